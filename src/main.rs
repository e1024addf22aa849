mod dto;
mod forwarder;
mod ingest;
mod parser;
mod record;
mod sink;
mod source;
mod store;
mod util;

use anyhow::{anyhow, bail, Context};
use forwarder::Forwarder;
use ingest::{IngestStats, Pipeline, PipelineOptions};
use sink::{MetricsSink, RestSink};
use source::{LineSource, ReaderSource, SerialSource};
use std::{env, process::exit};
use store::LocalStore;
use tokio::{io::BufReader, signal};
use tracing::{error, info};
use util::{
    adafruit_rest_sink,
    config::{Settings, Transport},
    connect_to_adafruit, setup_tracing,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    setup_tracing(&settings.log_level);

    info!("Weatherhub {}", env!("CARGO_PKG_VERSION"));

    let ref args: Vec<String> = env::args().collect();

    let choice = args.get(1).map(|a| a.clone()).unwrap_or("run".into());

    match choice.as_str() {
        "run" => handle_result(run_serial(&settings).await),
        "import" => match args.get(2) {
            Some(path) => handle_result(run_import(&settings, path).await),
            None => handle_result(Err(anyhow!("Usage: weatherhub import <capture file>"))),
        },
        "init-db" => handle_result(init_db(&settings).await.map(|_| ())),
        "recent" => match parse_limit(args.get(2)) {
            Ok(limit) => handle_result(print_recent(&settings, limit).await),
            Err(e) => handle_result(Err(e)),
        },
        "parse" => handle_result(parse_stdin().await),
        other => handle_result(Err(anyhow!(
            "Unknown command {:?}, make a valid choice (run, import, init-db, recent, parse)",
            other
        ))),
    }

    Ok(())
}

fn handle_result(res: anyhow::Result<()>) {
    if let Err(err) = res {
        error!("An error occurred: {:?}", err);
        exit(1)
    }
}

/// Row count for `recent`, 10 when omitted.
fn parse_limit(arg: Option<&String>) -> anyhow::Result<i64> {
    let Some(arg) = arg else {
        return Ok(10);
    };

    match arg.parse::<i64>() {
        Ok(limit) if limit > 0 => Ok(limit),
        _ => bail!("Usage: weatherhub recent [n], n must be a positive integer, got {:?}", arg),
    }
}

async fn init_db(settings: &Settings) -> anyhow::Result<LocalStore> {
    let store = LocalStore::connect(&settings.database_url)
        .await
        .with_context(|| format!("Could not open {}", settings.database_url))?;
    store.ensure_schema().await?;
    info!("{} readings stored so far", store.count().await?);

    Ok(store)
}

async fn print_recent(settings: &Settings, limit: i64) -> anyhow::Result<()> {
    let store = init_db(settings).await?;

    for row in store.recent(limit).await? {
        let observed_at = chrono::DateTime::from_timestamp(
            row.timestamp.div_euclid(1_000_000_000),
            row.timestamp.rem_euclid(1_000_000_000) as u32,
        )
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| row.timestamp.to_string());
        println!(
            "#{} {} {}: rssi = {}, cpu_temp = {:.2}, battery_volt = {:.2}, temp = {:.2}, pressure = {:.4}, humidity = {:.2}",
            row.id,
            observed_at,
            row.address,
            row.rssi,
            row.cpu_temp,
            row.battery_volt,
            row.temp,
            row.pressure,
            row.humidity
        );
    }

    store.close().await;
    Ok(())
}

async fn run_serial(settings: &Settings) -> anyhow::Result<()> {
    let store = init_db(settings).await?;
    let source = SerialSource::open(
        &settings.serial_port,
        settings.baud_rate,
        settings.serial_timeout(),
    )?;

    let stats = run_pipeline(settings, source, store).await?;
    info!("Stopped after {} lines", stats.lines);

    Ok(())
}

async fn run_import(settings: &Settings, path: &str) -> anyhow::Result<()> {
    let store = init_db(settings).await?;
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Could not open capture file {}", path))?;

    let stats = run_pipeline(settings, ReaderSource::new(BufReader::new(file)), store).await?;
    info!(
        "Imported {} of {} lines from {} ({} unparseable, {} not stored)",
        stats.stored, stats.lines, path, stats.parse_failures, stats.store_failures
    );
    if settings.forward_enabled {
        info!(
            "Forwarded {} readings ({} channel failures, {} dropped)",
            stats.forwarded, stats.channel_failures, stats.forward_dropped
        );
    }

    Ok(())
}

async fn run_pipeline<S: LineSource>(
    settings: &Settings,
    source: S,
    store: LocalStore,
) -> anyhow::Result<IngestStats> {
    let options = PipelineOptions {
        queue_capacity: settings.queue_capacity,
        forward_unpersisted: settings.forward_unpersisted,
        drain_timeout: settings.drain_timeout(),
    };

    let stats = if !settings.forward_enabled {
        ingest_until_shutdown(source, store.clone(), Forwarder::<RestSink>::disabled(), options).await
    } else {
        match settings.aio_transport {
            Transport::Rest => {
                let sink = adafruit_rest_sink(settings, settings.credentials()?)
                    .context("Could not set up the Adafruit IO HTTP client")?;
                ingest_until_shutdown(source, store.clone(), Forwarder::new(sink), options).await
            }
            Transport::Mqtt => {
                let sink = connect_to_adafruit(settings, settings.credentials()?);
                ingest_until_shutdown(source, store.clone(), Forwarder::new(sink), options).await
            }
        }
    };

    store.close().await;
    Ok(stats?)
}

async fn ingest_until_shutdown<S: LineSource, K: MetricsSink>(
    source: S,
    store: LocalStore,
    forwarder: Forwarder<K>,
    options: PipelineOptions,
) -> anyhow::Result<IngestStats> {
    let stats = Pipeline::new(source, store, forwarder, options)
        .run(shutdown_signal())
        .await
        .context("Lost connection to the concentrator")?;

    Ok(stats)
}

async fn parse_stdin() -> anyhow::Result<()> {
    let mut source = ReaderSource::new(BufReader::new(tokio::io::stdin()));

    while let Some(raw) = source.next_line().await? {
        match parser::parse_line(&raw) {
            Ok(record) => println!("{}", record),
            Err(e) => println!("error: {}", e),
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Could not listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Could not listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_limit_defaults_to_ten() {
        assert_eq!(parse_limit(None).unwrap(), 10);
        assert_eq!(parse_limit(Some(&"25".to_string())).unwrap(), 25);
    }

    #[test]
    fn recent_limit_must_be_positive() {
        for arg in ["-5", "0", "ten", ""] {
            assert!(parse_limit(Some(&arg.to_string())).is_err(), "{:?}", arg);
        }
    }
}
