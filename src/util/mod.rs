use rumqttc::{AsyncClient, MqttOptions};
use std::{
    str::FromStr,
    sync::{atomic::AtomicBool, Arc, Mutex},
    time::Duration,
};
use tracing::{info, warn, Level};
use tracing_subscriber::{
    fmt::writer::MakeWriterExt, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::sink::{drive_event_loop, MqttSink, PendingAcks, RestSink};
use self::config::{Credentials, Settings};

pub mod config;

pub type DB = sqlx::Sqlite;

pub fn setup_tracing(log_level: &str) {
    let level = Level::from_str(log_level).unwrap_or(Level::INFO);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::Layer::new()
                .with_writer(std::io::stdout.with_max_level(level))
                .compact(),
        )
        .init();

    if !log_level.eq_ignore_ascii_case(level.as_str()) {
        warn!("Unknown log level {:?}, using {}", log_level, level);
    }
}

pub fn adafruit_rest_sink(
    settings: &Settings,
    credentials: Credentials,
) -> Result<RestSink, reqwest::Error> {
    info!(
        "Forwarding to Adafruit IO at {} as {}",
        settings.aio_rest_url, credentials.username
    );

    RestSink::new(&settings.aio_rest_url, credentials, settings.aio_timeout())
}

/// Starts the Adafruit IO MQTT session in the background. Publishing fails
/// with `TransportUnavailable` until the broker acknowledges the connection.
pub fn connect_to_adafruit(settings: &Settings, credentials: Credentials) -> MqttSink {
    let mut mqttoptions = MqttOptions::new(
        settings.aio_client_id.clone(),
        &settings.aio_host,
        settings.aio_port,
    );
    mqttoptions.set_keep_alive(Duration::from_secs(settings.aio_keep_alive));
    mqttoptions.set_credentials(credentials.username.clone(), credentials.key);

    let (client, eventloop) = AsyncClient::new(mqttoptions, 64);
    let connected = Arc::new(AtomicBool::new(false));
    let acks = Arc::new(Mutex::new(PendingAcks::default()));

    info!(
        "Forwarding to Adafruit IO at {}:{} as {}",
        settings.aio_host, settings.aio_port, credentials.username
    );

    tokio::spawn(drive_event_loop(
        eventloop,
        client.clone(),
        credentials.username.clone(),
        connected.clone(),
        acks.clone(),
    ));

    MqttSink::new(
        client,
        credentials.username,
        connected,
        acks,
        settings.aio_timeout(),
    )
}
