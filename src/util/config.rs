use config::{Config, FileFormat};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("{0} must be set (WEATHERHUB_AIO_{1} or ADAFRUIT_IO_{1}) when forwarding is enabled")]
    MissingCredential(&'static str, &'static str),
}

/// How readings reach Adafruit IO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Rest,
    Mqtt,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_url: String,
    pub serial_port: String,
    pub baud_rate: u32,
    pub serial_timeout_ms: u64,
    pub forward_enabled: bool,
    pub forward_unpersisted: bool,
    pub aio_transport: Transport,
    pub aio_rest_url: String,
    pub aio_timeout_ms: u64,
    pub aio_host: String,
    pub aio_port: u16,
    pub aio_keep_alive: u64,
    pub aio_client_id: String,
    pub aio_username: Option<String>,
    pub aio_key: Option<String>,
    pub queue_capacity: usize,
    pub drain_timeout_secs: u64,
    pub log_level: String,
}

/// Opaque Adafruit IO credential pair.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub key: String,
}

impl Settings {
    /// Defaults, then `weatherhub.toml`, then `WEATHERHUB_*` environment variables.
    /// `ADAFRUIT_IO_USERNAME` and `ADAFRUIT_IO_KEY` are used when nothing else
    /// sets the credentials.
    pub fn load() -> Result<Self, ConfigError> {
        Ok(build_config(None, |name| std::env::var(name).ok())?.try_deserialize()?)
    }

    pub fn serial_timeout(&self) -> Duration {
        Duration::from_millis(self.serial_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Per-request timeout for REST posts and MQTT acknowledgements.
    pub fn aio_timeout(&self) -> Duration {
        Duration::from_millis(self.aio_timeout_ms)
    }

    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let username = non_empty(&self.aio_username)
            .ok_or(ConfigError::MissingCredential("aio_username", "USERNAME"))?;
        let key = non_empty(&self.aio_key)
            .ok_or(ConfigError::MissingCredential("aio_key", "KEY"))?;

        Ok(Credentials { username, key })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

fn build_config(
    overrides: Option<&str>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<Config, config::ConfigError> {
    let mut builder = Config::builder();

    for (key, fallback) in [
        ("aio_username", "ADAFRUIT_IO_USERNAME"),
        ("aio_key", "ADAFRUIT_IO_KEY"),
    ] {
        if let Some(value) = env_lookup(fallback) {
            builder = builder.set_default(key, value)?;
        }
    }

    builder = builder
        .set_default("database_url", "sqlite://weatherhub.db?mode=rwc")?
        .set_default("serial_port", "/dev/ttyACM2")?
        .set_default("baud_rate", 115200)?
        .set_default("serial_timeout_ms", 1000)?
        .set_default("forward_enabled", true)?
        .set_default("forward_unpersisted", false)?
        .set_default("aio_transport", "rest")?
        .set_default("aio_rest_url", "https://io.adafruit.com")?
        .set_default("aio_timeout_ms", 5000)?
        .set_default("aio_host", "io.adafruit.com")?
        .set_default("aio_port", 1883)?
        .set_default("aio_keep_alive", 15)?
        .set_default("aio_client_id", "weatherhub")?
        .set_default("queue_capacity", 64)?
        .set_default("drain_timeout_secs", 5)?
        .set_default("log_level", "info")?
        .add_source(config::File::new("weatherhub.toml", FileFormat::Toml).required(false))
        .add_source(config::Environment::with_prefix("WEATHERHUB"));

    if let Some(overrides) = overrides {
        builder = builder.add_source(config::File::from_str(overrides, FileFormat::Toml));
    }

    builder.build()
}
