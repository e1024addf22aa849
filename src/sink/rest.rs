use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::MetricsSink;
use crate::{forwarder::ForwardError, util::config::Credentials};

#[derive(Debug, Serialize)]
struct DataPoint {
    value: f64,
}

/// Adafruit IO feeds over the HTTP data API. The response status is the
/// verdict for each value.
#[derive(Clone)]
pub struct RestSink {
    client: Client,
    base_url: String,
    username: String,
    key: String,
}

impl RestSink {
    pub fn new(
        base_url: &str,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: credentials.username,
            key: credentials.key,
        })
    }

    pub fn data_url(&self, channel: &str) -> String {
        format!(
            "{}/api/v2/{}/feeds/{}/data",
            self.base_url, self.username, channel
        )
    }
}

impl MetricsSink for RestSink {
    async fn send(&self, channel: &str, value: f64) -> Result<(), ForwardError> {
        let response = self
            .client
            .post(self.data_url(channel))
            .header("X-AIO-Key", &self.key)
            .json(&DataPoint { value })
            .send()
            .await
            .map_err(|e| {
                debug!("POST to {} failed: {}", channel, e);
                ForwardError::TransportUnavailable
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!("Adafruit IO answered {} for {}: {}", status, channel, body);

        match status {
            StatusCode::TOO_MANY_REQUESTS => Err(ForwardError::TransportUnavailable),
            s if s.is_client_error() => Err(ForwardError::ChannelRejected(channel.to_string())),
            _ => Err(ForwardError::TransportUnavailable),
        }
    }
}
