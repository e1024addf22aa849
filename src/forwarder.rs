use thiserror::Error;

use crate::{
    record::{Channel, Record},
    sink::MetricsSink,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForwardError {
    #[error("channel {0} rejected the sample")]
    ChannelRejected(String),
    #[error("remote sink unavailable")]
    TransportUnavailable,
}

/// Outcome of pushing one record, one entry per channel in push order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardReport {
    pub outcomes: Vec<(Channel, Result<(), ForwardError>)>,
}

impl ForwardReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|(_, outcome)| outcome.is_ok())
    }

    /// At least one channel reached the sink.
    pub fn delivered_any(&self) -> bool {
        self.outcomes.iter().any(|(_, outcome)| outcome.is_ok())
    }

    pub fn failed_channels(&self) -> Vec<Channel> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_err())
            .map(|(channel, _)| *channel)
            .collect()
    }

    /// The first channel failure, if any.
    pub fn into_result(self) -> Result<(), ForwardError> {
        self.outcomes
            .into_iter()
            .find_map(|(_, outcome)| outcome.err())
            .map_or(Ok(()), Err)
    }
}

/// Best-effort push of records to the remote sink. A sample that fails is
/// dropped; nothing is retried or queued here.
pub struct Forwarder<K> {
    sink: Option<K>,
}

impl<K: MetricsSink> Forwarder<K> {
    pub fn new(sink: K) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Pushes all six channels of `record`. Every channel is attempted even
    /// when an earlier one fails.
    pub async fn forward(&self, record: &Record) -> ForwardReport {
        let mut report = ForwardReport::default();

        if let Some(sink) = &self.sink {
            for (channel, value) in record.samples() {
                let outcome = sink.send(channel.as_str(), value).await;
                report.outcomes.push((channel, outcome));
            }
        }

        report
    }
}
