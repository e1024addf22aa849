use std::future::Future;

use crate::forwarder::ForwardError;

mod mqtt;
mod rest;

pub use mqtt::{drive_event_loop, MqttSink, PendingAcks};
pub use rest::RestSink;

/// Remote metrics service accepting named numeric samples.
///
/// `Ok` means the remote side accepted the sample: an HTTP 2xx for
/// [`RestSink`], a broker PubAck for [`MqttSink`].
pub trait MetricsSink: Send + Sync + 'static {
    fn send(&self, channel: &str, value: f64) -> impl Future<Output = Result<(), ForwardError>> + Send;
}
