use rumqttc::{AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, Incoming, Outgoing, QoS};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::oneshot,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

use super::MetricsSink;
use crate::forwarder::ForwardError;

type AckSender = oneshot::Sender<Result<(), ForwardError>>;

/// Publishes waiting for their PubAck.
///
/// rumqttc hands out packet ids in the event loop, in the order publishes were
/// queued, so queued entries are paired with `Outgoing::Publish` ids FIFO.
/// Entries stay in place after their waiter gave up to keep that pairing.
#[derive(Default)]
pub struct PendingAcks {
    queued: VecDeque<(String, Option<AckSender>)>,
    in_flight: HashMap<u16, (String, Option<AckSender>)>,
}

impl PendingAcks {
    pub fn queue(&mut self, channel: &str) -> oneshot::Receiver<Result<(), ForwardError>> {
        let (sender, receiver) = oneshot::channel();
        self.queued.push_back((channel.to_string(), Some(sender)));
        receiver
    }

    /// The event loop wrote a publish with `pkid`.
    pub fn sent(&mut self, pkid: u16) {
        if self.in_flight.contains_key(&pkid) {
            debug!("Retransmitted publish {}", pkid);
            return;
        }

        match self.queued.pop_front() {
            Some(entry) => {
                self.in_flight.insert(pkid, entry);
            }
            None => debug!("Publish {} not sent by this sink", pkid),
        }
    }

    pub fn acked(&mut self, pkid: u16) {
        if let Some((channel, Some(sender))) = self.in_flight.remove(&pkid) {
            debug!("Broker acknowledged {} ({})", channel, pkid);
            let _ = sender.send(Ok(()));
        }
    }

    /// Fails every waiter, e.g. after the connection dropped.
    pub fn fail_all(&mut self) {
        let entries = self
            .queued
            .iter_mut()
            .map(|(_, sender)| sender)
            .chain(self.in_flight.values_mut().map(|(_, sender)| sender));

        for sender in entries {
            if let Some(sender) = sender.take() {
                let _ = sender.send(Err(ForwardError::TransportUnavailable));
            }
        }
    }
}

fn lock(acks: &Mutex<PendingAcks>) -> MutexGuard<'_, PendingAcks> {
    acks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Adafruit IO feeds over MQTT. Each channel maps to the feed
/// `{username}/feeds/{channel}`; a send succeeds once the broker acknowledges
/// the publish.
#[derive(Clone)]
pub struct MqttSink {
    client: AsyncClient,
    username: String,
    connected: Arc<AtomicBool>,
    acks: Arc<Mutex<PendingAcks>>,
    ack_timeout: Duration,
}

impl MqttSink {
    /// Wraps a client whose event loop is driven by [`drive_event_loop`] with
    /// the same `connected` flag and `acks`.
    pub fn new(
        client: AsyncClient,
        username: String,
        connected: Arc<AtomicBool>,
        acks: Arc<Mutex<PendingAcks>>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            client,
            username,
            connected,
            acks,
            ack_timeout,
        }
    }

    pub fn feed_topic(&self, channel: &str) -> String {
        format!("{}/feeds/{}", self.username, channel)
    }
}

impl MetricsSink for MqttSink {
    async fn send(&self, channel: &str, value: f64) -> Result<(), ForwardError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(ForwardError::TransportUnavailable);
        }

        let ack = {
            let mut acks = lock(&self.acks);
            self.client
                .try_publish(
                    self.feed_topic(channel),
                    QoS::AtLeastOnce,
                    false,
                    value.to_string(),
                )
                .map_err(|err| {
                    debug!("Publish to {} failed: {:?}", channel, err);
                    ForwardError::TransportUnavailable
                })?;
            acks.queue(channel)
        };

        match timeout(self.ack_timeout, ack).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ForwardError::TransportUnavailable),
            Err(_) => {
                debug!("No PubAck for {} within {:?}", channel, self.ack_timeout);
                Err(ForwardError::TransportUnavailable)
            }
        }
    }
}

/// Polls the MQTT event loop forever, keeping `connected` and `acks` current
/// and reporting the error and throttle notices Adafruit IO publishes.
pub async fn drive_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    username: String,
    connected: Arc<AtomicBool>,
    acks: Arc<Mutex<PendingAcks>>,
) {
    let notice_topics = [
        format!("{}/errors", username),
        format!("{}/throttle", username),
    ];

    loop {
        let event = eventloop.poll().await;
        match &event {
            Err(e) => {
                connected.store(false, Ordering::Release);
                lock(&acks).fail_all();
                error!("MQTT error: {:?}", e);

                // Only retry every 5 seconds
                sleep(Duration::from_secs(5)).await;

                warn!("Retrying after MQTT error.");
            }
            Ok(Event::Incoming(Incoming::ConnAck(ConnAck {
                session_present,
                code: ConnectReturnCode::Success,
            }))) => {
                info!("Connected to Adafruit IO");
                connected.store(true, Ordering::Release);

                if !session_present {
                    for topic in &notice_topics {
                        if let Err(e) = client.try_subscribe(topic, QoS::AtMostOnce) {
                            warn!("Could not subscribe to {}: {:?}", topic, e);
                        }
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => lock(&acks).sent(*pkid),
            Ok(Event::Incoming(Incoming::PubAck(ack))) => lock(&acks).acked(ack.pkid),
            Ok(Event::Incoming(Incoming::Publish(p))) => {
                warn!(
                    "Adafruit IO notice on {}: {}",
                    p.topic,
                    String::from_utf8_lossy(&p.payload)
                );
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                connected.store(false, Ordering::Release);
                lock(&acks).fail_all();
                warn!("Disconnected by Adafruit IO");
            }
            event => {
                debug!("MQTT event: {:?}", event);
            }
        }
    }
}
