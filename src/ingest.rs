use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::{timeout_at, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    forwarder::Forwarder,
    parser::parse_line,
    record::{Channel, Record},
    sink::MetricsSink,
    source::{LineSource, TransportError},
    store::LocalStore,
};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Capacity of the queues feeding the store and forward stages.
    pub queue_capacity: usize,
    /// Forward readings whose local write failed.
    pub forward_unpersisted: bool,
    /// How long the stages together may take to work off their queues once
    /// reading stopped.
    pub drain_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            forward_unpersisted: false,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub lines: u64,
    pub parse_failures: u64,
    pub stored: u64,
    pub store_failures: u64,
    pub forwarded: u64,
    pub channel_failures: u64,
    pub forward_dropped: u64,
}

#[derive(Default)]
struct Counters {
    lines: AtomicU64,
    parse_failures: AtomicU64,
    stored: AtomicU64,
    store_failures: AtomicU64,
    forwarded: AtomicU64,
    channel_failures: AtomicU64,
    forward_dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> IngestStats {
        IngestStats {
            lines: self.lines.load(Relaxed),
            parse_failures: self.parse_failures.load(Relaxed),
            stored: self.stored.load(Relaxed),
            store_failures: self.store_failures.load(Relaxed),
            forwarded: self.forwarded.load(Relaxed),
            channel_failures: self.channel_failures.load(Relaxed),
            forward_dropped: self.forward_dropped.load(Relaxed),
        }
    }
}

/// Source → parse → store → forward.
///
/// Parsing happens on the calling task. Persistence and forwarding run as
/// separate tasks behind bounded queues, so each sees records in the order
/// they were read. The forward queue is fed without waiting: when it is full
/// the record is dropped for forwarding and the store keeps going.
pub struct Pipeline<S, K> {
    source: S,
    store: LocalStore,
    forwarder: Forwarder<K>,
    options: PipelineOptions,
}

impl<S, K> Pipeline<S, K>
where
    S: LineSource,
    K: MetricsSink,
{
    pub fn new(source: S, store: LocalStore, forwarder: Forwarder<K>, options: PipelineOptions) -> Self {
        Self {
            source,
            store,
            forwarder,
            options,
        }
    }

    /// Ingests until the source is exhausted or `shutdown` resolves. Per-line
    /// failures are logged and counted; only a transport failure ends the run
    /// with an error, after the queued records were drained.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<IngestStats, TransportError> {
        let Pipeline {
            mut source,
            store,
            forwarder,
            options,
        } = self;
        let counters = Arc::new(Counters::default());
        let capacity = options.queue_capacity.max(1);

        let (forward_sender, forward_task) = if forwarder.is_enabled() {
            let (sender, receiver) = mpsc::channel(capacity);
            let task = tokio::spawn(forward_stage(forwarder, receiver, counters.clone()));
            (Some(sender), Some(task))
        } else {
            info!("Forwarding disabled");
            (None, None)
        };

        let (store_sender, store_receiver) = mpsc::channel(capacity);
        let store_task = tokio::spawn(store_stage(
            store,
            store_receiver,
            forward_sender,
            options.forward_unpersisted,
            counters.clone(),
        ));

        tokio::pin!(shutdown);
        let mut fatal = None;

        loop {
            let line = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                line = source.next_line() => line,
            };

            let raw = match line {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    info!("Source exhausted");
                    break;
                }
                Err(e) => {
                    error!("Source failed: {}", e);
                    fatal = Some(e);
                    break;
                }
            };

            counters.lines.fetch_add(1, Relaxed);
            debug!("line: {}", String::from_utf8_lossy(&raw).trim_end());

            match parse_line(&raw) {
                Ok(record) => {
                    info!("{}", record);
                    let sent = tokio::select! {
                        biased;
                        _ = &mut shutdown => {
                            info!("Shutdown requested while the store queue is full");
                            break;
                        }
                        sent = store_sender.send(record) => sent,
                    };
                    if sent.is_err() {
                        error!("Store stage stopped unexpectedly");
                        break;
                    }
                }
                Err(e) => {
                    counters.parse_failures.fetch_add(1, Relaxed);
                    warn!("Skipping line: {}", e);
                }
            }
        }

        drop(store_sender);
        let deadline = Instant::now() + options.drain_timeout;
        drain("store", store_task, deadline).await;
        if let Some(task) = forward_task {
            drain("forward", task, deadline).await;
        }

        let stats = counters.snapshot();
        info!("Ingestion stopped: {:?}", stats);

        match fatal {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

async fn store_stage(
    store: LocalStore,
    mut records: mpsc::Receiver<Record>,
    forward_sender: Option<mpsc::Sender<Record>>,
    forward_unpersisted: bool,
    counters: Arc<Counters>,
) {
    while let Some(record) = records.recv().await {
        let persisted = match store.insert(&record).await {
            Ok(()) => {
                counters.stored.fetch_add(1, Relaxed);
                true
            }
            Err(e) => {
                counters.store_failures.fetch_add(1, Relaxed);
                error!("Could not store reading from {}: {}", record.address(), e);
                false
            }
        };

        let Some(sender) = &forward_sender else {
            continue;
        };

        if !persisted && !forward_unpersisted {
            debug!("Not forwarding unpersisted reading from {}", record.address());
            continue;
        }

        match sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                counters.forward_dropped.fetch_add(1, Relaxed);
                warn!("Forward queue full, dropping reading from {}", record.address());
            }
            Err(TrySendError::Closed(record)) => {
                counters.forward_dropped.fetch_add(1, Relaxed);
                warn!("Forward stage gone, dropping reading from {}", record.address());
            }
        }
    }
}

async fn forward_stage<K: MetricsSink>(
    forwarder: Forwarder<K>,
    mut records: mpsc::Receiver<Record>,
    counters: Arc<Counters>,
) {
    while let Some(record) = records.recv().await {
        let report = forwarder.forward(&record).await;

        for (channel, outcome) in &report.outcomes {
            match outcome {
                Ok(()) => debug!("Forwarded {} from {}", channel, record.address()),
                Err(e) => warn!("Forwarding {} from {} failed: {}", channel, record.address(), e),
            }
        }

        if report.delivered_any() {
            counters.forwarded.fetch_add(1, Relaxed);
        }

        if !report.is_success() {
            let failed = report.failed_channels();
            counters
                .channel_failures
                .fetch_add(failed.len() as u64, Relaxed);

            if let Err(first) = report.into_result() {
                warn!(
                    "{} of {} channels failed for {}, first error: {}",
                    failed.len(),
                    Channel::ALL.len(),
                    record.address(),
                    first
                );
            }
        }
    }
}

async fn drain(stage: &str, mut task: JoinHandle<()>, deadline: Instant) {
    match timeout_at(deadline, &mut task).await {
        Ok(Ok(())) => debug!("{} stage drained", stage),
        Ok(Err(e)) => error!("{} stage failed: {}", stage, e),
        Err(_) => {
            warn!("{} stage did not drain in time, aborting", stage);
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sink::testing::RecordingSink,
        source::ReaderSource,
        store::{in_memory_pool, in_memory_store},
    };
    use std::collections::VecDeque;
    use tokio::sync::oneshot;

    /// Replays scripted results, then signals `exhausted` and stalls forever.
    struct ScriptedSource {
        script: VecDeque<Result<Vec<u8>, TransportError>>,
        exhausted: Option<oneshot::Sender<()>>,
    }

    impl LineSource for ScriptedSource {
        async fn next_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
            match self.script.pop_front() {
                Some(result) => result.map(Some),
                None => {
                    if let Some(exhausted) = self.exhausted.take() {
                        let _ = exhausted.send(());
                    }
                    std::future::pending().await
                }
            }
        }
    }

    fn valid_line(rssi: i32) -> String {
        format!("[hub]: 0x00124b000e09465a, {rssi}, 19, 598, 2108, 9776121, 37770\n")
    }

    fn reader(lines: &[String]) -> ReaderSource<std::io::Cursor<Vec<u8>>> {
        ReaderSource::new(std::io::Cursor::new(lines.concat().into_bytes()))
    }

    async fn ready_store() -> LocalStore {
        let store = in_memory_store().await;
        store.ensure_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn malformed_line_is_skipped_in_order() {
        let store = ready_store().await;
        let mut lines: Vec<String> = (1..=5).map(|i| valid_line(-i)).collect();
        lines.insert(2, "garbage line without structure\n".to_string());

        let sink = RecordingSink::default();
        let stats = Pipeline::new(
            reader(&lines),
            store.clone(),
            Forwarder::new(sink.clone()),
            PipelineOptions::default(),
        )
        .run(std::future::pending())
        .await
        .unwrap();

        assert_eq!(stats.lines, 6);
        assert_eq!(stats.parse_failures, 1);
        assert_eq!(stats.stored, 5);
        assert_eq!(stats.forwarded, 5);
        assert_eq!(sink.sent().len(), 30);

        let rssi: Vec<i64> = store.recent(10).await.unwrap().iter().rev().map(|r| r.rssi).collect();
        assert_eq!(rssi, vec![-1, -2, -3, -4, -5]);
    }

    #[tokio::test]
    async fn garbage_reaches_neither_store_nor_sink() {
        let store = ready_store().await;
        let sink = RecordingSink::default();

        let stats = Pipeline::new(
            reader(&["garbage line without structure\n".to_string()]),
            store.clone(),
            Forwarder::new(sink.clone()),
            PipelineOptions::default(),
        )
        .run(std::future::pending())
        .await
        .unwrap();

        assert_eq!(stats.parse_failures, 1);
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn disabled_forwarding_still_persists_everything() {
        let store = ready_store().await;
        let lines: Vec<String> = (0..100).map(|i| valid_line(-i)).collect();

        let stats = Pipeline::new(
            reader(&lines),
            store.clone(),
            Forwarder::<RecordingSink>::disabled(),
            PipelineOptions::default(),
        )
        .run(std::future::pending())
        .await
        .unwrap();

        assert_eq!(stats.stored, 100);
        assert_eq!(stats.forwarded, 0);
        assert_eq!(store.count().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn failed_writes_are_not_forwarded_by_default() {
        // No schema, every insert fails
        let store = in_memory_store().await;
        let sink = RecordingSink::default();
        let lines: Vec<String> = (0..3).map(|i| valid_line(-i)).collect();

        let stats = Pipeline::new(
            reader(&lines),
            store,
            Forwarder::new(sink.clone()),
            PipelineOptions::default(),
        )
        .run(std::future::pending())
        .await
        .unwrap();

        assert_eq!(stats.store_failures, 3);
        assert_eq!(stats.forwarded, 0);
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn failed_writes_can_be_forwarded_anyway() {
        let store = in_memory_store().await;
        let sink = RecordingSink::default();
        let lines: Vec<String> = (0..3).map(|i| valid_line(-i)).collect();

        let stats = Pipeline::new(
            reader(&lines),
            store,
            Forwarder::new(sink.clone()),
            PipelineOptions {
                forward_unpersisted: true,
                ..Default::default()
            },
        )
        .run(std::future::pending())
        .await
        .unwrap();

        assert_eq!(stats.store_failures, 3);
        assert_eq!(stats.forwarded, 3);
        assert_eq!(sink.sent().len(), 18);
    }

    #[tokio::test]
    async fn rejected_channels_do_not_stop_ingestion() {
        let store = ready_store().await;
        let sink = RecordingSink::rejecting(&["pressure"]);
        let lines: Vec<String> = (0..4).map(|i| valid_line(-i)).collect();

        let stats = Pipeline::new(
            reader(&lines),
            store.clone(),
            Forwarder::new(sink.clone()),
            PipelineOptions::default(),
        )
        .run(std::future::pending())
        .await
        .unwrap();

        assert_eq!(stats.stored, 4);
        assert_eq!(stats.forwarded, 4);
        assert_eq!(stats.channel_failures, 4);
        assert_eq!(sink.sent().len(), 24);
    }

    #[tokio::test]
    async fn transport_failure_ends_run_after_draining() {
        let store = ready_store().await;
        let source = ScriptedSource {
            script: VecDeque::from(vec![
                Ok(valid_line(-1).into_bytes()),
                Ok(b"[hub]: 0x01, x, 1, 2, 3, 4, 5\n".to_vec()),
                Ok(valid_line(-2).into_bytes()),
                Err(TransportError::Disconnected),
                Ok(valid_line(-3).into_bytes()),
            ]),
            exhausted: None,
        };

        let result = Pipeline::new(
            source,
            store.clone(),
            Forwarder::<RecordingSink>::disabled(),
            PipelineOptions::default(),
        )
        .run(std::future::pending())
        .await;

        assert!(matches!(result, Err(TransportError::Disconnected)));
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn shutdown_stops_a_stalled_source() {
        let store = ready_store().await;
        let (exhausted, shutdown) = oneshot::channel();
        let source = ScriptedSource {
            script: (0..3).map(|i| Ok(valid_line(-i).into_bytes())).collect(),
            exhausted: Some(exhausted),
        };

        let stats = Pipeline::new(
            source,
            store.clone(),
            Forwarder::<RecordingSink>::disabled(),
            PipelineOptions::default(),
        )
        .run(async {
            let _ = shutdown.await;
        })
        .await
        .unwrap();

        assert_eq!(stats.lines, 3);
        assert_eq!(stats.stored, 3);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn unreachable_sink_forwards_nothing() {
        let store = ready_store().await;
        let sink = RecordingSink::offline();
        let lines: Vec<String> = (0..3).map(|i| valid_line(-i)).collect();

        let stats = Pipeline::new(
            reader(&lines),
            store,
            Forwarder::new(sink.clone()),
            PipelineOptions::default(),
        )
        .run(std::future::pending())
        .await
        .unwrap();

        assert_eq!(stats.stored, 3);
        assert_eq!(stats.forwarded, 0);
        assert_eq!(stats.channel_failures, 18);
        assert_eq!(sink.sent().len(), 18);
    }

    #[tokio::test]
    async fn slow_sink_drops_readings_but_not_storage() {
        let store = ready_store().await;
        let sink = RecordingSink::slow(Duration::from_millis(200));
        let lines: Vec<String> = (0..20).map(|i| valid_line(-i)).collect();
        let started = std::time::Instant::now();

        let stats = Pipeline::new(
            reader(&lines),
            store.clone(),
            Forwarder::new(sink),
            PipelineOptions {
                queue_capacity: 1,
                drain_timeout: Duration::from_millis(300),
                ..Default::default()
            },
        )
        .run(std::future::pending())
        .await
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(stats.stored, 20);
        assert_eq!(store.count().await.unwrap(), 20);
        assert!(stats.forward_dropped > 0);
        // A single reading takes 1.2s to push, longer than the drain allows
        assert_eq!(stats.forwarded, 0);
    }

    #[tokio::test]
    async fn shutdown_is_honoured_while_store_is_stalled() {
        let pool = in_memory_pool().await;
        let store = LocalStore::from_pool(pool.clone());
        store.ensure_schema().await.unwrap();
        // Holding the only connection blocks every insert
        let held = pool.acquire().await.unwrap();

        let source = ScriptedSource {
            script: (0..5).map(|i| Ok(valid_line(-i).into_bytes())).collect(),
            exhausted: None,
        };
        let started = std::time::Instant::now();

        let stats = Pipeline::new(
            source,
            store,
            Forwarder::<RecordingSink>::disabled(),
            PipelineOptions {
                queue_capacity: 1,
                drain_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        )
        .run(tokio::time::sleep(Duration::from_millis(100)))
        .await
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(stats.lines < 5);
        assert_eq!(stats.stored, 0);
        drop(held);
    }
}
