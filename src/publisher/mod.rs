//! Queued publisher
//!
//! Decouples fast, bursty producers from slow, blocking bus publishes. Each
//! active channel owns an unbounded crossbeam queue and a dedicated worker
//! thread; callers only ever push onto the queue, so `enqueue` never blocks
//! on network I/O.
//!
//! # Components
//!
//! - [`QueuedPublisher`] - Owns the per-channel queues and workers
//! - [`ChannelWorker`] - Worker loop that publishes one envelope at a time
//! - [`ScopedPublisher`] - RAII guard: connect + start on open, drain + disconnect on drop
//! - [`StopReport`] - Outcome of stopping one channel
//! - [`PublishFailure`] - Envelope that exhausted its retries
//!
//! # Ordering
//!
//! Within one channel, publish order equals enqueue order and there is at
//! most one publish in flight. Channels are independent of each other.
//! A clear record is queued like any other envelope.
//!
//! # Example
//!
//! ```ignore
//! use telemetry_bus::bus::LocalBroker;
//! use telemetry_bus::config::PublisherConfig;
//! use telemetry_bus::publisher::ScopedPublisher;
//! use telemetry_bus::types::QoS;
//!
//! let bus = Arc::new(LocalBroker::new());
//! let channels = vec!["data/exp1".to_string()];
//! let publisher = ScopedPublisher::open(bus, QoS::ExactlyOnce, PublisherConfig::default(), &channels)?;
//! publisher.enqueue("data/exp1", envelope)?;
//! // Dropping the guard drains the queue and disconnects
//! ```

pub mod worker;

pub use worker::{ChannelCounters, ChannelWorker, PublishFailure, QueueItem};

use crate::bus::MessageBus;
use crate::codec::Envelope;
use crate::config::PublisherConfig;
use crate::error::{Result, ResultExt, TelemetryError};
use crate::types::QoS;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

/// Outcome of stopping one channel
///
/// `delivered + failed + dropped + in_flight == enqueued` always holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// Channel that was stopped
    pub channel: String,
    /// Envelopes accepted by `enqueue` over the worker's lifetime
    pub enqueued: u64,
    /// Envelopes confirmed by the bus over the worker's lifetime
    pub delivered: u64,
    /// Envelopes routed to the failure sink
    pub failed: u64,
    /// Envelopes discarded because the stop timed out
    pub dropped: u64,
    /// Envelope still held by an abandoned worker (0 or 1); its outcome is
    /// decided after the report is taken
    pub in_flight: u64,
    /// Whether the worker was abandoned after a timeout
    pub timed_out: bool,
}

impl StopReport {
    fn from_counters(channel: &str, counters: &ChannelCounters, timed_out: bool) -> Self {
        // Each envelope moves into exactly one final counter, so the sum of
        // snapshots never exceeds `enqueued`
        let enqueued = counters.enqueued();
        let delivered = counters.delivered();
        let failed = counters.failed();
        let dropped = counters.dropped();
        Self {
            channel: channel.to_string(),
            enqueued,
            delivered,
            failed,
            dropped,
            in_flight: enqueued.saturating_sub(delivered + failed + dropped),
            timed_out,
        }
    }
}

/// Queue, worker and bookkeeping for one active channel
struct ChannelQueue {
    sender: Sender<QueueItem>,
    /// Kept so a timed-out stop can drain what the worker never reached
    receiver: Receiver<QueueItem>,
    cancelled: Arc<AtomicBool>,
    counters: Arc<ChannelCounters>,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

/// Publisher with one FIFO queue and one worker thread per channel
pub struct QueuedPublisher {
    /// Shared bus handle
    bus: Arc<dyn MessageBus>,
    /// Delivery quality used by every channel of this publisher
    qos: QoS,
    /// Retry and shutdown settings
    config: PublisherConfig,
    /// Active channels
    channels: Mutex<HashMap<String, ChannelQueue>>,
    /// Producer end of the failure sink
    failure_tx: Sender<PublishFailure>,
    /// Consumer end of the failure sink
    failure_rx: Receiver<PublishFailure>,
}

impl QueuedPublisher {
    /// Create a publisher on top of a bus handle
    pub fn new(bus: Arc<dyn MessageBus>, qos: QoS, config: PublisherConfig) -> Self {
        let (failure_tx, failure_rx) = unbounded();
        Self {
            bus,
            qos,
            config,
            channels: Mutex::new(HashMap::new()),
            failure_tx,
            failure_rx,
        }
    }

    /// Delivery quality level
    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Shared bus handle
    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// Start a queue and worker thread for `channel`
    ///
    /// Returns [`TelemetryError::DuplicateQueueStart`] if the channel is
    /// already active; the running worker is left untouched.
    pub fn start(&self, channel: &str) -> Result<()> {
        let mut channels = self.lock_channels();

        if channels.contains_key(channel) {
            tracing::warn!("Queue for '{}' already active, ignoring start", channel);
            return Err(TelemetryError::DuplicateQueueStart(channel.to_string()));
        }

        let (sender, receiver) = unbounded();
        let (done_tx, done_rx) = unbounded();
        let cancelled = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(ChannelCounters::default());

        let worker = ChannelWorker::new(
            channel.to_string(),
            self.qos,
            self.bus.clone(),
            self.config.retry.clone(),
            receiver.clone(),
            self.failure_tx.clone(),
            cancelled.clone(),
            counters.clone(),
            done_tx,
        );

        let handle = std::thread::Builder::new()
            .name(format!("publish:{}", channel))
            .spawn(move || worker.run())
            .with_context(|| format!("spawning worker for '{}'", channel))?;

        channels.insert(
            channel.to_string(),
            ChannelQueue {
                sender,
                receiver,
                cancelled,
                counters,
                done: done_rx,
                handle,
            },
        );

        tracing::info!("Started queue for '{}' ({})", channel, self.qos);
        Ok(())
    }

    /// Append an envelope to the tail of `channel`'s queue
    ///
    /// Never blocks on the bus. Fails with
    /// [`TelemetryError::ChannelNotStarted`] if the channel has no active
    /// worker, including after `stop`.
    pub fn enqueue(&self, channel: &str, envelope: Envelope) -> Result<()> {
        let channels = self.lock_channels();
        let queue = channels
            .get(channel)
            .ok_or_else(|| TelemetryError::ChannelNotStarted(channel.to_string()))?;

        queue
            .sender
            .send(QueueItem::Publish(envelope))
            .map_err(|_| TelemetryError::ChannelNotStarted(channel.to_string()))?;
        queue.counters.add_enqueued(1);
        Ok(())
    }

    /// Stop `channel`, blocking until every queued envelope is published
    pub fn stop(&self, channel: &str) -> Result<StopReport> {
        self.stop_inner(channel, None)
    }

    /// Stop `channel`, waiting at most `timeout` for the queue to drain
    ///
    /// If the worker has not exited in time it is cancelled: envelopes still
    /// queued are discarded and counted in [`StopReport::dropped`]. The
    /// publish the worker is blocked in (if any) is allowed to finish in the
    /// background.
    pub fn stop_with_timeout(&self, channel: &str, timeout: Duration) -> Result<StopReport> {
        self.stop_inner(channel, Some(timeout))
    }

    /// Stop every active channel using the configured stop timeout
    ///
    /// Channels whose worker panicked are logged and omitted from the result.
    pub fn stop_all(&self) -> Vec<StopReport> {
        let timeout = self.config.stop_timeout();
        let mut reports = Vec::new();

        for channel in self.active_channels() {
            match self.stop_inner(&channel, timeout) {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!("Failed to stop '{}': {}", channel, e),
            }
        }

        reports
    }

    /// Number of envelopes waiting in `channel`'s queue
    pub fn pending(&self, channel: &str) -> Option<usize> {
        self.lock_channels().get(channel).map(|q| q.sender.len())
    }

    /// Names of all active channels, sorted
    pub fn active_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_channels().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `channel` has an active worker
    pub fn is_active(&self, channel: &str) -> bool {
        self.lock_channels().contains_key(channel)
    }

    /// Receiver for envelopes that exhausted their retries
    pub fn failures(&self) -> Receiver<PublishFailure> {
        self.failure_rx.clone()
    }

    fn stop_inner(&self, channel: &str, timeout: Option<Duration>) -> Result<StopReport> {
        // Enqueues after this point see ChannelNotStarted
        let queue = self
            .lock_channels()
            .remove(channel)
            .ok_or_else(|| TelemetryError::ChannelNotStarted(channel.to_string()))?;

        tracing::debug!(
            "Stopping '{}' with {} envelope(s) pending",
            channel,
            queue.sender.len()
        );
        let _ = queue.sender.send(QueueItem::Stop);

        let finished = match timeout {
            None => queue.done.recv().is_ok(),
            Some(timeout) => match queue.done.recv_timeout(timeout) {
                Ok(()) => true,
                Err(RecvTimeoutError::Disconnected) => false,
                Err(RecvTimeoutError::Timeout) => {
                    return Ok(Self::abandon(channel, queue, timeout));
                }
            },
        };

        let ChannelQueue {
            counters, handle, ..
        } = queue;

        if !finished || handle.join().is_err() {
            tracing::error!("Worker for '{}' panicked", channel);
            return Err(TelemetryError::WorkerPanicked(channel.to_string()));
        }

        let report = StopReport::from_counters(channel, &counters, false);
        tracing::info!(
            "Stopped '{}' ({} delivered, {} failed)",
            channel,
            report.delivered,
            report.failed
        );
        Ok(report)
    }

    /// Cancel a worker that missed its stop deadline and drain its queue
    fn abandon(channel: &str, queue: ChannelQueue, timeout: Duration) -> StopReport {
        queue.cancelled.store(true, Ordering::SeqCst);

        let drained = queue
            .receiver
            .try_iter()
            .filter(|item| matches!(item, QueueItem::Publish(_)))
            .count() as u64;

        tracing::warn!(
            "Worker for '{}' did not stop within {:?}; dropped {} queued envelope(s)",
            channel,
            timeout,
            drained
        );

        queue.counters.add_dropped(drained);

        // The thread is detached; it exits once its current publish returns
        StopReport::from_counters(channel, &queue.counters, true)
    }

    fn lock_channels(&self) -> MutexGuard<'_, HashMap<String, ChannelQueue>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Scoped publisher that pairs connect + start with stop + disconnect
///
/// Opening connects the bus and starts every requested channel. Dropping the
/// guard, on any exit path including `?` returns and unwinding, stops every
/// channel (draining queues within the configured stop timeout) and then
/// disconnects the bus.
pub struct ScopedPublisher {
    publisher: Arc<QueuedPublisher>,
    closed: bool,
}

impl ScopedPublisher {
    /// Connect `bus` and start a worker for each channel
    pub fn open(
        bus: Arc<dyn MessageBus>,
        qos: QoS,
        config: PublisherConfig,
        channels: &[String],
    ) -> Result<Self> {
        bus.connect().context("connecting bus")?;

        let scoped = Self {
            publisher: Arc::new(QueuedPublisher::new(bus, qos, config)),
            closed: false,
        };

        for channel in channels {
            scoped.publisher.start(channel)?;
        }

        Ok(scoped)
    }

    /// Shared handle for producers running alongside the guard
    pub fn handle(&self) -> Arc<QueuedPublisher> {
        self.publisher.clone()
    }

    /// Stop all channels and disconnect, returning the per-channel reports
    pub fn close(mut self) -> Vec<StopReport> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Vec<StopReport> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;

        let reports = self.publisher.stop_all();
        for report in &reports {
            if report.timed_out {
                tracing::warn!(
                    "Channel '{}' closed with {} envelope(s) dropped",
                    report.channel,
                    report.dropped
                );
            }
        }

        self.publisher.bus().disconnect();
        reports
    }
}

impl Deref for ScopedPublisher {
    type Target = QueuedPublisher;

    fn deref(&self) -> &QueuedPublisher {
        &self.publisher
    }
}

impl Drop for ScopedPublisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBroker;
    use crate::types::Record;
    use std::time::Duration;

    fn connected_broker() -> Arc<LocalBroker> {
        let broker = Arc::new(LocalBroker::new());
        broker.connect().unwrap();
        broker
    }

    fn envelope(channel: &str, x: f64) -> Envelope {
        let record = Record::new().with_number("x", x).with_number("y", 1.0 + x / 10.0);
        Envelope::encode(channel, QoS::ExactlyOnce, &record).unwrap()
    }

    #[test]
    fn test_two_enqueues_then_stop() {
        let broker = connected_broker();
        let publisher = QueuedPublisher::new(broker.clone(), QoS::ExactlyOnce, PublisherConfig::default());

        publisher.start("data").unwrap();
        publisher.enqueue("data", envelope("data", 0.0)).unwrap();
        publisher.enqueue("data", envelope("data", 1.0)).unwrap();
        let report = publisher.stop("data").unwrap();

        assert_eq!(report.delivered, 2);
        assert!(!report.timed_out);

        let published = broker.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].payload, envelope("data", 0.0).payload());
        assert_eq!(published[1].payload, envelope("data", 1.0).payload());
        assert!(publisher.active_channels().is_empty());
    }

    #[test]
    fn test_duplicate_start_keeps_original_worker() {
        let broker = connected_broker();
        let publisher = QueuedPublisher::new(broker.clone(), QoS::ExactlyOnce, PublisherConfig::default());

        publisher.start("data/exp1").unwrap();
        publisher.enqueue("data/exp1", envelope("data/exp1", 0.0)).unwrap();

        match publisher.start("data/exp1") {
            Err(TelemetryError::DuplicateQueueStart(channel)) => assert_eq!(channel, "data/exp1"),
            other => panic!("expected DuplicateQueueStart, got {:?}", other),
        }
        assert_eq!(publisher.active_channels(), vec!["data/exp1".to_string()]);

        publisher.enqueue("data/exp1", envelope("data/exp1", 1.0)).unwrap();
        let report = publisher.stop("data/exp1").unwrap();
        assert_eq!(report.delivered, 2);
    }

    #[test]
    fn test_enqueue_requires_started_channel() {
        let broker = connected_broker();
        let publisher = QueuedPublisher::new(broker.clone(), QoS::ExactlyOnce, PublisherConfig::default());

        assert!(matches!(
            publisher.enqueue("data/exp9", envelope("data/exp9", 0.0)),
            Err(TelemetryError::ChannelNotStarted(_))
        ));

        publisher.start("data/exp1").unwrap();
        publisher.stop("data/exp1").unwrap();

        assert!(matches!(
            publisher.enqueue("data/exp1", envelope("data/exp1", 0.0)),
            Err(TelemetryError::ChannelNotStarted(_))
        ));
        assert!(matches!(
            publisher.stop("data/exp1"),
            Err(TelemetryError::ChannelNotStarted(_))
        ));
        assert!(broker.published().is_empty());
    }

    #[test]
    fn test_publishes_to_started_channel() {
        let broker = connected_broker();
        let publisher = QueuedPublisher::new(broker.clone(), QoS::ExactlyOnce, PublisherConfig::default());

        // Envelope built for a different channel still goes to the worker's channel
        publisher.start("lab/exp3").unwrap();
        publisher.enqueue("lab/exp3", envelope("data", 0.0)).unwrap();
        publisher.stop("lab/exp3").unwrap();

        assert_eq!(broker.published_on("lab/exp3").len(), 1);
        assert!(broker.published_on("data").is_empty());
    }

    #[test]
    fn test_restart_after_stop() {
        let broker = connected_broker();
        let publisher = QueuedPublisher::new(broker.clone(), QoS::ExactlyOnce, PublisherConfig::default());

        publisher.start("data").unwrap();
        publisher.stop("data").unwrap();
        publisher.start("data").unwrap();
        publisher.enqueue("data", envelope("data", 0.0)).unwrap();

        let report = publisher.stop("data").unwrap();
        assert_eq!(report.delivered, 1);
    }

    #[test]
    fn test_stop_with_timeout_drops_remaining() {
        let broker = Arc::new(LocalBroker::new().with_latency(Duration::from_millis(300)));
        broker.connect().unwrap();
        let publisher = QueuedPublisher::new(broker.clone(), QoS::ExactlyOnce, PublisherConfig::default());

        publisher.start("data").unwrap();
        for i in 0..5 {
            publisher.enqueue("data", envelope("data", i as f64)).unwrap();
        }

        let report = publisher.stop_with_timeout("data", Duration::from_millis(50)).unwrap();
        assert!(report.timed_out);
        assert_eq!(report.enqueued, 5);
        assert_eq!(report.delivered, 0);
        assert_eq!(
            report.delivered + report.failed + report.dropped + report.in_flight,
            report.enqueued
        );
        assert!(report.in_flight <= 1);
        assert!(report.dropped >= 4, "dropped {}", report.dropped);
        assert!(!publisher.is_active("data"));
    }

    #[test]
    fn test_timed_out_stop_accounts_for_every_envelope() {
        let broker = Arc::new(LocalBroker::new().with_latency(Duration::from_millis(5)));
        broker.connect().unwrap();
        let publisher = QueuedPublisher::new(broker.clone(), QoS::ExactlyOnce, PublisherConfig::default());

        // Stop lands while the worker is somewhere between publishes
        publisher.start("data").unwrap();
        for i in 0..40 {
            publisher.enqueue("data", envelope("data", i as f64)).unwrap();
        }
        std::thread::sleep(Duration::from_millis(30));
        let report = publisher.stop_with_timeout("data", Duration::from_millis(12)).unwrap();

        assert!(report.timed_out);
        assert_eq!(report.enqueued, 40);
        assert!(report.in_flight <= 1, "in flight {}", report.in_flight);
        assert_eq!(
            report.delivered + report.failed + report.dropped + report.in_flight,
            40
        );
    }

    #[test]
    fn test_stop_with_timeout_in_time() {
        let broker = connected_broker();
        let publisher = QueuedPublisher::new(broker.clone(), QoS::ExactlyOnce, PublisherConfig::default());

        publisher.start("data").unwrap();
        publisher.enqueue("data", envelope("data", 0.0)).unwrap();

        let report = publisher.stop_with_timeout("data", Duration::from_secs(5)).unwrap();
        assert!(!report.timed_out);
        assert_eq!(report.dropped, 0);
        assert_eq!(report.in_flight, 0);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.enqueued, 1);
    }

    #[test]
    fn test_pending_reflects_backlog() {
        let broker = Arc::new(LocalBroker::new().with_latency(Duration::from_millis(100)));
        broker.connect().unwrap();
        let publisher = QueuedPublisher::new(broker.clone(), QoS::ExactlyOnce, PublisherConfig::default());

        assert_eq!(publisher.pending("data"), None);
        publisher.start("data").unwrap();
        for i in 0..3 {
            publisher.enqueue("data", envelope("data", i as f64)).unwrap();
        }

        let pending = publisher.pending("data").unwrap();
        assert!((2..=3).contains(&pending), "pending {}", pending);

        broker.set_latency(Duration::ZERO);
        let report = publisher.stop("data").unwrap();
        assert_eq!(report.delivered, 3);
    }

    #[test]
    fn test_failure_sink_receives_exhausted_envelopes() {
        let broker = connected_broker();
        let config = PublisherConfig {
            retry: crate::config::RetryPolicy::fixed(2, Duration::from_millis(1)),
            ..PublisherConfig::default()
        };
        let publisher = QueuedPublisher::new(broker.clone(), QoS::ExactlyOnce, config);
        let failures = publisher.failures();

        broker.fail_next(2);
        publisher.start("data").unwrap();
        publisher.enqueue("data", envelope("data", 0.0)).unwrap();
        publisher.enqueue("data", envelope("data", 1.0)).unwrap();
        let report = publisher.stop("data").unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        let failure = failures.try_recv().unwrap();
        assert_eq!(failure.envelope, envelope("data", 0.0));
        assert_eq!(failure.attempts, 2);
    }

    #[test]
    fn test_scoped_publisher_drains_on_drop() {
        let broker = Arc::new(LocalBroker::new().with_latency(Duration::from_millis(2)));
        let channels = vec!["data/exp1".to_string(), "data/exp2".to_string()];

        {
            let scoped = ScopedPublisher::open(
                broker.clone(),
                QoS::ExactlyOnce,
                PublisherConfig::default(),
                &channels,
            )
            .unwrap();
            assert!(broker.is_connected());

            for i in 0..5 {
                scoped.enqueue("data/exp1", envelope("data/exp1", i as f64)).unwrap();
                scoped.enqueue("data/exp2", envelope("data/exp2", i as f64)).unwrap();
            }
        }

        assert!(!broker.is_connected());
        assert_eq!(broker.published_on("data/exp1").len(), 5);
        assert_eq!(broker.published_on("data/exp2").len(), 5);
    }

    #[test]
    fn test_scoped_publisher_close_returns_reports() {
        let broker = Arc::new(LocalBroker::new());
        let channels = vec!["data/exp1".to_string()];
        let scoped =
            ScopedPublisher::open(broker.clone(), QoS::AtLeastOnce, PublisherConfig::default(), &channels)
                .unwrap();

        scoped.enqueue("data/exp1", envelope("data/exp1", 0.0)).unwrap();
        let reports = scoped.close();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].delivered, 1);
        assert!(!broker.is_connected());
    }

    #[test]
    fn test_scoped_publisher_cleans_up_on_failed_open() {
        let broker = Arc::new(LocalBroker::new());
        let channels = vec!["data/exp1".to_string(), "data/exp1".to_string()];

        let result =
            ScopedPublisher::open(broker.clone(), QoS::ExactlyOnce, PublisherConfig::default(), &channels);

        assert!(matches!(result, Err(TelemetryError::DuplicateQueueStart(_))));
        assert!(!broker.is_connected());
    }
}
