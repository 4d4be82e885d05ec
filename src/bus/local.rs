//! In-process broker
//!
//! A [`MessageBus`] implementation that routes messages between threads of
//! one process. It stands in for an external broker in the CLI demo and in
//! tests, and can simulate the behaviour of a real network bus:
//!
//! - **Confirmation latency**: every QoS 1/2 publish blocks for a configurable delay
//! - **Confirmation timeout**: if the delay exceeds the timeout the publish fails
//!   with [`TelemetryError::PublishTimeout`]
//! - **Fault injection**: [`LocalBroker::fail_next`] rejects the next N publishes
//! - **Publish log**: the most recent accepted messages are kept for inspection,
//!   bounded by [`LocalBroker::with_log_capacity`]
//!
//! Subscribers are invoked synchronously on the publishing thread, so handlers
//! registered here see the same concurrency as callbacks from a network
//! client's background thread: several workers may call them at once.

use crate::bus::{
    topic_matches, BusMessage, BusStats, MessageBus, MessageHandler, SubscriptionId,
};
use crate::config::{BusConfig, DEFAULT_PUBLISH_LOG_CAPACITY};
use crate::error::{Result, TelemetryError};
use crate::types::QoS;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

/// A message accepted by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    /// Destination channel
    pub channel: String,
    /// Payload text (lossy UTF-8)
    pub payload: String,
    /// QoS level used
    pub qos: QoS,
    /// Time the broker accepted the message
    pub accepted_at: DateTime<Utc>,
}

struct Subscription {
    id: SubscriptionId,
    filter: String,
    handler: MessageHandler,
}

/// In-process publish/subscribe broker
pub struct LocalBroker {
    /// Whether a client is "connected"
    connected: AtomicBool,
    /// Simulated confirmation latency
    latency: Mutex<Duration>,
    /// Maximum time to wait for a confirmation
    confirm_timeout: Option<Duration>,
    /// Number of upcoming publishes to reject
    fail_next: AtomicU32,
    /// Active subscriptions
    subscriptions: RwLock<Vec<Subscription>>,
    /// Next subscription id
    next_subscription_id: AtomicU64,
    /// Most recent accepted messages in acceptance order
    log: Mutex<VecDeque<PublishedMessage>>,
    /// Maximum length of `log`
    log_capacity: usize,
    /// Publish statistics
    stats: Mutex<BusStats>,
}

impl LocalBroker {
    /// Create a broker with no latency
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            confirm_timeout: None,
            fail_next: AtomicU32::new(0),
            subscriptions: RwLock::new(Vec::new()),
            next_subscription_id: AtomicU64::new(1),
            log: Mutex::new(VecDeque::new()),
            log_capacity: DEFAULT_PUBLISH_LOG_CAPACITY,
            stats: Mutex::new(BusStats::default()),
        }
    }

    /// Create a broker from the bus configuration section
    pub fn from_config(config: &BusConfig) -> Self {
        let broker = Self::new()
            .with_latency(Duration::from_millis(config.latency_ms))
            .with_log_capacity(config.publish_log_capacity);
        match config.confirm_timeout() {
            Some(timeout) => broker.with_confirm_timeout(timeout),
            None => broker,
        }
    }

    /// Set the simulated confirmation latency
    pub fn with_latency(self, latency: Duration) -> Self {
        *lock(&self.latency) = latency;
        self
    }

    /// Keep at most `capacity` accepted messages in the publish log
    ///
    /// The oldest entries are evicted first; 0 disables the log.
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    /// Set the confirmation timeout
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = Some(timeout);
        self
    }

    /// Change the simulated latency at runtime
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Reject the next `count` publishes
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Logged accepted messages, in acceptance order
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.log).iter().cloned().collect()
    }

    /// Accepted messages for one channel, in acceptance order
    pub fn published_on(&self, channel: &str) -> Vec<PublishedMessage> {
        lock(&self.log)
            .iter()
            .filter(|m| m.channel == channel)
            .cloned()
            .collect()
    }

    /// Forget accepted messages
    pub fn clear_log(&self) {
        lock(&self.log).clear();
    }

    /// Snapshot of publish statistics
    pub fn stats(&self) -> BusStats {
        lock(&self.stats).clone()
    }

    /// Number of active subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Consume one pending injected failure, if any
    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Wait out the simulated confirmation handshake
    fn await_confirmation(&self, channel: &str) -> Result<()> {
        let latency = *lock(&self.latency);
        match self.confirm_timeout {
            Some(timeout) if latency > timeout => {
                std::thread::sleep(timeout);
                Err(TelemetryError::PublishTimeout {
                    channel: channel.to_string(),
                    timeout,
                })
            }
            _ => {
                if !latency.is_zero() {
                    std::thread::sleep(latency);
                }
                Ok(())
            }
        }
    }

    fn deliver(&self, message: &BusMessage) {
        let handlers: Vec<MessageHandler> = match self.subscriptions.read() {
            Ok(subs) => subs
                .iter()
                .filter(|s| topic_matches(&s.filter, &message.channel))
                .map(|s| s.handler.clone())
                .collect(),
            Err(_) => return,
        };

        for handler in handlers {
            handler(message);
        }
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for LocalBroker {
    fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!("Local broker connected");
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        tracing::info!("Local broker disconnected");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish(&self, channel: &str, payload: &[u8], qos: QoS) -> Result<()> {
        let start = Instant::now();

        if !self.is_connected() {
            lock(&self.stats).record_rejected();
            return Err(TelemetryError::NotConnected);
        }

        if self.take_injected_failure() {
            lock(&self.stats).record_rejected();
            return Err(TelemetryError::PublishFailure {
                channel: channel.to_string(),
                message: "injected failure".to_string(),
            });
        }

        if qos != QoS::AtMostOnce {
            if let Err(e) = self.await_confirmation(channel) {
                lock(&self.stats).record_unconfirmed();
                return Err(e);
            }
        }

        let message = BusMessage {
            channel: channel.to_string(),
            payload: payload.to_vec(),
            qos,
            received_at: Utc::now(),
        };

        if self.log_capacity > 0 {
            let mut log = lock(&self.log);
            if log.len() == self.log_capacity {
                log.pop_front();
            }
            log.push_back(PublishedMessage {
                channel: message.channel.clone(),
                payload: String::from_utf8_lossy(payload).into_owned(),
                qos,
                accepted_at: message.received_at,
            });
        }

        self.deliver(&message);

        let elapsed = start.elapsed().as_micros().max(1) as u64;
        lock(&self.stats).record_confirmed(elapsed, payload.len() as u64);
        tracing::trace!("Accepted {} bytes on '{}' ({})", payload.len(), channel, qos);
        Ok(())
    }

    fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<SubscriptionId> {
        if !self.is_connected() {
            return Err(TelemetryError::NotConnected);
        }

        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .write()
            .map_err(|_| TelemetryError::Config("subscription table poisoned".to_string()))?
            .push(Subscription {
                id,
                filter: filter.to_string(),
                handler,
            });
        tracing::debug!("Subscription {} on '{}' ({})", id, filter, qos);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.subscriptions.write() {
            Ok(mut subs) => {
                let before = subs.len();
                subs.retain(|s| s.id != id);
                subs.len() < before
            }
            Err(_) => false,
        }
    }
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
