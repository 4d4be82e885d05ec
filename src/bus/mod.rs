//! Message bus interface
//!
//! The publish/subscribe bus is an external collaborator. This module defines
//! the narrow interface the rest of the crate consumes, plus the statistics
//! and topic-filter helpers shared by implementations.
//!
//! # Components
//!
//! - [`MessageBus`] - Connect, publish with confirmation, subscribe
//! - [`BusMessage`] - A message as delivered to a subscriber
//! - [`BusStats`] - Publish success rates and confirmation latency
//! - [`LocalBroker`] - In-process broker used by the CLI demo and tests
//!
//! # Topic Filters
//!
//! Subscriptions use MQTT-style filters: `+` matches exactly one level and a
//! trailing `#` matches any number of remaining levels, so `data/+` receives
//! `data/exp1` .. `data/exp5` and `data/#` additionally receives `data`.

pub mod local;

pub use local::{LocalBroker, PublishedMessage};

use crate::error::Result;
use crate::types::QoS;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Identifier returned by [`MessageBus::subscribe`]
pub type SubscriptionId = u64;

/// Callback invoked for every message matching a subscription
///
/// Handlers may be called concurrently from several publishing threads.
pub type MessageHandler = Arc<dyn Fn(&BusMessage) + Send + Sync>;

/// A message as delivered to subscribers
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Channel the message was published to
    pub channel: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// QoS the message was published with
    pub qos: QoS,
    /// Time the bus accepted the message
    pub received_at: DateTime<Utc>,
}

/// Publish outcomes as seen by a bus implementation
///
/// A publish either is confirmed, or fails because the broker rejected it or
/// never confirmed it in time. Confirmation time is measured for confirmed
/// publishes only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BusStats {
    /// Publishes the broker confirmed
    pub successful_publishes: u64,
    /// Publishes that failed for any reason
    pub failed_publishes: u64,
    /// Failed publishes whose confirmation did not arrive in time
    pub unconfirmed_publishes: u64,
    /// Payload bytes of confirmed publishes
    pub total_bytes_published: u64,
    /// Sum of confirmation times in microseconds
    pub total_confirm_time_us: u64,
    /// Slowest confirmation in microseconds
    pub max_confirm_time_us: u64,
}

impl BusStats {
    /// Mean confirmation time in microseconds
    pub fn avg_confirm_time_us(&self) -> f64 {
        if self.successful_publishes == 0 {
            0.0
        } else {
            self.total_confirm_time_us as f64 / self.successful_publishes as f64
        }
    }

    /// Confirmed publishes as a percentage of all attempts
    pub fn success_rate(&self) -> f64 {
        let total = self.successful_publishes + self.failed_publishes;
        if total == 0 {
            100.0
        } else {
            (self.successful_publishes as f64 / total as f64) * 100.0
        }
    }

    /// Record a confirmed publish
    pub fn record_confirmed(&mut self, confirm_time_us: u64, bytes: u64) {
        self.successful_publishes += 1;
        self.total_bytes_published += bytes;
        self.total_confirm_time_us += confirm_time_us;
        self.max_confirm_time_us = self.max_confirm_time_us.max(confirm_time_us);
    }

    /// Record a publish the broker rejected
    pub fn record_rejected(&mut self) {
        self.failed_publishes += 1;
    }

    /// Record a publish whose confirmation timed out
    pub fn record_unconfirmed(&mut self) {
        self.failed_publishes += 1;
        self.unconfirmed_publishes += 1;
    }
}

/// Unified interface for the publish/subscribe bus
///
/// Implementations must be `Send + Sync`: one bus handle is shared by every
/// channel worker of a publisher, and `publish` is called concurrently from
/// those workers.
///
/// # Example
///
/// ```ignore
/// fn send(bus: &dyn MessageBus, envelope: &Envelope) -> Result<()> {
///     bus.publish(envelope.channel(), envelope.as_bytes(), envelope.qos())
/// }
/// ```
pub trait MessageBus: Send + Sync {
    /// Connect to the bus
    fn connect(&self) -> Result<()>;

    /// Disconnect from the bus
    fn disconnect(&self);

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Publish a payload and block until the bus confirms acceptance
    ///
    /// Confirmation semantics follow `qos`: level 0 returns once the message
    /// is handed off, levels 1 and 2 wait for the broker acknowledgement.
    fn publish(&self, channel: &str, payload: &[u8], qos: QoS) -> Result<()>;

    /// Register a handler for every message whose channel matches `filter`
    fn subscribe(&self, filter: &str, qos: QoS, handler: MessageHandler)
        -> Result<SubscriptionId>;

    /// Remove a subscription, returning whether it existed
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

/// Check whether `topic` matches an MQTT-style subscription `filter`
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
