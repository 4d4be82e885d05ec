//! Channel worker thread
//!
//! One [`ChannelWorker`] runs per active channel. It owns the consuming end
//! of that channel's queue and publishes envelopes to the bus one at a time,
//! waiting for each confirmation before taking the next item.
//!
//! # Loop
//!
//! 1. Block on the queue until an item arrives
//! 2. [`QueueItem::Stop`] ends the loop; everything queued before it has
//!    already been published
//! 3. Otherwise publish with retry; on exhaustion the envelope goes to the
//!    failure sink and the loop continues with the next item
//!
//! A cancelled worker (see [`super::QueuedPublisher::stop_with_timeout`])
//! finishes the publish it is blocked in and then exits without taking
//! further items.

use crate::bus::MessageBus;
use crate::codec::Envelope;
use crate::config::RetryPolicy;
use crate::types::QoS;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Item carried by a channel queue
#[derive(Debug, Clone)]
pub enum QueueItem {
    /// An envelope to publish
    Publish(Envelope),
    /// Stop sentinel
    Stop,
}

/// An envelope that could not be published after all retries
#[derive(Debug, Clone)]
pub struct PublishFailure {
    /// Channel the worker serves
    pub channel: String,
    /// The undelivered envelope
    pub envelope: Envelope,
    /// Number of publish attempts made
    pub attempts: u32,
    /// Error from the last attempt
    pub error: String,
    /// Time the envelope was given up on
    pub failed_at: DateTime<Utc>,
}

/// Per-channel delivery counters shared between worker and publisher
///
/// Every accepted envelope ends up in exactly one of `delivered`, `failed`
/// or `dropped`; until then it is pending or in flight.
#[derive(Debug, Default)]
pub struct ChannelCounters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelCounters {
    /// Envelopes accepted onto the queue
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::SeqCst)
    }

    /// Envelopes confirmed by the bus
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Envelopes routed to the failure sink
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Envelopes discarded after cancellation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    pub(crate) fn add_enqueued(&self, count: u64) {
        self.enqueued.fetch_add(count, Ordering::SeqCst);
    }

    pub(crate) fn add_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::SeqCst);
    }
}

/// Worker that drains one channel queue into the bus
pub struct ChannelWorker {
    /// Channel every envelope is published to
    channel: String,
    /// Delivery quality for this channel
    qos: QoS,
    /// Shared bus handle
    bus: Arc<dyn MessageBus>,
    /// Retry policy for failed publishes
    retry: RetryPolicy,
    /// Consuming end of the queue
    queue: Receiver<QueueItem>,
    /// Sink for envelopes that exhausted their retries
    failures: Sender<PublishFailure>,
    /// Set when the publisher gives up waiting for this worker
    cancelled: Arc<AtomicBool>,
    /// Delivery counters
    counters: Arc<ChannelCounters>,
    /// Signalled once the loop has exited
    done: Sender<()>,
}

impl ChannelWorker {
    /// Create a new channel worker
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel: String,
        qos: QoS,
        bus: Arc<dyn MessageBus>,
        retry: RetryPolicy,
        queue: Receiver<QueueItem>,
        failures: Sender<PublishFailure>,
        cancelled: Arc<AtomicBool>,
        counters: Arc<ChannelCounters>,
        done: Sender<()>,
    ) -> Self {
        Self {
            channel,
            qos,
            bus,
            retry,
            queue,
            failures,
            cancelled,
            counters,
            done,
        }
    }

    /// Run the worker loop until the stop sentinel or cancellation
    pub fn run(self) {
        tracing::info!("Channel worker for '{}' started", self.channel);

        loop {
            let envelope = match self.queue.recv() {
                Ok(QueueItem::Publish(envelope)) => envelope,
                Ok(QueueItem::Stop) => {
                    tracing::debug!("Stop sentinel observed on '{}'", self.channel);
                    break;
                }
                Err(_) => {
                    tracing::debug!("Queue for '{}' disconnected", self.channel);
                    break;
                }
            };

            if self.is_cancelled() {
                tracing::warn!("Worker for '{}' cancelled, discarding queued envelope", self.channel);
                self.counters.add_dropped(1);
                break;
            }

            self.publish_with_retry(envelope);

            if self.is_cancelled() {
                break;
            }
        }

        let _ = self.done.send(());
        tracing::info!(
            "Channel worker for '{}' stopped ({} delivered, {} failed)",
            self.channel,
            self.counters.delivered(),
            self.counters.failed()
        );
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Publish one envelope, retrying transient failures per the policy
    fn publish_with_retry(&self, envelope: Envelope) {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let error = match self.bus.publish(&self.channel, envelope.as_bytes(), self.qos) {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::SeqCst);
                    tracing::trace!("Published to '{}' (attempt {})", self.channel, attempt);
                    return;
                }
                Err(e) => e,
            };

            let exhausted = attempt >= self.retry.max_attempts
                || !error.is_transient()
                || self.is_cancelled();

            if exhausted {
                tracing::error!(
                    "Giving up on envelope for '{}' after {} attempt(s): {}",
                    self.channel,
                    attempt,
                    error
                );
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                let _ = self.failures.send(PublishFailure {
                    channel: self.channel.clone(),
                    envelope,
                    attempts: attempt,
                    error: error.to_string(),
                    failed_at: Utc::now(),
                });
                return;
            }

            let delay = self.retry.backoff_for(attempt);
            tracing::warn!(
                "Publish to '{}' failed (attempt {}/{}), retrying in {:?}: {}",
                self.channel,
                attempt,
                self.retry.max_attempts,
                delay,
                error
            );
            std::thread::sleep(delay);
        }
    }
}
