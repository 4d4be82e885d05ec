//! Bus subscriber
//!
//! Attaches to the bus with a channel filter, decodes every delivered payload
//! and feeds the result into an [`Aggregator`]. A malformed payload is logged,
//! counted and skipped; it never takes down the subscription.

use crate::aggregator::Aggregator;
use crate::bus::{BusMessage, MessageBus, MessageHandler, SubscriptionId};
use crate::codec::decode_record;
use crate::error::{Result, ResultExt};
use crate::types::QoS;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Delivery counters for a subscriber
#[derive(Debug, Default)]
pub struct SubscriberStats {
    received: AtomicU64,
    malformed: AtomicU64,
}

impl SubscriberStats {
    /// Messages delivered by the bus
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    /// Messages skipped because they failed to decode
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::SeqCst)
    }
}

/// Subscriber that decodes bus messages into an aggregator
pub struct Subscriber {
    bus: Arc<dyn MessageBus>,
    aggregator: Arc<Aggregator>,
    stats: Arc<SubscriberStats>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl Subscriber {
    /// Create a subscriber feeding `aggregator`
    pub fn new(bus: Arc<dyn MessageBus>, aggregator: Arc<Aggregator>) -> Self {
        Self {
            bus,
            aggregator,
            stats: Arc::new(SubscriberStats::default()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to every channel matching `filter`
    pub fn attach(&self, filter: &str, qos: QoS) -> Result<SubscriptionId> {
        let aggregator = self.aggregator.clone();
        let stats = self.stats.clone();

        let handler: MessageHandler = Arc::new(move |message: &BusMessage| {
            stats.received.fetch_add(1, Ordering::SeqCst);
            match decode_record(&message.payload) {
                Ok(record) => aggregator.ingest(&message.channel, record),
                Err(e) => {
                    stats.malformed.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!("Skipping payload on '{}': {}", message.channel, e);
                }
            }
        });

        let id = self
            .bus
            .subscribe(filter, qos, handler)
            .with_context(|| format!("subscribing to '{}'", filter))?;

        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(id);
        tracing::info!("Subscribed to '{}' ({})", filter, qos);
        Ok(id)
    }

    /// Remove every subscription made by this subscriber
    pub fn detach(&self) -> usize {
        let ids: Vec<SubscriptionId> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();

        ids.into_iter().filter(|id| self.bus.unsubscribe(*id)).count()
    }

    /// Aggregator fed by this subscriber
    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// Delivery counters
    pub fn stats(&self) -> &SubscriberStats {
        &self.stats
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::StreamKey;
    use crate::bus::LocalBroker;

    fn setup() -> (Arc<LocalBroker>, Subscriber) {
        let broker = Arc::new(LocalBroker::new());
        broker.connect().unwrap();
        let subscriber = Subscriber::new(broker.clone(), Arc::new(Aggregator::new(100)));
        (broker, subscriber)
    }

    #[test]
    fn test_decodes_into_aggregator() {
        let (broker, subscriber) = setup();
        subscriber.attach("data/+", QoS::ExactlyOnce).unwrap();

        broker
            .publish("data/exp1", br#"{"x": 0, "y": 1.0, "clear": false}"#, QoS::ExactlyOnce)
            .unwrap();
        broker
            .publish("data/exp1", br#"{"x": 1, "y": 1.1, "clear": false}"#, QoS::ExactlyOnce)
            .unwrap();

        let snapshot = subscriber.aggregator().channel_snapshot("data/exp1").unwrap();
        assert_eq!(snapshot.rows(), 2);
        assert_eq!(subscriber.stats().received(), 2);
        assert_eq!(subscriber.stats().malformed(), 0);
    }

    #[test]
    fn test_malformed_payload_is_skipped() {
        let (broker, subscriber) = setup();
        subscriber.attach("data/#", QoS::ExactlyOnce).unwrap();

        broker.publish("data/exp1", b"{not json", QoS::ExactlyOnce).unwrap();
        broker.publish("data/exp1", br#"{"x": 1.0}"#, QoS::ExactlyOnce).unwrap();
        broker
            .publish("data/exp1", br#"{"x": 2, "clear": false}"#, QoS::ExactlyOnce)
            .unwrap();

        assert_eq!(subscriber.stats().received(), 3);
        assert_eq!(subscriber.stats().malformed(), 2);
        assert_eq!(subscriber.aggregator().rows(&StreamKey::channel("data/exp1")), 1);
    }

    #[test]
    fn test_filter_limits_delivery() {
        let (broker, subscriber) = setup();
        subscriber.attach("data/exp2", QoS::ExactlyOnce).unwrap();

        broker.publish("data/exp1", br#"{"clear": true}"#, QoS::ExactlyOnce).unwrap();
        assert_eq!(subscriber.stats().received(), 0);
        assert!(subscriber.aggregator().streams().is_empty());
    }

    #[test]
    fn test_detach_and_drop_unsubscribe() {
        let (broker, subscriber) = setup();
        subscriber.attach("data/+", QoS::ExactlyOnce).unwrap();
        subscriber.attach("other", QoS::AtLeastOnce).unwrap();
        assert_eq!(broker.subscription_count(), 2);

        assert_eq!(subscriber.detach(), 2);
        assert_eq!(broker.subscription_count(), 0);

        subscriber.attach("data/+", QoS::ExactlyOnce).unwrap();
        drop(subscriber);
        assert_eq!(broker.subscription_count(), 0);
    }

    #[test]
    fn test_attach_requires_connection() {
        let broker = Arc::new(LocalBroker::new());
        let subscriber = Subscriber::new(broker, Arc::new(Aggregator::new(10)));
        assert!(subscriber.attach("data/+", QoS::ExactlyOnce).is_err());
    }
}
