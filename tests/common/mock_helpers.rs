//! Mock construction helpers

use mockall::mock;
use std::sync::Arc;
use telemetry_bus::bus::{LocalBroker, MessageBus, MessageHandler, SubscriptionId};
use telemetry_bus::error::Result;
use telemetry_bus::types::QoS;

mock! {
    /// Mocked bus for scripting publish outcomes
    pub Bus {}

    impl MessageBus for Bus {
        fn connect(&self) -> Result<()>;
        fn disconnect(&self);
        fn is_connected(&self) -> bool;
        fn publish(&self, channel: &str, payload: &[u8], qos: QoS) -> Result<()>;
        fn subscribe(&self, filter: &str, qos: QoS, handler: MessageHandler) -> Result<SubscriptionId>;
        fn unsubscribe(&self, id: SubscriptionId) -> bool;
    }
}

/// Create a connected in-process broker
pub fn connected_broker() -> Arc<LocalBroker> {
    let broker = Arc::new(LocalBroker::new());
    broker.connect().unwrap();
    broker
}
