//! Test data builders for creating test objects

use telemetry_bus::codec::Envelope;
use telemetry_bus::config::{AppConfig, PublisherConfig, RetryPolicy};
use telemetry_bus::types::{ChannelLayout, QoS, Record};
use std::time::Duration;

/// Builder for sample records
pub struct RecordBuilder {
    record: Record,
}

impl RecordBuilder {
    pub fn new() -> Self {
        Self {
            record: Record::new(),
        }
    }

    /// Voltage-style sample `{x, y}`
    pub fn sample(x: f64, y: f64) -> Self {
        Self::new().number("x", x).number("y", y)
    }

    pub fn number(mut self, name: &str, value: f64) -> Self {
        self.record = self.record.with_number(name, value);
        self
    }

    pub fn series(mut self, name: &str, values: Vec<f64>) -> Self {
        self.record = self.record.with_series(name, values);
        self
    }

    pub fn build(self) -> Record {
        self.record
    }

    /// Encode for `channel` at exactly-once QoS
    pub fn envelope(self, channel: &str) -> Envelope {
        Envelope::encode(channel, QoS::ExactlyOnce, &self.record).unwrap()
    }
}

/// Builder for application configs with fast test settings
pub struct ConfigBuilder {
    config: AppConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.producer.interval_ms = 0;
        config.producer.seed = Some(42);
        config.dashboard.refresh_ms = 10;
        Self { config }
    }

    pub fn experiments(mut self, experiments: &[u8]) -> Self {
        self.config.producer.experiments = experiments.to_vec();
        self
    }

    pub fn points(mut self, points: u32) -> Self {
        self.config.producer.points = points;
        self
    }

    pub fn repeats(mut self, repeats: u32) -> Self {
        self.config.producer.repeats = repeats;
        self
    }

    pub fn layout(mut self, layout: ChannelLayout) -> Self {
        self.config.producer.layout = layout;
        self
    }

    pub fn topic(mut self, topic: &str) -> Self {
        self.config.producer.topic = topic.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

/// Publisher config with fast retries
pub fn fast_retry_config(max_attempts: u32) -> PublisherConfig {
    PublisherConfig {
        retry: RetryPolicy::fixed(max_attempts, Duration::from_millis(1)),
        ..PublisherConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder() {
        let record = RecordBuilder::sample(1.0, 2.0).build();
        assert_eq!(record.number("x"), Some(1.0));
        assert_eq!(record.number("y"), Some(2.0));
        assert!(!record.is_clear());
    }
}
