//! Integration tests for configuration files

mod common;

use common::builders::ConfigBuilder;
use std::io::Write;
use tempfile::{tempdir, Builder};
use telemetry_bus::config::AppConfig;
use telemetry_bus::error::TelemetryError;
use telemetry_bus::types::{ChannelLayout, QoS};

#[test]
fn test_toml_save_and_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut config = ConfigBuilder::new()
        .experiments(&[2, 5])
        .points(64)
        .repeats(3)
        .layout(ChannelLayout::Multiplexed)
        .build();
    config.bus.qos = QoS::AtLeastOnce;
    config.logging.log_dir = Some(dir.path().join("logs"));
    config.save(&path).unwrap();

    let loaded = AppConfig::load(&path).unwrap();
    assert_eq!(loaded.producer.experiments, vec![2, 5]);
    assert_eq!(loaded.producer.points, 64);
    assert_eq!(loaded.producer.repeats, 3);
    assert_eq!(loaded.producer.layout, ChannelLayout::Multiplexed);
    assert_eq!(loaded.bus.qos, QoS::AtLeastOnce);
    assert_eq!(loaded.logging.log_dir, Some(dir.path().join("logs")));
    assert_eq!(loaded.publisher.retry, config.publisher.retry);
}

#[test]
fn test_disabled_timeouts_survive_save_and_load() {
    let dir = tempdir().unwrap();

    for name in ["config.toml", "config.json"] {
        let path = dir.path().join(name);
        let mut config = ConfigBuilder::new().build();
        config.publisher.stop_timeout_ms = 0;
        config.bus.confirm_timeout_ms = 0;
        config.bus.publish_log_capacity = 0;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.publisher.stop_timeout(), None, "{}", name);
        assert_eq!(loaded.bus.confirm_timeout(), None, "{}", name);
        assert_eq!(loaded.bus.publish_log_capacity, 0, "{}", name);
    }
}

#[test]
fn test_json_file_is_detected_by_extension() {
    let mut file = Builder::new().suffix(".json").tempfile().unwrap();
    write!(
        file,
        r#"{{"producer": {{"topic": "lab", "experiments": [4]}}, "bus": {{"qos": 0}}}}"#
    )
    .unwrap();

    let config = AppConfig::load(file.path()).unwrap();
    assert_eq!(config.producer.topic, "lab");
    assert_eq!(config.producer.experiments, vec![4]);
    assert_eq!(config.bus.qos, QoS::AtMostOnce);
    assert_eq!(config.producer.channels().unwrap(), vec!["lab/exp4".to_string()]);
}

#[test]
fn test_invalid_experiment_fails_validation() {
    let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[producer]\nexperiments = [1, 9]").unwrap();

    let config = AppConfig::load(file.path()).unwrap();
    assert!(matches!(
        config.validate(),
        Err(TelemetryError::InvalidExperimentType(9))
    ));
}

#[test]
fn test_invalid_qos_is_a_parse_error() {
    let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[bus]\nqos = 3").unwrap();

    assert!(matches!(
        AppConfig::load(file.path()),
        Err(TelemetryError::Config(_))
    ));
}

#[test]
fn test_missing_file_is_reported() {
    let dir = tempdir().unwrap();
    let result = AppConfig::load(dir.path().join("absent.toml"));
    assert!(matches!(result, Err(TelemetryError::Config(_))));
}
