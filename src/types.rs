//! Core data types for the telemetry bus
//!
//! This module contains the data structures shared by the producer and
//! consumer sides of the pipeline.
//!
//! # Main Types
//!
//! - [`Record`] - One sample of experiment data (named fields plus a `clear` flag)
//! - [`FieldValue`] - A single field value (flag, number, series or table)
//! - [`ExperimentType`] - The five supported experiment shapes
//! - [`QoS`] - Bus delivery guarantee tier
//! - [`ChannelLayout`] - How experiments are mapped onto bus channels
//!
//! # Channel Naming
//!
//! Channels hang off an operator-supplied base topic (default `"data"`).
//! With [`ChannelLayout::PerExperiment`] each experiment publishes to
//! `<topic>/exp<N>`; with [`ChannelLayout::Multiplexed`] every experiment
//! shares `<topic>` and records carry a `type` discriminator.

use crate::error::{Result, TelemetryError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default base topic
pub const DEFAULT_TOPIC: &str = "data";

/// Wire key of the clear flag
pub const CLEAR_KEY: &str = "clear";

/// Value of a single named record field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Boolean flag
    Flag(bool),
    /// Scalar measurement
    Number(f64),
    /// Whole 1-D array (e.g. one sweep direction)
    Series(Vec<f64>),
    /// Whole 2-D array (e.g. a `data` table)
    Table(Vec<Vec<f64>>),
}

impl FieldValue {
    /// Get the scalar value, if this is a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the array value, if this is a series
    pub fn as_series(&self) -> Option<&[f64]> {
        match self {
            FieldValue::Series(v) => Some(v),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Flag(v)
    }
}

impl From<Vec<f64>> for FieldValue {
    fn from(v: Vec<f64>) -> Self {
        FieldValue::Series(v)
    }
}

/// One sample of experiment data
///
/// Field names are kept verbatim on the wire. `clear` is always serialized;
/// a record with `clear = true` carries no data fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Discard accumulated history for this channel
    pub clear: bool,
    /// Experiment discriminator (present when multiplexed on one channel)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ExperimentType>,
    /// Optional producer identity tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Type-specific data fields
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

impl Record {
    /// Create an empty data record (`clear = false`)
    pub fn new() -> Self {
        Self {
            clear: false,
            kind: None,
            id: None,
            fields: BTreeMap::new(),
        }
    }

    /// Create a clear sentinel record
    pub fn clear_sentinel() -> Self {
        Self {
            clear: true,
            ..Self::new()
        }
    }

    /// Add a scalar field
    pub fn with_number(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.insert(name.into(), FieldValue::Number(value));
        self
    }

    /// Add an array field
    pub fn with_series(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.fields.insert(name.into(), FieldValue::Series(values));
        self
    }

    /// Add an arbitrary field
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Tag the record with its experiment type
    pub fn with_kind(mut self, kind: ExperimentType) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Tag the record with a producer id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Check if this is a clear sentinel
    pub fn is_clear(&self) -> bool {
        self.clear
    }

    /// Look up a scalar field
    pub fn number(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(FieldValue::as_number)
    }

    /// Look up an array field
    pub fn series(&self, name: &str) -> Option<&[f64]> {
        self.fields.get(name).and_then(FieldValue::as_series)
    }
}

/// Experiment shapes produced by the data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExperimentType {
    /// Voltage vs time
    #[serde(rename = "type1")]
    Voltage,
    /// I-V sweep (forward and reverse, single emission)
    #[serde(rename = "type2")]
    IvSweep,
    /// Maximum power point tracking
    #[serde(rename = "type3")]
    Mppt,
    /// Current/power vs time
    #[serde(rename = "type4")]
    CurrentPower,
    /// External quantum efficiency spectrum
    #[serde(rename = "type5")]
    Eqe,
}

impl ExperimentType {
    /// Get all experiment types in numeric order
    pub fn all() -> &'static [ExperimentType] {
        &[
            ExperimentType::Voltage,
            ExperimentType::IvSweep,
            ExperimentType::Mppt,
            ExperimentType::CurrentPower,
            ExperimentType::Eqe,
        ]
    }

    /// Numeric identifier (1-5)
    pub fn number(&self) -> u8 {
        match self {
            ExperimentType::Voltage => 1,
            ExperimentType::IvSweep => 2,
            ExperimentType::Mppt => 3,
            ExperimentType::CurrentPower => 4,
            ExperimentType::Eqe => 5,
        }
    }

    /// Human-readable description
    pub fn display_name(&self) -> &'static str {
        match self {
            ExperimentType::Voltage => "voltage vs time",
            ExperimentType::IvSweep => "I-V sweep",
            ExperimentType::Mppt => "MPPT",
            ExperimentType::CurrentPower => "current/power vs time",
            ExperimentType::Eqe => "EQE spectrum",
        }
    }

    /// Per-experiment sub-channel under `topic`
    pub fn channel(&self, topic: &str) -> String {
        format!("{}/exp{}", topic, self.number())
    }

    /// Parse a list of numeric experiment types, failing on the first invalid one
    pub fn parse_list(numbers: &[u8]) -> Result<Vec<ExperimentType>> {
        numbers.iter().map(|&n| ExperimentType::try_from(n)).collect()
    }
}

impl TryFrom<u8> for ExperimentType {
    type Error = TelemetryError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(ExperimentType::Voltage),
            2 => Ok(ExperimentType::IvSweep),
            3 => Ok(ExperimentType::Mppt),
            4 => Ok(ExperimentType::CurrentPower),
            5 => Ok(ExperimentType::Eqe),
            other => Err(TelemetryError::InvalidExperimentType(other)),
        }
    }
}

impl std::fmt::Display for ExperimentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "type{}", self.number())
    }
}

/// Bus delivery guarantee tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// Fire and forget
    AtMostOnce,
    /// Acknowledged delivery, duplicates possible
    AtLeastOnce,
    /// Four-step handshake, delivered once
    #[default]
    ExactlyOnce,
}

impl QoS {
    /// Numeric level (0-2)
    pub fn level(&self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("invalid QoS level {} (expected 0-2)", other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos.level()
    }
}

impl std::fmt::Display for QoS {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "qos{}", self.level())
    }
}

/// How experiments map onto bus channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLayout {
    /// One sub-channel per experiment: `<topic>/exp<N>`
    #[default]
    PerExperiment,
    /// All experiments share `<topic>`, records carry `type`
    Multiplexed,
}

impl ChannelLayout {
    /// Channel that records of `kind` are published to
    pub fn channel_for(&self, topic: &str, kind: ExperimentType) -> String {
        match self {
            ChannelLayout::PerExperiment => kind.channel(topic),
            ChannelLayout::Multiplexed => topic.to_string(),
        }
    }

    /// All channels a producer running `kinds` will publish to, without duplicates
    pub fn channels(&self, topic: &str, kinds: &[ExperimentType]) -> Vec<String> {
        let mut channels: Vec<String> = kinds.iter().map(|k| self.channel_for(topic, *k)).collect();
        channels.sort();
        channels.dedup();
        channels
    }
}
