//! Message envelope codec
//!
//! Converts [`Record`]s to the JSON text carried on the bus and back.
//! Field names are preserved verbatim and the `clear` flag is always
//! present, so a consumer can branch on it without knowing the
//! experiment type.
//!
//! Decoding never panics: anything that is not a JSON object with a
//! boolean `clear` key is reported as [`TelemetryError::MalformedPayload`].
//!
//! Both directions apply the same record rules, so whatever encodes also
//! decodes to an equal record. Encoding a record that breaks them fails with
//! [`TelemetryError::Serialization`] on the producer side.

use crate::error::{Result, TelemetryError};
use crate::types::{FieldValue, QoS, Record, CLEAR_KEY};

/// Keys owned by the record header
const RESERVED_KEYS: [&str; 3] = [CLEAR_KEY, "type", "id"];

/// Encode a record as a UTF-8 JSON payload
pub fn encode_record(record: &Record) -> Result<String> {
    check_record(record).map_err(TelemetryError::Serialization)?;
    serde_json::to_string(record).map_err(|e| TelemetryError::Serialization(e.to_string()))
}

/// Decode a wire payload into a record
pub fn decode_record(payload: &[u8]) -> Result<Record> {
    let record: Record = serde_json::from_slice(payload)
        .map_err(|e| TelemetryError::MalformedPayload(e.to_string()))?;

    check_record(&record).map_err(TelemetryError::MalformedPayload)?;
    Ok(record)
}

/// Rules a record must satisfy to be carried on the wire
fn check_record(record: &Record) -> std::result::Result<(), String> {
    if record.clear && !record.fields.is_empty() {
        return Err(format!(
            "clear record carries {} data field(s)",
            record.fields.len()
        ));
    }

    for (name, value) in &record.fields {
        if RESERVED_KEYS.contains(&name.as_str()) {
            return Err(format!("field name '{}' is reserved", name));
        }
        match value {
            FieldValue::Flag(_) => {}
            FieldValue::Number(v) => check_finite(name, std::iter::once(v))?,
            FieldValue::Series(values) => check_finite(name, values.iter())?,
            // An empty table has the same wire form as an empty series
            FieldValue::Table(rows) if rows.is_empty() => {
                return Err(format!("field '{}' is an empty table", name));
            }
            FieldValue::Table(rows) => check_finite(name, rows.iter().flatten())?,
        }
    }

    Ok(())
}

fn check_finite<'a>(
    name: &str,
    mut values: impl Iterator<Item = &'a f64>,
) -> std::result::Result<(), String> {
    match values.find(|v| !v.is_finite()) {
        Some(v) => Err(format!("field '{}' holds non-finite value {}", name, v)),
        None => Ok(()),
    }
}

/// Wire form of a record, routed to a channel at a QoS level
///
/// Envelopes are immutable once built; the publisher only forwards them.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    channel: String,
    qos: QoS,
    payload: String,
}

impl Envelope {
    /// Wrap an already-encoded payload
    pub fn new(channel: impl Into<String>, qos: QoS, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            qos,
            payload: payload.into(),
        }
    }

    /// Encode a record into an envelope for `channel`
    pub fn encode(channel: impl Into<String>, qos: QoS, record: &Record) -> Result<Self> {
        Ok(Self::new(channel, qos, encode_record(record)?))
    }

    /// Destination channel
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Delivery quality level
    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Encoded payload text
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Encoded payload bytes
    pub fn as_bytes(&self) -> &[u8] {
        self.payload.as_bytes()
    }

    /// Decode the payload back into a record
    pub fn decode(&self) -> Result<Record> {
        decode_record(self.as_bytes())
    }
}
