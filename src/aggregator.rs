//! Consumer-side aggregator
//!
//! Keeps, per stream, the most recent record plus a bounded accumulation of
//! every numeric field seen since the last clear. A stream is a channel, or a
//! `(channel, type)` pair when records carry a `type` discriminator on a
//! multiplexed channel.
//!
//! # Concurrency
//!
//! Writers (bus callbacks, possibly several at once) and readers (the render
//! loop) share one [`RwLock`]. Readers receive owned [`StreamSnapshot`]s and
//! never hold the lock while rendering.
//!
//! # Accumulation Rules
//!
//! - Scalar fields (`x`, `y1`, ...) are appended to a column of the same name
//! - Array fields (`x_fwd`, ...) replace their column, since they carry a
//!   whole sweep in one record
//! - Columns are capped at `max_samples`; the oldest values are evicted
//! - A clear record empties every column of the stream (zero rows)

use crate::types::{ExperimentType, FieldValue, Record};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Identity of one aggregated stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    /// Channel the records arrived on
    pub channel: String,
    /// Discriminator carried by multiplexed records
    pub kind: Option<ExperimentType>,
}

impl StreamKey {
    /// Key for an untagged channel
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            kind: None,
        }
    }

    /// Key for a tagged stream on a multiplexed channel
    pub fn tagged(channel: impl Into<String>, kind: ExperimentType) -> Self {
        Self {
            channel: channel.into(),
            kind: Some(kind),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "{}[{}]", self.channel, kind),
            None => write!(f, "{}", self.channel),
        }
    }
}

/// Owned copy of one stream's state
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSnapshot {
    /// Stream identity
    pub key: StreamKey,
    /// Most recent record, clear records included
    pub latest: Option<Record>,
    /// Accumulated columns since the last clear
    pub columns: BTreeMap<String, Vec<f64>>,
    /// Records received over the stream's lifetime
    pub received: u64,
    /// Clear records received
    pub clears: u64,
    /// Time of the last ingest
    pub updated_at: Option<DateTime<Utc>>,
}

impl StreamSnapshot {
    /// Number of accumulated rows (length of the longest column)
    pub fn rows(&self) -> usize {
        self.columns.values().map(Vec::len).max().unwrap_or(0)
    }

    /// Accumulated values of one column
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }
}

#[derive(Debug, Default)]
struct StreamState {
    latest: Option<Record>,
    columns: BTreeMap<String, VecDeque<f64>>,
    received: u64,
    clears: u64,
    updated_at: Option<DateTime<Utc>>,
}

impl StreamState {
    fn ingest(&mut self, record: Record, max_samples: usize) {
        self.received += 1;
        self.updated_at = Some(Utc::now());

        if record.is_clear() {
            self.clears += 1;
            self.columns.clear();
        } else {
            for (name, value) in &record.fields {
                match value {
                    FieldValue::Number(v) => {
                        let column = self.columns.entry(name.clone()).or_default();
                        column.push_back(*v);
                        while column.len() > max_samples {
                            column.pop_front();
                        }
                    }
                    FieldValue::Series(values) => {
                        let skip = values.len().saturating_sub(max_samples);
                        self.columns
                            .insert(name.clone(), values[skip..].iter().copied().collect());
                    }
                    FieldValue::Flag(_) | FieldValue::Table(_) => {}
                }
            }
        }

        self.latest = Some(record);
    }

    fn snapshot(&self, key: &StreamKey) -> StreamSnapshot {
        StreamSnapshot {
            key: key.clone(),
            latest: self.latest.clone(),
            columns: self
                .columns
                .iter()
                .map(|(name, values)| (name.clone(), values.iter().copied().collect()))
                .collect(),
            received: self.received,
            clears: self.clears,
            updated_at: self.updated_at,
        }
    }
}

/// Thread-safe store of the latest data per stream
#[derive(Debug)]
pub struct Aggregator {
    streams: RwLock<HashMap<StreamKey, StreamState>>,
    max_samples: usize,
}

impl Aggregator {
    /// Create an aggregator keeping at most `max_samples` values per column
    pub fn new(max_samples: usize) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            max_samples: max_samples.max(1),
        }
    }

    /// Column length cap
    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    /// Store a decoded record received on `channel`
    pub fn ingest(&self, channel: &str, record: Record) {
        let key = StreamKey {
            channel: channel.to_string(),
            kind: record.kind,
        };

        if record.is_clear() {
            tracing::debug!("Clearing stream '{}'", key);
        }

        self.write()
            .entry(key)
            .or_default()
            .ingest(record, self.max_samples);
    }

    /// Snapshot of one stream
    pub fn snapshot(&self, key: &StreamKey) -> Option<StreamSnapshot> {
        self.read().get(key).map(|state| state.snapshot(key))
    }

    /// Snapshot of an untagged channel
    pub fn channel_snapshot(&self, channel: &str) -> Option<StreamSnapshot> {
        self.snapshot(&StreamKey::channel(channel))
    }

    /// Snapshots of every stream, ordered by key
    pub fn snapshots(&self) -> Vec<StreamSnapshot> {
        let streams = self.read();
        let mut keys: Vec<&StreamKey> = streams.keys().collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|key| streams.get(key).map(|state| state.snapshot(key)))
            .collect()
    }

    /// Keys of every known stream, sorted
    pub fn streams(&self) -> Vec<StreamKey> {
        let mut keys: Vec<StreamKey> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Most recent record of one stream
    pub fn latest(&self, key: &StreamKey) -> Option<Record> {
        self.read().get(key).and_then(|state| state.latest.clone())
    }

    /// Accumulated rows of one stream (0 for unknown streams)
    pub fn rows(&self, key: &StreamKey) -> usize {
        self.read()
            .get(key)
            .and_then(|state| state.columns.values().map(VecDeque::len).max())
            .unwrap_or(0)
    }

    /// Forget every stream
    pub fn reset(&self) {
        self.write().clear();
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<StreamKey, StreamState>> {
        self.streams.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<StreamKey, StreamState>> {
        self.streams.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_SAMPLES)
    }
}
