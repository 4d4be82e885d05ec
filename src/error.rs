//! Error handling for the telemetry bus
//!
//! This module defines the crate error type and a Result alias for use
//! throughout the producer, publisher and subscriber layers.

use std::time::Duration;
use thiserror::Error;

/// Main error type for telemetry operations
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// A payload could not be decoded into a record
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// `start` was called for a channel that already has a worker
    #[error("Queue already active for channel '{0}'")]
    DuplicateQueueStart(String),

    /// `enqueue`/`stop` on a channel without an active worker
    #[error("Channel '{0}' is not started")]
    ChannelNotStarted(String),

    /// The bus did not confirm a publish in time
    #[error("Publish to '{channel}' not confirmed within {timeout:?}")]
    PublishTimeout { channel: String, timeout: Duration },

    /// The bus rejected a publish
    #[error("Publish to '{channel}' failed: {message}")]
    PublishFailure { channel: String, message: String },

    /// Operation requires a connected bus
    #[error("Bus not connected")]
    NotConnected,

    /// Experiment type outside 1..=5
    #[error("Invalid experiment type {0} (expected 1-5)")]
    InvalidExperimentType(u8),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// A channel worker thread panicked
    #[error("Worker for channel '{0}' panicked")]
    WorkerPanicked(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<TelemetryError>,
    },
}

impl TelemetryError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        TelemetryError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether a publish that failed with this error is worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            TelemetryError::PublishTimeout { .. }
            | TelemetryError::PublishFailure { .. }
            | TelemetryError::NotConnected
            | TelemetryError::Io(_) => true,
            TelemetryError::WithContext { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// Result type alias for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::io::Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| TelemetryError::Io(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| TelemetryError::Io(e).with_context(f()))
    }
}
