//! # telemetry-bus: queued telemetry publishing over a pub/sub bus
//!
//! A producer generates simulated experiment measurements and publishes them
//! over a publish/subscribe message bus; a subscriber aggregates the latest
//! data per channel for a live dashboard.
//!
//! ## Architecture
//!
//! ```text
//! ExperimentSource -> DataHandler -> QueuedPublisher -> bus -> Subscriber -> Aggregator -> Dashboard
//! ```
//!
//! - **Source**: Synthetic records for five experiment shapes, ending each run with a clear
//! - **Handler**: Tags, routes and encodes records into envelopes
//! - **Publisher**: One unbounded queue and worker thread per channel; `enqueue` never blocks
//! - **Bus**: The [`bus::MessageBus`] trait, with an in-process [`bus::LocalBroker`]
//! - **Aggregator**: Latest record plus bounded columns per stream, behind a `RwLock`
//! - **Dashboard**: Fixed-interval render loop over aggregator snapshots
//!
//! ## Configuration
//!
//! Settings live in `telemetry-bus/config.toml` under the platform config
//! directory; see [`config::AppConfig`].
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use telemetry_bus::{
//!     bus::LocalBroker, config::AppConfig, producer::Producer, publisher::ScopedPublisher,
//! };
//!
//! let config = AppConfig::default();
//! config.validate()?;
//!
//! let bus = Arc::new(LocalBroker::from_config(&config.bus));
//! let channels = config.producer.channels()?;
//! let publisher = ScopedPublisher::open(bus, config.bus.qos, config.publisher.clone(), &channels)?;
//!
//! Producer::new(config.producer.clone(), publisher.handle())?.run()?;
//! // Dropping `publisher` drains every queue and disconnects
//! ```

pub mod aggregator;
pub mod bus;
pub mod codec;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod handler;
pub mod logging;
pub mod producer;
pub mod publisher;
pub mod signal;
pub mod source;
pub mod subscriber;
pub mod types;

// Re-export commonly used types
pub use aggregator::{Aggregator, StreamKey, StreamSnapshot};
pub use bus::{LocalBroker, MessageBus};
pub use codec::{decode_record, encode_record, Envelope};
pub use config::AppConfig;
pub use error::{Result, TelemetryError};
pub use handler::{DataHandler, PublishingHandler};
pub use publisher::{PublishFailure, QueuedPublisher, ScopedPublisher, StopReport};
pub use types::{ChannelLayout, ExperimentType, QoS, Record};
