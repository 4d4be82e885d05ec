//! Data handlers
//!
//! A [`DataHandler`] is anything that accepts records from an experiment
//! source. [`PublishingHandler`] is the production implementation, bound to
//! one experiment type: it tags each record, routes it to a channel per the
//! [`ChannelLayout`], encodes it and hands the envelope to a
//! [`QueuedPublisher`].

use crate::codec::Envelope;
use crate::error::Result;
use crate::publisher::QueuedPublisher;
use crate::types::{ChannelLayout, ExperimentType, Record};
use std::sync::Arc;

/// Capability to consume a record produced by an experiment source
pub trait DataHandler: Send + Sync {
    /// Handle one record
    fn handle(&self, record: Record) -> Result<()>;
}

/// Handler that publishes one experiment's records through a queued publisher
pub struct PublishingHandler {
    publisher: Arc<QueuedPublisher>,
    kind: ExperimentType,
    channel: String,
    layout: ChannelLayout,
    producer_id: Option<String>,
}

impl PublishingHandler {
    /// Create a handler for `kind` publishing under `topic` with the given layout
    pub fn new(
        publisher: Arc<QueuedPublisher>,
        kind: ExperimentType,
        topic: &str,
        layout: ChannelLayout,
    ) -> Self {
        Self {
            publisher,
            kind,
            channel: layout.channel_for(topic, kind),
            layout,
            producer_id: None,
        }
    }

    /// Tag every record with a producer identity
    pub fn with_producer_id(mut self, id: impl Into<String>) -> Self {
        self.producer_id = Some(id.into());
        self
    }

    /// Experiment type this handler serves
    pub fn kind(&self) -> ExperimentType {
        self.kind
    }

    /// Channel every record is routed to
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wire form of `record`
    ///
    /// Multiplexed records, clear records included, carry a `type`
    /// discriminator.
    pub fn envelope_for(&self, mut record: Record) -> Result<Envelope> {
        if self.layout == ChannelLayout::Multiplexed {
            record.kind = Some(self.kind);
        }
        if let Some(id) = &self.producer_id {
            record.id = Some(id.clone());
        }

        Envelope::encode(self.channel.as_str(), self.publisher.qos(), &record)
    }
}

impl DataHandler for PublishingHandler {
    fn handle(&self, record: Record) -> Result<()> {
        let envelope = self.envelope_for(record)?;
        tracing::trace!("Queueing {} record for '{}'", self.kind, self.channel);
        self.publisher.enqueue(&self.channel, envelope)
    }
}
