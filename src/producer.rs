//! Producer loop
//!
//! Drives one [`ExperimentSource`] per configured experiment type through a
//! [`PublishingHandler`], applying the tick cadence between rounds. Sources
//! are interleaved: every round takes at most one record from each active
//! source, so several experiments stream side by side on their own channels.
//!
//! A run ends when every source has emitted its clear record. The whole
//! sequence repeats `repeats` times, or indefinitely when `repeats` is 0.
//! The loop exits early when its stop handle is cleared or an interrupt
//! signal arrives; draining the queues is left to the publisher's owner.

use crate::config::ProducerConfig;
use crate::error::Result;
use crate::handler::{DataHandler, PublishingHandler};
use crate::publisher::QueuedPublisher;
use crate::signal;
use crate::source::ExperimentSource;
use crate::types::ExperimentType;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep while waiting for the next tick
const PAUSE_SLICE: Duration = Duration::from_millis(50);

/// Outcome of a producer run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerSummary {
    /// Completed runs
    pub runs: u32,
    /// Records handed to the publisher
    pub records: u64,
    /// Whether the loop was stopped before finishing
    pub interrupted: bool,
}

/// Producer feeding experiment records into a queued publisher
pub struct Producer {
    config: ProducerConfig,
    kinds: Vec<ExperimentType>,
    publisher: Arc<QueuedPublisher>,
    running: Arc<AtomicBool>,
}

impl Producer {
    /// Create a producer; fails on experiment types outside 1..=5
    pub fn new(config: ProducerConfig, publisher: Arc<QueuedPublisher>) -> Result<Self> {
        let kinds = config.experiment_types()?;
        Ok(Self {
            config,
            kinds,
            publisher,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Get a handle to stop the producer
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Channels the producer publishes to
    pub fn channels(&self) -> Vec<String> {
        self.config.layout.channels(&self.config.topic, &self.kinds)
    }

    fn should_continue(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !signal::shutdown_requested()
    }

    fn handler_for(&self, kind: ExperimentType) -> PublishingHandler {
        let handler =
            PublishingHandler::new(self.publisher.clone(), kind, &self.config.topic, self.config.layout);
        match &self.config.producer_id {
            Some(id) => handler.with_producer_id(id.clone()),
            None => handler,
        }
    }

    fn source_for(&self, kind: ExperimentType, run: u32) -> ExperimentSource {
        let source = ExperimentSource::new(kind, self.config.points);
        match self.config.seed {
            Some(seed) => source.with_seed(
                seed.wrapping_add(u64::from(run) * 16 + u64::from(kind.number())),
            ),
            None => source,
        }
    }

    /// Run every repeat to completion or until stopped
    pub fn run(&self) -> Result<ProducerSummary> {
        let mut summary = ProducerSummary::default();
        let interval = self.config.interval();

        let repeats = match self.config.repeats {
            0 => "unbounded".to_string(),
            n => n.to_string(),
        };
        tracing::info!(
            "Producing {} run(s) of {:?} with {} point(s) on {:?}",
            repeats,
            self.kinds,
            self.config.points,
            self.channels()
        );

        let mut run: u32 = 0;
        while self.config.repeats == 0 || run < self.config.repeats {
            let mut streams: Vec<(PublishingHandler, ExperimentSource)> = self
                .kinds
                .iter()
                .map(|&kind| (self.handler_for(kind), self.source_for(kind, run)))
                .collect();

            while !streams.is_empty() {
                if !self.should_continue() {
                    summary.interrupted = true;
                    tracing::info!("Producer stopped during run {}", run + 1);
                    return Ok(summary);
                }

                let tick_start = Instant::now();
                let mut emitted_data = false;

                streams.retain_mut(|(handler, source)| match source.next() {
                    Some(record) => {
                        emitted_data |= !record.is_clear();
                        if let Err(e) = handler.handle(record) {
                            tracing::error!("Dropping {} stream: {}", handler.kind(), e);
                            return false;
                        }
                        summary.records += 1;
                        true
                    }
                    None => false,
                });

                if emitted_data {
                    self.pause(interval.saturating_sub(tick_start.elapsed()));
                }
            }

            summary.runs += 1;
            tracing::debug!("Run {} of {} complete", run + 1, repeats);
            run = run.wrapping_add(1);
        }

        Ok(summary)
    }

    /// Sleep for `duration`, waking early if the producer is stopped
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.should_continue() {
                return;
            }
            std::thread::sleep(remaining.min(PAUSE_SLICE));
        }
    }
}
