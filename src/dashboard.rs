//! Dashboard refresh loop
//!
//! Renders the aggregator's state on a fixed interval from its own thread.
//! The loop only reads in-memory snapshots, so a slow or stalled bus never
//! delays a refresh.
//!
//! Rendering itself is pluggable through [`Renderer`]. [`LogRenderer`] writes
//! one summary line per stream through `tracing`.

use crate::aggregator::{Aggregator, StreamSnapshot};
use crate::error::{Result, ResultExt, TelemetryError};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// State of every stream at one refresh
#[derive(Debug, Clone)]
pub struct Frame {
    /// Refresh counter, starting at 0
    pub tick: u64,
    /// Time the frame was taken
    pub taken_at: DateTime<Utc>,
    /// One snapshot per stream, ordered by key
    pub streams: Vec<StreamSnapshot>,
}

impl Frame {
    /// Capture the aggregator's current state
    pub fn capture(aggregator: &Aggregator, tick: u64) -> Self {
        Self {
            tick,
            taken_at: Utc::now(),
            streams: aggregator.snapshots(),
        }
    }
}

/// Consumer of dashboard frames
pub trait Renderer: Send {
    /// Draw one frame
    fn render(&mut self, frame: &Frame);

    /// Called once when the dashboard stops
    fn finalize(&mut self) {}

    /// Human-readable name
    fn name(&self) -> &str;
}

/// Renderer that logs a one-line summary per stream
#[derive(Debug, Default)]
pub struct LogRenderer;

impl LogRenderer {
    fn summarize(snapshot: &StreamSnapshot) -> String {
        let latest = match &snapshot.latest {
            Some(record) if record.is_clear() => "clear".to_string(),
            Some(record) => record
                .fields
                .iter()
                .filter_map(|(name, value)| value.as_number().map(|v| format!("{}={:.3}", name, v)))
                .collect::<Vec<_>>()
                .join(" "),
            None => "-".to_string(),
        };
        format!(
            "{}: {} rows, {} received, latest [{}]",
            snapshot.key,
            snapshot.rows(),
            snapshot.received,
            latest
        )
    }
}

impl Renderer for LogRenderer {
    fn render(&mut self, frame: &Frame) {
        if frame.streams.is_empty() {
            tracing::debug!("Dashboard tick {}: no data yet", frame.tick);
            return;
        }
        for snapshot in &frame.streams {
            tracing::info!("{}", Self::summarize(snapshot));
        }
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Handle to a running dashboard thread
pub struct Dashboard {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<u64>>,
}

impl Dashboard {
    /// Spawn a thread rendering `aggregator` every `refresh`
    pub fn spawn(
        aggregator: Arc<Aggregator>,
        mut renderer: Box<dyn Renderer>,
        refresh: Duration,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let name = renderer.name().to_string();

        let handle = std::thread::Builder::new()
            .name("dashboard".to_string())
            .spawn(move || {
                tracing::info!("Dashboard started ({} renderer, every {:?})", renderer.name(), refresh);
                let mut tick = 0;

                loop {
                    match stop_rx.recv_timeout(refresh) {
                        Err(RecvTimeoutError::Timeout) => {
                            renderer.render(&Frame::capture(&aggregator, tick));
                            tick += 1;
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }

                // Final frame so the last state is always shown
                renderer.render(&Frame::capture(&aggregator, tick));
                tick += 1;
                renderer.finalize();
                tracing::info!("Dashboard stopped after {} frame(s)", tick);
                tick
            })
            .with_context(|| format!("spawning {} dashboard", name))?;

        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Stop the refresh loop, returning the number of frames rendered
    pub fn stop(mut self) -> Result<u64> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<u64> {
        let Some(handle) = self.handle.take() else {
            return Ok(0);
        };
        let _ = self.stop_tx.try_send(());
        handle
            .join()
            .map_err(|_| TelemetryError::WorkerPanicked("dashboard".to_string()))
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("{}", e);
        }
    }
}
