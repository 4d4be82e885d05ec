//! telemetry-bus - Main Entry Point
//!
//! Runs the full demo pipeline in one process: the producer publishes
//! simulated experiment data through the queued publisher onto an in-process
//! broker, and a subscriber feeds the live dashboard.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use telemetry_bus::{
    bus::{LocalBroker, MessageBus},
    config::AppConfig,
    dashboard::{Dashboard, LogRenderer},
    logging,
    producer::Producer,
    publisher::ScopedPublisher,
    signal,
    subscriber::Subscriber,
    types::{ChannelLayout, QoS},
    Aggregator,
};

#[derive(Parser, Debug)]
#[command(name = "telemetry-bus")]
#[command(author, version, about = "Publish simulated experiment telemetry over a pub/sub bus")]
struct Cli {
    /// Config file (TOML or JSON); defaults to the platform config directory
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base topic for experiment channels
    #[arg(short, long)]
    topic: Option<String>,

    /// Points per experiment run
    #[arg(short = 'n', long)]
    points: Option<u32>,

    /// Number of runs (0 = until interrupted)
    #[arg(short, long)]
    repeats: Option<u32>,

    /// Experiment types to run (1-5), comma separated
    #[arg(short, long, value_delimiter = ',')]
    experiments: Option<Vec<u8>>,

    /// Milliseconds between ticks
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Channel layout
    #[arg(long, value_enum)]
    layout: Option<LayoutArg>,

    /// Producer identity tag added to every record
    #[arg(long)]
    id: Option<String>,

    /// RNG seed for reproducible data
    #[arg(long)]
    seed: Option<u64>,

    /// Delivery quality level (0-2)
    #[arg(long)]
    qos: Option<u8>,

    /// Simulated bus confirmation latency in milliseconds
    #[arg(long)]
    latency_ms: Option<u64>,

    /// Directory for rolling log files
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Disable the dashboard refresh loop
    #[arg(long)]
    no_dashboard: bool,

    /// Write the effective configuration to this path and exit
    #[arg(long)]
    save_config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LayoutArg {
    /// One sub-channel per experiment
    PerExperiment,
    /// One shared channel with a type discriminator
    Multiplexed,
}

impl From<LayoutArg> for ChannelLayout {
    fn from(arg: LayoutArg) -> Self {
        match arg {
            LayoutArg::PerExperiment => ChannelLayout::PerExperiment,
            LayoutArg::Multiplexed => ChannelLayout::Multiplexed,
        }
    }
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)
                .with_context(|| format!("loading config from {:?}", path))?,
            None => AppConfig::load_or_default(),
        };

        let producer = &mut config.producer;
        if let Some(topic) = &self.topic {
            producer.topic = topic.clone();
        }
        if let Some(points) = self.points {
            producer.points = points;
        }
        if let Some(repeats) = self.repeats {
            producer.repeats = repeats;
        }
        if let Some(experiments) = &self.experiments {
            producer.experiments = experiments.clone();
        }
        if let Some(interval_ms) = self.interval_ms {
            producer.interval_ms = interval_ms;
        }
        if let Some(layout) = self.layout {
            producer.layout = layout.into();
        }
        if let Some(id) = &self.id {
            producer.producer_id = Some(id.clone());
        }
        if let Some(seed) = self.seed {
            producer.seed = Some(seed);
        }
        if let Some(qos) = self.qos {
            config.bus.qos = QoS::try_from(qos).map_err(anyhow::Error::msg)?;
        }
        if let Some(latency_ms) = self.latency_ms {
            config.bus.latency_ms = latency_ms;
        }
        if let Some(log_dir) = &self.log_dir {
            config.logging.log_dir = Some(log_dir.clone());
        }

        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    // Configuration errors are fatal before any thread is spawned
    config.validate().context("invalid configuration")?;

    if let Some(path) = &cli.save_config {
        config.save(path)?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }

    let _log_guard = logging::init(&config.logging)?;
    signal::install_handlers();

    tracing::info!("Starting telemetry-bus");

    let broker = Arc::new(LocalBroker::from_config(&config.bus));
    let bus: Arc<dyn MessageBus> = broker.clone();
    let channels = config.producer.channels()?;

    let publisher = ScopedPublisher::open(
        bus.clone(),
        config.bus.qos,
        config.publisher.clone(),
        &channels,
    )?;
    let failures = publisher.failures();

    let aggregator = Arc::new(Aggregator::new(config.dashboard.max_samples));
    let subscriber = Subscriber::new(bus, aggregator.clone());
    subscriber.attach(&format!("{}/#", config.producer.topic), config.bus.qos)?;

    let dashboard = if cli.no_dashboard {
        None
    } else {
        Some(Dashboard::spawn(
            aggregator.clone(),
            Box::new(LogRenderer),
            Duration::from_millis(config.dashboard.refresh_ms),
        )?)
    };

    let producer = Producer::new(config.producer.clone(), publisher.handle())?;
    let summary = producer.run()?;
    if summary.interrupted {
        tracing::info!("Interrupted, draining queues");
    }

    for report in publisher.close() {
        tracing::info!(
            "'{}': {} enqueued, {} delivered, {} failed, {} dropped, {} in flight",
            report.channel,
            report.enqueued,
            report.delivered,
            report.failed,
            report.dropped,
            report.in_flight
        );
    }

    for failure in failures.try_iter() {
        tracing::warn!(
            "Undelivered on '{}' after {} attempt(s): {}",
            failure.channel,
            failure.attempts,
            failure.error
        );
    }

    if let Some(dashboard) = dashboard {
        dashboard.stop()?;
    }
    subscriber.detach();

    let stats = broker.stats();
    tracing::info!(
        "Done: {} run(s), {} record(s); bus {:.1}% success ({} unconfirmed), avg confirm {:.0}us, max {}us, {} malformed",
        summary.runs,
        summary.records,
        stats.success_rate(),
        stats.unconfirmed_publishes,
        stats.avg_confirm_time_us(),
        stats.max_confirm_time_us,
        subscriber.stats().malformed()
    );

    Ok(())
}
