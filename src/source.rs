//! Experiment data source
//!
//! Generates synthetic records for the five experiment types. The source is
//! purely computational: it yields records as an [`Iterator`] and leaves the
//! cadence (sleeping between ticks) to the producer loop.
//!
//! # Experiment Shapes
//!
//! | Type | Fields | Rule |
//! |---|---|---|
//! | 1 voltage vs time | `x`, `y` | `y = 1 + U(-1/6, 1/6)` |
//! | 2 I-V sweep | `x_fwd`, `y_fwd`, `x_rev`, `y_rev` | linear ramps, one record |
//! | 3 MPPT | `x`, `y1`, `y2`, `y3` | `y1 = 20 + U(-1, 1)`, `y2 = y1 + 1`, `y3 = 1 + U(-1/6, 1/6)` |
//! | 4 current/power | `x`, `y1`, `y2` | `y1 = 10 - x`, `y2 = x` |
//! | 5 EQE spectrum | `x`, `y1`, `y2` | `y1 = 10 - x`, `y2 = x` |
//!
//! Every run ends with a clear record so consumers reset the channel.
//!
//! # Example
//!
//! ```ignore
//! use telemetry_bus::source::ExperimentSource;
//! use telemetry_bus::types::ExperimentType;
//!
//! let records: Vec<_> = ExperimentSource::new(ExperimentType::Voltage, 10)
//!     .with_seed(42)
//!     .collect();
//! assert_eq!(records.len(), 11); // 10 samples + clear
//! ```

use crate::types::{ExperimentType, Record};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Half-width of the voltage noise band
const VOLTAGE_NOISE: f64 = 1.0 / 6.0;

/// Baseline of the MPPT power channel
const MPPT_BASELINE: f64 = 20.0;

/// Half-width of the MPPT power noise band
const MPPT_NOISE: f64 = 1.0;

/// Intercept of the descending linear channel
const LINEAR_INTERCEPT: f64 = 10.0;

/// Start of the I-V sweep range (volts)
pub const SWEEP_START: f64 = 0.0;

/// End of the I-V sweep range (volts)
pub const SWEEP_END: f64 = 1.0;

/// Generator of one experiment run
#[derive(Debug, Clone)]
pub struct ExperimentSource {
    kind: ExperimentType,
    points: u32,
    tick: u32,
    data_done: bool,
    clear_sent: bool,
    rng: StdRng,
}

impl ExperimentSource {
    /// Create a source for `points` samples of `kind`, seeded from entropy
    pub fn new(kind: ExperimentType, points: u32) -> Self {
        Self {
            kind,
            points,
            tick: 0,
            data_done: false,
            clear_sent: false,
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a fixed RNG seed for reproducible noise
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Experiment type of this source
    pub fn kind(&self) -> ExperimentType {
        self.kind
    }

    /// Whether this experiment emits its whole array as one record
    pub fn is_single_emission(&self) -> bool {
        self.kind == ExperimentType::IvSweep
    }

    /// Number of records (data plus clear) a full run yields
    pub fn total_records(&self) -> usize {
        if self.is_single_emission() {
            2
        } else {
            self.points as usize + 1
        }
    }

    fn sample(&mut self, x: f64) -> Record {
        match self.kind {
            ExperimentType::Voltage => {
                let y = 1.0 + self.rng.gen_range(-VOLTAGE_NOISE..VOLTAGE_NOISE);
                Record::new().with_number("x", x).with_number("y", y)
            }
            ExperimentType::Mppt => {
                let y1 = MPPT_BASELINE + self.rng.gen_range(-MPPT_NOISE..MPPT_NOISE);
                let y3 = 1.0 + self.rng.gen_range(-VOLTAGE_NOISE..VOLTAGE_NOISE);
                Record::new()
                    .with_number("x", x)
                    .with_number("y1", y1)
                    .with_number("y2", y1 + 1.0)
                    .with_number("y3", y3)
            }
            ExperimentType::CurrentPower | ExperimentType::Eqe => Record::new()
                .with_number("x", x)
                .with_number("y1", LINEAR_INTERCEPT - x)
                .with_number("y2", x),
            ExperimentType::IvSweep => self.sweep(),
        }
    }

    fn sweep(&self) -> Record {
        let x_fwd = linspace(SWEEP_START, SWEEP_END, self.points as usize);
        let y_fwd = x_fwd.clone();
        let x_rev: Vec<f64> = x_fwd.iter().rev().copied().collect();
        let y_rev = x_rev.clone();

        Record::new()
            .with_series("x_fwd", x_fwd)
            .with_series("y_fwd", y_fwd)
            .with_series("x_rev", x_rev)
            .with_series("y_rev", y_rev)
    }
}

impl Iterator for ExperimentSource {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        if !self.data_done {
            if self.is_single_emission() {
                self.data_done = true;
                return Some(self.sweep());
            }
            if self.tick < self.points {
                let x = self.tick as f64;
                self.tick += 1;
                return Some(self.sample(x));
            }
            self.data_done = true;
        }

        if !self.clear_sent {
            self.clear_sent = true;
            return Some(Record::clear_sentinel());
        }

        None
    }
}

/// Evenly spaced values from `start` to `end` inclusive
pub fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (count - 1) as f64;
            (0..count).map(|i| start + step * i as f64).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_voltage_run() {
        let records: Vec<Record> = ExperimentSource::new(ExperimentType::Voltage, 5)
            .with_seed(1)
            .collect();

        assert_eq!(records.len(), 6);
        for (i, record) in records[..5].iter().enumerate() {
            assert!(!record.is_clear());
            assert_eq!(record.number("x"), Some(i as f64));
            let y = record.number("y").unwrap();
            assert!(y >= 1.0 - VOLTAGE_NOISE && y < 1.0 + VOLTAGE_NOISE);
        }
        assert!(records[5].is_clear());
        assert!(records[5].fields.is_empty());
    }

    #[test]
    fn test_iv_sweep_single_emission() {
        let source = ExperimentSource::new(ExperimentType::IvSweep, 11);
        assert_eq!(source.total_records(), 2);

        let records: Vec<Record> = source.collect();
        assert_eq!(records.len(), 2);

        let sweep = &records[0];
        let x_fwd = sweep.series("x_fwd").unwrap();
        let x_rev = sweep.series("x_rev").unwrap();
        assert_eq!(x_fwd.len(), 11);
        assert_eq!(x_fwd[0], SWEEP_START);
        assert!((x_fwd[10] - SWEEP_END).abs() < 1e-12);
        assert_eq!(x_rev[0], x_fwd[10]);
        assert_eq!(sweep.series("y_fwd").unwrap(), x_fwd);
        assert_eq!(sweep.series("y_rev").unwrap().len(), 11);
        assert!(records[1].is_clear());
    }

    #[test]
    fn test_mppt_relationships() {
        for record in ExperimentSource::new(ExperimentType::Mppt, 20)
            .with_seed(3)
            .filter(|r| !r.is_clear())
        {
            let y1 = record.number("y1").unwrap();
            let y2 = record.number("y2").unwrap();
            let y3 = record.number("y3").unwrap();
            assert!((y1 - MPPT_BASELINE).abs() <= MPPT_NOISE);
            assert!((y2 - (y1 + 1.0)).abs() < 1e-12);
            assert!((y3 - 1.0).abs() <= VOLTAGE_NOISE);
        }
    }

    #[test]
    fn test_linear_experiments_share_generator() {
        let four: Vec<Record> = ExperimentSource::new(ExperimentType::CurrentPower, 4).collect();
        let five: Vec<Record> = ExperimentSource::new(ExperimentType::Eqe, 4).collect();
        assert_eq!(four, five);
        assert_eq!(four[3].number("y1"), Some(7.0));
        assert_eq!(four[3].number("y2"), Some(3.0));
    }

    #[test]
    fn test_seed_is_reproducible() {
        let a: Vec<Record> = ExperimentSource::new(ExperimentType::Voltage, 8)
            .with_seed(99)
            .collect();
        let b: Vec<Record> = ExperimentSource::new(ExperimentType::Voltage, 8)
            .with_seed(99)
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_points_still_clears() {
        let records: Vec<Record> = ExperimentSource::new(ExperimentType::Voltage, 0).collect();
        assert_eq!(records, vec![Record::clear_sentinel()]);
    }

    #[test]
    fn test_linspace() {
        assert!(linspace(0.0, 1.0, 0).is_empty());
        assert_eq!(linspace(0.5, 1.0, 1), vec![0.5]);
        assert_eq!(linspace(0.0, 1.0, 3), vec![0.0, 0.5, 1.0]);
    }

    proptest! {
        #[test]
        fn test_every_run_ends_with_single_clear(
            kind in prop::sample::select(ExperimentType::all().to_vec()),
            points in 0u32..40,
            seed in any::<u64>()
        ) {
            let source = ExperimentSource::new(kind, points).with_seed(seed);
            let expected = source.total_records();
            let records: Vec<Record> = source.collect();

            prop_assert_eq!(records.len(), expected);
            prop_assert!(records.last().unwrap().is_clear());
            prop_assert_eq!(records.iter().filter(|r| r.is_clear()).count(), 1);
        }
    }
}
