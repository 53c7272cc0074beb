//! Throughput model and poll-window calibration.
//!
//! Every usable cycle adds a sample `(X, T)`: hashes done and seconds taken.
//! Samples collect in an open [`HistoryEntry`]. Once that entry is old enough
//! and holds enough samples it is closed into a bounded ring, the ring is
//! summed, and the line `T = Hs·X + W` is refit by least squares. The fit
//! gives the time to exhaust the nonce space and from it the poll window.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::{Timing, TICKS_PER_SECOND};
use crate::tracing::prelude::*;

/// Minimum age of a history entry before it may close.
pub const HISTORY_WINDOW: Duration = Duration::from_secs(60);

/// Closed entries kept for the fit.
pub const HISTORY_CAPACITY: usize = 10;

/// Starting sample threshold for closing an entry.
pub const MIN_DATA_COUNT: u32 = 5;

/// Threshold past which it stops doubling.
pub const MAX_MIN_DATA_COUNT: u32 = 100;

/// Positions this close to either end of the space are not sampled.
pub const END_CONDITION: u32 = 0x0000_ffff;

const NONCE_SPACE: f64 = 4_294_967_296.0;

/// Poll window, in ticks, for a given full-nonce time.
pub fn read_count_for(fullnonce: f64) -> u32 {
    let ticks = (fullnonce * TICKS_PER_SECOND as f64) as i64 - 1;
    ticks.clamp(1, u32::MAX as i64) as u32
}

/// Hashes worth of work in `elapsed` at `hashrate`, capped at one full space.
pub fn estimate_hashes(elapsed: Duration, hashrate: f64) -> u64 {
    let estimate = elapsed.as_secs_f64() * hashrate;
    estimate.clamp(0.0, u32::MAX as f64) as u64
}

/// How a reported nonce converts to a count of hashes done.
///
/// Icarus-class boards split the space between `fpga_count` chips, so the
/// nonce position times the chip count is the work done. DualMiner boards
/// instead report against the fraction of SHA-256 units switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashCountMode {
    NonceMask { mask: u32, fpga_count: u32 },
    UnitRatio { active: u32, total: u32 },
}

impl HashCountMode {
    pub fn hashes_for(&self, nonce: u32) -> u64 {
        match *self {
            Self::NonceMask { mask, fpga_count } => {
                ((nonce & mask) as u64 + 1) * fpga_count as u64
            }
            Self::UnitRatio { active, total } => nonce as u64 * active as u64 / total as u64,
        }
    }

    /// Inverse of [`hashes_for`](Self::hashes_for), clamped into `mask`.
    pub fn position_for(&self, hashes: u64, mask: u32) -> u32 {
        let position = match *self {
            Self::NonceMask { fpga_count, .. } => {
                (hashes / fpga_count.max(1) as u64).saturating_sub(1)
            }
            Self::UnitRatio { active, total } => hashes * total as u64 / active.max(1) as u64,
        };
        position.min(mask as u64) as u32
    }
}

/// Whether a search position is far enough from both ends to be trusted.
pub fn should_sample(position: u32, mask: u32) -> bool {
    position > END_CONDITION && position < (mask & !END_CONDITION)
}

/// One observation fed to the calibrator.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    /// When the job that produced this sample was started.
    pub started_at: Instant,
    pub elapsed: Duration,
    pub hashes: u64,
    /// Position inside one search unit, compared against [`END_CONDITION`].
    pub position: u32,
}

/// Sufficient statistics for a least-squares line.
#[derive(Debug, Clone, Default)]
pub struct HistoryEntry {
    sum_xt: f64,
    sum_x: f64,
    sum_t: f64,
    sum_x2: f64,
    values: u32,
    hash_min: u64,
    hash_max: u64,
    closes_at: Option<Instant>,
}

impl HistoryEntry {
    pub fn add(&mut self, hashes: u64, seconds: f64) {
        let x = hashes as f64;
        self.sum_xt += x * seconds;
        self.sum_x += x;
        self.sum_t += seconds;
        self.sum_x2 += x * x;
        self.values += 1;
        self.hash_max = self.hash_max.max(hashes);
        if self.hash_min == 0 || hashes < self.hash_min {
            self.hash_min = hashes;
        }
    }

    fn absorb(&mut self, other: &HistoryEntry) {
        self.sum_xt += other.sum_xt;
        self.sum_x += other.sum_x;
        self.sum_t += other.sum_t;
        self.sum_x2 += other.sum_x2;
        self.values += other.values;
        self.hash_max = self.hash_max.max(other.hash_max);
        if self.hash_min == 0 || other.hash_min < self.hash_min {
            self.hash_min = other.hash_min;
        }
    }

    pub fn values(&self) -> u32 {
        self.values
    }

    /// Least-squares `(Hs, W)`, or `None` when the X values do not spread.
    pub fn fit(&self) -> Option<LinearFit> {
        if self.values < 2 {
            return None;
        }
        let n = self.values as f64;
        let denominator = n * self.sum_x2 - self.sum_x * self.sum_x;
        if denominator.abs() <= f64::EPSILON * n * self.sum_x2 {
            return None;
        }
        let hs = (n * self.sum_xt - self.sum_x * self.sum_t) / denominator;
        let w = self.sum_t / n - hs * self.sum_x / n;
        Some(LinearFit { hs, w })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LinearFit {
    /// Seconds per hash.
    pub hs: f64,
    /// Fixed seconds per cycle.
    pub w: f64,
}

impl LinearFit {
    /// Seconds to run through the whole nonce space, overhead included.
    pub fn fullnonce(&self) -> f64 {
        self.w + self.hs * NONCE_SPACE
    }
}

/// Result of a refit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Estimate {
    pub fit: LinearFit,
    pub fullnonce: f64,
    pub read_count: u32,
    /// The window was cut down to the configured limit.
    pub limited: bool,
    /// Closed entries that took part.
    pub count: usize,
    pub values: u32,
    pub range: u64,
}

#[derive(Debug)]
pub struct TimingCalibrator {
    enabled: bool,
    stop_when_saturated: bool,
    limit: u32,
    min_data_count: u32,
    open: HistoryEntry,
    closed: VecDeque<HistoryEntry>,
    history_count: u64,
    history_time: Duration,
    last: Option<Estimate>,
}

impl TimingCalibrator {
    pub fn new(timing: &Timing) -> Self {
        Self {
            enabled: timing.is_adaptive(),
            stop_when_saturated: matches!(timing, Timing::Short { .. }),
            limit: timing.limit(),
            min_data_count: MIN_DATA_COUNT,
            open: HistoryEntry::default(),
            closed: VecDeque::with_capacity(HISTORY_CAPACITY),
            history_count: 0,
            history_time: Duration::ZERO,
            last: None,
        }
    }

    /// Switch to short-mode calibration, keeping what was collected.
    pub fn enable_short(&mut self) {
        self.enabled = true;
        self.stop_when_saturated = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn min_data_count(&self) -> u32 {
        self.min_data_count
    }

    pub fn history_count(&self) -> u64 {
        self.history_count
    }

    pub fn history_time(&self) -> Duration {
        self.history_time
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Samples in the entry still being filled.
    pub fn open_values(&self) -> u32 {
        self.open.values
    }

    pub fn last_estimate(&self) -> Option<&Estimate> {
        self.last.as_ref()
    }

    /// Add a sample; returns the new estimate when an entry closed.
    ///
    /// `transfer` is deducted from the elapsed time since the reply itself
    /// took that long to cross the link.
    pub fn record(&mut self, sample: Sample, mask: u32, transfer: Duration) -> Option<Estimate> {
        if !self.enabled || !should_sample(sample.position, mask) {
            return None;
        }
        let started = std::time::Instant::now();

        if self.open.values == 0 {
            self.open.closes_at = Some(sample.started_at + HISTORY_WINDOW);
        }
        let seconds = sample.elapsed.as_secs_f64() - transfer.as_secs_f64();
        self.open.add(sample.hashes, seconds);

        let window_passed = self
            .open
            .closes_at
            .is_some_and(|closes_at| sample.started_at > closes_at);
        let estimate = if self.open.values >= self.min_data_count && window_passed {
            self.close_entry()
        } else {
            None
        };

        self.history_count += 1;
        self.history_time += started.elapsed();
        estimate
    }

    fn close_entry(&mut self) -> Option<Estimate> {
        let entry = std::mem::take(&mut self.open);
        self.closed.push_front(entry);
        self.closed.truncate(HISTORY_CAPACITY);

        let mut total = HistoryEntry::default();
        let mut count = 0;
        for entry in self.closed.iter().filter(|e| e.values >= MIN_DATA_COUNT) {
            total.absorb(entry);
            count += 1;
        }

        if self.min_data_count < MAX_MIN_DATA_COUNT {
            self.min_data_count *= 2;
        } else if self.stop_when_saturated {
            debug!("Calibration complete, leaving short timing.");
            self.enabled = false;
        }

        let Some(fit) = total.fit() else {
            warn!(values = total.values, "History has no spread, keeping old timing.");
            return None;
        };
        if !(fit.hs.is_finite() && fit.hs > 0.0) {
            warn!(hs = fit.hs, "Discarding nonsensical fit.");
            return None;
        }

        let fullnonce = fit.fullnonce();
        let mut read_count = read_count_for(fullnonce);
        let limited = self.limit > 0 && read_count > self.limit;
        if limited {
            read_count = self.limit;
        }

        let estimate = Estimate {
            fit,
            fullnonce,
            read_count,
            limited,
            count,
            values: total.values,
            range: total.hash_max - total.hash_min,
        };
        debug!(
            hs = %format_args!("{:e}", fit.hs),
            w = %format_args!("{:e}", fit.w),
            read_count,
            limited,
            fullnonce = %format_args!("{fullnonce:.3}s"),
            "Re-estimate."
        );
        self.last = Some(estimate);
        Some(estimate)
    }
}
