//! Link reopen bookkeeping and the one-time device speed check.

use std::time::Duration;

use serde::Serialize;

use crate::config::ReopenPolicy;

/// Why the link is being reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ReopenReason {
    LinkError,
    Timeout,
    HardwareErrors,
    Requested,
    Cycle,
}

/// Tracks the conditions that call for a reopen outside the routine policy.
#[derive(Debug, Default)]
pub struct RecoveryPolicy {
    pending: Option<ReopenReason>,
    hw_errors: u32,
}

impl RecoveryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a reopen before the next job goes out.
    pub fn request_reopen(&mut self) {
        self.pending.get_or_insert(ReopenReason::Requested);
    }

    pub fn is_requested(&self) -> bool {
        self.pending.is_some()
    }

    /// Consume the pending request, if any.
    pub fn take_request(&mut self) -> Option<ReopenReason> {
        self.pending.take()
    }

    /// Count a hardware error; requests a reopen once `threshold` is reached.
    pub fn note_hardware_error(&mut self, threshold: Option<u32>) -> bool {
        self.hw_errors += 1;
        match threshold {
            Some(limit) if self.hw_errors >= limit => {
                self.pending = Some(ReopenReason::HardwareErrors);
                true
            }
            _ => false,
        }
    }

    /// Reopen routinely after a timeout?
    pub fn reopen_on_timeout(policy: ReopenPolicy) -> bool {
        policy == ReopenPolicy::Timeout
    }

    /// The link was reopened; start counting afresh.
    pub fn reopened(&mut self) {
        self.hw_errors = 0;
    }
}

/// Cycles examined by the speed check.
pub const DEFAULT_DETECT_ROUNDS: u32 = 16;

/// Shortest cycle the speed check trusts.
pub const DEFAULT_DETECT_THRESHOLD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Verdict {
    /// Outside every known envelope; calibrate with short timing.
    Unrecognized { mhs: f64, too_fast: bool },
    /// A genuine Icarus. `last` is set on the final round.
    Nominal { mhs: f64, last: bool },
    /// Fast enough to be a Cairnsmore1 running the Icarus protocol.
    Cairnsmore { mhs: f64 },
}

/// Compares measured speed with the Icarus envelope over the first cycles.
#[derive(Debug)]
pub struct AutoClassifier {
    remaining: u32,
}

impl AutoClassifier {
    pub fn new(enabled: bool) -> Self {
        Self {
            remaining: if enabled { DEFAULT_DETECT_ROUNDS } else { 0 },
        }
    }

    pub fn is_active(&self) -> bool {
        self.remaining > 0
    }

    pub fn observe(&mut self, hashes: u64, elapsed: Duration) -> Option<Verdict> {
        if self.remaining == 0 || elapsed < DEFAULT_DETECT_THRESHOLD {
            return None;
        }
        let mhs = (hashes as f64 / elapsed.as_micros() as f64).floor();
        self.remaining -= 1;

        if mhs <= 370.0 || mhs > 420.0 {
            self.remaining = 0;
            Some(Verdict::Unrecognized {
                mhs,
                too_fast: mhs > 380.0,
            })
        } else if mhs <= 380.0 {
            Some(Verdict::Nominal {
                mhs,
                last: self.remaining == 0,
            })
        } else {
            self.remaining = 0;
            Some(Verdict::Cairnsmore { mhs })
        }
    }
}
