//! Hash rate type for reporting device throughput.

use std::time::Duration;

use serde::Serialize;

/// Hashes per second.
///
/// Never negative; a rate measured over an empty interval is zero.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize)]
#[serde(transparent)]
pub struct HashRate(f64);

impl HashRate {
    /// Create a rate of N hashes per second, clamping negatives to zero.
    pub fn per_second(hashes: f64) -> Self {
        Self(hashes.max(0.0))
    }

    /// Rate implied by `hashes` done in `elapsed`.
    pub fn from_hashes(hashes: u64, elapsed: Duration) -> Self {
        if elapsed.is_zero() {
            return Self(0.0);
        }
        Self(hashes as f64 / elapsed.as_secs_f64())
    }

    /// Rate of a device that takes `seconds` per hash.
    pub fn from_hash_time(seconds: f64) -> Self {
        if seconds > 0.0 && seconds.is_finite() {
            Self(1.0 / seconds)
        } else {
            Self(0.0)
        }
    }

    pub fn as_per_second(&self) -> f64 {
        self.0
    }

    /// Megahashes per second.
    pub fn as_mhs(&self) -> f64 {
        self.0 / 1e6
    }
}

impl std::fmt::Display for HashRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mhs = self.as_mhs();
        if mhs >= 1_000.0 {
            write!(f, "{:.2} GH/s", mhs / 1_000.0)
        } else if mhs >= 1.0 {
            write!(f, "{:.1} MH/s", mhs)
        } else {
            write!(f, "{:.1} kH/s", self.0 / 1e3)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_hashes() {
        let rate = HashRate::from_hashes(760_000_000, Duration::from_secs(2));
        assert!((rate.as_mhs() - 380.0).abs() < 1e-9);
        assert_eq!(HashRate::from_hashes(5, Duration::ZERO), HashRate::default());
    }

    #[test]
    fn test_from_hash_time() {
        let icarus = HashRate::from_hash_time(0.000_000_002_640_83);
        assert!((icarus.as_mhs() - 378.67).abs() < 0.01);
        assert_eq!(HashRate::from_hash_time(0.0).as_per_second(), 0.0);
    }

    #[test]
    fn test_display() {
        assert_eq!(HashRate::per_second(378.7e6).to_string(), "378.7 MH/s");
        assert_eq!(HashRate::per_second(1.5e9).to_string(), "1.50 GH/s");
        // Scrypt rates are far lower.
        assert_eq!(HashRate::per_second(50_000.0).to_string(), "50.0 kH/s");
        assert_eq!(HashRate::per_second(-3.0).as_per_second(), 0.0);
    }
}
