//! Matching replies to the jobs in flight.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::job::{Job, JobSlots};

/// Decides whether a nonce solves a job.
pub trait NonceVerifier: Send + Sync {
    fn verify(&self, job: &Job, nonce: u32) -> bool;
}

/// Double SHA-256 of the header with the nonce in place; a solution has the
/// top 32 bits of the hash zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256dVerifier;

impl NonceVerifier for Sha256dVerifier {
    fn verify(&self, job: &Job, nonce: u32) -> bool {
        let Some(header) = job.header_with_nonce(nonce) else {
            return false;
        };
        let hash = Sha256::digest(Sha256::digest(header));
        hash[28..32] == [0, 0, 0, 0]
    }
}

/// Accepts whatever the device reports against the current job.
///
/// Used for scrypt devices, where the host checks the result itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceTrust;

impl NonceVerifier for DeviceTrust {
    fn verify(&self, _job: &Job, _nonce: u32) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Current(Arc<Job>),
    Previous(Arc<Job>),
    Mismatch,
}

/// Check `nonce` against the current job, then the previous one.
pub fn validate(slots: &JobSlots, nonce: u32, verifier: &dyn NonceVerifier) -> Validation {
    if let Some(job) = slots.current() {
        if verifier.verify(job, nonce) {
            return Validation::Current(job.clone());
        }
    }
    if let Some(job) = slots.previous() {
        if verifier.verify(job, nonce) {
            return Validation::Previous(job.clone());
        }
    }
    Validation::Mismatch
}
