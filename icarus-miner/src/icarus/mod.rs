//! The Icarus polling engine.
//!
//! Leaves first: [`codec`] frames jobs, [`reply`] reads bounded replies,
//! [`validate`] matches nonces to jobs, [`timing`] models throughput,
//! [`recovery`] decides on reopens. [`session`] ties them into one cycle.

pub mod codec;
pub mod job;
pub mod probe;
pub mod recovery;
pub mod reply;
pub mod session;
pub mod timing;
pub mod validate;

#[cfg(test)]
mod scenarios;
