//! Driver for Icarus-protocol serial hashing devices.
//!
//! The device takes a fixed-size job frame, searches a 32-bit nonce space
//! and answers with a 4-byte nonce only when it finds something. There is no
//! acknowledgement and no "done" signal, so the driver polls with a bounded
//! window derived from a running model of the device's hash rate.

pub mod api;
pub mod config;
pub mod error;
pub mod host;
pub mod icarus;
pub mod serial;
pub mod thread;
pub mod tracing;
pub mod types;
