//! Common error types for icarus-miner.
//!
//! Each concern has its own error enum next to its code; this module gathers
//! them into one crate-level type with `From` conversions.

use thiserror::Error;

use crate::config::ConfigError;
use crate::icarus::{codec::CodecError, probe::ProbeError, session::SessionError};
use crate::thread::ThreadError;

/// Main error type for icarus-miner operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Rejected configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job error: {0}")]
    Codec(#[from] CodecError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Device detection failures
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Device thread error: {0}")]
    Thread(#[from] ThreadError),

    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
