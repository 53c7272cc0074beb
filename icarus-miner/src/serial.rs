//! Links to devices.
//!
//! A session never opens ports itself; it asks a [`LinkOpener`] for a fresh
//! stream each time the link is (re)acquired.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, StopBits};

use crate::tracing::prelude::*;

/// Byte stream to one device.
pub trait LinkStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LinkStream for T {}

pub type Link = Box<dyn LinkStream>;

#[async_trait]
pub trait LinkOpener: Send + Sync {
    /// Open the link at `baud`, 8N1 without flow control.
    async fn open(&self, baud: u32) -> io::Result<Link>;

    /// Where the link goes, for logs.
    fn describe(&self) -> String;
}

/// Opens a serial device node.
#[derive(Debug, Clone)]
pub struct SerialOpener {
    path: String,
}

impl SerialOpener {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl LinkOpener for SerialOpener {
    async fn open(&self, baud: u32) -> io::Result<Link> {
        let port = tokio_serial::new(&self.path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(io::Error::from)?;

        // Whatever the device said to a previous owner is stale.
        if let Err(e) = port.clear(tokio_serial::ClearBuffer::All) {
            debug!(path = %self.path, error = %e, "Could not purge port buffers.");
        }

        debug!(path = %self.path, baud, "Opened serial port.");
        Ok(Box::new(port))
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}
