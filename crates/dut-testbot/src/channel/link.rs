//! Link trait and link-layer errors

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use dut_core::WorkerError;
use thiserror::Error;

/// Errors raised by the serial link
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Failed to open {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("Failed to configure link: {0}")]
    Configure(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Link closed")]
    Closed,

    #[error("Board not ready after {0:?}")]
    Timeout(Duration),
}

impl From<LinkError> for WorkerError {
    fn from(err: LinkError) -> Self {
        WorkerError::Link(err.to_string())
    }
}

/// Firmware version the board announces once it is ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardVersion {
    pub major: u8,
    pub minor: u8,
}

impl fmt::Display for BoardVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Byte-level link to the control board
///
/// Writes are fire-and-forget: the board never acknowledges a frame.
#[async_trait]
pub trait CommandLink: Send + Sync {
    /// Wait until the board announces itself
    async fn wait_ready(&mut self) -> Result<BoardVersion, LinkError>;

    /// Write one frame atomically
    async fn write_frame(&mut self, frame: [u8; 3]) -> Result<(), LinkError>;

    /// Release the underlying device
    async fn close(&mut self) -> Result<(), LinkError>;
}

/// Opens links to a device path
#[async_trait]
pub trait LinkOpener: Send + Sync {
    async fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn CommandLink>, LinkError>;
}
