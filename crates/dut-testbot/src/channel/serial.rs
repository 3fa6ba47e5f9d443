//! Serial-port link to the control board
//!
//! `serialport` is blocking, so every port access runs on the blocking pool.
//! Reads use a short port timeout; the ready wait loops over them, which
//! keeps the wait cancellable between reads.

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, trace, warn};

use super::{BoardVersion, CommandLink, LinkError, LinkOpener};

/// Version query / version report byte
const REPORT_VERSION: u8 = 0xF9;

/// Timeout of a single blocking read
const READ_TIMEOUT_MS: u64 = 100;

const READ_BUFFER_SIZE: usize = 64;

type SharedPort = Arc<Mutex<Option<Box<dyn SerialPort>>>>;

/// Opens [`SerialLink`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

#[async_trait]
impl LinkOpener for SerialOpener {
    async fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn CommandLink>, LinkError> {
        let link = SerialLink::open(path, baud_rate).await?;
        Ok(Box::new(link))
    }
}

/// Link over a serial device
pub struct SerialLink {
    path: String,
    port: SharedPort,
}

impl SerialLink {
    pub async fn open(path: &str, baud_rate: u32) -> Result<Self, LinkError> {
        let device = path.to_string();
        let port = tokio::task::spawn_blocking(move || {
            let port = serialport::new(&device, baud_rate)
                .timeout(Duration::from_millis(READ_TIMEOUT_MS))
                .open()
                .map_err(|e| LinkError::Open {
                    path: device.clone(),
                    reason: e.to_string(),
                })?;
            port.clear(ClearBuffer::All)
                .map_err(|e| LinkError::Configure(e.to_string()))?;
            Ok::<_, LinkError>(port)
        })
        .await
        .map_err(|e| LinkError::Configure(format!("open task failed: {}", e)))??;

        debug!(path, baud_rate, "Serial port opened");
        Ok(Self {
            path: path.to_string(),
            port: Arc::new(Mutex::new(Some(port))),
        })
    }

    async fn write_bytes(&self, bytes: Vec<u8>) -> Result<(), LinkError> {
        let port = self.port.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = port.lock();
            let port = guard.as_mut().ok_or(LinkError::Closed)?;
            port.write_all(&bytes)
                .and_then(|_| port.flush())
                .map_err(|e| LinkError::Write(e.to_string()))
        })
        .await
        .map_err(|e| LinkError::Write(format!("write task failed: {}", e)))?
    }

    /// One bounded read; an empty result means the read timed out
    async fn read_chunk(&self) -> Result<Vec<u8>, LinkError> {
        let port = self.port.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = port.lock();
            let port = guard.as_mut().ok_or(LinkError::Closed)?;
            let mut buf = [0u8; READ_BUFFER_SIZE];
            match port.read(&mut buf) {
                Ok(0) => Err(LinkError::Read("unexpected end of stream".to_string())),
                Ok(n) => Ok(buf[..n].to_vec()),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                    Ok(Vec::new())
                }
                Err(e) => Err(LinkError::Read(e.to_string())),
            }
        })
        .await
        .map_err(|e| LinkError::Read(format!("read task failed: {}", e)))?
    }
}

#[async_trait]
impl CommandLink for SerialLink {
    async fn wait_ready(&mut self) -> Result<BoardVersion, LinkError> {
        self.write_bytes(vec![REPORT_VERSION]).await?;

        let mut scanner = VersionScanner::default();
        loop {
            let chunk = self.read_chunk().await?;
            for byte in chunk {
                if let Some(version) = scanner.push(byte) {
                    return Ok(version);
                }
            }
        }
    }

    async fn write_frame(&mut self, frame: [u8; 3]) -> Result<(), LinkError> {
        trace!(path = %self.path, frame = ?frame, "Serial write");
        self.write_bytes(frame.to_vec()).await
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        if self.port.lock().take().is_none() {
            warn!(path = %self.path, "Serial port already closed");
        }
        Ok(())
    }
}

/// Finds `REPORT_VERSION major minor` in the inbound byte stream
#[derive(Debug, Default)]
struct VersionScanner {
    pending: Vec<u8>,
    in_report: bool,
}

impl VersionScanner {
    fn push(&mut self, byte: u8) -> Option<BoardVersion> {
        if !self.in_report {
            self.in_report = byte == REPORT_VERSION;
            return None;
        }

        self.pending.push(byte);
        if self.pending.len() < 2 {
            return None;
        }

        let version = BoardVersion {
            major: self.pending[0],
            minor: self.pending[1],
        };
        self.pending.clear();
        self.in_report = false;
        Some(version)
    }
}
