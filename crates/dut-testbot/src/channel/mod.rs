//! Command channel to the TestBot control board
//!
//! Every command is a fixed 3-byte frame `[opcode, arg0, arg1]`. The board
//! sends no acknowledgement, so the sender observes a per-frame settle delay
//! before the next frame goes out.

mod link;
pub mod mock;
pub mod serial;

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, trace};

pub use link::{BoardVersion, CommandLink, LinkError, LinkOpener};

/// Frame opcodes (fixed by the board firmware)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    WriteDacRegister = 0x00,
    EnableVoutSwitch = 0x01,
    DisableVoutSwitch = 0x02,
    EnableVreg = 0x03,
    EnableFaultReset = 0x04,
    SdResetEnable = 0x05,
    SdResetDisable = 0x06,
    SetPinMode = 0xF4,
    SetDigitalPinValue = 0xF5,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Opcode::WriteDacRegister),
            0x01 => Ok(Opcode::EnableVoutSwitch),
            0x02 => Ok(Opcode::DisableVoutSwitch),
            0x03 => Ok(Opcode::EnableVreg),
            0x04 => Ok(Opcode::EnableFaultReset),
            0x05 => Ok(Opcode::SdResetEnable),
            0x06 => Ok(Opcode::SdResetDisable),
            0xF4 => Ok(Opcode::SetPinMode),
            0xF5 => Ok(Opcode::SetDigitalPinValue),
            other => Err(other),
        }
    }
}

/// Board pins driven through the GPIO opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Pin {
    Led = 13,
    SdMuxSelect = 28,
    UsbMuxSelect = 29,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PinMode {
    Input = 0,
    Output = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Level {
    Low = 0,
    High = 1,
}

/// One command plus the time the board needs before the next one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    pub opcode: Opcode,
    pub arg0: u8,
    pub arg1: u8,
    pub settle: Duration,
}

impl CommandFrame {
    pub fn new(opcode: Opcode, arg0: u8, arg1: u8) -> Self {
        Self {
            opcode,
            arg0,
            arg1,
            settle: Duration::ZERO,
        }
    }

    /// Argument-less command
    pub fn command(opcode: Opcode) -> Self {
        Self::new(opcode, 0, 0)
    }

    pub fn settle_ms(mut self, millis: u64) -> Self {
        self.settle = Duration::from_millis(millis);
        self
    }

    pub fn pin_mode(pin: Pin, mode: PinMode) -> Self {
        Self::new(Opcode::SetPinMode, pin as u8, mode as u8)
    }

    pub fn digital_write(pin: Pin, level: Level) -> Self {
        Self::new(Opcode::SetDigitalPinValue, pin as u8, level as u8)
    }

    /// Program the supply DAC; `arg0` carries tenths of a volt
    pub fn write_dac(millivolts: u32) -> Self {
        let decivolts = (millivolts / 100).min(u8::MAX as u32) as u8;
        Self::new(Opcode::WriteDacRegister, decivolts, 0)
    }

    pub fn to_bytes(&self) -> [u8; 3] {
        [self.opcode as u8, self.arg0, self.arg1]
    }
}

impl fmt::Display for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}[{:02X} {:02X} {:02X}]",
            self.opcode, self.opcode as u8, self.arg0, self.arg1
        )
    }
}

/// Owned channel to one control board
pub struct CommandChannel {
    path: String,
    link: Box<dyn CommandLink>,
    closed: bool,
}

impl CommandChannel {
    /// Open the board's serial device
    pub async fn open(
        opener: &dyn LinkOpener,
        path: &str,
        baud_rate: u32,
    ) -> Result<Self, LinkError> {
        info!(path, baud_rate, "Opening command channel");
        let link = opener.open(path, baud_rate).await?;
        Ok(Self {
            path: path.to_string(),
            link,
            closed: false,
        })
    }

    /// Wait for the board's ready signal, optionally bounded
    pub async fn wait_ready(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<BoardVersion, LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }

        debug!(path = %self.path, ?timeout, "Waiting for board ready signal");
        let version = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.link.wait_ready())
                .await
                .map_err(|_| LinkError::Timeout(limit))??,
            None => self.link.wait_ready().await?,
        };

        info!(path = %self.path, version = %version, "Board ready");
        Ok(version)
    }

    /// Send one frame, then hold off for its settle time
    pub async fn send(&mut self, frame: &CommandFrame) -> Result<(), LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }

        trace!(frame = %frame, settle_ms = frame.settle.as_millis() as u64, "Sending frame");
        self.link.write_frame(frame.to_bytes()).await?;

        if !frame.settle.is_zero() {
            tokio::time::sleep(frame.settle).await;
        }
        Ok(())
    }

    pub async fn send_all(&mut self, frames: &[CommandFrame]) -> Result<(), LinkError> {
        for frame in frames {
            self.send(frame).await?;
        }
        Ok(())
    }

    /// Close the link. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<(), LinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        info!(path = %self.path, "Closing command channel");
        self.link.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandChannel")
            .field("path", &self.path)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
