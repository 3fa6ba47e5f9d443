//! dut-testbot - Worker for the serial-attached TestBot board
//!
//! The TestBot is a microcontroller board sitting between the host and a
//! device-under-test. Over a serial link it switches DUT power, routes the
//! DUT's SD card either to the host (for flashing) or to the DUT (for booting)
//! and drives status pins.
//!
//! # Architecture
//!
//! ```text
//!   WorkerCapability calls
//!          │
//!          ▼
//! ┌─────────────────┐   guarded   ┌──────────────────┐
//! │     TestBot     │────────────▶│ CriticalSection  │
//! │ (state machine) │             └──────────────────┘
//! └─────────────────┘
//!    │         │          │ flash(job)
//!    ▼         ▼          ▼
//! ┌───────┐ ┌───────────┐ ┌───────────────────┐
//! │Command│ │Termination│ │ FlashOrchestrator │──▶ /dev/sdX (+ verify)
//! │Channel│ │   Hook    │ └───────────────────┘
//! └───────┘ └───────────┘
//!    │
//!    ▼ 3-byte frames
//!  serial link (CommandLink)
//! ```

pub mod channel;
pub mod config;
pub mod firmware;
pub mod flash;
pub mod lifecycle;
pub mod sequence;
pub mod state;
pub mod testbot;
pub mod testing;

pub use channel::{CommandChannel, CommandFrame, Level, Opcode, Pin, PinMode};
pub use config::{FirmwareConfig, TestBotConfig};
pub use firmware::{ExternalLoader, FirmwareLoader};
pub use flash::{FlashOrchestrator, FlashReport, FlashTarget};
pub use lifecycle::{ExitFn, SignalHook, TermSignal, TerminationAction, TerminationHook};
pub use state::{HardwareState, PowerState, SdRoute, WorkerStatus};
pub use testbot::{TestBot, TestBotBuilder};
