//! dut-core - Core traits and types for DUT provisioning workers
//!
//! This crate provides the abstractions shared by every worker variant
//! (the serial-attached TestBot, the virtual machine worker, ...) and by the
//! control-plane that drives them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  WorkerCapability                        │
//! │  setup / teardown / power_on / power_off / network /     │
//! │  flash(FlashJob)                                         │
//! │                                                          │
//! │  ┌───────────────┐  ┌──────────────┐  ┌───────────────┐  │
//! │  │CriticalSection│  │ RetryPolicy  │  │ProgressStream │  │
//! │  │ (one hw op at │  │ (fixed       │  │ (latest event │  │
//! │  │  a time)      │  │  interval)   │  │  per dest.)   │  │
//! │  └───────────────┘  └──────────────┘  └───────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod capability;
pub mod error;
pub mod guard;
pub mod options;
pub mod progress;
pub mod retry;

pub use capability::{apply_network_config, NetworkManager, WorkerCapability};
pub use error::{WorkerError, WorkerResult};
pub use guard::CriticalSection;
pub use options::{NetworkConfig, WiredConfig, WirelessConfig, WorkerOptions, WorkerSection};
pub use progress::{
    ByteStream, FlashJob, FlashPhase, FlashSource, ProgressEvent, ProgressPublisher,
    ProgressStream,
};
pub use retry::{retry, RetryError, RetryPolicy};
