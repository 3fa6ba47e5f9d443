//! Control board firmware loading
//!
//! Outside CI the board is re-flashed on every setup: first a bootloader
//! sketch, then the command firmware. Each load is retried with the firmware
//! retry policy since the board re-enumerates between loads.

use std::path::Path;

use async_trait::async_trait;
use dut_core::{retry, RetryPolicy, WorkerError, WorkerResult};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::FirmwareConfig;

/// Loads an image onto the control board's microcontroller
#[async_trait]
pub trait FirmwareLoader: Send + Sync {
    async fn load(&self, image: &Path) -> WorkerResult<()>;
}

/// Loader backed by an external flashing tool
///
/// Runs `<program> --mcu=<mcu> -w -v <image>`.
#[derive(Debug, Clone)]
pub struct ExternalLoader {
    program: String,
    mcu: String,
}

impl ExternalLoader {
    pub fn new(program: impl Into<String>, mcu: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            mcu: mcu.into(),
        }
    }

    pub fn from_config(config: &FirmwareConfig) -> Self {
        Self::new(&config.loader, &config.mcu)
    }
}

#[async_trait]
impl FirmwareLoader for ExternalLoader {
    async fn load(&self, image: &Path) -> WorkerResult<()> {
        debug!(program = %self.program, mcu = %self.mcu, image = %image.display(), "Running firmware loader");

        let output = Command::new(&self.program)
            .arg(format!("--mcu={}", self.mcu))
            .arg("-w")
            .arg("-v")
            .arg(image)
            .output()
            .await
            .map_err(|e| WorkerError::Setup(format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkerError::Setup(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Load the bootloader sketch, then the command firmware
pub async fn reflash_board(loader: &dyn FirmwareLoader, config: &FirmwareConfig) -> WorkerResult<()> {
    let policy = RetryPolicy::firmware();

    for (stage, image) in [
        ("bootloader", &config.bootloader_image),
        ("firmware", &config.firmware_image),
    ] {
        info!(stage, image = %image.display(), "Loading board image");
        retry(&policy, |attempt| {
            debug!(stage, attempt, "Firmware load attempt");
            loader.load(image)
        })
        .await?;
    }

    Ok(())
}
