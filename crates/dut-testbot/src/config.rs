//! TestBot board configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable set by CI runners
const CI_ENV: &str = "CI";

/// Configuration for a TestBot worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestBotConfig {
    /// Serial device of the control board
    #[serde(default = "default_serial_port")]
    pub serial_port: String,
    /// Fixed baud rate of the board firmware
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Storage device node exposed when the SD card is routed to the host
    #[serde(default = "default_disk")]
    pub default_disk: PathBuf,
    /// Bound on the wait for the board's ready signal (0 = wait forever)
    #[serde(default)]
    pub ready_timeout_ms: u64,
    /// Skip firmware re-flashing. Derived from `$CI` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci: Option<bool>,
    /// DUT supply voltage programmed into the DAC
    #[serde(default = "default_vout_millivolts")]
    pub vout_millivolts: u32,
    #[serde(default)]
    pub firmware: FirmwareConfig,
}

/// Control board firmware images and the tool that loads them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareConfig {
    #[serde(default = "default_loader")]
    pub loader: String,
    #[serde(default = "default_mcu")]
    pub mcu: String,
    /// Sketch that leaves the board in its bootloader
    #[serde(default = "default_bootloader_image")]
    pub bootloader_image: PathBuf,
    /// Command firmware speaking the frame protocol
    #[serde(default = "default_firmware_image")]
    pub firmware_image: PathBuf,
}

fn default_serial_port() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_baud_rate() -> u32 {
    57600
}

fn default_disk() -> PathBuf {
    PathBuf::from("/dev/disk/by-id/usb-TestBot_SD_Card-0:0")
}

fn default_vout_millivolts() -> u32 {
    5000
}

fn default_loader() -> String {
    "teensy_loader_cli".to_string()
}

fn default_mcu() -> String {
    "TEENSY40".to_string()
}

fn default_bootloader_image() -> PathBuf {
    PathBuf::from("/usr/share/testbot/bootloader.hex")
}

fn default_firmware_image() -> PathBuf {
    PathBuf::from("/usr/share/testbot/firmware.hex")
}

impl Default for TestBotConfig {
    fn default() -> Self {
        Self {
            serial_port: default_serial_port(),
            baud_rate: default_baud_rate(),
            default_disk: default_disk(),
            ready_timeout_ms: 0,
            ci: None,
            vout_millivolts: default_vout_millivolts(),
            firmware: FirmwareConfig::default(),
        }
    }
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            loader: default_loader(),
            mcu: default_mcu(),
            bootloader_image: default_bootloader_image(),
            firmware_image: default_firmware_image(),
        }
    }
}

impl TestBotConfig {
    /// Whether we run under CI, where the board firmware is not re-flashed
    pub fn is_ci(&self) -> bool {
        self.ci.unwrap_or_else(|| {
            std::env::var(CI_ENV)
                .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(false)
        })
    }

    /// Bound on the ready wait, `None` when unbounded
    pub fn ready_timeout(&self) -> Option<Duration> {
        (self.ready_timeout_ms > 0).then(|| Duration::from_millis(self.ready_timeout_ms))
    }
}
