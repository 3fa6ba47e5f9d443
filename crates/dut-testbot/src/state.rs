//! Hardware state tracked by the TestBot worker

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lifecycle of the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareState {
    Uninitialized,
    Initializing,
    Idle,
    PoweredOn,
    Flashing,
    TornDown,
}

impl fmt::Display for HardwareState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HardwareState::Uninitialized => "uninitialized",
            HardwareState::Initializing => "initializing",
            HardwareState::Idle => "idle",
            HardwareState::PoweredOn => "powered_on",
            HardwareState::Flashing => "flashing",
            HardwareState::TornDown => "torn_down",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Unpowered,
    Powered,
}

/// Which side currently sees the SD card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdRoute {
    Host,
    DeviceUnderTest,
}

/// Point-in-time view of a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub state: HardwareState,
    pub power: PowerState,
    pub route: SdRoute,
    /// Storage device node flashes are written to
    pub disk: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_snake_case() {
        let status = WorkerStatus {
            state: HardwareState::PoweredOn,
            power: PowerState::Powered,
            route: SdRoute::DeviceUnderTest,
            disk: PathBuf::from("/dev/sda"),
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "powered_on");
        assert_eq!(json["route"], "device_under_test");
        assert_eq!(HardwareState::TornDown.to_string(), "torn_down");
    }
}
