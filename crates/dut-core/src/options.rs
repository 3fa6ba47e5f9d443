//! Worker construction options
//!
//! Options are fixed when a worker is built; nothing mutates them afterwards.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{WorkerError, WorkerResult};

/// Options recognized at worker construction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerOptions {
    /// Host network configuration for the DUT (optional)
    #[serde(default)]
    pub network: Option<NetworkConfig>,
    /// Worker-level overrides
    #[serde(default)]
    pub worker: WorkerSection,
}

/// Worker-level overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Path to the DUT storage device node, replacing the board default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<PathBuf>,
}

/// Wired and wireless connections shared with the DUT
///
/// A `None` side means "no such connection": applying the config removes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wired: Option<WiredConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wireless: Option<WirelessConfig>,
}

/// Wired connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WiredConfig {
    /// Share the host's upstream connection with the DUT
    #[serde(default = "default_nat")]
    pub nat: bool,
}

impl Default for WiredConfig {
    fn default() -> Self {
        Self { nat: default_nat() }
    }
}

/// Wireless access point settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirelessConfig {
    pub ssid: String,
    /// WPA pre-shared key; `None` creates an open network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk: Option<String>,
    #[serde(default = "default_nat")]
    pub nat: bool,
}

fn default_nat() -> bool {
    true
}

impl WorkerOptions {
    /// Reject configurations no worker can honour
    pub fn validate(&self) -> WorkerResult<()> {
        if let Some(ref network) = self.network {
            network.validate()?;
        }

        if let Some(ref disk) = self.worker.disk {
            if disk.as_os_str().is_empty() {
                return Err(WorkerError::InvalidRequest(
                    "worker.disk must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> WorkerResult<()> {
        if let Some(ref wireless) = self.wireless {
            if wireless.ssid.trim().is_empty() {
                return Err(WorkerError::InvalidRequest(
                    "wireless network requires an ssid".to_string(),
                ));
            }
            // WPA2 passphrases are 8..=63 characters
            if let Some(ref psk) = wireless.psk {
                if !(8..=63).contains(&psk.len()) {
                    return Err(WorkerError::InvalidRequest(format!(
                        "wireless psk must be 8-63 characters, got {}",
                        psk.len()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_full_options() {
        let json = r#"{
            "network": { "wired": { "nat": false }, "wireless": { "ssid": "dut-ap", "psk": "supersecret" } },
            "worker": { "disk": "/tmp/fake-disk" }
        }"#;

        let options: WorkerOptions = serde_json::from_str(json).unwrap();

        let network = options.network.as_ref().unwrap();
        assert_eq!(network.wired, Some(WiredConfig { nat: false }));
        let wireless = network.wireless.as_ref().unwrap();
        assert_eq!(wireless.ssid, "dut-ap");
        assert!(wireless.nat);
        assert_eq!(options.worker.disk, Some(PathBuf::from("/tmp/fake-disk")));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_empty_options_are_valid() {
        let options: WorkerOptions = serde_json::from_str("{}").unwrap();
        assert!(options.network.is_none());
        assert!(options.worker.disk.is_none());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_rejects_wireless_without_ssid() {
        let options = WorkerOptions {
            network: Some(NetworkConfig {
                wired: None,
                wireless: Some(WirelessConfig {
                    ssid: "  ".to_string(),
                    psk: None,
                    nat: true,
                }),
            }),
            ..Default::default()
        };

        assert!(matches!(
            options.validate(),
            Err(WorkerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_rejects_short_psk() {
        let network = NetworkConfig {
            wired: None,
            wireless: Some(WirelessConfig {
                ssid: "dut-ap".to_string(),
                psk: Some("short".to_string()),
                nat: true,
            }),
        };

        assert!(network.validate().is_err());
    }
}
