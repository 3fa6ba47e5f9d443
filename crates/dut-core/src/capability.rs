//! WorkerCapability trait - the contract every worker variant implements

use async_trait::async_trait;
use tracing::info;

use crate::error::WorkerResult;
use crate::options::{NetworkConfig, WiredConfig, WirelessConfig};
use crate::progress::FlashJob;

/// Operations the control-plane can invoke on a worker
///
/// Hardware-affecting operations (`setup`, `power_on`, `power_off`, `flash`)
/// never run concurrently on one worker. `network` is not part of that
/// serialization and may interleave with them.
#[async_trait]
pub trait WorkerCapability: Send + Sync {
    /// Bring the worker to a usable idle state
    async fn setup(&self) -> WorkerResult<()>;

    /// Power off and release every owned resource. Calling it again is a no-op.
    async fn teardown(&self) -> WorkerResult<()>;

    async fn power_on(&self) -> WorkerResult<()>;

    async fn power_off(&self) -> WorkerResult<()>;

    /// Apply a network configuration; fails when the worker has no network
    async fn network(&self, config: NetworkConfig) -> WorkerResult<()>;

    /// Write the job's image to the DUT storage, feeding the job's progress
    async fn flash(&self, job: FlashJob) -> WorkerResult<()>;
}

/// Host network configuration collaborator (reached over an IPC bus)
#[async_trait]
pub trait NetworkManager: Send + Sync {
    async fn add_wired(&self, config: &WiredConfig) -> WorkerResult<()>;

    async fn remove_wired(&self) -> WorkerResult<()>;

    async fn add_wireless(&self, config: &WirelessConfig) -> WorkerResult<()>;

    async fn remove_wireless(&self) -> WorkerResult<()>;
}

/// Apply `config` through `manager`; each side is handled independently
pub async fn apply_network_config(
    manager: &dyn NetworkManager,
    config: &NetworkConfig,
) -> WorkerResult<()> {
    config.validate()?;

    match config.wireless {
        Some(ref wireless) => {
            info!(ssid = %wireless.ssid, nat = wireless.nat, "Adding wireless connection");
            manager.add_wireless(wireless).await?;
        }
        None => {
            info!("Removing wireless connection");
            manager.remove_wireless().await?;
        }
    }

    match config.wired {
        Some(ref wired) => {
            info!(nat = wired.nat, "Adding wired connection");
            manager.add_wired(wired).await?;
        }
        None => {
            info!("Removing wired connection");
            manager.remove_wired().await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Calls(Mutex<Vec<String>>);

    #[async_trait]
    impl NetworkManager for Calls {
        async fn add_wired(&self, _config: &WiredConfig) -> WorkerResult<()> {
            self.0.lock().unwrap().push("add_wired".into());
            Ok(())
        }

        async fn remove_wired(&self) -> WorkerResult<()> {
            self.0.lock().unwrap().push("remove_wired".into());
            Ok(())
        }

        async fn add_wireless(&self, config: &WirelessConfig) -> WorkerResult<()> {
            self.0
                .lock()
                .unwrap()
                .push(format!("add_wireless:{}", config.ssid));
            Ok(())
        }

        async fn remove_wireless(&self) -> WorkerResult<()> {
            self.0.lock().unwrap().push("remove_wireless".into());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_none_sides_remove_connections() {
        let manager = Calls::default();

        apply_network_config(&manager, &NetworkConfig::default())
            .await
            .unwrap();

        assert_eq!(
            *manager.0.lock().unwrap(),
            vec!["remove_wireless", "remove_wired"]
        );
    }

    #[tokio::test]
    async fn test_sides_are_independent() {
        let manager = Calls::default();
        let config = NetworkConfig {
            wired: None,
            wireless: Some(WirelessConfig {
                ssid: "dut-ap".to_string(),
                psk: None,
                nat: true,
            }),
        };

        apply_network_config(&manager, &config).await.unwrap();

        assert_eq!(
            *manager.0.lock().unwrap(),
            vec!["add_wireless:dut-ap", "remove_wired"]
        );
    }
}
