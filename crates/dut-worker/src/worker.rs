//! Worker variants behind one capability

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use dut_core::{
    FlashJob, NetworkConfig, NetworkManager, WorkerCapability, WorkerError, WorkerOptions,
    WorkerResult,
};
use dut_testbot::{TestBot, TestBotConfig, WorkerStatus};
use tracing::info;

use crate::config::DaemonConfig;

/// Worker variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    TestBot,
    Qemu,
}

impl FromStr for WorkerKind {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "testbot" | "test-bot" => Ok(WorkerKind::TestBot),
            "qemu" => Ok(WorkerKind::Qemu),
            other => Err(WorkerError::InvalidRequest(format!(
                "unknown worker kind '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::TestBot => f.write_str("testbot"),
            WorkerKind::Qemu => f.write_str("qemu"),
        }
    }
}

/// Implementations provided by the embedding application
#[derive(Default, Clone)]
pub struct Collaborators {
    /// Host network configuration service
    pub network: Option<Arc<dyn NetworkManager>>,
    /// Virtual machine worker, required for [`WorkerKind::Qemu`]
    pub virtual_worker: Option<Arc<dyn WorkerCapability>>,
}

/// The process's single worker
#[derive(Clone)]
pub enum Worker {
    TestBot(TestBot),
    Qemu(Arc<dyn WorkerCapability>),
}

impl Worker {
    pub fn from_config(config: &DaemonConfig, collaborators: Collaborators) -> WorkerResult<Self> {
        let kind: WorkerKind = config.worker.kind.parse()?;
        Self::build(
            kind,
            config.testbot.clone(),
            config.worker_options(),
            collaborators,
        )
    }

    pub fn build(
        kind: WorkerKind,
        testbot: TestBotConfig,
        options: WorkerOptions,
        collaborators: Collaborators,
    ) -> WorkerResult<Self> {
        info!(%kind, "Constructing worker");
        match kind {
            WorkerKind::TestBot => {
                let mut builder = TestBot::builder(testbot).options(options);
                if let Some(network) = collaborators.network {
                    builder = builder.network_manager(network);
                }
                Ok(Worker::TestBot(builder.build()?))
            }
            WorkerKind::Qemu => {
                options.validate()?;
                collaborators.virtual_worker.map(Worker::Qemu).ok_or_else(|| {
                    WorkerError::InvalidRequest(
                        "qemu worker requested but no virtual worker was supplied".to_string(),
                    )
                })
            }
        }
    }

    pub fn kind(&self) -> WorkerKind {
        match self {
            Worker::TestBot(_) => WorkerKind::TestBot,
            Worker::Qemu(_) => WorkerKind::Qemu,
        }
    }

    /// Hardware status, for variants that track one
    pub fn status(&self) -> Option<WorkerStatus> {
        match self {
            Worker::TestBot(bot) => Some(bot.status()),
            Worker::Qemu(_) => None,
        }
    }

    fn capability(&self) -> &dyn WorkerCapability {
        match self {
            Worker::TestBot(bot) => bot,
            Worker::Qemu(vm) => vm.as_ref(),
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Worker").field(&self.kind()).finish()
    }
}

#[async_trait]
impl WorkerCapability for Worker {
    async fn setup(&self) -> WorkerResult<()> {
        self.capability().setup().await
    }

    async fn teardown(&self) -> WorkerResult<()> {
        self.capability().teardown().await
    }

    async fn power_on(&self) -> WorkerResult<()> {
        self.capability().power_on().await
    }

    async fn power_off(&self) -> WorkerResult<()> {
        self.capability().power_off().await
    }

    async fn network(&self, config: NetworkConfig) -> WorkerResult<()> {
        self.capability().network(config).await
    }

    async fn flash(&self, job: FlashJob) -> WorkerResult<()> {
        self.capability().flash(job).await
    }
}
