//! TestBot worker
//!
//! ```text
//!  Uninitialized ──setup──▶ Initializing ──▶ Idle(Host, Unpowered)
//!                                              │  ▲
//!                                      power_on│  │power_off
//!                                              ▼  │
//!                              PoweredOn(DeviceUnderTest, Powered)
//!
//!  flash:    any ready state ──forced power_off──▶ Flashing ──▶ Idle
//!  teardown: any state ──▶ TornDown (idempotent)
//! ```
//!
//! `setup`, `power_on`, `power_off`, `flash` and `teardown` run inside the
//! worker's critical section, one at a time. `network` does not.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dut_core::{
    apply_network_config, CriticalSection, FlashJob, NetworkConfig, NetworkManager,
    WorkerCapability, WorkerError, WorkerOptions, WorkerResult,
};
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::channel::serial::SerialOpener;
use crate::channel::{CommandChannel, CommandFrame, LinkOpener};
use crate::config::TestBotConfig;
use crate::firmware::{reflash_board, ExternalLoader, FirmwareLoader};
use crate::flash::{FlashOrchestrator, FlashReport};
use crate::lifecycle::{SignalHook, TerminationAction, TerminationHook};
use crate::sequence;
use crate::state::{HardwareState, PowerState, SdRoute, WorkerStatus};

#[derive(Debug, Clone, Copy)]
struct Tracked {
    state: HardwareState,
    power: PowerState,
    route: SdRoute,
}

struct Inner {
    config: TestBotConfig,
    options: WorkerOptions,
    opener: Arc<dyn LinkOpener>,
    loader: Arc<dyn FirmwareLoader>,
    hook: Arc<dyn TerminationHook>,
    network: Option<Arc<dyn NetworkManager>>,
    orchestrator: FlashOrchestrator,
    section: CriticalSection,
    channel: Mutex<Option<CommandChannel>>,
    tracked: RwLock<Tracked>,
}

/// Worker driving a TestBot board
///
/// Cloning yields another handle to the same worker.
#[derive(Clone)]
pub struct TestBot {
    inner: Arc<Inner>,
}

/// Builder for [`TestBot`]
pub struct TestBotBuilder {
    config: TestBotConfig,
    options: WorkerOptions,
    opener: Option<Arc<dyn LinkOpener>>,
    loader: Option<Arc<dyn FirmwareLoader>>,
    hook: Option<Arc<dyn TerminationHook>>,
    network: Option<Arc<dyn NetworkManager>>,
    orchestrator: FlashOrchestrator,
}

impl TestBotBuilder {
    pub fn options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Link opener (defaults to the serial port)
    pub fn link_opener(mut self, opener: Arc<dyn LinkOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    /// Board firmware loader (defaults to the configured external tool)
    pub fn firmware_loader(mut self, loader: Arc<dyn FirmwareLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Termination hook (defaults to SIGINT/SIGTERM)
    pub fn termination_hook(mut self, hook: Arc<dyn TerminationHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn network_manager(mut self, manager: Arc<dyn NetworkManager>) -> Self {
        self.network = Some(manager);
        self
    }

    pub fn orchestrator(mut self, orchestrator: FlashOrchestrator) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    pub fn build(self) -> WorkerResult<TestBot> {
        self.options.validate()?;

        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(ExternalLoader::from_config(&self.config.firmware)));

        Ok(TestBot {
            inner: Arc::new(Inner {
                opener: self.opener.unwrap_or_else(|| Arc::new(SerialOpener)),
                loader,
                hook: self.hook.unwrap_or_else(|| Arc::new(SignalHook::new())),
                network: self.network,
                orchestrator: self.orchestrator,
                section: CriticalSection::new("testbot"),
                channel: Mutex::new(None),
                tracked: RwLock::new(Tracked {
                    state: HardwareState::Uninitialized,
                    power: PowerState::Unpowered,
                    route: SdRoute::Host,
                }),
                config: self.config,
                options: self.options,
            }),
        })
    }
}

impl TestBot {
    pub fn builder(config: TestBotConfig) -> TestBotBuilder {
        TestBotBuilder {
            config,
            options: WorkerOptions::default(),
            opener: None,
            loader: None,
            hook: None,
            network: None,
            orchestrator: FlashOrchestrator::new(),
        }
    }

    /// Worker talking to real hardware
    pub fn new(config: TestBotConfig, options: WorkerOptions) -> WorkerResult<Self> {
        Self::builder(config).options(options).build()
    }

    pub fn status(&self) -> WorkerStatus {
        let tracked = *self.inner.tracked.read();
        WorkerStatus {
            state: tracked.state,
            power: tracked.power,
            route: tracked.route,
            disk: self.inner.disk(),
        }
    }

    /// Whether a hardware operation is executing
    pub fn is_busy(&self) -> bool {
        self.inner.section.is_held()
    }

    pub fn config(&self) -> &TestBotConfig {
        &self.inner.config
    }

    /// Teardown run by the termination hook
    fn termination_action(&self) -> TerminationAction {
        let worker = Arc::downgrade(&self.inner);
        Arc::new(move || {
            let worker = worker.clone();
            async move {
                if let Some(inner) = worker.upgrade() {
                    let bot = TestBot { inner };
                    if let Err(e) = bot.teardown().await {
                        error!(error = %e, "Teardown on termination failed");
                    }
                }
            }
            .boxed()
        })
    }
}

impl Inner {
    fn state(&self) -> HardwareState {
        self.tracked.read().state
    }

    fn set_state(&self, state: HardwareState) {
        let mut tracked = self.tracked.write();
        debug!(from = %tracked.state, to = %state, "State transition");
        tracked.state = state;
    }

    fn disk(&self) -> PathBuf {
        self.options
            .worker
            .disk
            .clone()
            .unwrap_or_else(|| self.config.default_disk.clone())
    }

    fn require_ready(&self, operation: &str) -> WorkerResult<()> {
        match self.state() {
            HardwareState::Uninitialized | HardwareState::Initializing => Err(
                WorkerError::InvalidRequest(format!("{} requires a completed setup", operation)),
            ),
            HardwareState::TornDown => Err(WorkerError::InvalidRequest(format!(
                "{} after teardown",
                operation
            ))),
            _ => Ok(()),
        }
    }

    async fn send(&self, frames: &[CommandFrame]) -> WorkerResult<()> {
        let mut channel = self.channel.lock().await;
        let channel = channel
            .as_mut()
            .ok_or_else(|| WorkerError::InvalidRequest("command channel is not open".to_string()))?;
        channel.send_all(frames).await?;
        Ok(())
    }

    async fn setup_locked(&self) -> WorkerResult<()> {
        match self.state() {
            HardwareState::Uninitialized => {}
            HardwareState::TornDown => {
                return Err(WorkerError::InvalidRequest("setup after teardown".to_string()))
            }
            state => {
                return Err(WorkerError::InvalidRequest(format!(
                    "setup already ran (state {})",
                    state
                )))
            }
        }

        self.set_state(HardwareState::Initializing);
        match self.bring_up().await {
            Ok(()) => {
                {
                    let mut tracked = self.tracked.write();
                    tracked.power = PowerState::Unpowered;
                    tracked.route = SdRoute::Host;
                }
                self.set_state(HardwareState::Idle);
                info!(port = %self.config.serial_port, "TestBot ready");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "TestBot setup failed");
                if let Some(mut channel) = self.channel.lock().await.take() {
                    if let Err(close_err) = channel.close().await {
                        warn!(error = %close_err, "Failed to close channel after setup failure");
                    }
                }
                self.set_state(HardwareState::Uninitialized);
                Err(e)
            }
        }
    }

    async fn bring_up(&self) -> WorkerResult<()> {
        if self.config.is_ci() {
            info!("Running under CI, skipping board firmware load");
        } else {
            reflash_board(self.loader.as_ref(), &self.config.firmware).await?;
        }

        let channel = CommandChannel::open(
            self.opener.as_ref(),
            &self.config.serial_port,
            self.config.baud_rate,
        )
        .await?;
        let mut slot = self.channel.lock().await;
        let channel = slot.insert(channel);

        channel
            .wait_ready(self.config.ready_timeout())
            .await
            .map_err(|e| WorkerError::Setup(format!("board never signalled ready: {}", e)))?;
        channel
            .send_all(&sequence::bring_up(self.config.vout_millivolts))
            .await?;
        drop(slot);

        if let Some(ref network) = self.options.network {
            match self.network {
                Some(ref manager) => apply_network_config(manager.as_ref(), network).await?,
                None => warn!("Network options given but no network manager configured"),
            }
        }
        Ok(())
    }

    async fn power_on_locked(&self, action: TerminationAction) -> WorkerResult<()> {
        self.require_ready("power_on")?;
        if self.tracked.read().power == PowerState::Powered {
            debug!("DUT already powered");
            return Ok(());
        }

        self.send(&sequence::route_to_dut()).await?;
        self.tracked.write().route = SdRoute::DeviceUnderTest;

        self.send(&[sequence::vout_enable()]).await?;
        self.tracked.write().power = PowerState::Powered;

        self.hook.register(action);
        self.set_state(HardwareState::PoweredOn);
        info!("DUT powered on");
        Ok(())
    }

    /// Forced power-off; safe to repeat
    async fn power_off_locked(&self) -> WorkerResult<()> {
        self.require_ready("power_off")?;

        self.send(&[sequence::vout_disable()]).await?;
        self.tracked.write().power = PowerState::Unpowered;

        self.send(&sequence::route_to_host()).await?;
        self.tracked.write().route = SdRoute::Host;

        self.hook.deregister();
        self.set_state(HardwareState::Idle);
        info!("DUT powered off");
        Ok(())
    }

    async fn flash_locked(&self, job: FlashJob) -> WorkerResult<()> {
        self.require_ready("flash")?;
        let job_id = job.id();

        self.power_off_locked().await?;
        self.set_state(HardwareState::Flashing);

        let result = self.write_image(job).await;
        self.set_state(HardwareState::Idle);

        match result {
            Ok(report) => {
                info!(
                    %job_id,
                    bytes = report.bytes_written,
                    sha256 = %report.sha256,
                    failed = report.failed.len(),
                    "Flash finished"
                );
                Ok(())
            }
            Err(e) => {
                error!(%job_id, error = %e, "Flash failed");
                Err(e)
            }
        }
    }

    async fn write_image(&self, job: FlashJob) -> WorkerResult<FlashReport> {
        let target = self.orchestrator.resolve(&self.disk()).await?;
        self.orchestrator.run(&[target], job).await
    }

    async fn teardown_locked(&self) -> WorkerResult<()> {
        match self.state() {
            HardwareState::TornDown => {
                debug!("Already torn down");
                return Ok(());
            }
            HardwareState::Uninitialized => {
                self.set_state(HardwareState::TornDown);
                return Ok(());
            }
            _ => {}
        }

        let mut first_error = None;

        if let Err(e) = self.power_off_locked().await {
            warn!(error = %e, "Power off during teardown failed");
            first_error.get_or_insert(e);
        }
        self.hook.deregister();

        if let Some(mut channel) = self.channel.lock().await.take() {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Failed to close command channel");
                first_error.get_or_insert(e.into());
            }
        }

        if self.options.network.is_some() {
            if let Some(ref manager) = self.network {
                if let Err(e) = apply_network_config(manager.as_ref(), &NetworkConfig::default()).await {
                    warn!(error = %e, "Failed to remove DUT network connections");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.set_state(HardwareState::TornDown);
        info!("TestBot torn down");
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl WorkerCapability for TestBot {
    async fn setup(&self) -> WorkerResult<()> {
        self.inner.section.run(self.inner.setup_locked()).await
    }

    async fn teardown(&self) -> WorkerResult<()> {
        self.inner.section.run(self.inner.teardown_locked()).await
    }

    async fn power_on(&self) -> WorkerResult<()> {
        let action = self.termination_action();
        self.inner.section.run(self.inner.power_on_locked(action)).await
    }

    async fn power_off(&self) -> WorkerResult<()> {
        self.inner.section.run(self.inner.power_off_locked()).await
    }

    async fn network(&self, config: NetworkConfig) -> WorkerResult<()> {
        // Not serialized with the hardware operations
        let manager = self.inner.network.as_ref().ok_or_else(|| {
            WorkerError::InvalidRequest("no network manager configured".to_string())
        })?;
        if self.inner.state() == HardwareState::TornDown {
            return Err(WorkerError::InvalidRequest("network after teardown".to_string()));
        }
        apply_network_config(manager.as_ref(), &config).await
    }

    async fn flash(&self, job: FlashJob) -> WorkerResult<()> {
        // The write runs in its own task: dropping the caller or the
        // progress stream does not abort it
        let inner = self.inner.clone();
        let job_id = job.id();
        tokio::spawn(async move { inner.section.run(inner.flash_locked(job)).await })
            .await
            .map_err(|e| WorkerError::Flash(format!("flash task {} failed: {}", job_id, e)))?
    }
}
