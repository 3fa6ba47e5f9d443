//! Test doubles for the worker's collaborators
//!
//! Used by this crate's tests and by downstream crates that drive a TestBot
//! without hardware.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dut_core::{NetworkManager, WiredConfig, WirelessConfig, WorkerError, WorkerResult};
use parking_lot::Mutex;

use crate::firmware::FirmwareLoader;
use crate::lifecycle::{TerminationAction, TerminationHook};

/// Termination hook that records registrations and can be fired by hand
#[derive(Default)]
pub struct RecordingHook {
    action: Mutex<Option<TerminationAction>>,
    registrations: AtomicU32,
    deregistrations: AtomicU32,
}

impl RecordingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registrations(&self) -> u32 {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn deregistrations(&self) -> u32 {
        self.deregistrations.load(Ordering::SeqCst)
    }

    /// Simulate a termination signal. Returns false when nothing is armed.
    pub async fn fire(&self) -> bool {
        let action = self.action.lock().take();
        match action {
            Some(action) => {
                action().await;
                true
            }
            None => false,
        }
    }
}

impl TerminationHook for RecordingHook {
    fn register(&self, action: TerminationAction) {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        *self.action.lock() = Some(action);
    }

    fn deregister(&self) {
        if self.action.lock().take().is_some() {
            self.deregistrations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_registered(&self) -> bool {
        self.action.lock().is_some()
    }
}

/// Firmware loader that records images and fails on demand
#[derive(Debug, Default)]
pub struct ScriptedLoader {
    loaded: Mutex<Vec<PathBuf>>,
    attempts: AtomicU32,
    failures_left: AtomicU32,
}

impl ScriptedLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `count` load attempts
    pub fn failing_first(self, count: u32) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    /// Successfully loaded images, in order
    pub fn loaded(&self) -> Vec<PathBuf> {
        self.loaded.lock().clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FirmwareLoader for ScriptedLoader {
    async fn load(&self, image: &Path) -> WorkerResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(WorkerError::Setup(format!(
                "board not found while loading {}",
                image.display()
            )));
        }

        self.loaded.lock().push(image.to_path_buf());
        Ok(())
    }
}

/// Call made on a [`RecordingNetwork`]
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkCall {
    AddWired(WiredConfig),
    RemoveWired,
    AddWireless(WirelessConfig),
    RemoveWireless,
}

/// Network manager that records every call
#[derive(Debug, Default)]
pub struct RecordingNetwork {
    calls: Mutex<Vec<NetworkCall>>,
}

impl RecordingNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<NetworkCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl NetworkManager for RecordingNetwork {
    async fn add_wired(&self, config: &WiredConfig) -> WorkerResult<()> {
        self.calls.lock().push(NetworkCall::AddWired(config.clone()));
        Ok(())
    }

    async fn remove_wired(&self) -> WorkerResult<()> {
        self.calls.lock().push(NetworkCall::RemoveWired);
        Ok(())
    }

    async fn add_wireless(&self, config: &WirelessConfig) -> WorkerResult<()> {
        self.calls.lock().push(NetworkCall::AddWireless(config.clone()));
        Ok(())
    }

    async fn remove_wireless(&self) -> WorkerResult<()> {
        self.calls.lock().push(NetworkCall::RemoveWireless);
        Ok(())
    }
}
