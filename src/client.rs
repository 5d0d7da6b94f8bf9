use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

use crate::error::ZeroError;
use crate::manager::DeviceManager;
use crate::models::{DiscoverySummary, Endpoint, StartupStatus, SyncMode};
use crate::registry::RegistryHandle;

/// The handle a UI uses to drive discovery and devices.
///
/// Cheap to clone. Every registry access goes through the registry actor,
/// so calls from several UI tasks never observe a half-applied update.
#[derive(Clone)]
pub struct ZeroClient {
    manager: Arc<DeviceManager>,
    registry: RegistryHandle,
    startup: watch::Receiver<StartupStatus>,
}

impl ZeroClient {
    pub(crate) fn new(manager: Arc<DeviceManager>, startup: watch::Receiver<StartupStatus>) -> Self {
        let registry = manager.registry().clone();
        Self {
            manager,
            registry,
            startup,
        }
    }

    /// Runs a discovery cycle now, merging each accepted device as it is found.
    ///
    /// Fails with [`ZeroError::DiscoveryBusy`] while the poller (or another
    /// trigger) is mid-run.
    pub async fn trigger_discovery(&self) -> Result<DiscoverySummary, ZeroError> {
        self.manager.discover(SyncMode::Merge).await
    }

    /// Snapshot of all devices, in first-seen order.
    pub async fn devices(&self) -> Result<Vec<Endpoint>, ZeroError> {
        self.registry.all().await
    }

    pub async fn selected(&self) -> Result<Option<Endpoint>, ZeroError> {
        self.registry.selected().await
    }

    /// Selects the next device, wrapping around; returns the new selection.
    pub async fn advance_selection(&self) -> Result<Option<Endpoint>, ZeroError> {
        self.registry.advance_selection().await
    }

    /// Toggles the selected device. Returns false if nothing is selected or
    /// the write did not succeed.
    ///
    /// Toggles issued through this client are applied one at a time. A
    /// toggle from another process in between is not detected: the value
    /// sent is the inverse of this process's cached state.
    pub async fn toggle_selected(&self) -> bool {
        match self.registry.toggle_selected().await {
            Ok(toggled) => toggled,
            Err(e) => {
                warn!(error = %e, "Toggle failed");
                false
            }
        }
    }

    pub fn startup_status(&self) -> StartupStatus {
        self.startup.borrow().clone()
    }

    /// Waits until startup registration has finished.
    pub async fn wait_for_startup(&self) -> StartupStatus {
        let mut startup = self.startup.clone();
        // An error means the sender is gone; the last published value stands.
        let _ = startup
            .wait_for(|status| *status != StartupStatus::Pending)
            .await;
        startup.borrow().clone()
    }
}
