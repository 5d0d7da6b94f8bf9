//! # ZeroM2M: Zeroconf discovery for oneM2M-controlled devices
//!
//! This library discovers devices on the local network via multicast DNS,
//! keeps a live registry of them with their on/off state, and switches them
//! through a minimal oneM2M HTTP protocol (an Application Entity, a
//! Container, and Content Instances carrying state changes).
//!
//! ## Key Concepts
//!
//! - **`ZeroConfig`**: configuration, typically loaded from a TOML file: the
//!   CSE address and identity headers, the resource names, and the discovery
//!   service type, timeout, poll interval and filter.
//!
//! - **`ZeroHandler` Trait**: a user-implemented trait that combines
//!   `DeviceEventHandler` and `StartupObserver`. Your UI reacts to progress
//!   lines, registry snapshots and the startup result through it.
//!
//! - **`ZeroClient`**: the handle your UI uses to trigger discovery, read
//!   the registry, move the selection and toggle the selected device. An
//!   instance is passed to your `ZeroHandler` factory on startup.
//!
//! ## Quickstart Example
//!
//! ```no_run
//! use anyhow::Result;
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use tracing::info;
//! use zerom2m::{DeviceEventHandler, StartupObserver, StartupStatus, ZeroClient, ZeroConfig, ZeroHandler};
//!
//! struct MyApplication {
//!     client: ZeroClient,
//! }
//!
//! #[async_trait]
//! impl DeviceEventHandler for MyApplication {
//!     async fn on_progress(&self, message: &str) {
//!         info!("[HANDLER] {}", message);
//!     }
//! }
//!
//! #[async_trait]
//! impl StartupObserver for MyApplication {
//!     async fn on_startup(&self, status: &StartupStatus) {
//!         info!("[HANDLER] Startup: {:?}", status);
//!     }
//! }
//!
//! impl ZeroHandler for MyApplication {}
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     tracing_subscriber::fmt::init();
//!
//!     let config = ZeroConfig::load("path/to/your/config.toml")?;
//!     let zerom2m = zerom2m::start(config, |client| Arc::new(MyApplication { client })).await?;
//!
//!     let client = zerom2m.client().clone();
//!     if client.toggle_selected().await {
//!         info!("Toggled {:?}", client.selected().await?);
//!     }
//!
//!     zerom2m.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod manager;
pub mod models;
pub mod poller;
pub mod protocol;
pub mod registry;
mod utils;

// Re-export public-facing components.
pub use client::ZeroClient;
pub use config::ZeroConfig;
pub use discovery::{DiscoveryEngine, MdnsResolver, Resolver};
pub use error::ZeroError;
pub use events::{DeviceEventHandler, StartupObserver, ZeroHandler};
pub use models::{
    Advertisement, DiscoverySummary, Endpoint, Notification, RegistrationOutcome, RunState,
    StartupStatus, SyncMode,
};
pub use protocol::{DeviceState, M2mClient};

use anyhow::{Context, Result};
use ractor::concurrency::JoinHandle as ActorJoinHandle;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::manager::{DeviceManager, SyncSettings};
use crate::poller::Poller;
use crate::registry::RegistryHandle;

/// A running instance: registry actor, poller and notification dispatcher.
pub struct ZeroM2m {
    client: ZeroClient,
    registry: RegistryHandle,
    registry_join: ActorJoinHandle<()>,
    poller: Poller,
    dispatcher: JoinHandle<()>,
}

impl ZeroM2m {
    pub fn client(&self) -> &ZeroClient {
        &self.client
    }

    /// Stops polling, the registry actor and notification delivery.
    pub async fn shutdown(self) {
        self.poller.shutdown().await;
        self.registry.stop();
        let _ = self.registry_join.await;
        self.dispatcher.abort();
        info!("ZeroM2M stopped");
    }
}

/// Starts everything with multicast DNS discovery.
///
/// Registers the entity and container first, then starts polling. The
/// factory receives the client and returns the handler that will observe
/// all notifications.
pub async fn start<H, F>(config: ZeroConfig, factory: F) -> Result<ZeroM2m>
where
    H: ZeroHandler + 'static,
    F: FnOnce(ZeroClient) -> Arc<H>,
{
    start_with_resolver(config, Arc::new(MdnsResolver::new()), factory).await
}

/// Same as [`start`], with a custom advertisement source.
pub async fn start_with_resolver<H, F>(
    config: ZeroConfig,
    resolver: Arc<dyn Resolver>,
    factory: F,
) -> Result<ZeroM2m>
where
    H: ZeroHandler + 'static,
    F: FnOnce(ZeroClient) -> Arc<H>,
{
    let m2m = Arc::new(M2mClient::new(&config).context("build oneM2M client")?);
    let (registry, registry_join) = RegistryHandle::spawn(m2m.clone())
        .await
        .context("spawn registry actor")?;

    let engine = DiscoveryEngine::new(
        resolver,
        config.discovery.browse_type(),
        config.discovery.channel_capacity,
    );
    let (notification_tx, notification_rx) = mpsc::channel(64);
    let manager = Arc::new(DeviceManager::new(
        engine,
        m2m.clone(),
        registry.clone(),
        SyncSettings::from(&config.discovery),
        notification_tx.clone(),
    ));

    let (startup_tx, startup_rx) = watch::channel(StartupStatus::Pending);
    let client = ZeroClient::new(manager.clone(), startup_rx);
    let handler = factory(client.clone());
    let dispatcher = tokio::spawn(events::dispatch(handler, notification_rx));

    let status = manager::bootstrap(&m2m).await;
    startup_tx.send_replace(status.clone());
    let _ = notification_tx.send(Notification::Startup(status)).await;

    let poller = Poller::spawn(manager, config.discovery.poll_interval());
    info!(service_type = %config.discovery.browse_type(), "ZeroM2M started");

    Ok(ZeroM2m {
        client,
        registry,
        registry_join,
        poller,
        dispatcher,
    })
}
