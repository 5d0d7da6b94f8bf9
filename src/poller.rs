use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::ZeroError;
use crate::manager::DeviceManager;
use crate::models::SyncMode;

/// Re-runs discovery on a fixed interval, replacing the registry each time.
///
/// The first cycle starts immediately. A tick that finds another cycle
/// still running (a manual trigger, or a slow previous poll) is dropped.
pub struct Poller {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl Poller {
    pub fn spawn(manager: Arc<DeviceManager>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let period = interval.max(Duration::from_millis(1));

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = period.as_secs_f32(), "Poller started");
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => match manager.discover(SyncMode::Replace).await {
                        Ok(summary) => debug!(?summary, "Poll finished"),
                        Err(ZeroError::DiscoveryBusy) => {
                            debug!("Discovery already running, dropping tick")
                        }
                        Err(e) => warn!(error = %e, "Poll failed"),
                    },
                }
            }
            info!("Poller stopped");
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            join,
        }
    }

    /// Stops ticking. A cycle already in flight runs to its deadline first.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.join.await;
    }
}
