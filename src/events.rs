use crate::models::{DiscoverySummary, Endpoint, Notification, StartupStatus};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A trait for observing discovery and registry changes.
///
/// Implement this trait to drive a UI from the device registry. Handlers
/// only observe; nothing they return feeds back into discovery.
#[async_trait]
pub trait DeviceEventHandler: Send + Sync {
    /// Called with a human-readable progress line, suitable for a log view.
    async fn on_progress(&self, message: &str);

    /// Called for every discovered endpoint, including ones the filter rejected.
    async fn on_endpoint(&self, _endpoint: &Endpoint, _accepted: bool) {}

    /// Called with the full registry snapshot after each change.
    async fn on_registry_updated(&self, _devices: &[Endpoint]) {}

    async fn on_discovery_finished(&self, _summary: &DiscoverySummary) {}
}

/// A trait for learning how startup registration went.
#[async_trait]
pub trait StartupObserver: Send + Sync {
    /// Called once, after the entity and container registration attempts.
    async fn on_startup(&self, status: &StartupStatus);
}

/// A convenient super-trait that combines `DeviceEventHandler` and `StartupObserver`.
///
/// This is the recommended trait for your main application struct to implement.
#[async_trait]
pub trait ZeroHandler: DeviceEventHandler + StartupObserver {}

/// Forwards notifications to `handler` until every sender is gone.
pub(crate) async fn dispatch<H>(handler: Arc<H>, mut notifications: mpsc::Receiver<Notification>)
where
    H: ZeroHandler + ?Sized,
{
    while let Some(notification) = notifications.recv().await {
        match notification {
            Notification::Progress(message) => handler.on_progress(&message).await,
            Notification::EndpointDiscovered { endpoint, accepted } => {
                handler.on_endpoint(&endpoint, accepted).await
            }
            Notification::RegistryUpdated(devices) => handler.on_registry_updated(&devices).await,
            Notification::DiscoveryFinished(summary) => {
                handler.on_discovery_finished(&summary).await
            }
            Notification::Startup(status) => handler.on_startup(&status).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunState, SyncMode};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeviceEventHandler for Recorder {
        async fn on_progress(&self, message: &str) {
            self.seen.lock().unwrap().push(format!("progress:{}", message));
        }

        async fn on_discovery_finished(&self, summary: &DiscoverySummary) {
            self.seen.lock().unwrap().push(format!("finished:{}", summary.accepted));
        }
    }

    #[async_trait]
    impl StartupObserver for Recorder {
        async fn on_startup(&self, status: &StartupStatus) {
            self.seen.lock().unwrap().push(format!("startup:{:?}", status));
        }
    }

    impl ZeroHandler for Recorder {}

    #[tokio::test]
    async fn test_dispatch_routes_notifications_in_order() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::channel(8);
        tx.send(Notification::Startup(StartupStatus::Ready)).await.unwrap();
        tx.send(Notification::Progress("hello".to_string())).await.unwrap();
        tx.send(Notification::RegistryUpdated(Vec::new())).await.unwrap();
        tx.send(Notification::DiscoveryFinished(DiscoverySummary {
            state: RunState::Completed,
            mode: SyncMode::Merge,
            discovered: 2,
            accepted: 1,
        }))
        .await
        .unwrap();
        drop(tx);

        dispatch(recorder.clone(), rx).await;
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["startup:Ready", "progress:hello", "finished:1"]
        );
    }
}
