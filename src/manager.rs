use futures::StreamExt;
use futures::stream::FuturesOrdered;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::config::{DiscoveryConfig, FilterRule};
use crate::discovery::DiscoveryEngine;
use crate::error::ZeroError;
use crate::models::{
    DiscoverySummary, Endpoint, Notification, RegistrationOutcome, RunState, StartupStatus, SyncMode,
};
use crate::protocol::{DeviceState, M2mClient};
use crate::registry::RegistryHandle;

/// Knobs for one discovery cycle, taken from [`DiscoveryConfig`].
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub timeout: Duration,
    pub read_state: bool,
    pub filter: FilterRule,
}

impl From<&DiscoveryConfig> for SyncSettings {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            timeout: config.timeout(),
            read_state: config.read_state,
            filter: config.filter.clone(),
        }
    }
}

/// Runs discovery cycles: browse, filter, read each accepted endpoint's
/// state, and apply the accepted endpoints to the registry.
pub struct DeviceManager {
    engine: DiscoveryEngine,
    device: Arc<dyn DeviceState>,
    registry: RegistryHandle,
    settings: SyncSettings,
    notification_tx: mpsc::Sender<Notification>,
    // Held for the whole cycle so two runs never write the same registry.
    run_gate: Mutex<()>,
}

impl DeviceManager {
    pub fn new(
        engine: DiscoveryEngine,
        device: Arc<dyn DeviceState>,
        registry: RegistryHandle,
        settings: SyncSettings,
        notification_tx: mpsc::Sender<Notification>,
    ) -> Self {
        Self {
            engine,
            device,
            registry,
            settings,
            notification_tx,
            run_gate: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    async fn notify(&self, notification: Notification) {
        let _ = self.notification_tx.send(notification).await;
    }

    async fn progress(&self, message: String) {
        self.notify(Notification::Progress(message)).await;
    }

    /// Runs one discovery cycle.
    ///
    /// `Merge` applies each accepted endpoint as soon as it arrives (manual
    /// trigger, incremental feedback). `Replace` collects into a fresh
    /// snapshot swapped in at the end, dropping devices that disappeared
    /// (periodic poll).
    ///
    /// Returns [`ZeroError::DiscoveryBusy`] if a cycle is already running and
    /// [`ZeroError::DiscoveryInit`] if the resolver cannot start.
    pub async fn discover(&self, mode: SyncMode) -> Result<DiscoverySummary, ZeroError> {
        let gate = self.run_gate.try_lock().map_err(|_| ZeroError::DiscoveryBusy)?;

        self.progress(format!("Searching for devices on {}...", self.engine.service_type()))
            .await;
        let mut run = match self.engine.browse(self.settings.timeout) {
            Ok(run) => run,
            Err(e) => {
                drop(gate);
                self.progress(format!("Discovery unavailable: {}", e)).await;
                let summary = DiscoverySummary {
                    state: RunState::InitFailed,
                    mode,
                    discovered: 0,
                    accepted: 0,
                };
                self.notify(Notification::DiscoveryFinished(summary)).await;
                return Err(e);
            }
        };

        // Reads run concurrently so the run keeps draining; results are
        // applied in advertisement order.
        let mut reads = FuturesOrdered::new();
        let mut browsing = true;
        let mut discovered = 0;
        let mut accepted = Vec::new();
        loop {
            tokio::select! {
                next = run.next(), if browsing => match next {
                    Some(endpoint) => {
                        discovered += 1;
                        if self.settings.filter.accepts(&endpoint) {
                            reads.push_back(self.refresh_state(endpoint));
                        } else {
                            self.report(&endpoint, false).await;
                        }
                    }
                    None => browsing = false,
                },
                Some(read) = reads.next(), if !reads.is_empty() => {
                    let endpoint = read?;
                    self.report(&endpoint, true).await;
                    if mode == SyncMode::Merge {
                        let snapshot = self.registry.merge(endpoint.clone()).await?;
                        self.notify(Notification::RegistryUpdated(snapshot)).await;
                    }
                    accepted.push(endpoint);
                }
                else => break,
            }
        }
        let outcome = run.finish().await;

        if mode == SyncMode::Replace {
            let snapshot = self.registry.replace(accepted.clone()).await?;
            self.notify(Notification::RegistryUpdated(snapshot)).await;
        }

        drop(gate);

        let summary = DiscoverySummary {
            state: outcome.state,
            mode,
            discovered,
            accepted: accepted.len(),
        };
        info!(?summary, "Discovery cycle finished");
        self.progress(format!(
            "Discovery finished: {} found, {} kept",
            summary.discovered, summary.accepted
        ))
        .await;
        self.notify(Notification::DiscoveryFinished(summary.clone()))
            .await;
        Ok(summary)
    }

    async fn report(&self, endpoint: &Endpoint, admit: bool) {
        debug!(device = %endpoint.name, port = endpoint.port, admit, "Filtered");
        self.progress(format!(
            "{} {}",
            if admit { "Found" } else { "Ignored" },
            endpoint
        ))
        .await;
        self.notify(Notification::EndpointDiscovered {
            endpoint: endpoint.clone(),
            accepted: admit,
        })
        .await;
    }

    /// Reads the endpoint's state. On failure the registry's cached state
    /// for that name is kept rather than resetting it to off.
    async fn refresh_state(&self, mut endpoint: Endpoint) -> Result<Endpoint, ZeroError> {
        if let Some(known) = self.registry.get(endpoint.name.clone()).await? {
            endpoint.is_on = known.is_on;
        }
        if !self.settings.read_state {
            return Ok(endpoint);
        }
        let read = self.device.read_state(&endpoint).await;
        if read.ok {
            endpoint.is_on = read.state;
        } else {
            warn!(device = %endpoint.name, cached = endpoint.is_on, "Keeping cached state");
        }
        Ok(endpoint)
    }
}

/// Registers the entity (unless it already exists) and then its container.
pub async fn bootstrap(client: &M2mClient) -> StartupStatus {
    let entity = if client.entity_exists().await {
        debug!("Entity already registered");
        RegistrationOutcome::AlreadyExists
    } else {
        client.register_entity().await
    };
    let status = match entity {
        RegistrationOutcome::Failed => StartupStatus::Failed("entity registration failed".to_string()),
        RegistrationOutcome::Degraded => {
            StartupStatus::Degraded("entity registration refused for this originator".to_string())
        }
        RegistrationOutcome::Created | RegistrationOutcome::AlreadyExists => {
            match client.register_container().await {
                RegistrationOutcome::Failed => {
                    StartupStatus::Degraded("container registration failed".to_string())
                }
                _ => StartupStatus::Ready,
            }
        }
    };
    info!(?entity, ?status, "Bootstrap finished");
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZeroConfig;
    use crate::discovery::testing::{ScriptedResolver, advert};
    use crate::registry::testing::FakeDevices;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        manager: Arc<DeviceManager>,
        notifications: mpsc::Receiver<Notification>,
    }

    async fn fixture(resolver: ScriptedResolver, devices: Arc<FakeDevices>, read_state: bool) -> Fixture {
        fixture_with(resolver, devices, read_state).await
    }

    async fn fixture_with(
        resolver: ScriptedResolver,
        devices: Arc<dyn DeviceState>,
        read_state: bool,
    ) -> Fixture {
        let engine = DiscoveryEngine::new(Arc::new(resolver), "_http._tcp.local.", 8);
        let (registry, _join) = RegistryHandle::spawn(devices.clone()).await.unwrap();
        let (tx, rx) = mpsc::channel(256);
        let settings = SyncSettings {
            timeout: Duration::from_secs(2),
            read_state,
            filter: FilterRule::default(),
        };
        Fixture {
            manager: Arc::new(DeviceManager::new(engine, devices, registry, settings, tx)),
            notifications: rx,
        }
    }

    /// Every read takes `delay` and reports the device as on.
    #[derive(Default)]
    struct SlowDevices {
        delay: Duration,
        reads: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl DeviceState for SlowDevices {
        async fn read_state(&self, endpoint: &Endpoint) -> crate::models::StateRead {
            tokio::time::sleep(self.delay).await;
            self.reads.lock().unwrap().push(endpoint.name.clone());
            crate::models::StateRead { ok: true, state: true }
        }

        async fn write_state(&self, _endpoint: &Endpoint, _current: bool) -> bool {
            false
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test]
    async fn test_merge_cycle_filters_and_reads_state() {
        let resolver = ScriptedResolver::closing(vec![vec![
            advert("lamp-1", 8081, &["10.0.0.1"]),
            advert("sensor-1", 9000, &["10.0.0.2"]),
            advert("printer", 8081, &["10.0.0.3"]),
        ]]);
        let devices = Arc::new(FakeDevices::with(&[("lamp-1", true)]));
        let mut fx = fixture(resolver, devices, true).await;

        let summary = fx.manager.discover(SyncMode::Merge).await.unwrap();
        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.discovered, 3);
        assert_eq!(summary.accepted, 2);

        let all = fx.manager.registry().all().await.unwrap();
        assert_eq!(all.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(), vec!["lamp-1", "printer"]);
        assert!(all[0].is_on);
        assert!(!all[1].is_on);

        let notes = drain(&mut fx.notifications);
        let rejected: Vec<&str> = notes
            .iter()
            .filter_map(|n| match n {
                Notification::EndpointDiscovered { endpoint, accepted: false } => Some(endpoint.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(rejected, vec!["sensor-1"]);
        assert!(notes.iter().any(|n| matches!(n, Notification::Progress(p) if p.starts_with("Ignored sensor-1"))));
        assert!(matches!(notes.last(), Some(Notification::DiscoveryFinished(_))));
    }

    #[tokio::test]
    async fn test_replace_cycle_drops_vanished_devices() {
        let resolver = ScriptedResolver::closing(vec![
            vec![advert("lamp-1", 8081, &["10.0.0.1"]), advert("lamp-2", 8081, &["10.0.0.2"])],
            vec![advert("lamp-2", 8081, &["10.0.0.9"])],
        ]);
        let fx = fixture(resolver, Arc::default(), false).await;

        fx.manager.discover(SyncMode::Replace).await.unwrap();
        assert_eq!(fx.manager.registry().all().await.unwrap().len(), 2);

        fx.manager.discover(SyncMode::Replace).await.unwrap();
        let all = fx.manager.registry().all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "lamp-2");
        assert_eq!(all[0].host, "10.0.0.9");
    }

    #[tokio::test]
    async fn test_failed_read_keeps_cached_state() {
        let resolver = ScriptedResolver::closing(vec![
            vec![advert("lamp-1", 8081, &["10.0.0.1"])],
            vec![advert("lamp-1", 8081, &["10.0.0.1"])],
        ]);
        let devices = Arc::new(FakeDevices::with(&[("lamp-1", true)]));
        let fx = fixture(resolver, devices.clone(), true).await;
        fx.manager.discover(SyncMode::Merge).await.unwrap();
        assert!(fx.manager.registry().all().await.unwrap()[0].is_on);

        // The device stops answering: the reads fail from now on.
        devices.states.lock().unwrap().clear();
        fx.manager.discover(SyncMode::Merge).await.unwrap();
        assert!(fx.manager.registry().all().await.unwrap()[0].is_on);
    }

    #[tokio::test]
    async fn test_init_failure_reports_and_leaves_registry() {
        let mut fx = fixture(ScriptedResolver::failing(), Arc::default(), true).await;
        let result = fx.manager.discover(SyncMode::Replace).await;
        assert!(matches!(result, Err(ZeroError::DiscoveryInit(_))));
        assert!(fx.manager.registry().all().await.unwrap().is_empty());
        let notes = drain(&mut fx.notifications);
        assert!(notes.iter().any(|n| matches!(
            n,
            Notification::DiscoveryFinished(DiscoverySummary { state: RunState::InitFailed, .. })
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_cycle_is_rejected() {
        let resolver = ScriptedResolver::hanging(vec![vec![advert("lamp-1", 8081, &["10.0.0.1"])]]);
        let fx = fixture(resolver, Arc::default(), false).await;

        let first = {
            let manager = fx.manager.clone();
            tokio::spawn(async move { manager.discover(SyncMode::Replace).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = fx.manager.discover(SyncMode::Merge).await;
        assert!(matches!(second, Err(ZeroError::DiscoveryBusy)));

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.state, RunState::TimedOut);
        assert_eq!(fx.manager.registry().all().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reads_do_not_starve_later_devices() {
        let mut script: Vec<_> = (0..12)
            .map(|i| advert(&format!("printer-{}", i), 631, &["10.0.1.1"]))
            .collect();
        script.push(advert("lamp-1", 8081, &["10.0.0.1"]));
        let resolver = ScriptedResolver::hanging(vec![script]);
        let devices = Arc::new(SlowDevices {
            delay: Duration::from_secs(1),
            ..SlowDevices::default()
        });
        let mut fx = fixture_with(resolver, devices.clone(), true).await;

        let summary = fx.manager.discover(SyncMode::Replace).await.unwrap();
        assert_eq!(summary.state, RunState::TimedOut);
        assert_eq!(summary.discovered, 13);
        assert_eq!(summary.accepted, 1);

        // Rejected endpoints are reported but never read.
        assert_eq!(*devices.reads.lock().unwrap(), vec!["lamp-1".to_string()]);
        let all = fx.manager.registry().all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "lamp-1");
        assert!(all[0].is_on);

        let ignored = drain(&mut fx.notifications)
            .into_iter()
            .filter(|n| matches!(n, Notification::EndpointDiscovered { accepted: false, .. }))
            .count();
        assert_eq!(ignored, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_apply_in_advertisement_order() {
        let resolver = ScriptedResolver::closing(vec![vec![
            advert("lamp-1", 8081, &["10.0.0.1"]),
            advert("lamp-2", 8081, &["10.0.0.2"]),
            advert("lamp-3", 8081, &["10.0.0.3"]),
        ]]);
        let devices = Arc::new(SlowDevices {
            delay: Duration::from_millis(500),
            ..SlowDevices::default()
        });
        let started = tokio::time::Instant::now();
        let fx = fixture_with(resolver, devices, true).await;

        fx.manager.discover(SyncMode::Merge).await.unwrap();
        // The three reads overlap instead of running back to back.
        assert!(started.elapsed() < Duration::from_millis(1500));
        let names: Vec<String> = fx
            .manager
            .registry()
            .all()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["lamp-1", "lamp-2", "lamp-3"]);
    }

    fn client_for(server: &MockServer) -> M2mClient {
        let mut config = ZeroConfig::default();
        config.cse.host = server.address().ip().to_string();
        config.cse.port = server.address().port();
        M2mClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_skips_entity_when_present() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cse-in"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"m2m:uril":["cse-in/Notebook-AE"]}"#))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/cse-in"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/cse-in/Notebook-AE"))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;
        assert_eq!(bootstrap(&client_for(&server)).await, StartupStatus::Ready);
    }

    #[tokio::test]
    async fn test_bootstrap_status_mapping() {
        for (entity, container, expected_ready, expected_failed) in [
            (201u16, 500u16, false, false),
            (403, 201, false, false),
            (500, 201, false, true),
            (409, 201, true, false),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/cse-in"))
                .respond_with(ResponseTemplate::new(entity))
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/cse-in/Notebook-AE"))
                .respond_with(ResponseTemplate::new(container))
                .mount(&server)
                .await;
            let status = bootstrap(&client_for(&server)).await;
            assert_eq!(status == StartupStatus::Ready, expected_ready, "{} {}", entity, container);
            assert_eq!(matches!(status, StartupStatus::Failed(_)), expected_failed);
        }
    }
}
