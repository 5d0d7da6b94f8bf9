//! Time-bounded multicast discovery.
//!
//! [`DiscoveryEngine::browse`] starts one run and hands back a
//! [`DiscoveryRun`]: endpoints arrive one at a time in advertisement order,
//! and a completion signal reports whether the advertisement stream closed
//! on its own or the deadline cut it short.
//!
//! The producer task is the only owner of the endpoint sender. It stops at
//! the deadline, drops the sender exactly once, then reports completion, so
//! there is no second path that could close the channel or send after close.

use futures::stream::{self, BoxStream, StreamExt};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, trace, warn};

use crate::error::ZeroError;
use crate::models::{Advertisement, Endpoint, RunState};

/// A source of multicast advertisements.
pub trait Resolver: Send + Sync {
    /// Starts browsing for `service_type` (fully qualified, e.g. `_http._tcp.local.`).
    ///
    /// The returned stream ends when the resolver stops the search. Dropping
    /// it releases the resolver.
    fn browse(&self, service_type: &str) -> Result<BoxStream<'static, Advertisement>, ZeroError>;
}

/// Resolver backed by a fresh `mdns_sd` daemon per browse.
#[derive(Debug, Default, Clone)]
pub struct MdnsResolver;

impl MdnsResolver {
    pub fn new() -> Self {
        Self
    }
}

/// Stops the search and the daemon thread once the advertisement stream is dropped.
struct DaemonGuard {
    daemon: ServiceDaemon,
    service_type: String,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.stop_browse(&self.service_type) {
            trace!(error = %e, "stop_browse after run");
        }
        if let Err(e) = self.daemon.shutdown() {
            trace!(error = %e, "mDNS daemon shutdown");
        }
    }
}

impl Resolver for MdnsResolver {
    fn browse(&self, service_type: &str) -> Result<BoxStream<'static, Advertisement>, ZeroError> {
        let daemon = ServiceDaemon::new().map_err(|e| ZeroError::DiscoveryInit(e.to_string()))?;
        let receiver = daemon
            .browse(service_type)
            .map_err(|e| ZeroError::DiscoveryInit(e.to_string()))?;
        let guard = DaemonGuard {
            daemon,
            service_type: service_type.to_string(),
        };

        let adverts = stream::unfold((receiver, guard), |(receiver, guard)| async move {
            loop {
                match receiver.recv_async().await {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        trace!(fullname = %info.get_fullname(), "Resolved");
                        let advert = Advertisement::from(&info);
                        return Some((advert, (receiver, guard)));
                    }
                    Ok(ServiceEvent::SearchStopped(service_type)) => {
                        debug!(%service_type, "Search stopped by resolver");
                        return None;
                    }
                    Ok(other) => trace!(event = ?other, "Ignoring mDNS event"),
                    Err(_) => return None,
                }
            }
        });
        Ok(adverts.boxed())
    }
}

/// Why a run ended, with the number of endpoints it emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub state: RunState,
    pub emitted: usize,
}

/// One in-flight discovery run.
pub struct DiscoveryRun {
    endpoints: mpsc::Receiver<Endpoint>,
    completion: oneshot::Receiver<RunOutcome>,
    state: watch::Receiver<RunState>,
    deadline: Instant,
    received: usize,
}

impl DiscoveryRun {
    /// Next endpoint, or `None` once the run has ended for any reason.
    pub async fn next(&mut self) -> Option<Endpoint> {
        let endpoint = self.endpoints.recv().await;
        if endpoint.is_some() {
            self.received += 1;
        }
        endpoint
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// `Browsing` until the producer stops, then `Completed` or `TimedOut`.
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Waits for the completion signal. Endpoints not yet received are dropped.
    pub async fn finish(self) -> RunOutcome {
        let DiscoveryRun {
            endpoints,
            completion,
            received,
            ..
        } = self;
        drop(endpoints);
        match completion.await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(received, "Browse ended without a completion signal");
                RunOutcome {
                    state: RunState::Aborted,
                    emitted: received,
                }
            }
        }
    }
}

/// Runs time-bounded browses for one service type.
#[derive(Clone)]
pub struct DiscoveryEngine {
    resolver: Arc<dyn Resolver>,
    service_type: String,
    channel_capacity: usize,
}

impl DiscoveryEngine {
    pub fn new(resolver: Arc<dyn Resolver>, service_type: impl Into<String>, channel_capacity: usize) -> Self {
        Self {
            resolver,
            service_type: service_type.into(),
            channel_capacity: channel_capacity.max(1),
        }
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Starts a run that ends no later than `timeout` from now.
    ///
    /// Fails with [`ZeroError::DiscoveryInit`] if the resolver cannot start;
    /// in that case nothing is spawned and no endpoint is ever produced.
    pub fn browse(&self, timeout: Duration) -> Result<DiscoveryRun, ZeroError> {
        let deadline = Instant::now() + timeout;
        let adverts = self.resolver.browse(&self.service_type).inspect_err(|e| {
            warn!(service_type = %self.service_type, error = %e, "Discovery could not start");
        })?;
        info!(
            service_type = %self.service_type,
            timeout_secs = timeout.as_secs_f32(),
            "Browsing"
        );

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let (done_tx, done_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(RunState::Browsing);
        tokio::spawn(produce(adverts, tx, done_tx, state_tx, deadline));

        Ok(DiscoveryRun {
            endpoints: rx,
            completion: done_rx,
            state: state_rx,
            deadline,
            received: 0,
        })
    }
}

async fn produce(
    mut adverts: BoxStream<'static, Advertisement>,
    tx: mpsc::Sender<Endpoint>,
    done_tx: oneshot::Sender<RunOutcome>,
    state_tx: watch::Sender<RunState>,
    deadline: Instant,
) {
    let mut emitted = 0;
    let state = 'run: loop {
        let next = tokio::select! {
            _ = tx.closed() => None,
            next = timeout_at(deadline, adverts.next()) => Some(next),
        };
        let advert = match next {
            Some(Ok(Some(advert))) => advert,
            // Stream closed by the resolver, or the consumer went away.
            Some(Ok(None)) | None => break RunState::Completed,
            Some(Err(_)) => break RunState::TimedOut,
        };
        for endpoint in advert.endpoints() {
            debug!(name = %endpoint.name, host = %endpoint.host, port = endpoint.port, "Discovered");
            match timeout_at(deadline, tx.send(endpoint)).await {
                Ok(Ok(())) => emitted += 1,
                // Receiver gone: nobody is listening any more.
                Ok(Err(_)) => break 'run RunState::Completed,
                Err(_) => break 'run RunState::TimedOut,
            }
        }
    };

    // Publish the final state before the consumer can observe end-of-stream.
    state_tx.send_replace(state);
    drop(tx);
    drop(adverts);
    info!(?state, emitted, "Browse finished");
    let _ = done_tx.send(RunOutcome { state, emitted });
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Scripted resolver: each browse replays the next script, then either
    /// closes the stream or stays silent forever.
    pub struct ScriptedResolver {
        scripts: Mutex<Vec<Vec<Advertisement>>>,
        hang_after: bool,
        fail: bool,
        pub calls: Mutex<usize>,
    }

    impl ScriptedResolver {
        pub fn closing(scripts: Vec<Vec<Advertisement>>) -> Self {
            Self::new(scripts, false, false)
        }

        pub fn hanging(scripts: Vec<Vec<Advertisement>>) -> Self {
            Self::new(scripts, true, false)
        }

        pub fn failing() -> Self {
            Self::new(Vec::new(), false, true)
        }

        fn new(scripts: Vec<Vec<Advertisement>>, hang_after: bool, fail: bool) -> Self {
            Self {
                scripts: Mutex::new(scripts),
                hang_after,
                fail,
                calls: Mutex::new(0),
            }
        }
    }

    impl Resolver for ScriptedResolver {
        fn browse(&self, _service_type: &str) -> Result<BoxStream<'static, Advertisement>, ZeroError> {
            *self.calls.lock().unwrap() += 1;
            if self.fail {
                return Err(ZeroError::DiscoveryInit("no multicast interface".to_string()));
            }
            let mut scripts = self.scripts.lock().unwrap();
            let script = if scripts.is_empty() {
                Vec::new()
            } else {
                scripts.remove(0)
            };
            let replay = stream::iter(script);
            if self.hang_after {
                Ok(replay.chain(stream::pending()).boxed())
            } else {
                Ok(replay.boxed())
            }
        }
    }

    pub fn advert(name: &str, port: u16, hosts: &[&str]) -> Advertisement {
        Advertisement {
            name: name.to_string(),
            port,
            addresses: hosts.iter().map(|h| h.parse().unwrap()).collect(),
        }
    }
}
