use mdns_sd::ServiceInfo;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

/// A device endpoint as tracked by the registry.
///
/// `name` is the identity key. `is_on` is the last state read from the
/// device and may be stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub is_on: bool,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            is_on: false,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{}) [{}]",
            self.name,
            self.host,
            self.port,
            if self.is_on { "on" } else { "off" }
        )
    }
}

/// One resolved multicast advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Instance name without the service type suffix.
    pub name: String,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
}

impl Advertisement {
    /// One endpoint per IPv4 address, in address order, all starting `off`.
    pub fn endpoints(&self) -> impl Iterator<Item = Endpoint> + '_ {
        self.addresses
            .iter()
            .filter(|ip| ip.is_ipv4())
            .map(|ip| Endpoint::new(self.name.clone(), ip.to_string(), self.port))
    }
}

impl From<&ServiceInfo> for Advertisement {
    fn from(info: &ServiceInfo) -> Self {
        let fullname = info.get_fullname();
        let name = fullname
            .strip_suffix(info.get_type())
            .map(|n| n.trim_end_matches('.'))
            .unwrap_or(fullname)
            .to_string();
        let mut addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
        addresses.sort();
        Advertisement {
            name,
            port: info.get_port(),
            addresses,
        }
    }
}

/// Result of reading a device's state. On failure `state` carries the
/// caller's previous value unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateRead {
    pub ok: bool,
    pub state: bool,
}

/// Outcome of an idempotent resource registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Created,
    AlreadyExists,
    /// The CSE was reached but refused the originator (HTTP 403).
    Degraded,
    Failed,
}

impl RegistrationOutcome {
    pub fn is_success(self) -> bool {
        !matches!(self, RegistrationOutcome::Failed)
    }
}

/// Result of the startup registration, queried by the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupStatus {
    /// Bootstrap has not finished yet.
    Pending,
    Ready,
    Degraded(String),
    Failed(String),
}

/// How a discovery cycle applies its results to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Merge each accepted endpoint as it arrives.
    Merge,
    /// Collect accepted endpoints and swap them in at the end of the run.
    Replace,
}

/// Lifecycle of a single discovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Browsing,
    /// The advertisement stream closed before the deadline.
    Completed,
    TimedOut,
    InitFailed,
    /// The producer stopped without reporting, e.g. its task was cancelled.
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::TimedOut | RunState::InitFailed | RunState::Aborted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverySummary {
    pub state: RunState,
    pub mode: SyncMode,
    pub discovered: usize,
    pub accepted: usize,
}

/// Events sent from the library back to the client application.
#[derive(Debug, Clone)]
pub enum Notification {
    /// Human-readable progress line.
    Progress(String),
    /// An endpoint came out of discovery. Rejected endpoints are reported too.
    EndpointDiscovered { endpoint: Endpoint, accepted: bool },
    /// Snapshot of the registry after a change.
    RegistryUpdated(Vec<Endpoint>),
    DiscoveryFinished(DiscoverySummary),
    Startup(StartupStatus),
}
