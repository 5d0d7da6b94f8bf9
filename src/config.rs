use anyhow::{Context, Result};
use serde::Deserialize;
use std::{collections::HashMap, io::Read, path::Path, time::Duration};

use crate::models::Endpoint;

/// Represents the top-level configuration loaded from a TOML file.
///
/// Every section has defaults, so an empty file yields a working configuration
/// that talks to a CSE on `localhost:8080`.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ZeroConfig {
    pub cse: CseConfig,
    pub entity: EntityConfig,
    pub target: TargetConfig,
    pub discovery: DiscoveryConfig,
}

/// Where and how requests are sent to a Common Services Entity.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CseConfig {
    pub host: String,
    pub port: u16,
    pub base_path: String,
    /// Sent as `X-M2M-Origin`.
    pub originator: String,
    /// Sent as `X-M2M-RI`.
    pub request_id: String,
    /// Sent as `X-M2M-RVI`.
    pub release: String,
    /// Prefix of resource keys in JSON bodies, e.g. `m2m:ae`.
    pub namespace: String,
    pub request_timeout_secs: u64,
    /// Extra headers added to every request.
    pub headers: HashMap<String, String>,
}

impl Default for CseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            base_path: "cse-in".to_string(),
            originator: "CAdmin3".to_string(),
            request_id: "123".to_string(),
            release: "3".to_string(),
            namespace: "m2m".to_string(),
            request_timeout_secs: 5,
            headers: HashMap::new(),
        }
    }
}

impl CseConfig {
    /// Root collection URL of the configured CSE.
    pub fn root_url(&self) -> String {
        format!("http://{}:{}/{}", self.host, self.port, self.base_path)
    }

    /// Root collection URL of the CSE served by a discovered endpoint.
    pub fn endpoint_url(&self, endpoint: &Endpoint) -> String {
        format!(
            "http://{}:{}/{}",
            endpoint.host, endpoint.port, self.base_path
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// The Application Entity this process registers as, and its container.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EntityConfig {
    pub name: String,
    pub api: String,
    pub container: String,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            name: "Notebook-AE".to_string(),
            api: "NnotebookAE".to_string(),
            container: "state".to_string(),
        }
    }
}

/// The resource path holding state on every discovered device.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TargetConfig {
    pub entity: String,
    pub container: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            entity: "Lamp-AE".to_string(),
            container: "state".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub service_type: String,
    pub domain: String,
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
    /// Read the state of every discovered endpoint before it reaches the registry.
    pub read_state: bool,
    pub channel_capacity: usize,
    pub filter: FilterRule,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: "_http._tcp".to_string(),
            domain: "local.".to_string(),
            timeout_secs: 5,
            poll_interval_secs: 15,
            read_state: true,
            channel_capacity: 32,
            filter: FilterRule::default(),
        }
    }
}

impl DiscoveryConfig {
    /// Fully qualified browse target, e.g. `_http._tcp.local.`.
    pub fn browse_type(&self) -> String {
        let domain = self.domain.trim_start_matches('.');
        format!("{}.{}", self.service_type.trim_end_matches('.'), domain)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Decides which discovered endpoints are admitted into the registry.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct FilterRule {
    /// Case-insensitive substring of the endpoint name. Empty disables the check.
    pub name_marker: String,
    pub port: Option<u16>,
}

impl Default for FilterRule {
    fn default() -> Self {
        Self {
            name_marker: "lamp".to_string(),
            port: Some(8081),
        }
    }
}

impl FilterRule {
    pub fn accepts(&self, endpoint: &Endpoint) -> bool {
        let by_name = !self.name_marker.is_empty()
            && endpoint
                .name
                .to_lowercase()
                .contains(&self.name_marker.to_lowercase());
        by_name || self.port == Some(endpoint.port)
    }
}

impl ZeroConfig {
    /// Loads configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("read config from {:?}", path.as_ref()))?;
        toml::from_str(&content).context("parse zerom2m config")
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut buf = String::new();
        let mut rdr = reader;
        rdr.read_to_string(&mut buf)?;
        toml::from_str(&buf).context("parse zerom2m config from reader")
    }
}
