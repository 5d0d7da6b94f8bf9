//! oneM2M protocol client.
//!
//! Four single-round-trip operations: register the Application Entity,
//! register its Container, write a Content Instance carrying a device's new
//! state, and read the latest Content Instance back. None of them retry and
//! none of them return an error: failures are logged and folded into the
//! operation's result.

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{CseConfig, EntityConfig, TargetConfig, ZeroConfig};
use crate::error::ZeroError;
use crate::models::{Endpoint, RegistrationOutcome, StateRead};
use crate::utils::m2m_headers;

const TY_AE: u8 = 2;
const TY_CONTAINER: u8 = 3;
const TY_CONTENT_INSTANCE: u8 = 4;

/// Reads and writes the on/off state of a discovered device.
///
/// This is the pipeline stage the discovery cycle runs for every endpoint,
/// and the write side of the toggle action.
#[async_trait]
pub trait DeviceState: Send + Sync {
    /// Reads the latest state. On failure `state` equals `endpoint.is_on`.
    async fn read_state(&self, endpoint: &Endpoint) -> StateRead;

    /// Toggles the device: transmits `!current`. Returns true on 200/201.
    ///
    /// Not a compare-and-swap. Two writers toggling the same device from
    /// the same stale `current` both send the same value (last write wins).
    async fn write_state(&self, endpoint: &Endpoint, current: bool) -> bool;
}

#[derive(Serialize)]
struct AeResource<'a> {
    rn: &'a str,
    api: &'a str,
    rr: bool,
    srv: [&'a str; 1],
}

#[derive(Serialize)]
struct ContainerResource<'a> {
    rn: &'a str,
}

#[derive(Serialize)]
struct ContentInstanceResource {
    con: bool,
    cnf: &'static str,
}

/// The `<ns>:cin` object of a latest-content-instance response.
#[derive(Debug, Deserialize)]
pub struct ContentInstance {
    #[serde(default)]
    pub con: Option<Content>,
}

/// The `con` field, which devices report either as a JSON boolean or a string.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Content {
    Flag(bool),
    Text(String),
    Other(Value),
}

impl Content {
    /// `true`, `"true"` and `"True"` mean on. Everything else means off.
    pub fn as_state(&self) -> bool {
        match self {
            Content::Flag(flag) => *flag,
            Content::Text(text) => text == "true" || text == "True",
            Content::Other(_) => false,
        }
    }
}

fn resource_key(namespace: &str, short_name: &str) -> String {
    format!("{}:{}", namespace, short_name)
}

fn wrap<T: Serialize>(namespace: &str, short_name: &str, resource: T) -> Result<Value, ZeroError> {
    let mut root = serde_json::Map::new();
    root.insert(
        resource_key(namespace, short_name),
        serde_json::to_value(resource)?,
    );
    Ok(Value::Object(root))
}

/// Extracts the device state from a latest-content-instance body.
///
/// Fails if the body is not a JSON object, lacks `<ns>:cin`, or lacks `con`.
pub fn parse_content_state(body: &str, namespace: &str) -> Result<bool, ZeroError> {
    let mut root: serde_json::Map<String, Value> = serde_json::from_str(body)?;
    let key = resource_key(namespace, "cin");
    let cin = root
        .remove(&key)
        .ok_or_else(|| ZeroError::Parse(format!("missing {}", key)))?;
    let cin: ContentInstance = serde_json::from_value(cin)?;
    cin.con
        .map(|con| con.as_state())
        .ok_or_else(|| ZeroError::Parse(format!("missing {}.con", key)))
}

/// Stateless request builder for a single CSE and target resource path.
#[derive(Clone, Debug)]
pub struct M2mClient {
    http: reqwest::Client,
    cse: CseConfig,
    entity: EntityConfig,
    target: TargetConfig,
}

impl M2mClient {
    pub fn new(config: &ZeroConfig) -> Result<Self, ZeroError> {
        let http = reqwest::ClientBuilder::new()
            .default_headers(m2m_headers(&config.cse)?)
            .timeout(config.cse.request_timeout())
            .build()?;
        Ok(Self {
            http,
            cse: config.cse.clone(),
            entity: config.entity.clone(),
            target: config.target.clone(),
        })
    }

    fn state_url(&self, endpoint: &Endpoint) -> String {
        format!(
            "{}/{}/{}",
            self.cse.endpoint_url(endpoint),
            self.target.entity,
            self.target.container
        )
    }

    async fn create(&self, url: &str, resource_type: u8, body: &Value) -> Result<StatusCode, ZeroError> {
        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, format!("application/json;ty={}", resource_type))
            .body(serde_json::to_vec(body)?)
            .send()
            .await?;
        Ok(response.status())
    }

    async fn fetch(&self, request: reqwest::RequestBuilder) -> Result<(StatusCode, String), ZeroError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }

    /// Creates the Application Entity under the CSE root.
    ///
    /// 409 means the entity is already there and counts as success, so this
    /// is safe to call on every startup.
    pub async fn register_entity(&self) -> RegistrationOutcome {
        let url = self.cse.root_url();
        let resource = AeResource {
            rn: &self.entity.name,
            api: &self.entity.api,
            rr: true,
            srv: ["3"],
        };
        let result = match wrap(&self.cse.namespace, "ae", resource) {
            Ok(body) => self.create(&url, TY_AE, &body).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(status) => {
                let outcome = match status.as_u16() {
                    200 | 201 => RegistrationOutcome::Created,
                    409 => RegistrationOutcome::AlreadyExists,
                    403 => RegistrationOutcome::Degraded,
                    _ => RegistrationOutcome::Failed,
                };
                debug!(entity = %self.entity.name, %status, ?outcome, "Entity registration answered");
                outcome
            }
            Err(e) => {
                warn!(entity = %self.entity.name, error = %e, "Entity registration failed");
                RegistrationOutcome::Failed
            }
        }
    }

    /// Best-effort existence check: true iff a filtered discovery of
    /// entities mentions the configured entity name anywhere in the body.
    pub async fn entity_exists(&self) -> bool {
        let request = self
            .http
            .get(self.cse.root_url())
            .query(&[("fu", "1"), ("ty", "2")]);
        match self.fetch(request).await {
            Ok((_, body)) => body.contains(&self.entity.name),
            Err(e) => {
                warn!(entity = %self.entity.name, error = %e, "Entity lookup failed");
                false
            }
        }
    }

    /// Creates the Container under the entity. 409 counts as success.
    pub async fn register_container(&self) -> RegistrationOutcome {
        let url = format!("{}/{}", self.cse.root_url(), self.entity.name);
        let resource = ContainerResource {
            rn: &self.entity.container,
        };
        let result = match wrap(&self.cse.namespace, "cnt", resource) {
            Ok(body) => self.create(&url, TY_CONTAINER, &body).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(status) => match status.as_u16() {
                200 | 201 => RegistrationOutcome::Created,
                409 => RegistrationOutcome::AlreadyExists,
                code => {
                    warn!(container = %self.entity.container, status = code, "Container registration rejected");
                    RegistrationOutcome::Failed
                }
            },
            Err(e) => {
                warn!(container = %self.entity.container, error = %e, "Container registration failed");
                RegistrationOutcome::Failed
            }
        }
    }

    /// Posts a Content Instance carrying `!current` to the endpoint's target container.
    pub async fn write_state(&self, endpoint: &Endpoint, current: bool) -> bool {
        let desired = !current;
        let resource = ContentInstanceResource {
            con: desired,
            cnf: "text/plain:0",
        };
        let result = match wrap(&self.cse.namespace, "cin", resource) {
            Ok(body) => self.create(&self.state_url(endpoint), TY_CONTENT_INSTANCE, &body).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(status) if status == StatusCode::OK || status == StatusCode::CREATED => {
                debug!(device = %endpoint.name, state = desired, "State written");
                true
            }
            Ok(status) => {
                let error = ZeroError::Status { status: status.as_u16() };
                warn!(device = %endpoint.name, %error, "State write rejected");
                false
            }
            Err(e) => {
                warn!(device = %endpoint.name, error = %e, "State write failed");
                false
            }
        }
    }

    /// Reads the latest Content Instance of the endpoint's target container.
    pub async fn read_state(&self, endpoint: &Endpoint) -> StateRead {
        let unchanged = StateRead {
            ok: false,
            state: endpoint.is_on,
        };
        let request = self.http.get(format!("{}/la", self.state_url(endpoint)));
        let body = match self.fetch(request).await {
            Ok((status, body)) if status == StatusCode::OK => body,
            Ok((status, _)) => {
                let error = ZeroError::Status { status: status.as_u16() };
                warn!(device = %endpoint.name, %error, "State read rejected");
                return unchanged;
            }
            Err(e) => {
                warn!(device = %endpoint.name, error = %e, "State read failed");
                return unchanged;
            }
        };
        match parse_content_state(&body, &self.cse.namespace) {
            Ok(state) => StateRead { ok: true, state },
            Err(e) => {
                warn!(device = %endpoint.name, error = %e, "State response malformed");
                unchanged
            }
        }
    }
}

#[async_trait]
impl DeviceState for M2mClient {
    async fn read_state(&self, endpoint: &Endpoint) -> StateRead {
        M2mClient::read_state(self, endpoint).await
    }

    async fn write_state(&self, endpoint: &Endpoint, current: bool) -> bool {
        M2mClient::write_state(self, endpoint, current).await
    }
}
