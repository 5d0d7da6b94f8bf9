//! The device registry and the actor that owns it.
//!
//! [`Registry`] is a plain ordered, name-keyed collection with a selection
//! cursor. All shared access goes through [`RegistryActor`], which processes
//! one message at a time: discovery merges, UI reads, selection changes and
//! toggles never interleave.

use async_trait::async_trait;
use ractor::concurrency::JoinHandle;
use ractor::rpc::CallResult;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::ZeroError;
use crate::models::Endpoint;
use crate::protocol::DeviceState;

/// Endpoints in first-seen order, unique by name, plus a selection cursor.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    entries: Vec<Endpoint>,
    selected: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    /// Inserts a new name at the end, or updates host, port and state of an
    /// existing entry in place. Returns true if the name was new.
    pub fn merge(&mut self, endpoint: Endpoint) -> bool {
        match self.position(&endpoint.name) {
            Some(index) => {
                self.entries[index] = endpoint;
                false
            }
            None => {
                self.entries.push(endpoint);
                self.clamp();
                true
            }
        }
    }

    /// Swaps in a new snapshot. Duplicate names in `endpoints` collapse into
    /// the first position with the last value.
    pub fn replace(&mut self, endpoints: Vec<Endpoint>) {
        let mut fresh = Registry::new();
        for endpoint in endpoints {
            fresh.merge(endpoint);
        }
        self.entries = fresh.entries;
        self.clamp();
    }

    pub fn all(&self) -> Vec<Endpoint> {
        self.entries.clone()
    }

    pub fn get(&self, name: &str) -> Option<&Endpoint> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn selected(&self) -> Option<&Endpoint> {
        self.entries.get(self.selected)
    }

    pub fn selected_index(&self) -> usize {
        self.selected
    }

    /// Moves the cursor to the next entry, wrapping to the first.
    pub fn advance_selection(&mut self) {
        if !self.entries.is_empty() {
            self.selected = (self.selected + 1) % self.entries.len();
        }
    }

    /// Updates the cached state of `name`. Returns false if it is unknown.
    pub fn set_state(&mut self, name: &str, is_on: bool) -> bool {
        match self.position(name) {
            Some(index) => {
                self.entries[index].is_on = is_on;
                true
            }
            None => false,
        }
    }

    fn clamp(&mut self) {
        self.selected = self.selected.min(self.entries.len().saturating_sub(1));
    }
}

/// Requests handled by [`RegistryActor`].
pub enum RegistryMessage {
    /// Insert or update; replies with the new snapshot.
    Merge {
        endpoint: Endpoint,
        reply: RpcReplyPort<Vec<Endpoint>>,
    },
    /// Swap in a whole snapshot; replies with it.
    Replace {
        endpoints: Vec<Endpoint>,
        reply: RpcReplyPort<Vec<Endpoint>>,
    },
    All(RpcReplyPort<Vec<Endpoint>>),
    Get {
        name: String,
        reply: RpcReplyPort<Option<Endpoint>>,
    },
    Selected(RpcReplyPort<Option<Endpoint>>),
    /// Advance the cursor; replies with the newly selected endpoint.
    AdvanceSelection(RpcReplyPort<Option<Endpoint>>),
    /// Write the inverse of the selected endpoint's cached state and, on
    /// success, flip the cache. Replies false if nothing is selected or the
    /// write failed.
    ///
    /// The write is awaited inside the actor, so every other message waits
    /// behind it, for up to the CSE request timeout.
    ToggleSelected(RpcReplyPort<bool>),
}

pub struct RegistryActor;

pub struct RegistryState {
    registry: Registry,
    device: Arc<dyn DeviceState>,
}

#[async_trait]
impl Actor for RegistryActor {
    type Msg = RegistryMessage;
    type State = RegistryState;
    type Arguments = Arc<dyn DeviceState>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        device: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(RegistryState {
            registry: Registry::new(),
            device,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let registry = &mut state.registry;
        match message {
            RegistryMessage::Merge { endpoint, reply } => {
                let name = endpoint.name.clone();
                if registry.merge(endpoint) {
                    debug!(device = %name, "Registry added device");
                }
                let _ = reply.send(registry.all());
            }
            RegistryMessage::Replace { endpoints, reply } => {
                registry.replace(endpoints);
                debug!(devices = registry.len(), "Registry replaced");
                let _ = reply.send(registry.all());
            }
            RegistryMessage::All(reply) => {
                let _ = reply.send(registry.all());
            }
            RegistryMessage::Get { name, reply } => {
                let _ = reply.send(registry.get(&name).cloned());
            }
            RegistryMessage::Selected(reply) => {
                let _ = reply.send(registry.selected().cloned());
            }
            RegistryMessage::AdvanceSelection(reply) => {
                registry.advance_selection();
                let _ = reply.send(registry.selected().cloned());
            }
            RegistryMessage::ToggleSelected(reply) => {
                let toggled = match registry.selected().cloned() {
                    Some(endpoint) => {
                        let ok = state.device.write_state(&endpoint, endpoint.is_on).await;
                        if ok {
                            registry.set_state(&endpoint.name, !endpoint.is_on);
                            info!(device = %endpoint.name, is_on = !endpoint.is_on, "Toggled");
                        }
                        ok
                    }
                    None => false,
                };
                let _ = reply.send(toggled);
            }
        }
        Ok(())
    }
}

/// Cloneable handle to a running [`RegistryActor`].
#[derive(Clone, Debug)]
pub struct RegistryHandle {
    actor: ActorRef<RegistryMessage>,
}

impl RegistryHandle {
    /// Spawns an empty registry whose toggles write through `device`.
    pub async fn spawn(device: Arc<dyn DeviceState>) -> Result<(Self, JoinHandle<()>), ZeroError> {
        let (actor, join) = Actor::spawn(None, RegistryActor, device)
            .await
            .map_err(|e| ZeroError::Actor(e.to_string()))?;
        Ok((Self { actor }, join))
    }

    async fn call<T>(&self, msg_builder: impl FnOnce(RpcReplyPort<T>) -> RegistryMessage) -> Result<T, ZeroError>
    where
        T: Send + 'static,
    {
        match self.actor.call(msg_builder, None).await {
            Ok(CallResult::Success(value)) => Ok(value),
            Ok(CallResult::Timeout) => Err(ZeroError::Actor("call timed out".to_string())),
            Ok(CallResult::SenderError) => Err(ZeroError::Actor("reply dropped".to_string())),
            Err(_) => Err(ZeroError::Actor("registry actor is not running".to_string())),
        }
    }

    pub async fn merge(&self, endpoint: Endpoint) -> Result<Vec<Endpoint>, ZeroError> {
        self.call(|reply| RegistryMessage::Merge { endpoint, reply }).await
    }

    pub async fn replace(&self, endpoints: Vec<Endpoint>) -> Result<Vec<Endpoint>, ZeroError> {
        self.call(|reply| RegistryMessage::Replace { endpoints, reply }).await
    }

    pub async fn all(&self) -> Result<Vec<Endpoint>, ZeroError> {
        self.call(RegistryMessage::All).await
    }

    pub async fn get(&self, name: impl Into<String>) -> Result<Option<Endpoint>, ZeroError> {
        let name = name.into();
        self.call(|reply| RegistryMessage::Get { name, reply }).await
    }

    pub async fn selected(&self) -> Result<Option<Endpoint>, ZeroError> {
        self.call(RegistryMessage::Selected).await
    }

    pub async fn advance_selection(&self) -> Result<Option<Endpoint>, ZeroError> {
        self.call(RegistryMessage::AdvanceSelection).await
    }

    pub async fn toggle_selected(&self) -> Result<bool, ZeroError> {
        self.call(RegistryMessage::ToggleSelected).await
    }

    pub fn stop(&self) {
        self.actor.stop(None);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::models::StateRead;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory device states keyed by endpoint name.
    #[derive(Default)]
    pub struct FakeDevices {
        pub states: Mutex<HashMap<String, bool>>,
        pub writes: Mutex<Vec<(String, bool)>>,
        pub reject_writes: bool,
    }

    impl FakeDevices {
        pub fn with(states: &[(&str, bool)]) -> Self {
            Self {
                states: Mutex::new(states.iter().map(|(n, s)| (n.to_string(), *s)).collect()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl DeviceState for FakeDevices {
        async fn read_state(&self, endpoint: &Endpoint) -> StateRead {
            match self.states.lock().unwrap().get(&endpoint.name) {
                Some(state) => StateRead { ok: true, state: *state },
                None => StateRead { ok: false, state: endpoint.is_on },
            }
        }

        async fn write_state(&self, endpoint: &Endpoint, current: bool) -> bool {
            if self.reject_writes {
                return false;
            }
            self.writes.lock().unwrap().push((endpoint.name.clone(), !current));
            self.states.lock().unwrap().insert(endpoint.name.clone(), !current);
            true
        }
    }
}
