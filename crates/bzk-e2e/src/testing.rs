//! In-memory [`ContainerRuntime`] for unit tests.
//!
//! [`FakeRuntime`] records every call, keeps track of which containers are
//! still alive, and can be told to fail specific operations.

use crate::runtime::{ContainerRuntime, ContainerSpec, LogStream, RuntimeError};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Host port reported for containers that publish all their ports.
pub const FAKE_PUBLISHED_PORT: u16 = 49153;

/// One call made against the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    ListNetworks,
    CreateNetwork(String),
    Run(ContainerSpec),
    Stop(String),
    Remove(String),
    Wait(String),
    HostPort { id: String, port: String },
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<RuntimeCall>,
    networks: Vec<String>,
    next_id: usize,
    live: BTreeMap<String, ContainerSpec>,
    log_chunks: Vec<String>,
    log_requests: Vec<String>,
    exit_codes: Vec<(String, i64)>,
    failing_runs: Vec<String>,
    failing_removals: Vec<String>,
    wait_failure: Option<String>,
    fail_create_network: bool,
}

/// Recording container runtime.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pretend `name` already exists.
    pub fn add_network(&self, name: &str) {
        self.state().networks.push(name.to_string());
    }

    pub fn fail_create_network(&self) {
        self.state().fail_create_network = true;
    }

    /// Chunks returned by every log stream.
    pub fn set_logs<I, S>(&self, chunks: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().log_chunks = chunks.into_iter().map(Into::into).collect();
    }

    /// Containers whose command line contains `needle` exit with `code`.
    pub fn set_exit_code(&self, needle: &str, code: i64) {
        self.state().exit_codes.push((needle.to_string(), code));
    }

    /// Starting a container whose name or image contains `needle` fails.
    pub fn fail_run(&self, needle: &str) {
        self.state().failing_runs.push(needle.to_string());
    }

    /// Removing a container whose name contains `needle` fails.
    pub fn fail_remove(&self, needle: &str) {
        self.state().failing_removals.push(needle.to_string());
    }

    /// Every wait fails with `reason`.
    pub fn fail_wait(&self, reason: &str) {
        self.state().wait_failure = Some(reason.to_string());
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state().calls.clone()
    }

    /// Specs of every container started, in order.
    pub fn started(&self) -> Vec<ContainerSpec> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                RuntimeCall::Run(spec) => Some(spec.clone()),
                _ => None,
            })
            .collect()
    }

    /// Ids passed to `remove_container`, in order.
    pub fn removed(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                RuntimeCall::Remove(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Display names of containers started and not yet removed.
    pub fn live_containers(&self) -> Vec<String> {
        self.state()
            .live
            .values()
            .map(|spec| spec.display_name().to_string())
            .collect()
    }

    pub fn networks(&self) -> Vec<String> {
        self.state().networks.clone()
    }

    pub fn log_requests(&self) -> Vec<String> {
        self.state().log_requests.clone()
    }
}

fn engine_error(operation: &'static str, message: impl Into<String>) -> RuntimeError {
    RuntimeError::Engine {
        operation,
        message: message.into(),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_networks(&self) -> Result<Vec<String>, RuntimeError> {
        let mut state = self.state();
        state.calls.push(RuntimeCall::ListNetworks);
        Ok(state.networks.clone())
    }

    async fn create_network(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(RuntimeCall::CreateNetwork(name.to_string()));
        if state.fail_create_network {
            return Err(engine_error("create network", "injected failure"));
        }
        state.networks.push(name.to_string());
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut state = self.state();
        state.calls.push(RuntimeCall::Run(spec.clone()));

        let fails = state.failing_runs.iter().any(|needle| {
            spec.image.contains(needle.as_str())
                || spec.name.as_deref().is_some_and(|n| n.contains(needle.as_str()))
        });
        if fails {
            return Err(engine_error("create container", "injected failure"));
        }

        let id = format!("fake-{}", state.next_id);
        state.next_id += 1;
        state.live.insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(RuntimeCall::Stop(id.to_string()));
        if state.live.contains_key(id) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(id.to_string()))
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(RuntimeCall::Remove(id.to_string()));

        let Some(spec) = state.live.get(id) else {
            return Err(RuntimeError::NotFound(id.to_string()));
        };
        let name = spec.display_name().to_string();
        if state
            .failing_removals
            .iter()
            .any(|needle| name.contains(needle.as_str()))
        {
            return Err(engine_error("remove container", "injected failure"));
        }

        state.live.remove(id);
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        let mut state = self.state();
        state.calls.push(RuntimeCall::Wait(id.to_string()));

        if let Some(reason) = &state.wait_failure {
            return Err(engine_error("wait container", reason.clone()));
        }
        let Some(spec) = state.live.get(id) else {
            return Err(RuntimeError::NotFound(id.to_string()));
        };

        let command = spec.cmd.join(" ");
        let code = state
            .exit_codes
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map_or(0, |(_, code)| *code);
        Ok(code)
    }

    async fn host_port(
        &self,
        id: &str,
        container_port: &str,
    ) -> Result<Option<u16>, RuntimeError> {
        let mut state = self.state();
        state.calls.push(RuntimeCall::HostPort {
            id: id.to_string(),
            port: container_port.to_string(),
        });

        match state.live.get(id) {
            Some(spec) if spec.publish_all_ports => Ok(Some(FAKE_PUBLISHED_PORT)),
            Some(spec) => Ok(spec
                .port_bindings
                .iter()
                .find(|p| p.container_port == container_port)
                .map(|p| p.host_port)),
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    fn log_stream(&self, id: &str) -> LogStream {
        let mut state = self.state();
        state.log_requests.push(id.to_string());
        let chunks: Vec<Result<String, RuntimeError>> =
            state.log_chunks.iter().cloned().map(Ok).collect();
        stream::iter(chunks).boxed()
    }
}
