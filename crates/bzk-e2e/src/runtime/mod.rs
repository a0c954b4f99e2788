//! Container runtime gateway.
//!
//! The harness only needs a small capability set from the container engine:
//! networks, detached and one-shot containers, their logs, exit codes and
//! published ports. [`ContainerRuntime`] is that capability set;
//! [`DockerRuntime`] implements it over the Docker Engine API.

mod docker;

pub use docker::DockerRuntime;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::BTreeMap;
use thiserror::Error;

/// Container runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The container, network or image does not exist (or no longer does).
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Container engine error during {operation}: {message}")]
    Engine {
        operation: &'static str,
        message: String,
    },

    #[error("Failed to connect to the container engine: {0}")]
    Connection(String),
}

impl RuntimeError {
    /// Whether the error only says the target is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Stream of log output chunks. Chunks are not aligned on line boundaries.
pub type LogStream = BoxStream<'static, Result<String, RuntimeError>>;

/// A host port binding for a container port such as `3000/tcp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: String,
    pub host_port: u16,
}

/// Everything needed to create and start a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: Option<String>,
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// `host_path:container_path` bind mounts.
    pub binds: Vec<String>,
    pub network: Option<String>,
    pub working_dir: Option<String>,
    pub port_bindings: Vec<PortMapping>,
    /// Publish every exposed port on a random host port.
    pub publish_all_ports: bool,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_bind(mut self, host_path: impl AsRef<str>, container_path: &str) -> Self {
        self.binds
            .push(format!("{}:{}", host_path.as_ref(), container_path));
        self
    }

    /// Attach to `network`; `None` leaves the engine default.
    pub fn on_network(mut self, network: Option<&str>) -> Self {
        self.network = network.map(str::to_string);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_port_binding(mut self, container_port: impl Into<String>, host_port: u16) -> Self {
        self.port_bindings.push(PortMapping {
            container_port: container_port.into(),
            host_port,
        });
        self
    }

    pub fn with_publish_all_ports(mut self, publish: bool) -> Self {
        self.publish_all_ports = publish;
        self
    }

    /// Name for log messages: the container name, or the image.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.image)
    }
}

/// Capability set the harness needs from a container engine.
///
/// Implementations make exactly one engine call per operation and never
/// retry; the harness decides on retries.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Names of all existing networks.
    async fn list_networks(&self) -> Result<Vec<String>, RuntimeError>;

    async fn create_network(&self, name: &str) -> Result<(), RuntimeError>;

    /// Create and start a container, returning its id.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Force-remove a container together with its anonymous volumes.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Block until the container exits and return its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError>;

    /// Host port that `container_port` (e.g. `9418/tcp`) is published on.
    async fn host_port(&self, id: &str, container_port: &str)
        -> Result<Option<u16>, RuntimeError>;

    /// Follow the container's stdout and stderr. The stream ends when the
    /// container stops or is removed.
    fn log_stream(&self, id: &str) -> LogStream;
}
