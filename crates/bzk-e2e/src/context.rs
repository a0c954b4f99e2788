//! Process-wide harness state.

use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::naming::RepoIndexAllocator;
use crate::runtime::{ContainerRuntime, DockerRuntime};
use std::sync::{Arc, OnceLock};
use tracing::info;

/// Allocator shared by every context loaded from the environment, so
/// repository indices are unique across the whole test process.
static SHARED_REPO_INDICES: OnceLock<Arc<RepoIndexAllocator>> = OnceLock::new();

/// Everything environments share within one test process: the validated
/// configuration, the container runtime and the repository index allocator.
#[derive(Clone)]
pub struct HarnessContext {
    config: HarnessConfig,
    runtime: Arc<dyn ContainerRuntime>,
    repo_indices: Arc<RepoIndexAllocator>,
}

impl std::fmt::Debug for HarnessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessContext")
            .field("config", &self.config)
            .field("repo_indices", &self.repo_indices)
            .finish_non_exhaustive()
    }
}

impl HarnessContext {
    /// A context with its own repository index allocator.
    pub fn new(config: HarnessConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            config,
            runtime,
            repo_indices: Arc::new(RepoIndexAllocator::new()),
        }
    }

    /// Load `BZK_E2E_*` configuration and connect to the Docker engine.
    pub fn from_env() -> Result<Self, HarnessError> {
        let config =
            HarnessConfig::from_env().map_err(|e| HarnessError::setup("configuration", e))?;
        let runtime = DockerRuntime::connect(&config.docker_sock)
            .map_err(|e| HarnessError::setup("container engine", e))?;

        info!(
            docker_sock = %config.docker_sock.display(),
            host = %config.server_host,
            addressing = ?config.addressing,
            "harness context ready"
        );

        Ok(Self {
            config,
            runtime: Arc::new(runtime),
            repo_indices: Arc::clone(SHARED_REPO_INDICES.get_or_init(Default::default)),
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub(crate) fn repo_indices(&self) -> &Arc<RepoIndexAllocator> {
        &self.repo_indices
    }
}
