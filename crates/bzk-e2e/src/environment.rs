//! Per-scenario environment: dependency store, server, fixture repositories.
//!
//! An [`Environment`] is created empty, provisioned, used by one scenario,
//! and torn down explicitly. Every resource is recorded as soon as it
//! exists, so a teardown after a failed provisioning removes whatever was
//! created before the failure.

use crate::config::{HarnessConfig, MONGO_IMAGE};
use crate::context::HarnessContext;
use crate::error::{HarnessError, TeardownReport};
use crate::log_relay::spawn_log_relay;
use crate::naming::{RepoIndexAllocator, RunId};
use crate::poller::{wait_for_completion, Completion, DEFAULT_POLL_INTERVAL};
use crate::readiness::{wait_for_reachable, ReadinessError, DEFAULT_PROBE_INTERVAL};
use crate::repository::FixtureRepository;
use crate::runtime::{ContainerRuntime, ContainerSpec};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Port the server API listens on inside its container.
const SERVER_API_PORT: &str = "3000/tcp";

/// Port the server syslog listener uses inside its container.
const SERVER_SYSLOG_PORT: &str = "3001/tcp";

/// MongoDB port inside the store container.
const STORE_PORT: &str = "27017/tcp";

/// A container created by the harness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ContainerRecord {
    pub(crate) name: String,
    pub(crate) id: String,
}

/// Resources of one fixture repository awaiting teardown.
#[derive(Debug)]
struct RepositoryRecord {
    index: usize,
    tree: Option<PathBuf>,
    container: Option<ContainerRecord>,
}

/// An isolated server instance and everything created for it.
pub struct Environment {
    run_id: RunId,
    config: HarnessConfig,
    runtime: Arc<dyn ContainerRuntime>,
    repo_indices: Arc<RepoIndexAllocator>,
    home: PathBuf,
    home_created: bool,
    network: Option<String>,
    store: Option<ContainerRecord>,
    server: Option<ContainerRecord>,
    api: Option<bzk_api::Client>,
    repositories: Vec<RepositoryRecord>,
}

impl Environment {
    /// An environment with a fresh run id and nothing provisioned yet.
    pub fn new(context: &HarnessContext) -> Self {
        let run_id = RunId::next();
        let config = context.config().clone();
        let home = config.temp_dir.join(format!("bzk-home-{run_id}"));

        Self {
            run_id,
            config,
            runtime: Arc::clone(context.runtime()),
            repo_indices: Arc::clone(context.repo_indices()),
            home,
            home_created: false,
            network: None,
            store: None,
            server: None,
            api: None,
            repositories: Vec::new(),
        }
    }

    /// Start the dependency store and the server, and wait until the server
    /// accepts API connections.
    ///
    /// A failure leaves already created resources recorded; call
    /// [`teardown`](Self::teardown) in every case.
    pub async fn provision(&mut self) -> Result<(), HarnessError> {
        if self.home_created || self.store.is_some() || self.server.is_some() {
            return Err(HarnessError::setup(
                format!("environment {}", self.run_id),
                "already provisioned",
            ));
        }

        info!(run_id = %self.run_id, "provisioning environment");

        self.create_home().await?;
        self.network = self.ensure_network().await?;
        let store_address = self.start_store().await?;
        let server_id = self.start_server(&store_address).await?;
        self.wait_for_server().await?;

        spawn_log_relay(&self.runtime, &server_id, "server");

        let api = bzk_api::Client::new(self.config.api_url())
            .map_err(|e| HarnessError::setup("api client", e))?;
        info!(run_id = %self.run_id, api = %api.base_url(), "environment ready");
        self.api = Some(api);

        Ok(())
    }

    async fn create_home(&mut self) -> Result<(), HarnessError> {
        tokio::fs::create_dir_all(&self.home).await.map_err(|e| {
            HarnessError::setup(format!("home directory {}", self.home.display()), e)
        })?;
        self.home_created = true;
        Ok(())
    }

    /// Create the shared network unless it already exists.
    async fn ensure_network(&self) -> Result<Option<String>, HarnessError> {
        let Some(name) = self.config.shared_network() else {
            return Ok(None);
        };

        let existing = self
            .runtime
            .list_networks()
            .await
            .map_err(|e| HarnessError::setup(format!("network {name}"), e))?;

        if existing.iter().any(|n| n == name) {
            info!(network = name, "reusing network");
        } else {
            self.runtime
                .create_network(name)
                .await
                .map_err(|e| HarnessError::setup(format!("network {name}"), e))?;
            info!(network = name, "created network");
        }

        Ok(Some(name.to_string()))
    }

    /// Start the store and return the address the server reaches it at.
    async fn start_store(&mut self) -> Result<String, HarnessError> {
        let name = format!("bzk_e2e_mongo_{}", self.run_id);
        let spec = ContainerSpec::new(MONGO_IMAGE)
            .with_name(&name)
            .on_network(self.network.as_deref())
            .with_publish_all_ports(self.network.is_none());

        let id = self
            .runtime
            .run_container(&spec)
            .await
            .map_err(|e| HarnessError::setup(format!("store container {name}"), e))?;
        self.store = Some(ContainerRecord {
            name: name.clone(),
            id: id.clone(),
        });
        info!(container = %name, "store started");

        if self.network.is_some() {
            return Ok(format!("{name}:27017"));
        }

        match self.runtime.host_port(&id, STORE_PORT).await {
            Ok(Some(port)) => Ok(format!("{}:{port}", self.config.server_host)),
            Ok(None) => Err(HarnessError::setup(
                format!("store container {name}"),
                format!("{STORE_PORT} is not published"),
            )),
            Err(e) => Err(HarnessError::setup(format!("store container {name}"), e)),
        }
    }

    async fn start_server(&mut self, store_address: &str) -> Result<String, HarnessError> {
        let name = format!("bzk_e2e_server_{}", self.run_id);
        let home = self.home.to_string_lossy().into_owned();
        let docker_sock = self.config.docker_sock.to_string_lossy().into_owned();

        let mut spec = ContainerSpec::new(self.config.server_image())
            .with_name(&name)
            .with_bind(&home, "/bazooka")
            .with_bind(&docker_sock, "/var/run/docker.sock")
            .with_env("BZK_HOME", &home)
            .with_env("BZK_DOCKERSOCK", &docker_sock)
            .with_env("BZK_MONGO_ADDR", store_address)
            .with_env("BZK_API_URL", self.config.api_url())
            .with_env("BZK_SYSLOG_URL", self.config.syslog_url())
            .with_port_binding(SERVER_API_PORT, self.config.api_port)
            .with_port_binding(SERVER_SYSLOG_PORT, self.config.syslog_port)
            .on_network(self.network.as_deref());

        if let Some(network) = &self.network {
            spec = spec.with_env("BZK_NETWORK", network);
        }
        if let Some(key_file) = &self.config.scm_key_file {
            spec = spec.with_env("BZK_SCM_KEYFILE", key_file.to_string_lossy());
        }

        let id = self
            .runtime
            .run_container(&spec)
            .await
            .map_err(|e| HarnessError::setup(format!("server container {name}"), e))?;
        self.server = Some(ContainerRecord {
            name: name.clone(),
            id: id.clone(),
        });
        info!(container = %name, image = %spec.image, "server started");

        Ok(id)
    }

    async fn wait_for_server(&self) -> Result<(), HarnessError> {
        wait_for_reachable(
            &self.config.api_address(),
            DEFAULT_PROBE_INTERVAL,
            self.config.readiness_timeout,
        )
        .await
        .map_err(|e| match e {
            ReadinessError::Timeout {
                address,
                elapsed,
                timeout,
            } => HarnessError::ReadinessTimeout {
                address,
                elapsed,
                timeout,
            },
        })
    }

    /// Remove every recorded resource.
    ///
    /// Each step runs once even when earlier ones fail; failures end up in
    /// the report. Resources are forgotten as they are attempted, so calling
    /// this again does nothing.
    pub async fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();

        if let Some(server) = self.server.take() {
            let result = remove_container(self.runtime.as_ref(), &server.id).await;
            report.record(format!("server container {}", server.name), result);
        }

        if let Some(store) = self.store.take() {
            let result = remove_container(self.runtime.as_ref(), &store.id).await;
            report.record(format!("store container {}", store.name), result);
        }

        if std::mem::take(&mut self.home_created) {
            let result = remove_dir(&self.home).await;
            report.record(format!("home directory {}", self.home.display()), result);
        }

        for repository in std::mem::take(&mut self.repositories) {
            if let Some(tree) = repository.tree {
                let result = remove_dir(&tree).await;
                report.record(
                    format!(
                        "working tree {} of repository {}",
                        tree.display(),
                        repository.index
                    ),
                    result,
                );
            }
            if let Some(container) = repository.container {
                let result = remove_container(self.runtime.as_ref(), &container.id).await;
                report.record(format!("git server container {}", container.name), result);
            }
        }

        self.api = None;
        info!(run_id = %self.run_id, %report, "environment torn down");
        report
    }

    /// Create a fixture repository owned by this environment.
    pub async fn create_repository(&mut self) -> Result<FixtureRepository, HarnessError> {
        FixtureRepository::create(self).await
    }

    /// Wait for a job of this environment's server to finish.
    pub async fn wait_for_job(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<Completion, HarnessError> {
        let api = self.api()?;
        wait_for_completion(api, job_id, timeout, DEFAULT_POLL_INTERVAL)
            .await
            .into_result()
    }

    /// Client for the server API. Fails until provisioning completed.
    pub fn api(&self) -> Result<&bzk_api::Client, HarnessError> {
        self.api.as_ref().ok_or_else(|| {
            HarnessError::setup(
                format!("environment {}", self.run_id),
                "server is not provisioned",
            )
        })
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Server home directory on the host.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Shared network the containers are attached to, if any.
    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    pub(crate) fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub(crate) fn allocate_repo_index(&self) -> usize {
        self.repo_indices.allocate()
    }

    pub(crate) fn record_repository_tree(&mut self, index: usize, tree: PathBuf) {
        match self.repositories.iter_mut().find(|r| r.index == index) {
            Some(record) => record.tree = Some(tree),
            None => self.repositories.push(RepositoryRecord {
                index,
                tree: Some(tree),
                container: None,
            }),
        }
    }

    pub(crate) fn record_repository_container(&mut self, index: usize, container: ContainerRecord) {
        match self.repositories.iter_mut().find(|r| r.index == index) {
            Some(record) => record.container = Some(container),
            None => self.repositories.push(RepositoryRecord {
                index,
                tree: None,
                container: Some(container),
            }),
        }
    }

    /// Human readable list of resources still awaiting teardown.
    fn pending_resources(&self) -> Vec<String> {
        let mut pending = Vec::new();
        if let Some(server) = &self.server {
            pending.push(server.name.clone());
        }
        if let Some(store) = &self.store {
            pending.push(store.name.clone());
        }
        if self.home_created {
            pending.push(self.home.display().to_string());
        }
        for repository in &self.repositories {
            if let Some(tree) = &repository.tree {
                pending.push(tree.display().to_string());
            }
            if let Some(container) = &repository.container {
                pending.push(container.name.clone());
            }
        }
        pending
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("run_id", &self.run_id)
            .field("home", &self.home)
            .field("network", &self.network)
            .field("store", &self.store)
            .field("server", &self.server)
            .field("repositories", &self.repositories)
            .finish_non_exhaustive()
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let pending = self.pending_resources();
        if !pending.is_empty() {
            warn!(
                run_id = %self.run_id,
                ?pending,
                "environment dropped without teardown, resources leaked"
            );
        }
    }
}

/// Remove a container; one that is already gone counts as removed.
pub(crate) async fn remove_container(
    runtime: &dyn ContainerRuntime,
    id: &str,
) -> Result<(), String> {
    match runtime.remove_container(id).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

async fn remove_dir(path: &Path) -> Result<(), String> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::testing::{FakeRuntime, RuntimeCall, FAKE_PUBLISHED_PORT};
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    struct Fixture {
        fake: Arc<FakeRuntime>,
        context: HarnessContext,
        _temp: TempDir,
        _listener: Option<TcpListener>,
    }

    /// A context whose server "API" is a local listener, so readiness
    /// succeeds without a real server.
    async fn fixture(extra: &[(&str, &str)], listening: bool) -> Fixture {
        let temp = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let api_port = listener.local_addr().unwrap().port();
        let syslog_port = if api_port == u16::MAX { api_port - 1 } else { api_port + 1 };

        let mut vars = HashMap::from([
            (
                "BZK_E2E_TEMP".to_string(),
                temp.path().to_string_lossy().into_owned(),
            ),
            ("BZK_E2E_HOST".to_string(), "127.0.0.1".to_string()),
            ("BZK_E2E_API_PORT".to_string(), api_port.to_string()),
            ("BZK_E2E_SYSLOG_PORT".to_string(), syslog_port.to_string()),
        ]);
        for (key, value) in extra {
            vars.insert((*key).to_string(), (*value).to_string());
        }
        let config = HarnessConfig::from_vars(&vars).unwrap();

        let fake = Arc::new(FakeRuntime::new());
        let runtime: Arc<dyn ContainerRuntime> = fake.clone();

        Fixture {
            fake,
            context: HarnessContext::new(config, runtime),
            _temp: temp,
            _listener: listening.then_some(listener),
        }
    }

    #[tokio::test]
    async fn test_provision_wires_store_and_server() {
        let f = fixture(&[("BZK_E2E_TAG", "0.4")], true).await;
        let mut env = Environment::new(&f.context);

        env.provision().await.expect("provisioning should succeed");

        assert!(env.home().is_dir());
        assert_eq!(env.network(), Some("bzk_e2e"));
        assert!(f.fake.networks().contains(&"bzk_e2e".to_string()));

        let started = f.fake.started();
        assert_eq!(started.len(), 2);
        let store = &started[0];
        let server = &started[1];
        let run_id = env.run_id();

        assert_eq!(store.image, "mongo:3.0.2");
        assert_eq!(store.name.as_deref(), Some(format!("bzk_e2e_mongo_{run_id}").as_str()));
        assert_eq!(store.network.as_deref(), Some("bzk_e2e"));
        assert!(!store.publish_all_ports);

        assert_eq!(server.image, "bazooka/server:0.4");
        assert_eq!(server.name.as_deref(), Some(format!("bzk_e2e_server_{run_id}").as_str()));
        let home = env.home().to_string_lossy().into_owned();
        assert_eq!(
            server.binds,
            vec![
                format!("{home}:/bazooka"),
                "/var/run/docker.sock:/var/run/docker.sock".to_string(),
            ]
        );
        assert_eq!(server.env.get("BZK_HOME"), Some(&home));
        assert_eq!(
            server.env.get("BZK_MONGO_ADDR").map(String::as_str),
            Some(format!("bzk_e2e_mongo_{run_id}:27017").as_str())
        );
        assert_eq!(
            server.env.get("BZK_NETWORK").map(String::as_str),
            Some("bzk_e2e")
        );
        assert!(server.env.contains_key("BZK_SYSLOG_URL"));
        assert!(!server.env.contains_key("BZK_SCM_KEYFILE"));
        assert_eq!(server.port_bindings.len(), 2);

        let api = env.api().unwrap();
        assert_eq!(api.base_url(), f.context.config().api_url());

        env.teardown().await;
    }

    #[tokio::test]
    async fn test_existing_network_is_reused() {
        let f = fixture(&[], true).await;
        f.fake.add_network("bzk_e2e");
        let mut env = Environment::new(&f.context);

        env.provision().await.unwrap();

        assert!(!f
            .fake
            .calls()
            .iter()
            .any(|call| matches!(call, RuntimeCall::CreateNetwork(_))));
        env.teardown().await;
    }

    #[tokio::test]
    async fn test_published_ports_mode_skips_network() {
        let f = fixture(
            &[
                ("BZK_E2E_ADDRESSING", "ports"),
                ("BZK_E2E_SCM_KEYFILE", "/keys/id_rsa"),
            ],
            true,
        )
        .await;
        let mut env = Environment::new(&f.context);

        env.provision().await.unwrap();

        assert_eq!(env.network(), None);
        assert!(!f.fake.calls().iter().any(|call| matches!(
            call,
            RuntimeCall::ListNetworks | RuntimeCall::CreateNetwork(_)
        )));

        let started = f.fake.started();
        assert!(started[0].publish_all_ports);
        assert_eq!(started[0].network, None);
        let server = &started[1];
        assert_eq!(
            server.env.get("BZK_MONGO_ADDR").map(String::as_str),
            Some(format!("127.0.0.1:{FAKE_PUBLISHED_PORT}").as_str())
        );
        assert!(!server.env.contains_key("BZK_NETWORK"));
        assert_eq!(
            server.env.get("BZK_SCM_KEYFILE").map(String::as_str),
            Some("/keys/id_rsa")
        );

        env.teardown().await;
    }

    #[tokio::test]
    async fn test_server_logs_are_relayed() {
        let f = fixture(&[], true).await;
        let mut env = Environment::new(&f.context);

        env.provision().await.unwrap();

        let server_id = env.server.as_ref().map(|s| s.id.clone()).unwrap();
        assert_eq!(f.fake.log_requests(), vec![server_id]);
        env.teardown().await;
    }

    #[tokio::test]
    async fn test_store_failure_leaves_home_for_teardown() {
        let f = fixture(&[], true).await;
        f.fake.fail_run("mongo");
        let mut env = Environment::new(&f.context);

        let err = env.provision().await.unwrap_err();
        match &err {
            HarnessError::Setup { resource, .. } => assert!(resource.contains("bzk_e2e_mongo_")),
            other => panic!("unexpected error: {other:?}"),
        }
        // Nothing is cleaned up until teardown.
        assert!(env.home().is_dir());

        let report = env.teardown().await;
        assert!(report.is_clean());
        assert_eq!(report.attempted, 1);
        assert!(!env.home().exists());
        assert!(f.fake.live_containers().is_empty());
    }

    #[tokio::test]
    async fn test_network_failure_starts_no_containers() {
        let f = fixture(&[], true).await;
        f.fake.fail_create_network();
        let mut env = Environment::new(&f.context);

        let err = env.provision().await.unwrap_err();
        match &err {
            HarnessError::Setup { resource, .. } => assert_eq!(resource, "network bzk_e2e"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(f.fake.started().is_empty());
        assert_eq!(env.network(), None);
        assert!(env.home().is_dir());

        let report = env.teardown().await;
        assert!(report.is_clean());
        assert_eq!(report.attempted, 1);
        assert!(!env.home().exists());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_readiness_timeout() {
        let f = fixture(&[("BZK_E2E_READY_TIMEOUT_SECS", "1")], false).await;
        let mut env = Environment::new(&f.context);

        let err = env.provision().await.unwrap_err();
        match err {
            HarnessError::ReadinessTimeout {
                address, timeout, ..
            } => {
                assert_eq!(address, f.context.config().api_address());
                assert_eq!(timeout, Duration::from_secs(1));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(env.api().is_err());

        assert_eq!(f.fake.live_containers().len(), 2);
        let report = env.teardown().await;
        assert!(report.is_clean());
        assert!(f.fake.live_containers().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let f = fixture(&[], true).await;
        let mut env = Environment::new(&f.context);
        env.provision().await.unwrap();
        let repo = env.create_repository().await.unwrap();

        let first = env.teardown().await;
        assert!(first.is_clean());
        assert_eq!(first.attempted, 5);
        assert!(!repo.tree().exists());
        assert!(f.fake.live_containers().is_empty());
        let removals = f.fake.removed().len();

        let second = env.teardown().await;
        assert_eq!(second.attempted, 0);
        assert_eq!(f.fake.removed().len(), removals);
        assert!(env.api().is_err());
    }

    #[tokio::test]
    async fn test_teardown_continues_after_failures() {
        let f = fixture(&[], true).await;
        f.fake.fail_remove("bzk_e2e_server_");
        let mut env = Environment::new(&f.context);
        env.provision().await.unwrap();

        let report = env.teardown().await;

        assert_eq!(report.attempted, 3);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].resource.contains("bzk_e2e_server_"));
        // Store and home were still removed.
        assert_eq!(f.fake.live_containers().len(), 1);
        assert!(!env.home().exists());
    }

    #[tokio::test]
    async fn test_already_removed_containers_are_not_failures() {
        let f = fixture(&[], true).await;
        let mut env = Environment::new(&f.context);
        env.provision().await.unwrap();

        let store_id = env.store.as_ref().map(|s| s.id.clone()).unwrap();
        f.context.runtime().remove_container(&store_id).await.unwrap();

        let report = env.teardown().await;
        assert!(report.is_clean());
        assert_eq!(report.attempted, 3);
    }

    #[tokio::test]
    async fn test_provision_twice_is_rejected() {
        let f = fixture(&[], true).await;
        let mut env = Environment::new(&f.context);
        env.provision().await.unwrap();

        let err = env.provision().await.unwrap_err();
        assert!(matches!(err, HarnessError::Setup { .. }));
        assert_eq!(f.fake.started().len(), 2);

        env.teardown().await;
    }

    #[tokio::test]
    async fn test_wait_for_job_requires_provisioning() {
        let f = fixture(&[], true).await;
        let env = Environment::new(&f.context);

        let err = env
            .wait_for_job("j-1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Setup { .. }));
    }
}
