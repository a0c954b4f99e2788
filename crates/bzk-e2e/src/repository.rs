//! Fixture git repositories served to the server under test.
//!
//! A [`FixtureRepository`] is a working tree on the host, bind-mounted into
//! a `git://` server container. Git commands run in short-lived containers
//! of the same image against the same tree, so the host needs no git.

use crate::config::GIT_IMAGE;
use crate::environment::{remove_container, ContainerRecord, Environment};
use crate::error::{CommandFailure, HarnessError};
use crate::log_relay::{relay, spawn_log_relay};
use crate::runtime::{ContainerRuntime, ContainerSpec};
use serde::Serialize;
use std::error::Error as StdError;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Mount point of the working tree inside git containers.
const REPO_MOUNT: &str = "/repo";

/// Port the git daemon listens on.
const GIT_DAEMON_PORT: &str = "9418/tcp";

/// How long a finished command gets to flush its output before removal.
const RELAY_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A git repository fixture.
pub struct FixtureRepository {
    index: usize,
    tree: PathBuf,
    container_name: String,
    clone_endpoint: String,
    runtime: Arc<dyn ContainerRuntime>,
}

impl std::fmt::Debug for FixtureRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixtureRepository")
            .field("index", &self.index)
            .field("tree", &self.tree)
            .field("container_name", &self.container_name)
            .field("clone_endpoint", &self.clone_endpoint)
            .finish_non_exhaustive()
    }
}

impl FixtureRepository {
    /// Create an empty repository and start its git server.
    ///
    /// The working tree and the server container are recorded in `env` as
    /// soon as they exist, and removed by its teardown.
    pub async fn create(env: &mut Environment) -> Result<Self, HarnessError> {
        let index = env.allocate_repo_index();
        let run_id = env.run_id();
        let runtime = Arc::clone(env.runtime());
        let config = env.config().clone();

        let tree = config
            .temp_dir
            .join(format!("bzk-repo-{run_id}-{index}"));
        let container_name = format!("bzk_repo_e2e_{index}_{run_id}");

        match tokio::fs::remove_dir_all(&tree).await {
            Ok(()) => debug!(tree = %tree.display(), "cleared stale working tree"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(HarnessError::setup(
                    format!("working tree {}", tree.display()),
                    e,
                ))
            }
        }
        tokio::fs::create_dir_all(&tree)
            .await
            .map_err(|e| HarnessError::setup(format!("working tree {}", tree.display()), e))?;
        env.record_repository_tree(index, tree.clone());

        run_command(runtime.as_ref(), &tree, "git-init", &["git", "init"]).await?;

        // Without a shared network the daemon is only reachable through a
        // published host port.
        let network = env.network().map(str::to_string);
        let spec = ContainerSpec::new(GIT_IMAGE)
            .with_name(&container_name)
            .with_bind(tree.to_string_lossy(), REPO_MOUNT)
            .on_network(network.as_deref())
            .with_publish_all_ports(network.is_none());

        let id = runtime.run_container(&spec).await.map_err(|e| {
            HarnessError::setup(format!("git server container {container_name}"), e)
        })?;
        env.record_repository_container(
            index,
            ContainerRecord {
                name: container_name.clone(),
                id: id.clone(),
            },
        );
        spawn_log_relay(&runtime, &id, "git-srv");

        let clone_endpoint = if network.is_some() {
            format!("git://{container_name}:9418/")
        } else {
            match runtime.host_port(&id, GIT_DAEMON_PORT).await {
                Ok(Some(port)) => format!("git://{}:{port}/", config.server_host),
                Ok(None) => {
                    return Err(HarnessError::setup(
                        format!("git server container {container_name}"),
                        format!("{GIT_DAEMON_PORT} is not published"),
                    ))
                }
                Err(e) => {
                    return Err(HarnessError::setup(
                        format!("git server container {container_name}"),
                        e,
                    ))
                }
            }
        };

        info!(index, tree = %tree.display(), %clone_endpoint, "fixture repository ready");

        Ok(Self {
            index,
            tree,
            container_name,
            clone_endpoint,
            runtime,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Working tree on the host.
    pub fn tree(&self) -> &Path {
        &self.tree
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// URL the server clones this repository from.
    pub fn clone_endpoint(&self) -> &str {
        &self.clone_endpoint
    }

    /// Copy `src` into the working tree at `dst` (relative to the tree root).
    pub async fn import_file(&self, src: &Path, dst: &Path) -> Result<(), HarnessError> {
        let target = self.tree.join(dst);
        copy_file(src, &target).await?;
        flush_host_buffers().await;
        debug!(src = %src.display(), dst = %target.display(), "imported file");
        Ok(())
    }

    /// Mirror the contents of `src` into the working tree root.
    pub async fn import_dir(&self, src: &Path) -> Result<(), HarnessError> {
        let mut files = 0usize;

        for entry in WalkDir::new(src).min_depth(1) {
            let entry = entry.map_err(|e| HarnessError::fixture(src, e))?;
            let relative = entry
                .path()
                .strip_prefix(src)
                .map_err(|e| HarnessError::fixture(entry.path(), e))?;
            let target = self.tree.join(relative);

            if entry.file_type().is_dir() {
                tokio::fs::create_dir_all(&target)
                    .await
                    .map_err(|e| HarnessError::fixture(&target, e))?;
            } else {
                copy_file(entry.path(), &target).await?;
                files += 1;
            }
        }

        flush_host_buffers().await;
        info!(src = %src.display(), files, "imported directory");
        Ok(())
    }

    /// Render `file` (relative to the tree root) as a template in place.
    ///
    /// Undefined variables are errors.
    pub async fn render<M: Serialize>(&self, file: &Path, model: &M) -> Result<(), HarnessError> {
        let path = self.tree.join(file);

        let template = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| HarnessError::fixture(&path, e))?;
        let context = tera::Context::from_serialize(model)
            .map_err(|e| HarnessError::fixture(&path, error_chain(&e)))?;
        let rendered = tera::Tera::one_off(&template, &context, false)
            .map_err(|e| HarnessError::fixture(&path, error_chain(&e)))?;

        tokio::fs::write(&path, rendered)
            .await
            .map_err(|e| HarnessError::fixture(&path, e))?;
        debug!(file = %path.display(), "rendered template");
        Ok(())
    }

    /// Stage every change in the working tree.
    pub async fn add_all(&self) -> Result<(), HarnessError> {
        self.exec("git-add", &["git", "add", "-A"]).await
    }

    pub async fn commit(&self, message: &str) -> Result<(), HarnessError> {
        self.exec("git-commit", &["git", "commit", "-m", message]).await
    }

    /// Run `command` in a one-shot git container with the tree at `/repo`.
    pub async fn exec(&self, prefix: &str, command: &[&str]) -> Result<(), HarnessError> {
        run_command(self.runtime.as_ref(), &self.tree, prefix, command).await
    }
}

/// Run `command` in a throwaway container and wait for it.
///
/// The container is removed whatever the outcome. A nonzero exit code is an
/// error.
async fn run_command(
    runtime: &dyn ContainerRuntime,
    tree: &Path,
    prefix: &str,
    command: &[&str],
) -> Result<(), HarnessError> {
    let command_line: Vec<String> = command.iter().map(|s| (*s).to_string()).collect();
    let failed = |failure| HarnessError::CommandExecution {
        command: command_line.clone(),
        failure,
    };

    info!(prefix, command = %command_line.join(" "), "running command");

    let spec = ContainerSpec::new(GIT_IMAGE)
        .with_cmd(command.iter().copied())
        .with_bind(tree.to_string_lossy(), REPO_MOUNT)
        .with_working_dir(REPO_MOUNT);

    let id = runtime
        .run_container(&spec)
        .await
        .map_err(|e| failed(CommandFailure::Start(e.to_string())))?;

    let output = tokio::spawn(relay(runtime.log_stream(&id), prefix.to_string()));
    let exit = runtime.wait_container(&id).await;

    if tokio::time::timeout(RELAY_DRAIN_TIMEOUT, output).await.is_err() {
        debug!(prefix, "command output still streaming, removing container anyway");
    }
    if let Err(reason) = remove_container(runtime, &id).await {
        warn!(prefix, id = %id, %reason, "failed to remove command container");
    }

    match exit {
        Ok(0) => Ok(()),
        Ok(code) => Err(failed(CommandFailure::ExitCode(code))),
        Err(e) => Err(failed(CommandFailure::Wait(e.to_string()))),
    }
}

/// Copy a file, creating parent directories, and flush it to disk.
async fn copy_file(src: &Path, dst: &Path) -> Result<(), HarnessError> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| HarnessError::fixture(parent, e))?;
    }

    tokio::fs::copy(src, dst)
        .await
        .map_err(|e| HarnessError::fixture(src, e))?;

    let file = tokio::fs::File::open(dst)
        .await
        .map_err(|e| HarnessError::fixture(dst, e))?;
    file.sync_all()
        .await
        .map_err(|e| HarnessError::fixture(dst, e))?;

    Ok(())
}

/// Ask the host to flush its write buffers so bind mounts see new files.
async fn flush_host_buffers() {
    match tokio::process::Command::new("sync").status().await {
        Ok(status) if status.success() => {}
        Ok(status) => debug!(%status, "sync exited unsuccessfully"),
        Err(e) => debug!(error = %e, "sync unavailable"),
    }
}

/// Tera buries the useful part of its errors in the source chain.
fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
