//! [`ContainerRuntime`] over the Docker Engine API.

use super::{ContainerRuntime, ContainerSpec, LogStream, RuntimeError};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures_util::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

/// Seconds the engine waits for API responses.
const ENGINE_TIMEOUT_SECS: u64 = 120;

/// Grace period before a stopped container is killed.
const STOP_TIMEOUT_SECS: i64 = 10;

/// Docker Engine client reached through a unix socket.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    socket: String,
}

impl fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DockerRuntime")
            .field("socket", &self.socket)
            .finish()
    }
}

impl DockerRuntime {
    /// Connect to the engine listening on `socket`.
    pub fn connect(socket: &Path) -> Result<Self, RuntimeError> {
        let socket = socket.to_string_lossy().into_owned();
        let docker =
            Docker::connect_with_unix(&socket, ENGINE_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| RuntimeError::Connection(format!("{socket}: {e}")))?;

        Ok(Self { docker, socket })
    }

    /// Pull `image` unless it is already present locally.
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(map_error("inspect image", image, e)),
        }

        let (from_image, tag) = split_image_reference(image);
        info!(image, "pulling image");

        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: from_image.to_string(),
                    tag: tag.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| map_error("pull image", image, e))?;

        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_networks(&self) -> Result<Vec<String>, RuntimeError> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(|e| map_error("list networks", "networks", e))?;

        Ok(networks.into_iter().filter_map(|n| n.name).collect())
    }

    async fn create_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                check_duplicate: true,
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| map_error("create network", name, e))?;

        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.ensure_image(&spec.image).await?;

        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .port_bindings
            .iter()
            .map(|p| (p.container_port.clone(), HashMap::new()))
            .collect();

        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .port_bindings
            .iter()
            .map(|p| {
                (
                    p.container_port.clone(),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(p.host_port.to_string()),
                    }]),
                )
            })
            .collect();

        let host_config = HostConfig {
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            network_mode: spec.network.clone(),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            publish_all_ports: Some(spec.publish_all_ports),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
            env: Some(
                spec.env
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect(),
            ),
            working_dir: spec.working_dir.clone(),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let created = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| map_error("create container", spec.display_name(), e))?;

        for warning in &created.warnings {
            warn!(container = %spec.display_name(), %warning, "engine warning");
        }

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            // The container exists but never ran: nothing else holds its id.
            if let Err(remove_err) = self.remove_container(&created.id).await {
                warn!(id = %created.id, error = %remove_err, "failed to remove unstarted container");
            }
            return Err(map_error("start container", spec.display_name(), e));
        }

        debug!(container = %spec.display_name(), id = %created.id, "container started");
        Ok(created.id)
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: STOP_TIMEOUT_SECS,
                }),
            )
            .await
            .map_err(|e| map_error("stop container", id, e))
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_error("remove container", id, e))
    }

    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        let mut responses =
            Box::pin(self.docker.wait_container(id, None::<WaitContainerOptions<String>>));

        match responses.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Nonzero exits come back as errors; they are still exit codes.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(map_error("wait container", id, e)),
            None => Err(RuntimeError::Engine {
                operation: "wait container",
                message: format!("no exit status reported for {id}"),
            }),
        }
    }

    async fn host_port(
        &self,
        id: &str,
        container_port: &str,
    ) -> Result<Option<u16>, RuntimeError> {
        let details = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error("inspect container", id, e))?;

        let port = details
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|ports| ports.get(container_port).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
            .and_then(|port| port.parse().ok());

        Ok(port)
    }

    fn log_stream(&self, id: &str) -> LogStream {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let container = id.to_string();

        self.docker
            .logs(id, Some(options))
            .map(move |chunk| {
                chunk
                    .map(|output| output.to_string())
                    .map_err(|e| map_error("stream logs", &container, e))
            })
            .boxed()
    }
}

fn map_error(operation: &'static str, target: &str, err: DockerError) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(format!("{target}: {message}")),
        other => RuntimeError::Engine {
            operation,
            message: format!("{target}: {other}"),
        },
    }
}

/// Split `repo[:tag]` into repository and tag, defaulting the tag to `latest`.
///
/// A colon inside the registry part (`host:5000/repo`) is not a tag separator.
fn split_image_reference(image: &str) -> (&str, &str) {
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image.rfind(':') {
        Some(colon) if colon > name_start => (
            image.get(..colon).unwrap_or(image),
            image.get(colon + 1..).unwrap_or("latest"),
        ),
        _ => (image, "latest"),
    }
}
