//! Harness configuration.
//!
//! Configuration is loaded from `BZK_E2E_*` environment variables once, at
//! harness startup. Missing required variables are reported immediately
//! rather than at first use.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Default container engine socket.
pub const DEFAULT_DOCKER_SOCK: &str = "/var/run/docker.sock";

/// Default tag of the server image under test.
pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// Default name of the network shared by every harness container.
pub const DEFAULT_NETWORK_NAME: &str = "bzk_e2e";

/// Default time the server gets to accept API connections.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(20);

/// Dependency store image.
pub const MONGO_IMAGE: &str = "mongo:3.0.2";

/// Git server image, also used for one-shot git commands.
pub const GIT_IMAGE: &str = "bazooka/e2e-git";

/// How containers started by the harness address each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// All containers join one named network and address each other by
    /// container name.
    SharedNetwork,
    /// Containers publish their ports on the host and are addressed through
    /// the resolved host port.
    PublishedPorts,
}

impl Addressing {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "network" => Some(Addressing::SharedNetwork),
            "ports" => Some(Addressing::PublishedPorts),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
}

/// Harness configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Root under which every home directory and working tree is created.
    pub temp_dir: PathBuf,

    /// Container engine socket, bind-mounted into the server container.
    pub docker_sock: PathBuf,

    /// Host name or IP of the machine running the tests, reachable from the
    /// server and from the build containers it spawns.
    pub server_host: String,

    /// Host port the server API is bound to.
    pub api_port: u16,

    /// Host port the server syslog listener is bound to.
    pub syslog_port: u16,

    /// Tag of the `bazooka/server` image.
    pub image_tag: String,

    /// Name of the shared network.
    pub network_name: String,

    pub addressing: Addressing,

    /// Key file handed to the server for private repositories.
    pub scm_key_file: Option<PathBuf>,

    pub readiness_timeout: Duration,
}

impl HarnessConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let temp_dir = PathBuf::from(required(vars, "BZK_E2E_TEMP")?);

        let docker_sock = match non_empty(vars, "BZK_E2E_DOCKER_SOCK") {
            Some(sock) => PathBuf::from(sock),
            None => {
                info!(
                    default = DEFAULT_DOCKER_SOCK,
                    "BZK_E2E_DOCKER_SOCK is not set, using the default socket"
                );
                PathBuf::from(DEFAULT_DOCKER_SOCK)
            }
        };

        let server_host = required(vars, "BZK_E2E_HOST")?.to_string();
        let api_port = parse_port(vars, "BZK_E2E_API_PORT")?;
        let syslog_port = parse_port(vars, "BZK_E2E_SYSLOG_PORT")?;

        if api_port == syslog_port {
            return Err(ConfigError::InvalidValue {
                var: "BZK_E2E_SYSLOG_PORT".to_string(),
                reason: format!("must differ from BZK_E2E_API_PORT ({api_port})"),
            });
        }

        let image_tag = non_empty(vars, "BZK_E2E_TAG")
            .unwrap_or(DEFAULT_IMAGE_TAG)
            .to_string();

        let network_name = non_empty(vars, "BZK_E2E_NETWORK")
            .unwrap_or(DEFAULT_NETWORK_NAME)
            .to_string();

        let addressing = match non_empty(vars, "BZK_E2E_ADDRESSING") {
            Some(value) => Addressing::parse(value).ok_or_else(|| ConfigError::InvalidValue {
                var: "BZK_E2E_ADDRESSING".to_string(),
                reason: format!("expected 'network' or 'ports', got '{value}'"),
            })?,
            None => Addressing::SharedNetwork,
        };

        let scm_key_file = non_empty(vars, "BZK_E2E_SCM_KEYFILE").map(PathBuf::from);

        let readiness_timeout = match non_empty(vars, "BZK_E2E_READY_TIMEOUT_SECS") {
            Some(value) => {
                let secs: u64 = value.parse().map_err(|e| ConfigError::InvalidValue {
                    var: "BZK_E2E_READY_TIMEOUT_SECS".to_string(),
                    reason: format!("must be a positive integer, got '{value}': {e}"),
                })?;
                if secs == 0 {
                    return Err(ConfigError::InvalidValue {
                        var: "BZK_E2E_READY_TIMEOUT_SECS".to_string(),
                        reason: "must be greater than 0".to_string(),
                    });
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_READINESS_TIMEOUT,
        };

        Ok(Self {
            temp_dir,
            docker_sock,
            server_host,
            api_port,
            syslog_port,
            image_tag,
            network_name,
            addressing,
            scm_key_file,
            readiness_timeout,
        })
    }

    /// The server image reference, `bazooka/server:<tag>`.
    pub fn server_image(&self) -> String {
        format!("bazooka/server:{}", self.image_tag)
    }

    /// Address the readiness probe and the API client connect to.
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.server_host, self.api_port)
    }

    /// Base URL of the server API as seen from the host.
    pub fn api_url(&self) -> String {
        format!("http://{}", self.api_address())
    }

    /// Syslog URL the server forwards build logs to.
    pub fn syslog_url(&self) -> String {
        format!("tcp://{}:{}", self.server_host, self.syslog_port)
    }

    /// The shared network name, when containers are attached to one.
    pub fn shared_network(&self) -> Option<&str> {
        match self.addressing {
            Addressing::SharedNetwork => Some(&self.network_name),
            Addressing::PublishedPorts => None,
        }
    }
}

fn non_empty<'a>(vars: &'a HashMap<String, String>, var: &str) -> Option<&'a str> {
    vars.get(var).map(String::as_str).filter(|v| !v.is_empty())
}

fn required<'a>(vars: &'a HashMap<String, String>, var: &str) -> Result<&'a str, ConfigError> {
    non_empty(vars, var).ok_or_else(|| ConfigError::MissingEnvVar(var.to_string()))
}

fn parse_port(vars: &HashMap<String, String>, var: &str) -> Result<u16, ConfigError> {
    let value = required(vars, var)?;
    let port: u16 = value.parse().map_err(|e| ConfigError::InvalidValue {
        var: var.to_string(),
        reason: format!("must be a valid port number, got '{value}': {e}"),
    })?;

    if port == 0 {
        return Err(ConfigError::InvalidValue {
            var: var.to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }

    Ok(port)
}
