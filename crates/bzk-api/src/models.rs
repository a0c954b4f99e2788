//! Request and response types of the Bazooka API.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of a job or of one of its variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Errored,
    /// A status this client does not know about.
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    /// Whether no further transition can happen from this status.
    ///
    /// Anything other than pending or running counts as terminal, including
    /// statuses unknown to this client.
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

/// A project as returned by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub scm_type: String,
    pub scm_uri: String,
}

/// A job as returned by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(default)]
    pub project_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub number: u32,
}

/// One variant of a job's build matrix.
#[derive(Debug, Clone, Deserialize)]
pub struct Variant {
    pub id: String,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub number: u32,
    pub status: JobStatus,
}

/// Project configuration: a flat key/value map.
pub type ProjectConfig = HashMap<String, String>;

/// Request body for `POST /project`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateProjectRequest<'a> {
    pub name: &'a str,
    pub scm_type: &'a str,
    pub scm_uri: &'a str,
}

/// Request body for `POST /project/{id}/job`.
#[derive(Debug, Clone, Serialize)]
pub struct StartJobRequest<'a> {
    pub reference: &'a str,
    #[serde(skip_serializing_if = "no_parameters")]
    pub parameters: &'a [String],
}

fn no_parameters(parameters: &&[String]) -> bool {
    parameters.is_empty()
}

/// Request body for `POST /project/{id}/crypto`.
#[derive(Serialize)]
pub struct EncryptRequest<'a> {
    pub content: &'a str,
}

impl std::fmt::Debug for EncryptRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptRequest")
            .field("content", &"[REDACTED]")
            .finish()
    }
}
