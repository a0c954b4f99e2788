//! HTTP client for the Bazooka API.

use crate::error::{truncate_error_body, ApiError};
use crate::models::{
    CreateProjectRequest, EncryptRequest, Job, Project, ProjectConfig, StartJobRequest, Variant,
};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::debug;

/// Per-request timeout applied by [`Client::new`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the public API of a Bazooka server.
///
/// Each method issues exactly one request. Failures are returned to the
/// caller, which decides whether to retry.
#[derive(Debug, Clone)]
pub struct Client {
    base_url: String,
    http_client: reqwest::Client,
}

impl Client {
    /// Create a client for the server at `base_url` (e.g. `http://host:3000`).
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let http_client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;

        Ok(Self::with_http_client(base_url, http_client))
    }

    /// Create a client reusing an existing HTTP client.
    pub fn with_http_client(base_url: impl Into<String>, http_client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            http_client,
        }
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Create a project.
    ///
    /// # Endpoint
    ///
    /// `POST /project`
    pub async fn create_project(
        &self,
        name: &str,
        scm_type: &str,
        scm_uri: &str,
    ) -> Result<Project, ApiError> {
        let url = format!("{}/project", self.base_url);
        debug!(name, scm_type, scm_uri, "creating project");

        let response = self
            .http_client
            .post(&url)
            .json(&CreateProjectRequest {
                name,
                scm_type,
                scm_uri,
            })
            .send()
            .await?;

        handle_json(response).await
    }

    /// Start a job for a project on the given reference (branch, tag, sha).
    ///
    /// `parameters` are `KEY=VALUE` pairs exposed to the build environment.
    ///
    /// # Endpoint
    ///
    /// `POST /project/{id}/job`
    pub async fn start_job(
        &self,
        project_id: &str,
        reference: &str,
        parameters: &[String],
    ) -> Result<Job, ApiError> {
        let url = format!("{}/project/{}/job", self.base_url, project_id);
        debug!(project_id, reference, ?parameters, "starting job");

        let response = self
            .http_client
            .post(&url)
            .json(&StartJobRequest {
                reference,
                parameters,
            })
            .send()
            .await?;

        handle_json(response).await
    }

    /// Fetch a job, including its current status.
    ///
    /// # Endpoint
    ///
    /// `GET /job/{id}`
    pub async fn job(&self, job_id: &str) -> Result<Job, ApiError> {
        let url = format!("{}/job/{}", self.base_url, job_id);

        let response = self.http_client.get(&url).send().await?;

        handle_json(response).await
    }

    /// List the variants of a job.
    ///
    /// # Endpoint
    ///
    /// `GET /job/{id}/variant`
    pub async fn job_variants(&self, job_id: &str) -> Result<Vec<Variant>, ApiError> {
        let url = format!("{}/job/{}/variant", self.base_url, job_id);

        let response = self.http_client.get(&url).send().await?;

        handle_json(response).await
    }

    /// Fetch the whole configuration of a project.
    ///
    /// # Endpoint
    ///
    /// `GET /project/{id}/config`
    pub async fn project_config(&self, project_id: &str) -> Result<ProjectConfig, ApiError> {
        let url = format!("{}/project/{}/config", self.base_url, project_id);

        let response = self.http_client.get(&url).send().await?;

        handle_json(response).await
    }

    /// Set one project configuration key, replacing any previous value.
    ///
    /// # Endpoint
    ///
    /// `PUT /project/{id}/config/{key}`
    pub async fn set_project_config_key(
        &self,
        project_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ApiError> {
        let url = format!("{}/project/{}/config/{}", self.base_url, project_id, key);
        debug!(project_id, key, "setting project config key");

        let response = self.http_client.put(&url).json(value).send().await?;

        handle_text(response).await.map(|_| ())
    }

    /// Remove one project configuration key.
    ///
    /// # Endpoint
    ///
    /// `DELETE /project/{id}/config/{key}`
    pub async fn unset_project_config_key(
        &self,
        project_id: &str,
        key: &str,
    ) -> Result<(), ApiError> {
        let url = format!("{}/project/{}/config/{}", self.base_url, project_id, key);
        debug!(project_id, key, "unsetting project config key");

        let response = self.http_client.delete(&url).send().await?;

        handle_text(response).await.map(|_| ())
    }

    /// Encrypt sensitive data with the project's key.
    ///
    /// The returned ciphertext can be embedded in the project's build file;
    /// only the server can decrypt it.
    ///
    /// # Endpoint
    ///
    /// `POST /project/{id}/crypto`
    pub async fn encrypt_data(
        &self,
        project_id: &str,
        data: &SecretString,
    ) -> Result<String, ApiError> {
        let url = format!("{}/project/{}/crypto", self.base_url, project_id);
        debug!(project_id, "encrypting project data");

        let response = self
            .http_client
            .post(&url)
            .json(&EncryptRequest {
                content: data.expose_secret(),
            })
            .send()
            .await?;

        let ciphertext = handle_text(response).await?;
        Ok(ciphertext.trim().to_string())
    }
}

/// Check the status and parse a JSON body.
async fn handle_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ApiError> {
    let body = handle_text(response).await?;
    Ok(serde_json::from_str(&body)?)
}

/// Check the status and return the raw body.
async fn handle_text(response: reqwest::Response) -> Result<String, ApiError> {
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::RequestFailed {
            status: status.as_u16(),
            body: truncate_error_body(&body),
        });
    }

    Ok(response.text().await?)
}
