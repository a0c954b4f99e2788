//! Bounded job completion polling.

use crate::error::HarnessError;
use async_trait::async_trait;
use bzk_api::{ApiError, JobStatus};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Time between two status queries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Anything that can report the current status of a job.
#[async_trait]
pub trait JobStatusSource: Send + Sync {
    async fn job_status(&self, job_id: &str) -> Result<JobStatus, ApiError>;
}

#[async_trait]
impl JobStatusSource for bzk_api::Client {
    async fn job_status(&self, job_id: &str) -> Result<JobStatus, ApiError> {
        Ok(self.job(job_id).await?.status)
    }
}

/// How polling a job ended.
#[derive(Debug)]
pub enum PollOutcome {
    /// The job reached a status from which it cannot move on.
    Terminal { status: JobStatus, elapsed: Duration },
    /// The deadline fired before the job finished.
    TimeoutExceeded { job_id: String, timeout: Duration },
    /// A status query failed; polling stopped at the first failure.
    TransportError { job_id: String, error: ApiError },
}

/// A finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub status: JobStatus,
    pub elapsed: Duration,
}

impl PollOutcome {
    /// Treat anything but a terminal status as an error.
    pub fn into_result(self) -> Result<Completion, HarnessError> {
        match self {
            PollOutcome::Terminal { status, elapsed } => Ok(Completion { status, elapsed }),
            PollOutcome::TimeoutExceeded { job_id, timeout } => {
                Err(HarnessError::PollTimeout { job_id, timeout })
            }
            PollOutcome::TransportError { job_id, error } => Err(HarnessError::Transport {
                operation: format!("polling job {job_id}"),
                source: error,
            }),
        }
    }
}

/// Query `job_id` every `interval` until it is terminal or `timeout` elapses.
///
/// The deadline is armed once and bounds every attempt, including a status
/// query that never answers.
pub async fn wait_for_completion(
    source: &dyn JobStatusSource,
    job_id: &str,
    timeout: Duration,
    interval: Duration,
) -> PollOutcome {
    let start = Instant::now();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut attempts: u32 = 0;

    loop {
        let attempt = async {
            tokio::time::sleep(interval).await;
            source.job_status(job_id).await
        };

        tokio::select! {
            _ = &mut deadline => {
                warn!(job_id, ?timeout, attempts, "gave up waiting on job");
                return PollOutcome::TimeoutExceeded {
                    job_id: job_id.to_string(),
                    timeout,
                };
            }
            result = attempt => {
                attempts = attempts.saturating_add(1);
                match result {
                    Ok(status) if status.is_terminal() => {
                        let elapsed = start.elapsed();
                        info!(job_id, ?status, ?elapsed, "job finished");
                        return PollOutcome::Terminal { status, elapsed };
                    }
                    Ok(status) => {
                        debug!(job_id, ?status, attempts, "job still in progress");
                    }
                    Err(error) => {
                        warn!(job_id, error = %error, "job status query failed");
                        return PollOutcome::TransportError {
                            job_id: job_id.to_string(),
                            error,
                        };
                    }
                }
            }
        }
    }
}
