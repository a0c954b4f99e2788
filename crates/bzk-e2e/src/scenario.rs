//! Glue shared by the end-to-end scenarios.

use crate::context::HarnessContext;
use crate::environment::Environment;
use crate::error::{HarnessError, TeardownReport};
use crate::repository::FixtureRepository;
use futures_util::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

/// Budget for a single job to finish.
pub const JOB_TIMEOUT: Duration = Duration::from_secs(60);

/// Message of the commit seeding every fixture repository.
pub const INITIAL_COMMIT_MESSAGE: &str = "Point of inception";

/// Attach the name of the API call to its failure.
pub trait ApiResultExt<T> {
    fn during(self, operation: &str) -> Result<T, HarnessError>;
}

impl<T> ApiResultExt<T> for Result<T, bzk_api::ApiError> {
    fn during(self, operation: &str) -> Result<T, HarnessError> {
        self.map_err(|source| HarnessError::Transport {
            operation: operation.to_string(),
            source,
        })
    }
}

/// Directory holding the fixture project trees.
pub fn data_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("data")
}

/// Create a repository holding the `data/<project>` tree, committed.
pub async fn seed_repository(
    env: &mut Environment,
    project: &str,
) -> Result<FixtureRepository, HarnessError> {
    let repo = env.create_repository().await?;
    repo.import_dir(&data_dir().join(project)).await?;
    repo.add_all().await?;
    repo.commit(INITIAL_COMMIT_MESSAGE).await?;
    Ok(repo)
}

/// Combine a scenario's outcome with its teardown report.
///
/// Teardown failures are logged but never replace the scenario's own result.
pub fn conclude<T>(outcome: Result<T, HarnessError>, report: TeardownReport) -> Result<T, HarnessError> {
    if report.is_clean() {
        info!(%report, "teardown complete");
    } else {
        warn!(%report, "teardown incomplete");
    }

    if let Err(e) = &outcome {
        error!(error = %e, "scenario failed");
    }
    outcome
}

/// Provision an environment, run `body` against it, and tear it down
/// whatever happened.
pub async fn run_scenario<T, F>(context: &HarnessContext, body: F) -> Result<T, HarnessError>
where
    F: for<'a> FnOnce(&'a mut Environment) -> BoxFuture<'a, Result<T, HarnessError>>,
{
    let mut env = Environment::new(context);

    let outcome = match env.provision().await {
        Ok(()) => body(&mut env).await,
        Err(e) => Err(e),
    };

    let report = env.teardown().await;
    conclude(outcome, report)
}
