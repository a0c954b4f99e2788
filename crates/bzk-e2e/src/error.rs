//! Harness error types.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that abort the current scenario.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A resource could not be allocated or a container could not start.
    #[error("Setup failed for {resource}: {reason}")]
    Setup { resource: String, reason: String },

    /// The server never accepted connections on its API port.
    #[error("Server at {address} not reachable after {elapsed:?} (budget {timeout:?})")]
    ReadinessTimeout {
        address: String,
        elapsed: Duration,
        timeout: Duration,
    },

    /// A single API call failed.
    #[error("Transport error during {operation}: {source}")]
    Transport {
        operation: String,
        #[source]
        source: bzk_api::ApiError,
    },

    /// A job did not reach a terminal status within its budget.
    #[error("Gave up waiting on job {job_id}: didn't finish after {timeout:?}")]
    PollTimeout { job_id: String, timeout: Duration },

    /// A fixture repository command exited nonzero or could not be waited on.
    #[error("Command {command:?} failed: {failure}")]
    CommandExecution {
        command: Vec<String>,
        failure: CommandFailure,
    },

    /// A fixture file could not be imported or rendered.
    #[error("Fixture error on {}: {reason}", path.display())]
    Fixture { path: PathBuf, reason: String },
}

impl HarnessError {
    pub(crate) fn setup(resource: impl Into<String>, reason: impl fmt::Display) -> Self {
        HarnessError::Setup {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn fixture(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        HarnessError::Fixture {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Why a one-shot command container failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandFailure {
    /// The command container could not be started.
    Start(String),
    /// The exit code could not be retrieved.
    Wait(String),
    /// The command ran and exited with a nonzero code.
    ExitCode(i64),
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandFailure::Start(reason) => write!(f, "could not start: {reason}"),
            CommandFailure::Wait(reason) => {
                write!(f, "could not retrieve the exit code: {reason}")
            }
            CommandFailure::ExitCode(code) => write!(f, "exit code {code}"),
        }
    }
}

/// One cleanup step that failed.
#[derive(Debug, Clone, Error)]
#[error("Failed to remove {resource}: {reason}")]
pub struct TeardownError {
    pub resource: String,
    pub reason: String,
}

/// Outcome of a teardown: every step was attempted, these ones failed.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Number of cleanup steps attempted.
    pub attempted: usize,
    pub errors: Vec<TeardownError>,
}

impl TeardownReport {
    /// Whether every attempted step succeeded.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub(crate) fn record(&mut self, resource: impl Into<String>, result: Result<(), String>) {
        self.attempted += 1;
        if let Err(reason) = result {
            let error = TeardownError {
                resource: resource.into(),
                reason,
            };
            tracing::warn!(resource = %error.resource, reason = %error.reason, "teardown step failed");
            self.errors.push(error);
        }
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cleanup steps, {} failed",
            self.attempted,
            self.errors.len()
        )?;
        for error in &self.errors {
            write!(f, "; {error}")?;
        }
        Ok(())
    }
}
