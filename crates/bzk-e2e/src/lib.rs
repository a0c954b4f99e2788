//! Bazooka end-to-end test harness.
//!
//! Stands up a throwaway Bazooka server (plus its MongoDB store) in
//! containers, serves fixture projects to it from `git://` containers, and
//! drives it through its HTTP API. Every scenario gets its own
//! [`Environment`], which is always torn down, pass or fail.
//!
//! # Features
//!
//! - `e2e`: compile the scenario tests under `tests/` (needs a container
//!   engine and the `BZK_E2E_*` variables)
//!
//! # Prerequisites
//!
//! 1. Docker engine reachable through `BZK_E2E_DOCKER_SOCK`
//!    (default `/var/run/docker.sock`)
//! 2. `bazooka/server:<BZK_E2E_TAG>`, `mongo:3.0.2` and `bazooka/e2e-git`
//!    images available or pullable
//! 3. `BZK_E2E_TEMP`, `BZK_E2E_HOST`, `BZK_E2E_API_PORT` and
//!    `BZK_E2E_SYSLOG_PORT` set
//!
//! # Usage
//!
//! ```bash
//! # Unit tests only, no engine needed
//! cargo test -p bzk-e2e
//!
//! # Full scenarios
//! BZK_E2E_TEMP=/tmp/bzk BZK_E2E_HOST=172.17.0.1 \
//! BZK_E2E_API_PORT=3000 BZK_E2E_SYSLOG_PORT=3001 \
//!     cargo test -p bzk-e2e --features e2e
//! ```

pub mod config;
pub mod context;
pub mod environment;
pub mod error;
pub mod log_relay;
pub mod logging;
pub mod naming;
pub mod poller;
pub mod readiness;
pub mod repository;
pub mod runtime;
pub mod scenario;

#[cfg(test)]
pub mod testing;

pub use config::{Addressing, ConfigError, HarnessConfig};
pub use context::HarnessContext;
pub use environment::Environment;
pub use error::{CommandFailure, HarnessError, TeardownError, TeardownReport};
pub use naming::{RepoIndexAllocator, RunId};
pub use poller::{wait_for_completion, Completion, JobStatusSource, PollOutcome};
pub use repository::FixtureRepository;
pub use runtime::{ContainerRuntime, ContainerSpec, DockerRuntime, RuntimeError};
