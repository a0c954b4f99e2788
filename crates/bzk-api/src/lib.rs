//! Bazooka API client.
//!
//! Thin HTTP client for the public API of a Bazooka server, used by the
//! end-to-end harness to create projects, start jobs, and observe them.
//!
//! # Usage
//!
//! ```rust,no_run
//! use bzk_api::Client;
//!
//! # async fn example() -> Result<(), bzk_api::ApiError> {
//! let client = Client::new("http://localhost:3000")?;
//! let project = client.create_project("goproj", "git", "git://repo:9418/").await?;
//! let job = client.start_job(&project.id, "master", &[]).await?;
//! let job = client.job(&job.id).await?;
//! println!("job {} is {:?}", job.id, job.status);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;

pub use client::Client;
pub use error::ApiError;
pub use models::{Job, JobStatus, Project, ProjectConfig, Variant};
