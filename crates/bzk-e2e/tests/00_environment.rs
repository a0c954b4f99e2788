//! Environment lifecycle against a real container engine.
//!
//! Validates that a server comes up, answers API calls, and that teardown
//! removes everything. Every other scenario depends on this.

#![cfg(feature = "e2e")]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use bzk_e2e::scenario::ApiResultExt;
use bzk_e2e::{logging, Environment, HarnessContext};
use serial_test::serial;

fn context() -> HarnessContext {
    logging::init_test_tracing();
    HarnessContext::from_env()
        .expect("BZK_E2E_* variables must be set and the Docker engine reachable")
}

#[tokio::test]
#[serial]
async fn test_environment_provisions_and_tears_down() {
    let context = context();
    let mut env = Environment::new(&context);

    let outcome = async {
        env.provision().await?;
        let project = env
            .api()?
            .create_project("probe", "git", "nothing")
            .await
            .during("create project")?;
        Ok::<_, bzk_e2e::HarnessError>(project)
    }
    .await;

    let home = env.home().to_path_buf();
    let first = env.teardown().await;
    let second = env.teardown().await;

    let project = outcome.expect("environment should provision and answer API calls");
    assert_eq!(project.name, "probe");
    assert!(first.is_clean(), "teardown failed: {first}");
    assert_eq!(second.attempted, 0, "second teardown should be a no-op");
    assert!(!home.exists(), "home directory should be removed");
}

#[tokio::test]
#[serial]
async fn test_fixture_repository_lifecycle() {
    let context = context();
    let mut env = Environment::new(&context);

    let outcome = async {
        env.provision().await?;
        let repo = env.create_repository().await?;
        repo.import_dir(&bzk_e2e::scenario::data_dir().join("go-project"))
            .await?;
        repo.add_all().await?;
        repo.commit("Point of inception").await?;
        Ok::<_, bzk_e2e::HarnessError>(repo.tree().to_path_buf())
    }
    .await;

    let report = env.teardown().await;

    let tree = outcome.expect("repository should be created and committed");
    assert!(report.is_clean(), "teardown failed: {report}");
    assert!(!tree.exists(), "working tree should be removed");
}
