//! The deploy sequence run for every push delivery

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{error, info};

use crate::checkout::pull_command;
use crate::config::RepositoryConfig;
use crate::error::{DeployError, Result};
use crate::process::{CommandRunner, CommandSpec};
use crate::report::DeployReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStep {
    Pull,
    Stop,
    Install,
    Reload,
    Start,
}

impl fmt::Display for DeployStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeployStep::Pull => "pull",
            DeployStep::Stop => "stop",
            DeployStep::Install => "install",
            DeployStep::Reload => "reload",
            DeployStep::Start => "start",
        };
        f.write_str(name)
    }
}

/// Steps that apply to `repo`, in execution order.
///
/// Without a service name only pull and install run.
pub fn plan(repo: &RepositoryConfig) -> Vec<DeployStep> {
    let managed = repo.service_name().is_some();
    let mut steps = vec![DeployStep::Pull];
    if managed {
        steps.push(DeployStep::Stop);
    }
    if repo.install_command().is_some() {
        steps.push(DeployStep::Install);
    }
    if managed {
        steps.extend([DeployStep::Reload, DeployStep::Start]);
    }
    steps
}

fn step_command(step: DeployStep, repo: &RepositoryConfig, dir: &Path) -> CommandSpec {
    let unit = repo.service_name().unwrap_or_default();
    match step {
        DeployStep::Pull => pull_command(dir),
        DeployStep::Stop => CommandSpec::exec("systemctl", ["stop", unit], dir).inherit_output(),
        DeployStep::Install => CommandSpec::shell(repo.install_command().unwrap_or_default(), dir),
        DeployStep::Reload => {
            CommandSpec::exec("systemctl", ["daemon-reload"], dir).inherit_output()
        }
        DeployStep::Start => CommandSpec::exec("systemctl", ["start", unit], dir).inherit_output(),
    }
}

/// Run the deploy sequence for `repo` in its checkout at `dir`.
///
/// The first failing step ends the sequence. Nothing is rolled back, so a
/// failed install leaves the service stopped.
pub async fn deploy(
    runner: &dyn CommandRunner,
    dir: &Path,
    repo: &RepositoryConfig,
) -> Result<DeployReport> {
    match tokio::fs::metadata(dir).await {
        Ok(metadata) if metadata.is_dir() => {}
        _ => return Err(DeployError::MissingCheckout(dir.to_path_buf())),
    }

    let mut report = DeployReport::new(&repo.id);
    info!(deploy_id = %report.id, "Deploying {} in {}", repo.id, dir.display());

    for step in plan(repo) {
        let spec = step_command(step, repo, dir);
        info!(deploy_id = %report.id, "{}: {}", step, spec);

        let started = Instant::now();
        if let Err(source) = runner.run(&spec).await {
            error!(deploy_id = %report.id, "{} failed for {}: {}", step, repo.id, source);
            return Err(DeployError::StepFailed { step, source });
        }
        report.record_step(step, started.elapsed());
    }

    report.mark_done();
    Ok(report)
}

/// One lock per repository id, so deploys of the same repository never interleave.
#[derive(Debug, Default)]
pub struct RepoLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `repo_id`. Released when the guard drops.
    pub async fn acquire(&self, repo_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.entry(repo_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceSpec;
    use crate::process::CommandError;
    use crate::process::testing::RecordingRunner;
    use std::time::Duration;

    fn repo(service: &str, install: &str) -> RepositoryConfig {
        RepositoryConfig {
            id: "a/b".to_string(),
            branch: "main".to_string(),
            install: install.to_string(),
            service: Some(ServiceSpec {
                name: service.to_string(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn it_should_plan_the_full_sequence_for_services() {
        assert_eq!(
            vec![
                DeployStep::Pull,
                DeployStep::Stop,
                DeployStep::Install,
                DeployStep::Reload,
                DeployStep::Start
            ],
            plan(&repo("svc", "make build"))
        );
        assert_eq!(
            vec![DeployStep::Pull, DeployStep::Stop, DeployStep::Reload, DeployStep::Start],
            plan(&repo("svc", ""))
        );
    }

    #[test]
    fn it_should_plan_pull_and_install_without_a_service() {
        assert_eq!(
            vec![DeployStep::Pull, DeployStep::Install],
            plan(&repo("", "make build"))
        );

        let no_service = RepositoryConfig {
            service: None,
            ..repo("", "make build")
        };
        assert_eq!(vec![DeployStep::Pull, DeployStep::Install], plan(&no_service));
    }

    #[tokio::test]
    async fn it_should_run_the_steps_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();

        let report = deploy(&runner, dir.path(), &repo("svc", "make build"))
            .await
            .unwrap();

        assert_eq!(
            vec![
                "git pull --ff-only",
                "systemctl stop svc",
                "make build",
                "systemctl daemon-reload",
                "systemctl start svc",
            ],
            runner.calls()
        );
        assert_eq!(5, report.steps.len());
        assert!(report.completed_at.is_some());
        assert_eq!("a/b", report.repository);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!("a/b", json["repository"]);
        assert_eq!("pull", json["steps"][0]["step"]);
        assert_eq!("start", json["steps"][4]["step"]);
        assert!(json["started_at"].is_string());
    }

    #[tokio::test]
    async fn it_should_never_touch_systemctl_without_a_service() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();

        let report = deploy(&runner, dir.path(), &repo("", "make build"))
            .await
            .unwrap();

        assert_eq!(vec!["git pull --ff-only", "make build"], runner.calls());
        assert!(report.ran(DeployStep::Install));
        assert!(!report.ran(DeployStep::Start));
    }

    #[tokio::test]
    async fn it_should_stop_at_a_failed_install() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new().fail("make build", "cc: error: missing.c");

        let result = deploy(&runner, dir.path(), &repo("svc", "make build")).await;

        match result {
            Err(DeployError::StepFailed {
                step: DeployStep::Install,
                source: CommandError::NonZeroExit { output, .. },
            }) => assert_eq!("cc: error: missing.c", output),
            other => panic!("{other:?} should be a failed install"),
        }
        assert_eq!(
            vec!["git pull --ff-only", "systemctl stop svc", "make build"],
            runner.calls()
        );
    }

    #[tokio::test]
    async fn it_should_stop_at_a_failed_pull() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new().fail("git pull", "fatal: Not possible to fast-forward");

        let result = deploy(&runner, dir.path(), &repo("svc", "make build")).await;

        assert!(matches!(
            result,
            Err(DeployError::StepFailed {
                step: DeployStep::Pull,
                ..
            })
        ));
        assert_eq!(vec!["git pull --ff-only"], runner.calls());
    }

    #[tokio::test]
    async fn it_should_refuse_a_missing_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();

        let result = deploy(&runner, &dir.path().join("gone"), &repo("svc", "")).await;

        assert!(matches!(result, Err(DeployError::MissingCheckout(_))));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn it_should_serialize_deploys_of_the_same_repository() {
        let locks = Arc::new(RepoLocks::new());
        let guard = locks.acquire("a/b").await;

        let waiting = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("a/b").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn it_should_not_block_other_repositories() {
        let locks = RepoLocks::new();
        let _guard = locks.acquire("a/b").await;

        tokio::time::timeout(Duration::from_secs(1), locks.acquire("a/c"))
            .await
            .unwrap();
    }
}
