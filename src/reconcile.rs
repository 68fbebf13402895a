//! Startup pass that brings every configured checkout and hook in line

use tracing::info;

use crate::checkout::{self, CheckoutStatus};
use crate::config::{RepositoryConfig, RepositoryMap, Settings};
use crate::error::{DeployError, Result};
use crate::github::{HookApi, HookOutcome, ensure_hook};
use crate::process::CommandRunner;

/// What happened to one checkout during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Cloned,
    Pulled,
}

pub struct Reconciler<'a, H: HookApi + ?Sized> {
    settings: &'a Settings,
    runner: &'a dyn CommandRunner,
    hooks: &'a H,
}

impl<'a, H: HookApi + ?Sized> Reconciler<'a, H> {
    pub fn new(settings: &'a Settings, runner: &'a dyn CommandRunner, hooks: &'a H) -> Self {
        Self {
            settings,
            runner,
            hooks,
        }
    }

    /// Reconcile every repository, stopping at the first error.
    pub async fn reconcile_all(&self, repos: &RepositoryMap) -> Result<()> {
        for repo in repos.values() {
            self.reconcile_one(repo).await?;
        }
        info!("Reconciled {} repositories", repos.len());
        Ok(())
    }

    /// Clone or pull one checkout, then make sure its push hook exists.
    pub async fn reconcile_one(&self, repo: &RepositoryConfig) -> Result<(SyncOutcome, HookOutcome)> {
        let path = self.settings.checkout_path(repo)?;

        let outcome = match checkout::validate(self.runner, &path, &repo.branch).await? {
            CheckoutStatus::Absent => {
                let url = self.settings.clone_url(repo);
                info!("Cloning {} into {}", url, path.display());
                self.runner
                    .run(&checkout::clone_command(&url, &path, &repo.branch))
                    .await?;
                SyncOutcome::Cloned
            }
            CheckoutStatus::OccupiedByFile => return Err(DeployError::OccupiedByFile(path)),
            CheckoutStatus::WrongBranch { actual } => {
                return Err(DeployError::WrongBranch {
                    repo: repo.id.clone(),
                    expected: repo.branch.clone(),
                    actual,
                });
            }
            CheckoutStatus::Valid => {
                info!("Pulling {} in {}", repo.id, path.display());
                self.runner.run(&checkout::pull_command(&path)).await?;
                SyncOutcome::Pulled
            }
        };

        let hook = ensure_hook(
            self.hooks,
            &repo.id,
            &self.settings.external_url,
            self.settings.webhook_secret.as_deref(),
        )
        .await?;

        Ok((outcome, hook))
    }
}
