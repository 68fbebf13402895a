//! Keep local checkouts of GitHub repositories in sync and redeploy their
//! systemd services on every push.
//!
//! At startup every configured repository is cloned or pulled and gets a push
//! hook on GitHub. Afterwards each push delivery pulls the checkout, stops the
//! service, runs the install command, reloads systemd and starts the service.

pub mod api;
pub mod checkout;
pub mod config;
pub mod deploy;
pub mod error;
pub mod github;
pub mod logging;
pub mod process;
pub mod reconcile;
pub mod report;
pub mod webhook;

use std::sync::Arc;

use config::Settings;
use deploy::RepoLocks;
use process::CommandRunner;

pub struct AppState {
    pub settings: Settings,
    pub runner: Arc<dyn CommandRunner>,
    pub deploy_locks: RepoLocks,
}

impl AppState {
    pub fn new(settings: Settings, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            settings,
            runner,
            deploy_locks: RepoLocks::new(),
        }
    }
}

pub type SharedState = Arc<AppState>;
