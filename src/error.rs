use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::io;
use std::path::PathBuf;

use crate::deploy::DeployStep;
use crate::process::CommandError;

/// Custom error type for sync and deploy operations
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("{} is a file, expected a checkout directory", .0.display())]
    OccupiedByFile(PathBuf),

    #[error("{repo} is checked out to the wrong branch: expected '{expected}', found '{actual}'")]
    WrongBranch {
        repo: String,
        expected: String,
        actual: String,
    },

    #[error("{} is not a git checkout: {message}", .path.display())]
    NotACheckout { path: PathBuf, message: String },

    #[error("{} has a detached HEAD, expected a branch", .0.display())]
    DetachedHead(PathBuf),

    #[error("checkout {} is missing, restart to clone it again", .0.display())]
    MissingCheckout(PathBuf),

    #[error(transparent)]
    CommandFailed(#[from] CommandError),

    #[error("{step} failed: {source}")]
    StepFailed {
        step: DeployStep,
        #[source]
        source: CommandError,
    },

    #[error("GitHub API returned {status}: {body}")]
    RemoteApi { status: u16, body: String },

    #[error("GitHub request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    BadRequest(String),

    #[error("Webhook validation failed: {0}")]
    Unauthorized(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl DeployError {
    /// HTTP status used when the error ends a webhook delivery.
    pub fn status_code(&self) -> StatusCode {
        match self {
            DeployError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DeployError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DeployError {
    fn into_response(self) -> Response {
        (self.status_code(), format!("{}\n", self)).into_response()
    }
}

/// Helper type for Results that use DeployError
pub type Result<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_4xx() {
        let err = DeployError::BadRequest("repo a/b not configured".to_string());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = DeployError::Unauthorized("bad signature".to_string());
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn downstream_failures_map_to_500() {
        let err = DeployError::StepFailed {
            step: DeployStep::Install,
            source: CommandError::NonZeroExit {
                command: "make build".to_string(),
                code: 2,
                output: "no rule to make target".to_string(),
            },
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("no rule to make target"));
    }
}
