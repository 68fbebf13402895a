//! Webhook handler for GitHub push events

use axum::{
    body::Bytes,
    extract::State as AxumState,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::time::Instant;
use tracing::{debug, error, info};

use crate::SharedState;
use crate::config::load_config;
use crate::deploy::deploy;
use crate::error::{DeployError, Result};
use crate::report::DeployReport;
use crate::webhook::{PushDelivery, verify_github_signature};

enum Delivery {
    Deployed(DeployReport),
    Ignored(String),
}

/// Runs the deploy sequence for the pushed repository and answers once it finished.
pub async fn handle_webhook(
    AxumState(state): AxumState<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();

    match process_delivery(&state, &headers, &body).await {
        Ok(Delivery::Deployed(report)) => {
            let elapsed = started.elapsed().as_millis();
            info!(deploy_id = %report.id, "Deployed {} in {} ms", report.repository, elapsed);
            match serde_json::to_string(&report) {
                Ok(json) => debug!(deploy_id = %report.id, "{}", json),
                Err(e) => error!(deploy_id = %report.id, "Failed to serialize deploy report: {}", e),
            }
            (StatusCode::OK, format!("ok in {} ms\n", elapsed)).into_response()
        }
        Ok(Delivery::Ignored(reason)) => {
            info!("Ignoring delivery: {}", reason);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            error!("Delivery failed: {}", e);
            e.into_response()
        }
    }
}

async fn process_delivery(state: &SharedState, headers: &HeaderMap, body: &[u8]) -> Result<Delivery> {
    // Only handle "push" events, a missing header counts as push.
    let event = headers.get("X-GitHub-Event").and_then(|v| v.to_str().ok());
    if let Some(event) = event.filter(|e| *e != "push") {
        return Ok(Delivery::Ignored(format!("not a push event ({})", event)));
    }

    if let Some(secret) = &state.settings.webhook_secret {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| DeployError::Unauthorized("missing signature header".to_string()))?;
        if !verify_github_signature(secret, body, signature) {
            return Err(DeployError::Unauthorized("signature mismatch".to_string()));
        }
    }

    let delivery = PushDelivery::from_slice(body)?;
    let repo_id = &delivery.repository.full_name;

    let repos = load_config(&state.settings.config_path()).await?;
    let repo = repos
        .get(repo_id)
        .ok_or_else(|| DeployError::BadRequest(format!("repo {} not configured", repo_id)))?;

    if let (Some(pushed), Some(tracked)) = (delivery.branch(), repo.tracks_branch()) {
        if pushed != tracked {
            return Ok(Delivery::Ignored(format!(
                "push to {} on {}, tracking {}",
                repo_id, pushed, tracked
            )));
        }
    }

    info!(
        "Push to {} ({}) by {}",
        repo_id,
        delivery.after.as_deref().unwrap_or("unknown commit"),
        delivery
            .pusher
            .as_ref()
            .map(|p| p.name.as_str())
            .unwrap_or("unknown pusher")
    );

    let checkout = state.settings.checkout_path(repo)?;
    let _guard = state.deploy_locks.acquire(&repo.id).await;
    let report = deploy(state.runner.as_ref(), &checkout, repo).await?;

    Ok(Delivery::Deployed(report))
}
