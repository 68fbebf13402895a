//! GitHub hooks API and idempotent push hook registration

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DeployError, Result};

const PUSH_EVENT: &str = "push";
const JSON_CONTENT_TYPE: &str = "json";

/// A hook as listed by `GET /repos/{id}/hooks`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Hook {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub events: Vec<String>,
    pub config: Option<HookConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct HookConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Body of `POST /repos/{id}/hooks`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewHook {
    pub name: String,
    pub active: bool,
    pub events: Vec<String>,
    pub config: HookConfig,
}

impl Hook {
    /// Whether this hook already delivers push events as JSON to `url`.
    pub fn delivers_pushes_to(&self, url: &str) -> bool {
        let Some(config) = &self.config else {
            return false;
        };
        config.url == url
            && self.active
            && self.events.iter().any(|e| e == PUSH_EVENT)
            && config.content_type == JSON_CONTENT_TYPE
    }
}

impl NewHook {
    pub fn push(url: &str, secret: Option<&str>) -> Self {
        NewHook {
            name: "web".to_string(),
            active: true,
            events: vec![PUSH_EVENT.to_string()],
            config: HookConfig {
                url: url.to_string(),
                content_type: JSON_CONTENT_TYPE.to_string(),
                secret: secret.map(String::from),
            },
        }
    }
}

/// The remote side of hook registration.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HookApi: Send + Sync {
    async fn list_hooks(&self, repo_id: &str) -> Result<Vec<Hook>>;
    async fn create_hook(&self, repo_id: &str, hook: &NewHook) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    AlreadyRegistered,
    Created,
}

/// Create the push hook for `repo_id` unless an equivalent one exists.
///
/// Existing hooks are never updated or deleted.
pub async fn ensure_hook<H: HookApi + ?Sized>(
    api: &H,
    repo_id: &str,
    external_url: &str,
    secret: Option<&str>,
) -> Result<HookOutcome> {
    let hooks = api.list_hooks(repo_id).await?;
    debug!("{} has {} hooks", repo_id, hooks.len());

    if hooks.iter().any(|hook| hook.delivers_pushes_to(external_url)) {
        info!("Push hook for {} already registered", repo_id);
        return Ok(HookOutcome::AlreadyRegistered);
    }

    api.create_hook(repo_id, &NewHook::push(external_url, secret))
        .await?;
    info!("Registered push hook for {} -> {}", repo_id, external_url);
    Ok(HookOutcome::Created)
}

/// Minimal GitHub REST client for the hooks endpoints.
#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl GithubClient {
    pub fn new(api_url: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn hooks_url(&self, repo_id: &str) -> String {
        format!("{}/repos/{}/hooks", self.api_url, repo_id)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header(AUTHORIZATION, format!("token {}", self.token))
            .header(USER_AGENT, concat!("git_sync_deploy/", env!("CARGO_PKG_VERSION")))
            .header(ACCEPT, "application/vnd.github+json")
    }
}

async fn remote_error(response: reqwest::Response) -> DeployError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    DeployError::RemoteApi {
        status,
        body: body.trim().to_string(),
    }
}

#[async_trait]
impl HookApi for GithubClient {
    async fn list_hooks(&self, repo_id: &str) -> Result<Vec<Hook>> {
        let response = self
            .request(self.http.get(format!("{}?per_page=100", self.hooks_url(repo_id))))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }

        let status = response.status().as_u16();
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| DeployError::RemoteApi {
            status,
            body: format!("cannot decode hook list: {}", e),
        })
    }

    async fn create_hook(&self, repo_id: &str, hook: &NewHook) -> Result<()> {
        let response = self
            .request(self.http.post(self.hooks_url(repo_id)))
            .json(hook)
            .send()
            .await?;

        if response.status() != StatusCode::CREATED {
            return Err(remote_error(response).await);
        }
        Ok(())
    }
}
