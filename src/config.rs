use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::{DeployError, Result};

const DEFAULT_PORT: u16 = 2067;
const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
const DEFAULT_GIT_CLONE_BASE: &str = "https://github.com";
const CONFIG_FILE_NAME: &str = "repos.json";

/// Repositories keyed by their `owner/name` identifier.
pub type RepositoryMap = BTreeMap<String, RepositoryConfig>;

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct RepositoryConfig {
    pub id: String,
    /// Empty means the remote's default branch.
    pub branch: String,
    /// Shell command run in the checkout, empty means no install step.
    pub install: String,
    pub service: Option<ServiceSpec>,
}

/// systemd binding of a repository.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ServiceSpec {
    pub name: String,
    pub env: HashMap<String, String>,
    pub start: String,
    pub user: String,
    pub dir: String,
}

impl RepositoryConfig {
    /// The repository name after the `/`, which is also the checkout directory name.
    pub fn short_name(&self) -> Result<&str> {
        match self.id.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(name)
            }
            _ => Err(DeployError::ConfigError(format!(
                "repository id '{}' must look like 'owner/name'",
                self.id
            ))),
        }
    }

    /// The unit to manage, if any.
    pub fn service_name(&self) -> Option<&str> {
        self.service
            .as_ref()
            .map(|s| s.name.as_str())
            .filter(|name| !name.is_empty())
    }

    pub fn install_command(&self) -> Option<&str> {
        Some(self.install.as_str()).filter(|cmd| !cmd.trim().is_empty())
    }

    pub fn tracks_branch(&self) -> Option<&str> {
        Some(self.branch.as_str()).filter(|b| !b.is_empty())
    }
}

/// Parse the repository config file contents, filling in and checking ids.
pub fn parse_config(contents: &str) -> Result<RepositoryMap> {
    let mut repos: RepositoryMap = serde_json::from_str(contents)
        .map_err(|e| DeployError::ConfigError(format!("Failed to parse repositories: {}", e)))?;

    // short name -> id, checkouts live in <home>/<short name>
    let mut checkouts: HashMap<String, String> = HashMap::new();
    for (key, repo) in repos.iter_mut() {
        if repo.id.is_empty() {
            repo.id = key.clone();
        }
        if repo.id != *key {
            return Err(DeployError::ConfigError(format!(
                "repository '{}' has mismatching id '{}'",
                key, repo.id
            )));
        }
        let short_name = repo.short_name()?.to_string();
        if let Some(other) = checkouts.insert(short_name.clone(), key.clone()) {
            return Err(DeployError::ConfigError(format!(
                "repositories '{}' and '{}' would share the checkout '{}'",
                other, key, short_name
            )));
        }
    }

    Ok(repos)
}

/// Load the repository config file. Called on every use so edits apply without a restart.
pub async fn load_config(path: &Path) -> Result<RepositoryMap> {
    let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
        DeployError::ConfigError(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;
    parse_config(&contents)
}

/// Process settings read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub github_token: String,
    pub external_url: String,
    pub port: u16,
    pub home: PathBuf,
    pub webhook_secret: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub github_api_url: String,
    pub git_clone_base: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok(), dirs::home_dir())
    }

    /// Build settings from a variable lookup, `default_home` is used when `REPOS_HOME` is unset.
    pub fn from_lookup<F>(lookup: F, default_home: Option<PathBuf>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let require = |key: &str| {
            var(key).ok_or_else(|| {
                DeployError::ConfigError(format!("environment variable {} is required", key))
            })
        };

        let port = match var("PORT") {
            Some(port) => port.parse().map_err(|e| {
                DeployError::ConfigError(format!("PORT '{}' is not a valid port: {}", port, e))
            })?,
            None => DEFAULT_PORT,
        };

        let home = var("REPOS_HOME")
            .map(PathBuf::from)
            .or(default_home)
            .ok_or_else(|| {
                DeployError::ConfigError("cannot determine home directory, set REPOS_HOME".into())
            })?;

        Ok(Settings {
            github_token: require("GITHUB_TOKEN")?,
            external_url: require("EXTERNAL_URL")?,
            port,
            home,
            webhook_secret: var("WEBHOOK_SECRET"),
            log_dir: var("LOG_DIR").map(PathBuf::from),
            github_api_url: var("GITHUB_API_URL")
                .unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            git_clone_base: var("GIT_CLONE_BASE")
                .unwrap_or_else(|| DEFAULT_GIT_CLONE_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.home.join(CONFIG_FILE_NAME)
    }

    pub fn checkout_path(&self, repo: &RepositoryConfig) -> Result<PathBuf> {
        Ok(self.home.join(repo.short_name()?))
    }

    pub fn clone_url(&self, repo: &RepositoryConfig) -> String {
        format!("{}/{}.git", self.git_clone_base, repo.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn it_should_parse_a_full_entry() {
        let repos = parse_config(
            r#"{
                "a/b": {
                    "id": "a/b",
                    "branch": "main",
                    "install": "make build",
                    "service": {
                        "name": "svc",
                        "env": {"PORT": "8080"},
                        "start": "/usr/local/bin/b",
                        "user": "deploy",
                        "dir": "/srv/b"
                    }
                }
            }"#,
        )
        .unwrap();

        let repo = &repos["a/b"];
        assert_eq!("main", repo.branch);
        assert_eq!(Some("make build"), repo.install_command());
        assert_eq!(Some("svc"), repo.service_name());
        assert_eq!("8080", repo.service.as_ref().unwrap().env["PORT"]);
        assert_eq!("b", repo.short_name().unwrap());
    }

    #[test]
    fn it_should_fill_missing_fields() {
        let repos = parse_config(r#"{"a/b": {"branch": "main"}}"#).unwrap();
        let repo = &repos["a/b"];

        assert_eq!("a/b", repo.id);
        assert_eq!(None, repo.install_command());
        assert_eq!(None, repo.service_name());
    }

    #[test]
    fn it_should_treat_empty_service_name_as_unmanaged() {
        let repos = parse_config(r#"{"a/b": {"service": {"name": ""}}}"#).unwrap();
        assert_eq!(None, repos["a/b"].service_name());
        assert_eq!(None, repos["a/b"].tracks_branch());
    }

    #[test]
    fn it_should_reject_malformed_ids() {
        for id in ["ab", "a/b/c", "/b", "a/"] {
            let contents = format!(r#"{{"{id}": {{}}}}"#);
            let result = parse_config(&contents);
            assert!(
                matches!(result, Err(DeployError::ConfigError(_))),
                "{id} should be rejected"
            );
        }
    }

    #[test]
    fn it_should_reject_an_id_different_from_its_key() {
        let result = parse_config(r#"{"a/b": {"id": "a/c"}}"#);
        assert!(matches!(result, Err(DeployError::ConfigError(_))));
    }

    #[test]
    fn it_should_reject_repositories_sharing_a_checkout() {
        let result = parse_config(r#"{"a/b": {}, "c/b": {}}"#);
        match result {
            Err(DeployError::ConfigError(message)) => {
                assert!(message.contains("a/b"), "{message}");
                assert!(message.contains("c/b"), "{message}");
            }
            other => panic!("{other:?} should be a config error"),
        }

        assert_eq!(2, parse_config(r#"{"a/b": {}, "a/c": {}}"#).unwrap().len());
    }

    #[test]
    fn it_should_reject_invalid_json() {
        let result = parse_config("{not json");
        assert!(matches!(result, Err(DeployError::ConfigError(_))));
    }

    #[tokio::test]
    async fn it_should_report_a_missing_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(&dir.path().join("repos.json")).await;
        assert!(matches!(result, Err(DeployError::ConfigError(_))));
    }

    #[tokio::test]
    async fn it_should_reread_the_file_on_every_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repos.json");

        std::fs::write(&path, r#"{"a/b": {}}"#).unwrap();
        assert_eq!(1, load_config(&path).await.unwrap().len());

        std::fs::write(&path, r#"{"a/b": {}, "a/c": {}}"#).unwrap();
        assert_eq!(2, load_config(&path).await.unwrap().len());
    }

    #[test]
    fn it_should_read_settings_with_defaults() {
        let settings = Settings::from_lookup(
            lookup(&[("GITHUB_TOKEN", "t0k"), ("EXTERNAL_URL", "https://hooks.example.com/")]),
            Some(PathBuf::from("/home/deploy")),
        )
        .unwrap();

        assert_eq!("t0k", settings.github_token);
        assert_eq!(2067, settings.port);
        assert_eq!(PathBuf::from("/home/deploy/repos.json"), settings.config_path());
        assert_eq!("https://api.github.com", settings.github_api_url);
        assert_eq!(None, settings.webhook_secret);

        let repo = RepositoryConfig {
            id: "a/b".to_string(),
            ..Default::default()
        };
        assert_eq!(PathBuf::from("/home/deploy/b"), settings.checkout_path(&repo).unwrap());
        assert_eq!("https://github.com/a/b.git", settings.clone_url(&repo));
    }

    #[test]
    fn it_should_override_settings_from_the_environment() {
        let settings = Settings::from_lookup(
            lookup(&[
                ("GITHUB_TOKEN", "t0k"),
                ("EXTERNAL_URL", "https://hooks.example.com"),
                ("PORT", "9000"),
                ("REPOS_HOME", "/srv/repos"),
                ("WEBHOOK_SECRET", "s3cret"),
                ("GIT_CLONE_BASE", "file:///tmp/remotes/"),
            ]),
            Some(PathBuf::from("/home/deploy")),
        )
        .unwrap();

        assert_eq!(9000, settings.port);
        assert_eq!(PathBuf::from("/srv/repos"), settings.home);
        assert_eq!(Some("s3cret".to_string()), settings.webhook_secret);
        assert_eq!("file:///tmp/remotes", settings.git_clone_base);
    }

    #[test]
    fn it_should_require_token_and_url() {
        let result = Settings::from_lookup(
            lookup(&[("EXTERNAL_URL", "https://hooks.example.com")]),
            Some(PathBuf::from("/home/deploy")),
        );
        assert!(matches!(result, Err(DeployError::ConfigError(_))));

        let result = Settings::from_lookup(
            lookup(&[("GITHUB_TOKEN", "t0k")]),
            Some(PathBuf::from("/home/deploy")),
        );
        assert!(matches!(result, Err(DeployError::ConfigError(_))));
    }

    #[test]
    fn it_should_reject_a_bad_port() {
        let result = Settings::from_lookup(
            lookup(&[
                ("GITHUB_TOKEN", "t0k"),
                ("EXTERNAL_URL", "https://hooks.example.com"),
                ("PORT", "http"),
            ]),
            Some(PathBuf::from("/home/deploy")),
        );
        assert!(matches!(result, Err(DeployError::ConfigError(_))));
    }
}
