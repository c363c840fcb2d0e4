//! Layered configuration: built-in defaults, an optional `config.yaml`
//! (searched at `./config.yaml`, `./config/config.yaml`, then
//! `/etc/gitops-reconciler/config.yaml`), then `GITOPS_`-prefixed
//! environment variables (`GITOPS_WEBHOOK__PORT` overrides
//! `webhook.port`). Mirrors the precedence of the original controller's
//! Viper-based loader.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

const CONFIG_SEARCH_PATHS: &[&str] = &[
    "config.yaml",
    "config/config.yaml",
    "/etc/gitops-reconciler/config.yaml",
];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("at least one repository must be configured")]
    NoRepositories,

    #[error("repository {name:?} is missing a git url")]
    MissingUrl { name: String },

    #[error("repository {name:?} has an invalid sync interval {value:?}: {source}")]
    InvalidInterval {
        name: String,
        value: String,
        source: humantime::DurationError,
    },
}

/// Fully validated configuration, handed immutably to the supervisor.
#[derive(Debug, Clone)]
pub struct Config {
    pub repositories: Vec<RepositoryConfig>,
    pub kubernetes: KubernetesConfig,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub name: String,
    pub url: String,
    pub branch: String,
    pub local_path: PathBuf,
    /// Subdirectory within the working copy that holds manifests, relative
    /// to `local_path`. `None` means manifests live at the repository root.
    pub path: Option<PathBuf>,
    pub namespace: String,
    pub interval: Duration,
    pub prune: bool,
}

impl RepositoryConfig {
    /// The directory manifests are loaded from: `local_path` joined with
    /// `path` when a manifest subdirectory is configured, else `local_path`
    /// itself.
    pub fn manifest_dir(&self) -> PathBuf {
        match &self.path {
            Some(path) => self.local_path.join(path),
            None => self.local_path.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct KubernetesConfig {
    pub kubeconfig: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub port: u16,
    pub secret: Option<String>,
}

// Raw, pre-validation shape the `config` crate deserializes into. Every
// field is optional here; defaults and validation happen in `Config::load`.
#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    repositories: Vec<RawRepository>,
    #[serde(default)]
    kubernetes: RawKubernetes,
    #[serde(default)]
    webhook: RawWebhook,
}

#[derive(Debug, Deserialize, Default)]
struct RawRepository {
    name: Option<String>,
    url: Option<String>,
    branch: Option<String>,
    local_path: Option<String>,
    path: Option<String>,
    namespace: Option<String>,
    interval: Option<String>,
    prune: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct RawKubernetes {
    kubeconfig: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawWebhook {
    enabled: Option<bool>,
    port: Option<u16>,
    secret: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        let mut builder = config::Config::builder();
        for path in CONFIG_SEARCH_PATHS {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GITOPS")
                .separator("__")
                .try_parsing(true),
        );
        let raw: RawConfig = builder.build()?.try_deserialize()?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, Error> {
        if raw.repositories.is_empty() {
            return Err(Error::NoRepositories);
        }

        let mut repositories = Vec::with_capacity(raw.repositories.len());
        for (idx, r) in raw.repositories.into_iter().enumerate() {
            let name = r.name.unwrap_or_else(|| format!("repo-{idx}"));
            let url = r.url.ok_or_else(|| Error::MissingUrl { name: name.clone() })?;
            let branch = r.branch.unwrap_or_else(|| "master".to_owned());
            let local_path = r
                .local_path
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(format!("/tmp/gitops-reconciler/{name}")));
            let path = r.path.map(PathBuf::from);
            let namespace = r.namespace.unwrap_or_else(|| "default".to_owned());
            let interval_str = r.interval.unwrap_or_else(|| "60s".to_owned());
            let interval =
                humantime::parse_duration(&interval_str).map_err(|source| Error::InvalidInterval {
                    name: name.clone(),
                    value: interval_str.clone(),
                    source,
                })?;
            let prune = r.prune.unwrap_or(true);

            repositories.push(RepositoryConfig {
                name,
                url,
                branch,
                local_path,
                path,
                namespace,
                interval,
                prune,
            });
        }

        let kubernetes = KubernetesConfig {
            kubeconfig: raw.kubernetes.kubeconfig.map(PathBuf::from),
        };

        let webhook = WebhookConfig {
            enabled: raw.webhook.enabled.unwrap_or(true),
            port: raw.webhook.port.unwrap_or(8080),
            secret: raw.webhook.secret,
        };

        Ok(Config {
            repositories,
            kubernetes,
            webhook,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_repository_list() {
        let err = Config::from_raw(RawConfig::default()).unwrap_err();
        assert!(matches!(err, Error::NoRepositories));
    }

    #[test]
    fn requires_url_per_repository() {
        let raw = RawConfig {
            repositories: vec![RawRepository {
                name: Some("demo".to_owned()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let err = Config::from_raw(raw).unwrap_err();
        assert!(matches!(err, Error::MissingUrl { name } if name == "demo"));
    }

    #[test]
    fn fills_in_defaults() {
        let raw = RawConfig {
            repositories: vec![RawRepository {
                url: Some("https://example.com/repo.git".to_owned()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let cfg = Config::from_raw(raw).unwrap();
        let repo = &cfg.repositories[0];
        assert_eq!(repo.branch, "master");
        assert_eq!(repo.namespace, "default");
        assert_eq!(repo.interval, Duration::from_secs(60));
        assert!(repo.prune);
        assert_eq!(repo.path, None);
        assert_eq!(repo.manifest_dir(), repo.local_path);
        assert!(cfg.webhook.enabled);
        assert_eq!(cfg.webhook.port, 8080);
    }

    #[test]
    fn parses_custom_sync_interval() {
        let raw = RawConfig {
            repositories: vec![RawRepository {
                url: Some("https://example.com/repo.git".to_owned()),
                interval: Some("5m".to_owned()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let cfg = Config::from_raw(raw).unwrap();
        assert_eq!(cfg.repositories[0].interval, Duration::from_secs(300));
    }

    #[test]
    fn manifest_dir_joins_configured_path() {
        let raw = RawConfig {
            repositories: vec![RawRepository {
                url: Some("https://example.com/repo.git".to_owned()),
                local_path: Some("/tmp/demo".to_owned()),
                path: Some("manifests/prod".to_owned()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let cfg = Config::from_raw(raw).unwrap();
        assert_eq!(
            cfg.repositories[0].manifest_dir(),
            PathBuf::from("/tmp/demo/manifests/prod")
        );
    }
}
