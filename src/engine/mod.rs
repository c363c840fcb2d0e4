//! The reconciliation engine: pulls a repository, parses its manifests,
//! applies them to the cluster, prunes anything the controller manages
//! that Git no longer lists, and reports drift and failures for one sync
//! cycle.

pub mod drift;

use std::time::Duration;

use crate::cluster::{ClusterClient, ClusterResource};
use crate::config::RepositoryConfig;
use crate::manifest::{self, Manifest};
use crate::metrics;
use crate::repository::RepositoryClient;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Repository(#[from] crate::repository::Error),

    #[error(transparent)]
    Cluster(#[from] crate::cluster::Error),
}

/// One failure encountered while reconciling a single resource. Failures
/// never abort the whole cycle; they're collected and attributed.
#[derive(Debug, Clone)]
pub struct SyncFailure {
    pub kind: String,
    pub name: String,
    pub cause: String,
}

#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub commit_sha: String,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub errors: Vec<SyncFailure>,
    pub drift: Vec<drift::DriftReport>,
}

impl SyncResult {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

pub struct Engine {
    name: String,
    namespace: String,
    manifest_dir: std::path::PathBuf,
    prune: bool,
    repository: RepositoryClient,
    cluster: ClusterClient,
}

impl Engine {
    pub fn new(config: &RepositoryConfig, cluster: ClusterClient) -> Self {
        let repository = RepositoryClient::new(&config.url, &config.branch, &config.local_path);
        Engine {
            name: config.name.clone(),
            namespace: config.namespace.clone(),
            manifest_dir: config.manifest_dir(),
            prune: config.prune,
            repository,
            cluster,
        }
    }

    pub fn ensure_clone(&self) -> Result<(), Error> {
        self.repository.ensure_clone().map_err(Into::into)
    }

    pub fn has_remote_changes(&self) -> Result<bool, Error> {
        self.repository.has_remote_changes().map_err(Into::into)
    }

    pub async fn ensure_namespace(&self) -> Result<(), Error> {
        self.cluster
            .ensure_namespace(&self.namespace)
            .await
            .map_err(Into::into)
    }

    /// Runs one full reconciliation cycle: pull, parse, apply, prune,
    /// detect drift. Never returns `Err` for per-resource failures; those
    /// are collected into `SyncResult::errors` so the caller can decide
    /// whether a partial sync is acceptable.
    #[tracing::instrument(skip(self), fields(repository = %self.name))]
    pub async fn sync(&self) -> Result<SyncResult, Error> {
        let started = std::time::Instant::now();
        let commit_sha = self.repository.pull()?;
        let mut manifests = manifest::load_dir(&self.manifest_dir);
        // Most manifests in Git omit `metadata.namespace` and rely on the
        // repository's configured target namespace; fill it in before the
        // identity key used for diff/apply/prune is computed from it.
        for m in &mut manifests {
            m.set_default_namespace(&self.namespace);
        }

        let managed = self.cluster.list_managed(&self.namespace).await?;
        let managed_by_key: std::collections::HashMap<_, _> =
            managed.iter().map(|r| (r.key(), r)).collect();

        let mut result = SyncResult {
            commit_sha,
            ..Default::default()
        };

        let mut applied_keys = std::collections::HashSet::new();
        for m in &manifests {
            applied_keys.insert(m.key());
            match self.apply_one(m).await {
                Ok(Some(changed)) => {
                    if changed {
                        result.updated.push(m.key());
                        metrics::RESOURCE_MANAGED_TOTAL
                            .with_label_values(&["applied", m.kind.as_str()])
                            .inc();
                    }
                    let before = managed_by_key
                        .get(&m.key())
                        .map(|resource| to_yaml(*resource))
                        .unwrap_or(serde_yaml::Value::Null);
                    let report = drift::detect(&m.key(), &m.body, &before);
                    if report.has_drift {
                        result.drift.push(report);
                    }
                }
                Ok(None) => {}
                Err(e) => result.errors.push(SyncFailure {
                    kind: m.kind.clone(),
                    name: m.name.clone(),
                    cause: e.to_string(),
                }),
            }
        }

        if self.prune {
            for resource in &managed {
                if applied_keys.contains(&resource.key()) || resource.prune_opted_out() {
                    continue;
                }
                match self
                    .cluster
                    .delete(
                        &resource.api_version,
                        &resource.kind,
                        resource.namespace.as_deref(),
                        &resource.name,
                    )
                    .await
                {
                    Ok(()) => {
                        result.deleted.push(resource.key());
                        metrics::RESOURCE_MANAGED_TOTAL
                            .with_label_values(&["deleted", resource.kind.as_str()])
                            .inc();
                    }
                    Err(e) => result.errors.push(SyncFailure {
                        kind: resource.kind.clone(),
                        name: resource.name.clone(),
                        cause: e.to_string(),
                    }),
                }
            }
        }

        self.record_metrics(&result, started.elapsed());
        Ok(result)
    }

    /// Applies `sync()` up to `policy.max_retries` times with exponential
    /// backoff, stopping early on the first attempt that completes
    /// without per-resource errors.
    pub async fn sync_with_retry(&self, policy: RetryPolicy) -> Result<SyncResult, Error> {
        let mut delay = policy.initial_delay;
        let mut last = self.sync().await?;
        let mut attempt = 0;
        while !last.succeeded() && attempt < policy.max_retries {
            attempt += 1;
            tracing::warn!(
                repository = %self.name,
                attempt,
                errors = last.errors.len(),
                "sync had errors, retrying"
            );
            tokio::time::sleep(delay).await;
            delay = std::cmp::min(delay * 2, policy.max_delay);
            last = self.sync().await?;
        }
        Ok(last)
    }

    async fn apply_one(&self, m: &Manifest) -> Result<Option<bool>, crate::cluster::Error> {
        let before = self
            .cluster
            .get(&m.api_version, &m.kind, m.namespace.as_deref(), &m.name)
            .await?;
        let after = self.cluster.apply(m).await?;
        let changed = before
            .map(|b| b.resource_version != after.resource_version)
            .unwrap_or(true);
        Ok(Some(changed))
    }

    fn record_metrics(&self, result: &SyncResult, elapsed: Duration) {
        let label = self.name.as_str();
        let status = if result.succeeded() { "success" } else { "failure" };
        metrics::SYNC_TOTAL.with_label_values(&[label, status]).inc();
        metrics::SYNC_DURATION
            .with_label_values(&[label])
            .observe(elapsed.as_secs_f64());
        if result.succeeded() {
            metrics::LAST_SYNC_TIMESTAMP
                .with_label_values(&[label])
                .set(chrono::Utc::now().timestamp() as f64);
        }
        metrics::DRIFT_DETECTED
            .with_label_values(&[label])
            .set(if result.drift.is_empty() { 0.0 } else { 1.0 });
    }
}

fn to_yaml(resource: &ClusterResource) -> serde_yaml::Value {
    serde_json::to_value(&resource.object)
        .ok()
        .and_then(|v| serde_yaml::to_string(&v).ok())
        .and_then(|s| serde_yaml::from_str(&s).ok())
        .unwrap_or(serde_yaml::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_defaults_match_original_controller() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn sync_result_succeeded_reflects_errors() {
        let mut result = SyncResult::default();
        assert!(result.succeeded());
        result.errors.push(SyncFailure {
            kind: "ConfigMap".into(),
            name: "a".into(),
            cause: "boom".into(),
        });
        assert!(!result.succeeded());
    }
}
