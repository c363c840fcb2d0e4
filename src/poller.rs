//! Ticks a repository's engine on its configured interval, and also wakes
//! on webhook-delivered push notifications. Both trigger sources feed the
//! same `Notify`, so a webhook arriving mid-cycle just schedules one more
//! run rather than queuing N runs — the trigger is idempotent, collapsing
//! is correct.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::engine::{Engine, RetryPolicy, SyncResult};

/// Shared handle a webhook handler or any other trigger source can hold to
/// wake the poller early.
#[derive(Clone)]
pub struct Trigger {
    notify: Arc<Notify>,
}

impl Trigger {
    pub fn fire(&self) {
        self.notify.notify_one();
    }
}

/// Tracks the commit a poller last synced without error. Exists separately
/// from `Poller` so the latch-advances-only-on-success rule can be tested
/// without standing up a real `Engine`.
#[derive(Default)]
struct CommitLatch {
    last: tokio::sync::Mutex<Option<String>>,
}

impl CommitLatch {
    fn new() -> Self {
        CommitLatch::default()
    }

    async fn is_set(&self) -> bool {
        self.last.lock().await.is_some()
    }

    /// Advances the latch to `result.commit_sha` only when the sync
    /// succeeded; a partial failure leaves the previous commit latched so
    /// the next tick retries against it.
    async fn record(&self, result: &SyncResult) {
        if result.succeeded() {
            let mut last = self.last.lock().await;
            *last = Some(result.commit_sha.clone());
        } else {
            tracing::warn!(
                commit = %result.commit_sha,
                errors = result.errors.len(),
                "sync cycle completed with errors"
            );
        }
    }
}

pub struct Poller {
    engine: Arc<Engine>,
    interval: Duration,
    retry_policy: RetryPolicy,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    last_commit: CommitLatch,
}

impl Poller {
    pub fn new(engine: Arc<Engine>, interval: Duration, retry_policy: RetryPolicy) -> Self {
        Poller {
            engine,
            interval,
            retry_policy,
            notify: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            last_commit: CommitLatch::new(),
        }
    }

    pub fn trigger(&self) -> Trigger {
        Trigger {
            notify: self.notify.clone(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs until `cancel_token()` is cancelled. Only advances the commit
    /// latch on a successful sync, matching the original poller's
    /// behavior of retrying against the same commit until it applies
    /// cleanly.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("poller shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_if_changed().await;
                }
                _ = self.notify.notified() => {
                    self.run_if_changed().await;
                }
            }
        }
    }

    async fn run_if_changed(&self) {
        let changed = match self.engine.has_remote_changes() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "failed to check repository for changes");
                true
            }
        };
        if !changed && self.last_commit.is_set().await {
            return;
        }

        match self.engine.sync_with_retry(self.retry_policy).await {
            Ok(result) => self.last_commit.record(&result).await,
            Err(e) => tracing::error!(error = %e, "sync cycle failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SyncFailure;

    fn succeeded(commit_sha: &str) -> SyncResult {
        SyncResult {
            commit_sha: commit_sha.to_owned(),
            ..Default::default()
        }
    }

    fn failed(commit_sha: &str) -> SyncResult {
        SyncResult {
            commit_sha: commit_sha.to_owned(),
            errors: vec![SyncFailure {
                kind: "ConfigMap".into(),
                name: "a".into(),
                cause: "boom".into(),
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn latch_is_unset_until_first_successful_sync() {
        let latch = CommitLatch::new();
        assert!(!latch.is_set().await);
    }

    #[tokio::test]
    async fn latch_advances_on_success() {
        let latch = CommitLatch::new();
        latch.record(&succeeded("abc123")).await;
        assert!(latch.is_set().await);
    }

    #[tokio::test]
    async fn latch_does_not_advance_on_failure() {
        let latch = CommitLatch::new();
        latch.record(&failed("abc123")).await;
        assert!(!latch.is_set().await);
    }

    #[tokio::test]
    async fn latch_keeps_prior_commit_after_a_later_failure() {
        let latch = CommitLatch::new();
        latch.record(&succeeded("abc123")).await;
        latch.record(&failed("def456")).await;
        assert_eq!(latch.last.lock().await.as_deref(), Some("abc123"));
    }
}
