//! HTTP surface: `POST /webhook` accepts a push notification and wakes the
//! matching repository's poller, `GET /metrics` exposes the Prometheus
//! registry, `GET /health`/`GET /ready` are liveness/readiness probes.

mod auth;

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use serde::Deserialize;
use warp::{http::StatusCode, Filter, Rejection, Reply};

use crate::metrics;
use crate::poller::Trigger;

pub use auth::Error as AuthError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("webhook server failed to bind: {0}")]
    Bind(#[from] std::io::Error),
}

/// Triggers keyed by repository name; a push payload without a `ref` we
/// recognize fans out to every repository, since push routing by clone URL
/// is left as a future refinement.
pub type Triggers = Arc<BTreeMap<String, Trigger>>;

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    repository: Option<RepositoryInfo>,
}

#[derive(Debug, Deserialize)]
struct RepositoryInfo {
    #[serde(alias = "clone_url", alias = "url")]
    clone_url: Option<String>,
}

pub fn routes(
    triggers: Triggers,
    secret: Option<Arc<String>>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    webhook(triggers, secret)
        .or(metrics_route())
        .or(health())
        .or(ready())
        .recover(handle_rejection)
}

fn webhook(
    triggers: Triggers,
    secret: Option<Arc<String>>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::post()
        .and(warp::path("webhook"))
        .and(warp::path::end())
        .and(warp::body::content_length_limit(1024 * 1024))
        .and(auth::verify_signature(secret))
        .and(with_triggers(triggers))
        .and_then(handle_push)
}

fn metrics_route() -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::get()
        .and(warp::path("metrics"))
        .and(warp::path::end())
        .map(|| {
            warp::reply::with_header(
                metrics::gather(),
                "content-type",
                "text/plain; version=0.0.4",
            )
        })
}

fn health() -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::get()
        .and(warp::path("health"))
        .and(warp::path::end())
        .map(|| StatusCode::OK)
}

fn ready() -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::get()
        .and(warp::path("ready"))
        .and(warp::path::end())
        .map(|| StatusCode::OK)
}

fn with_triggers(
    triggers: Triggers,
) -> impl Filter<Extract = (Triggers,), Error = Infallible> + Clone {
    warp::any().map(move || triggers.clone())
}

#[tracing::instrument(skip(body, triggers))]
async fn handle_push(body: bytes::Bytes, triggers: Triggers) -> Result<impl Reply, Infallible> {
    let payload: PushPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unparseable webhook payload");
            return Ok(StatusCode::BAD_REQUEST);
        }
    };

    if let Some(git_ref) = &payload.git_ref {
        if !git_ref.starts_with("refs/heads/") {
            tracing::debug!(%git_ref, "ignoring non-branch ref");
            return Ok(StatusCode::OK);
        }
    }

    // Per-repository routing by clone URL is left as a future refinement;
    // every push fans out to every configured repository's poller.
    let _clone_url = payload.repository.and_then(|r| r.clone_url);
    for trigger in triggers.values() {
        trigger.fire();
    }

    Ok(StatusCode::ACCEPTED)
}

/// Maps `verify_signature`'s rejections to `401 Unauthorized`. Without this,
/// an unsigned or mismatched webhook request falls through to warp's default
/// rejection handling and comes back as a `500`.
async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    if let Some(err) = err.find::<AuthError>() {
        return Ok(warp::reply::with_status(err.to_string(), StatusCode::UNAUTHORIZED));
    }
    if err.is_not_found() {
        return Ok(warp::reply::with_status(
            "not found".to_owned(),
            StatusCode::NOT_FOUND,
        ));
    }
    tracing::warn!(?err, "unhandled rejection");
    Ok(warp::reply::with_status(
        "internal server error".to_owned(),
        StatusCode::INTERNAL_SERVER_ERROR,
    ))
}
