//! Crate-wide error type. Each component also exposes its own `Error` (see
//! `repository`, `manifest`, `cluster`, `engine`, `webhook`, `config`) so
//! that a `SyncResult` can attribute a failure to the stage that produced
//! it; this type unifies them for callers that just want one `Result`.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::Error),

    #[error("repository error: {0}")]
    Repository(#[from] crate::repository::Error),

    #[error("cluster error: {0}")]
    Cluster(#[from] crate::cluster::Error),

    #[error("engine error: {0}")]
    Engine(#[from] crate::engine::Error),

    #[error("webhook server error: {0}")]
    Webhook(#[from] crate::webhook::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
