//! Structured logging setup. Call once, from `main`, before anything else
//! runs.

use tracing_subscriber::fmt::format::FmtSpan;

pub fn init() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "gitops_reconciler=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .init();
}
