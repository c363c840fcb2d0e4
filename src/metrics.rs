//! Process-global Prometheus registry and the series this controller
//! exposes at `GET /metrics`. One registry for the whole process, shared
//! by every repository's engine, not one per engine.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static SYNC_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("gitops_sync_total", "Total number of sync attempts"),
        &["repository", "status"],
    )
    .expect("metric names are valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric is registered once");
    c
});

pub static SYNC_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let h = HistogramVec::new(
        HistogramOpts::new(
            "gitops_sync_duration_seconds",
            "Duration of a sync cycle in seconds",
        )
        .buckets(prometheus::linear_buckets(0.0, 10.0, 10).expect("valid buckets")),
        &["repository"],
    )
    .expect("metric names are valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric is registered once");
    h
});

pub static RESOURCE_MANAGED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "gitops_resource_managed_total",
            "Total number of resources applied or deleted, by operation and kind",
        ),
        &["operation", "kind"],
    )
    .expect("metric names are valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric is registered once");
    c
});

pub static LAST_SYNC_TIMESTAMP: Lazy<GaugeVec> = Lazy::new(|| {
    let g = GaugeVec::new(
        Opts::new(
            "gitops_last_sync_timestamp",
            "Unix timestamp of the last successful sync per repository",
        ),
        &["repository"],
    )
    .expect("metric names are valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric is registered once");
    g
});

pub static DRIFT_DETECTED: Lazy<GaugeVec> = Lazy::new(|| {
    let g = GaugeVec::new(
        Opts::new(
            "gitops_drift_detected",
            "1 if drift was detected on the last sync for this repository, else 0",
        ),
        &["repository"],
    )
    .expect("metric names are valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric is registered once");
    g
});

/// Force every metric to register, so `/metrics` is non-empty before the
/// first sync runs.
pub fn init() {
    Lazy::force(&SYNC_TOTAL);
    Lazy::force(&SYNC_DURATION);
    Lazy::force(&RESOURCE_MANAGED_TOTAL);
    Lazy::force(&LAST_SYNC_TIMESTAMP);
    Lazy::force(&DRIFT_DETECTED);
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&metric_families, &mut buf)
        .expect("prometheus text encoding never fails for well-formed metrics");
    buf
}
