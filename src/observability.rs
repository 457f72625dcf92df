use std::net::SocketAddr;

// ── Engine metrics ──────────────────────────────────────────────

/// Counter: reserve attempts. Labels: depth, outcome.
pub const RESERVATIONS_TOTAL: &str = "holdtree_reservations_total";

/// Counter: releases. Labels: outcome.
pub const RELEASES_TOTAL: &str = "holdtree_releases_total";

/// Counter: anomalies found while releasing. Labels: kind.
pub const RELEASE_ANOMALIES_TOTAL: &str = "holdtree_release_anomalies_total";

/// Counter: reservation id collisions.
pub const COLLISIONS_TOTAL: &str = "holdtree_collisions_total";

/// Histogram: reserve latency in seconds.
pub const RESERVE_DURATION_SECONDS: &str = "holdtree_reserve_duration_seconds";

/// Histogram: release latency in seconds, whole tree included.
pub const RELEASE_DURATION_SECONDS: &str = "holdtree_release_duration_seconds";

/// Counter: counter entries updated. Labels: family.
pub const COUNTER_UPDATES_TOTAL: &str = "holdtree_counter_updates_total";

// ── Expiry pipeline ─────────────────────────────────────────────

/// Counter: expiry events seen by the watcher. Labels: kind (reservation, other).
pub const EXPIRY_EVENTS_TOTAL: &str = "holdtree_expiry_events_total";

/// Counter: watcher resubscriptions after a dropped subscription.
pub const EXPIRY_RESUBSCRIBES_TOTAL: &str = "holdtree_expiry_resubscribes_total";

/// Gauge: releases currently running in the worker.
pub const RELEASES_IN_FLIGHT: &str = "holdtree_releases_in_flight";

/// Counter: tasks skipped because the same reservation was already being released.
pub const RELEASE_TASKS_DEDUPED_TOTAL: &str = "holdtree_release_tasks_deduped_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Label for reservation depth.
pub fn depth_label(depth: crate::model::Depth) -> &'static str {
    match depth {
        crate::model::Depth::Root => "root",
        crate::model::Depth::Child => "child",
    }
}
