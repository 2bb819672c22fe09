//! Metric instrument factories.
//!
//! Instruments come from the globally registered `MeterProvider`; without
//! one they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("webtask-migrate")
}

/// Counter: remote call attempts.
/// Labels: `method`, `outcome` ("success" | "absent" | "retry" | "terminal" | "exhausted").
pub fn remote_calls() -> Counter<u64> {
    meter()
        .u64_counter("wt.remote.calls")
        .with_description("Remote call attempts by outcome")
        .build()
}

/// Counter: retries scheduled after a transient failure.
/// Labels: `method`.
pub fn remote_retries() -> Counter<u64> {
    meter()
        .u64_counter("wt.remote.retries")
        .with_description("Retries scheduled after transient failures")
        .build()
}

/// Histogram: single attempt duration in milliseconds.
/// Labels: `method`.
pub fn call_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("wt.remote.duration_ms")
        .with_description("Remote call attempt duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: tasks executed by a work queue.
/// Labels: `queue`, `outcome` ("ok" | "error").
pub fn queue_tasks() -> Counter<u64> {
    meter()
        .u64_counter("wt.queue.tasks")
        .with_description("Tasks executed by a work queue")
        .build()
}

/// Counter: modules resolved by a provisioner.
/// Labels: `result` ("available" | "failed" | "cached").
pub fn modules_provisioned() -> Counter<u64> {
    meter()
        .u64_counter("wt.modules.provisioned")
        .with_description("Modules resolved by provisioning")
        .build()
}

/// Counter: webtasks enumerated by a downloader.
/// Labels: `result` ("downloaded" | "skipped" | "error").
pub fn webtasks_enumerated() -> Counter<u64> {
    meter()
        .u64_counter("wt.webtasks.enumerated")
        .with_description("Webtasks enumerated by a downloader")
        .build()
}
