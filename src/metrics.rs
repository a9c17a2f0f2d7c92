//! Prometheus metrics for fuzz-run observability.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter,
    IntGauge,
};

lazy_static! {
    /// Time to open a device session (runtime init through queue creation).
    pub static ref SESSION_OPEN_DURATION: Histogram = register_histogram!(
        "hsafuzz_session_open_duration_seconds",
        "Time to open a device session"
    )
    .unwrap();

    /// Dispatch packets successfully submitted.
    pub static ref DISPATCHES_SUBMITTED: IntCounter = register_int_counter!(
        "hsafuzz_dispatches_submitted_total",
        "Kernel dispatch packets submitted"
    )
    .unwrap();

    /// Dispatches rejected before or at submission.
    pub static ref DISPATCH_FAILURES: IntCounter = register_int_counter!(
        "hsafuzz_dispatch_failures_total",
        "Dispatches that failed before or at submission"
    )
    .unwrap();

    /// Buffers currently tracked by open sessions.
    pub static ref TRACKED_BUFFERS: IntGauge = register_int_gauge!(
        "hsafuzz_tracked_buffers",
        "Buffers currently tracked by open sessions"
    )
    .unwrap();

    /// Memory-pool allocations rejected.
    pub static ref ALLOCATION_FAILURES: IntCounter = register_int_counter!(
        "hsafuzz_allocation_failures_total",
        "Memory-pool allocations rejected"
    )
    .unwrap();
}
