//! Metric instrument factories for keyq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"keyq"` meter. Without an
//! installed provider they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for keyq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("keyq")
}

/// Counter: queue operations.
/// Labels: `operation` ("enqueue" | "grant" | "defer" | "confirm" | "release").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("keyq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: confirms or releases for messages the worker did not hold.
/// Labels: `action`.
pub fn protocol_violations() -> Counter<u64> {
    meter()
        .u64_counter("keyq.queue.protocol_violations")
        .with_description("Confirm/release calls for messages not held by the caller")
        .build()
}

/// Counter: in-flight messages reclaimed after their lease expired.
pub fn lease_reclaims() -> Counter<u64> {
    meter()
        .u64_counter("keyq.queue.lease_reclaims")
        .with_description("In-flight messages reclaimed after lease expiry")
        .build()
}

/// Counter: store apply results.
/// Labels: `operation`, `result` ("ok" | "error").
pub fn store_applies() -> Counter<u64> {
    meter()
        .u64_counter("keyq.store.applies")
        .with_description("Operations applied to the store")
        .build()
}

/// Histogram: store apply duration in milliseconds.
/// Labels: `operation`.
pub fn apply_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("keyq.store.apply_duration_ms")
        .with_description("Store apply duration in milliseconds")
        .with_unit("ms")
        .build()
}
