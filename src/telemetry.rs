//! Telemetry logic.
//! Support logging and metrics.

use metrics::Unit;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_FILTER: &str = "info";

/// Install a global `fmt` subscriber filtered by `RUST_LOG`.
///
/// Fails when a global subscriber is already set.
pub fn setup_logging() -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
}

/// Describe counters emitted by the stores to the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "membership_authentications_total",
        Unit::Count,
        "Credential checks by outcome."
    );
    metrics::describe_counter!(
        "membership_role_snapshot_loads_total",
        Unit::Count,
        "Role snapshots loaded by cached role stores."
    );
}
