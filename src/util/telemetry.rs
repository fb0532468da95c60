//! Telemetry bootstrap for the runner's structured logging.
//!
//! Pools, groups, and tasks all log through `tracing` with structured
//! fields (`pool`, `group`, `command`, `task`). Embedders that install
//! their own subscriber keep full control; [`init_tracing`] is for
//! binaries and tests that just want the runner's logs on stderr.

use tracing_subscriber::EnvFilter;

/// Install a default `fmt` subscriber unless one is already set.
///
/// The filter honors `RUST_LOG`; without it, the runner's own events show
/// at `info` and everything else stays at `warn`, so worker churn and
/// sink evictions are visible without drowning an embedding application.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,bulkhead=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
