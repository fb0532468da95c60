//! # bulkhead
//!
//! A latency-and-fault-tolerance command runner. Callers define
//! *commands* — units of work with a primary action, an optional
//! fallback, and an optional cleanup — and submit *tasks* to bounded
//! worker pools. The runner provides asynchronous submission, synchronous
//! result retrieval with timeouts, cooperative cancellation, and
//! fallback-on-failure semantics.
//!
//! ## Core pieces
//!
//! - **Commands and tasks**: the [`Command`] trait describes the work;
//!   registering one with its [`Group`] yields a [`CommandHandle`] that
//!   creates [`Task`] execution attempts.
//! - **Pools**: bounded FIFO queues with elastic worker sets, capped in
//!   queue depth and concurrency, with idle workers reaped.
//! - **Groups**: process-wide namespaces mapping command and pool names.
//! - **Telemetry**: an event bus fanning structured events out to sinks,
//!   and rolling-window counters for throughput.
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use bulkhead::{register, Command};
//!
//! struct Halve;
//!
//! impl Command for Halve {
//!     type Args = i64;
//!     type Output = i64;
//!
//!     fn run(&self, v: &i64) -> anyhow::Result<i64> {
//!         Ok(v / 2)
//!     }
//!
//!     fn fallback(&self, _v: &i64) -> Option<anyhow::Result<i64>> {
//!         Some(Ok(0))
//!     }
//! }
//!
//! let halve = register(Halve)?;
//! assert_eq!(halve.task(10).result(None)?, 5);
//! # Ok::<(), bulkhead::CommandError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

/// Builders to construct scheduler components from configuration.
pub mod builders;
/// Configuration models for pools and the runner.
pub mod config;
/// Core runner: commands, tasks, groups, pools, errors.
pub mod core;
/// Telemetry event bus and sinks.
pub mod events;
/// Rolling-window counters for throughput telemetry.
pub mod metrics;
/// Shared utilities.
pub mod util;

pub use crate::config::{PoolConfig, RunnerConfig};
pub use crate::core::{
    register, Command, CommandError, CommandHandle, Group, Pool, PoolStats, Task, TaskState,
};
pub use crate::events::{emit, sink, Event, EventBus, FnSink, Sink};
pub use crate::metrics::{CounterSnapshot, RollingCounter};

/// Shut down every pool (blocking) and drain the root event bus.
///
/// The explicit replacement for a process-exit hook: call it once when the
/// process is done submitting work.
pub fn shutdown() {
    core::pool::shutdown_all(true);
    events::root().shutdown();
}
