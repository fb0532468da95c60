//! Core runner: commands, tasks, groups, pools, and the error taxonomy.

pub mod command;
pub mod error;
pub mod group;
pub mod pool;
pub mod task;

pub use command::{register, Command, CommandHandle, DEFAULT_GROUP, DEFAULT_POOL};
pub use error::CommandError;
pub use group::Group;
pub use pool::{shutdown_all, Pool, PoolMetrics, PoolStats};
pub use task::{Task, TaskState};
