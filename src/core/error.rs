//! Error taxonomy for command definition, submission, and execution.

use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by the command runner.
///
/// The enum is `Clone` because a task's recorded error outlives the failure:
/// it sits in the task's error slot and every waiter observes it. Arbitrary
/// user failures from `run` are carried by value in the [`Run`] variant.
///
/// [`Run`]: CommandError::Run
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// A command definition could not be registered.
    #[error("command setup failed: {0}")]
    Setup(String),

    /// An internal lifecycle invariant was violated.
    #[error("task integrity violated: {0}")]
    Integrity(String),

    /// A registry lookup produced a definition of a different type.
    #[error("command type mismatch: {0}")]
    Type(String),

    /// A command name collided within its group.
    #[error("command name {name:?} already registered in group {group:?}")]
    Name {
        /// The colliding command name.
        name: String,
        /// The group the registration targeted.
        group: String,
    },

    /// The task was canceled before producing a result.
    #[error("task canceled")]
    Cancelled,

    /// The task was canceled by a result-retrieval timeout.
    #[error("task timed out")]
    Timeout,

    /// A pool-side failure outside the closed/full cases.
    #[error("executor failure: {0}")]
    Executor(String),

    /// The pool named by a command is not registered with its group.
    #[error("executor {executor:?} not defined for group {group:?}")]
    ExecutorNotFound {
        /// The requested pool name.
        executor: String,
        /// The group consulted.
        group: String,
    },

    /// No command with the requested name exists in the group.
    #[error("command {command:?} not defined for group {group:?}")]
    NotFound {
        /// The requested command name.
        command: String,
        /// The group consulted.
        group: String,
    },

    /// The target pool has been shut down.
    #[error("pool {0:?} is closed")]
    PoolClosed(String),

    /// The target pool's queue is at capacity.
    #[error("queue full on pool {0:?}")]
    QueueFull(String),

    /// An arbitrary failure returned (or panicked) by user `run` code.
    #[error("{0}")]
    Run(Arc<anyhow::Error>),
}

impl CommandError {
    /// The user error carried by a [`Run`](CommandError::Run) failure.
    pub fn as_run(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Run(inner) => Some(inner),
            _ => None,
        }
    }

    /// Whether this error is the timeout cancellation marker.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<anyhow::Error> for CommandError {
    fn from(error: anyhow::Error) -> Self {
        Self::Run(Arc::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = CommandError::ExecutorNotFound {
            executor: "gpu".to_string(),
            group: "default".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "executor \"gpu\" not defined for group \"default\""
        );

        let err = CommandError::QueueFull("default".to_string());
        assert_eq!(err.to_string(), "queue full on pool \"default\"");
    }

    #[test]
    fn run_errors_keep_the_user_message_and_downcast() {
        #[derive(Debug, thiserror::Error)]
        #[error("division by zero")]
        struct DivisionByZero;

        let err = CommandError::from(anyhow::Error::new(DivisionByZero));
        assert_eq!(err.to_string(), "division by zero");
        assert!(err
            .as_run()
            .map(|e| e.downcast_ref::<DivisionByZero>().is_some())
            .unwrap_or(false));
        assert!(!err.is_timeout());
        assert!(CommandError::Timeout.is_timeout());
    }

    #[test]
    fn cloned_errors_share_the_run_cause() {
        let err = CommandError::from(anyhow::anyhow!("boom"));
        let clone = err.clone();
        assert_eq!(err.to_string(), clone.to_string());
    }
}
