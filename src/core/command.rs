//! Command definitions and registration handles.
//!
//! A [`Command`] describes a unit of work: a required `run`, an optional
//! `fallback` producing a substitute result when `run` fails, and an
//! optional `cleanup` that always executes after `run` returns on the
//! worker. Registering a command with its declared [`Group`] yields a
//! [`CommandHandle`], the factory for [`Task`] execution attempts.

use std::any::type_name;
use std::sync::Arc;

use crate::core::error::CommandError;
use crate::core::group::Group;
use crate::core::task::Task;

/// Name of the group commands belong to unless they declare otherwise.
pub const DEFAULT_GROUP: &str = "default";

/// Name of the pool commands run on unless they declare otherwise.
pub const DEFAULT_POOL: &str = "default";

/// A unit of work with fallback and cleanup capabilities.
///
/// `run` receives the arguments captured when the task was created and is
/// the only required behavior. `fallback` is invoked lazily with the same
/// arguments after a failure, at most once per task; returning `None`
/// means the command defines no fallback. `cleanup` runs on the worker
/// after every `run`, regardless of outcome; its errors are logged and
/// swallowed.
pub trait Command: Send + Sync + 'static {
    /// Arguments captured at task construction and handed to `run` and
    /// `fallback` by reference.
    type Args: Send + Sync + 'static;

    /// Result type. `Clone` because every waiter on a task receives the
    /// value.
    type Output: Clone + Send + 'static;

    /// Command name, unique within its group. Defaults to the short type
    /// name.
    fn name(&self) -> &'static str
    where
        Self: Sized,
    {
        short_type_name::<Self>()
    }

    /// Name of the group this command registers with.
    fn group(&self) -> &str {
        DEFAULT_GROUP
    }

    /// Name of the pool tasks of this command run on.
    fn pool(&self) -> &str {
        DEFAULT_POOL
    }

    /// The primary action.
    fn run(&self, args: &Self::Args) -> anyhow::Result<Self::Output>;

    /// Substitute result after a failure. `None` means not defined.
    fn fallback(&self, args: &Self::Args) -> Option<anyhow::Result<Self::Output>> {
        let _ = args;
        None
    }

    /// Post-execution hook, always run on the worker after `run` returns.
    fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// A registered command: the definition plus its resolved bindings.
pub(crate) struct CommandSeat<C: Command> {
    pub(crate) command: C,
    pub(crate) name: String,
    pub(crate) group: Group,
    pub(crate) pool: String,
}

/// Typed handle to a registered command. Cheap to clone; the task factory.
pub struct CommandHandle<C: Command> {
    pub(crate) seat: Arc<CommandSeat<C>>,
}

impl<C: Command> Clone for CommandHandle<C> {
    fn clone(&self) -> Self {
        Self {
            seat: Arc::clone(&self.seat),
        }
    }
}

impl<C: Command> CommandHandle<C> {
    /// The resolved command name.
    pub fn name(&self) -> &str {
        &self.seat.name
    }

    /// The group this command is bound to.
    pub fn group(&self) -> &Group {
        &self.seat.group
    }

    /// The pool tasks of this command run on.
    pub fn pool_name(&self) -> &str {
        &self.seat.pool
    }

    /// Create a task: one execution attempt with `args` captured for the
    /// task's lifetime.
    pub fn task(&self, args: C::Args) -> Task<C> {
        Task::new(Arc::clone(&self.seat), args)
    }
}

impl<C: Command> std::fmt::Debug for CommandHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandle")
            .field("name", &self.seat.name)
            .field("group", &self.seat.group.name())
            .field("pool", &self.seat.pool)
            .finish()
    }
}

/// Register `command` with its declared group, creating the group if
/// needed. Equivalent to `Group::named(command.group()).register(command)`.
pub fn register<C: Command>(command: C) -> Result<CommandHandle<C>, CommandError> {
    Group::named(command.group()).register(command)
}
