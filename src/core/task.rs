//! Task lifecycle: one execution attempt of a command.
//!
//! A task moves NEW → PENDING → RUNNING → SUCCEEDED | FAILED, with two
//! shortcuts: a cancel in NEW or PENDING fails the task before any worker
//! touches it, and a cancel while RUNNING fails the task immediately while
//! the worker's eventual outcome is discarded. The completion signal fires
//! exactly once, at the moment a terminal state is entered, and is the
//! happens-before barrier for everything the worker wrote.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::core::command::{Command, CommandSeat};
use crate::core::error::CommandError;
use crate::core::pool::{Pool, Runnable};

/// Lifecycle states of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Constructed but not submitted.
    New,
    /// Queued, waiting for a worker.
    Pending,
    /// A worker is executing `run`.
    Running,
    /// `run` completed and its value is recorded.
    Succeeded,
    /// The task failed, was canceled, or timed out.
    Failed,
}

impl TaskState {
    /// Terminal states keep their result or error forever.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Fallback progress. `Claimed` marks the in-flight attempt so the
/// fallback runs at most once even when several waiters race to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FallbackState {
    New,
    Claimed,
    Succeeded,
    Failed,
}

struct TaskCore<R> {
    state: TaskState,
    canceled: bool,
    result: Option<R>,
    error: Option<CommandError>,
    fallback: FallbackState,
    fallback_result: Option<R>,
    fallback_error: Option<CommandError>,
    pool: Option<Pool>,
}

pub(crate) struct TaskShared<C: Command> {
    id: u64,
    seat: Arc<CommandSeat<C>>,
    args: C::Args,
    core: Mutex<TaskCore<C::Output>>,
    signal: Condvar,
    completed: AtomicBool,
}

static TASK_IDS: AtomicU64 = AtomicU64::new(0);

/// Handle to a single execution attempt of a command.
///
/// Cloning is cheap; every clone observes the same attempt. The handle is
/// also returned from [`submit`](Task::submit) so calls can be chained.
pub struct Task<C: Command> {
    shared: Arc<TaskShared<C>>,
}

impl<C: Command> Clone for Task<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Command> Task<C> {
    pub(crate) fn new(seat: Arc<CommandSeat<C>>, args: C::Args) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                id: TASK_IDS.fetch_add(1, Ordering::Relaxed),
                seat,
                args,
                core: Mutex::new(TaskCore {
                    state: TaskState::New,
                    canceled: false,
                    result: None,
                    error: None,
                    fallback: FallbackState::New,
                    fallback_result: None,
                    fallback_error: None,
                    pool: None,
                }),
                signal: Condvar::new(),
                completed: AtomicBool::new(false),
            }),
        }
    }

    /// Process-unique task id.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Name of the command this task executes.
    pub fn command_name(&self) -> &str {
        &self.shared.seat.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.shared.core.lock().state
    }

    /// Queue the task on its command's pool. Submitting an already
    /// submitted task has no effect; the handle is returned either way.
    ///
    /// A pool-resolution failure leaves the task NEW and resubmittable. A
    /// rejection by the pool (closed or full) fails the task — with the
    /// completion signal fired and the rejection recorded — so that
    /// fallback semantics apply, and the rejection is also returned.
    pub fn submit(&self) -> Result<Task<C>, CommandError> {
        if self.shared.core.lock().state != TaskState::New {
            return Ok(self.clone());
        }
        // Resolve the executor before touching task state.
        let pool = self.shared.seat.group.get_executor(&self.shared.seat.pool)?;
        {
            let mut core = self.shared.core.lock();
            if core.state != TaskState::New {
                return Ok(self.clone());
            }
            core.state = TaskState::Pending;
            core.pool = Some(pool.clone());
        }
        debug!(
            task = self.shared.id,
            command = %self.shared.seat.name,
            pool = %self.shared.seat.pool,
            "task submitted"
        );
        if let Err(rejection) = pool.enqueue(self.shared.clone()) {
            let mut core = self.shared.core.lock();
            if core.state == TaskState::Pending {
                core.state = TaskState::Failed;
                core.error = Some(rejection.clone());
                self.shared.fire_completion(&mut core);
            }
            return Err(rejection);
        }
        Ok(self.clone())
    }

    /// Abandon an unfinished task and wake every waiter.
    ///
    /// The task fails with `error` (default [`CommandError::Cancelled`])
    /// and is removed from its pool's queue if still there. Returns true
    /// when the cancel landed before `run` started (NEW or PENDING); a
    /// RUNNING task is failed too, but the worker keeps going and its
    /// eventual outcome is discarded. Terminal tasks are unaffected.
    pub fn cancel(&self, error: Option<CommandError>) -> bool {
        let (early, pool) = {
            let mut core = self.shared.core.lock();
            match core.state {
                TaskState::New | TaskState::Pending | TaskState::Running => {
                    let early = core.state != TaskState::Running;
                    core.error = Some(error.unwrap_or(CommandError::Cancelled));
                    core.state = TaskState::Failed;
                    core.canceled = true;
                    self.shared.fire_completion(&mut core);
                    (early, core.pool.clone())
                }
                TaskState::Succeeded | TaskState::Failed => return false,
            }
        };
        debug!(task = self.shared.id, early, "task canceled");
        if let Some(pool) = pool {
            pool.dequeue(self.shared.id);
        }
        early
    }

    /// Wait for the task to complete. Returns whether it is complete,
    /// regardless of outcome. Does not submit.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut core = self.shared.core.lock();
        match timeout {
            None => {
                while !core.state.is_terminal() {
                    self.shared.signal.wait(&mut core);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !core.state.is_terminal() {
                    if self
                        .shared
                        .signal
                        .wait_until(&mut core, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
            }
        }
        core.state.is_terminal()
    }

    /// Submit the task if needed and return the result as soon as it is
    /// available. A failure (including cancellation and timeout) falls
    /// back to the command's fallback value when one is defined; otherwise
    /// the original error is returned.
    ///
    /// When no result arrives within `timeout`, the task is canceled with
    /// [`CommandError::Timeout`]. Use [`wait`](Task::wait) to wait without
    /// canceling.
    pub fn result(&self, timeout: Option<Duration>) -> Result<C::Output, CommandError> {
        if let Err(error) = self.submit() {
            // Resolution failures leave the task NEW with nothing to fall
            // back from; pool rejections fall through to the failure path.
            if !self.is_completed() {
                return Err(error);
            }
        }
        if !self.wait(timeout) {
            self.cancel(Some(CommandError::Timeout));
        }
        {
            let core = self.shared.core.lock();
            if core.state == TaskState::Succeeded {
                return core
                    .result
                    .clone()
                    .ok_or_else(|| CommandError::Integrity("succeeded task has no result".into()));
            }
        }
        if self.try_fallback() {
            let core = self.shared.core.lock();
            core.fallback_result
                .clone()
                .ok_or_else(|| CommandError::Integrity("successful fallback has no result".into()))
        } else {
            let core = self.shared.core.lock();
            Err(core
                .error
                .clone()
                .unwrap_or_else(|| CommandError::Integrity("failed task has no error".into())))
        }
    }

    /// The recorded failure, if any. When the task is not complete yet,
    /// this drives it to completion exactly like [`result`](Task::result)
    /// and then reports the recorded error, swallowing the raised one.
    pub fn exception(&self, timeout: Option<Duration>) -> Option<CommandError> {
        if !self.shared.completed.load(Ordering::Acquire) {
            let _ = self.result(timeout);
        }
        self.shared.core.lock().error.clone()
    }

    /// Whether `run` is executing right now.
    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    /// Whether the task reached a terminal state.
    pub fn is_completed(&self) -> bool {
        self.shared.completed.load(Ordering::Acquire)
    }

    /// Whether `run` completed successfully.
    pub fn is_success(&self) -> bool {
        self.state() == TaskState::Succeeded
    }

    /// Whether the task failed, was canceled, or timed out.
    pub fn is_failure(&self) -> bool {
        self.state() == TaskState::Failed
    }

    /// Whether the task was canceled or timed out.
    pub fn is_canceled(&self) -> bool {
        self.shared.core.lock().canceled
    }

    /// Whether the recorded failure is the timeout marker.
    pub fn is_timeout(&self) -> bool {
        self.shared
            .core
            .lock()
            .error
            .as_ref()
            .is_some_and(CommandError::is_timeout)
    }

    /// Whether the result originates from the fallback. Triggers the
    /// fallback attempt on a failed task.
    pub fn is_fallback(&self) -> bool {
        self.try_fallback()
    }

    /// Whether a result is available: the next [`result`](Task::result)
    /// call will not block and not fail. Triggers the fallback attempt on
    /// a failed task.
    pub fn has_result(&self) -> bool {
        self.is_success() || self.is_fallback()
    }

    /// The failure recorded by an unsuccessful fallback attempt, if any.
    pub fn fallback_exception(&self) -> Option<CommandError> {
        self.shared.core.lock().fallback_error.clone()
    }

    /// Run the fallback at most once, on the first caller that observes
    /// the failure. The user callback executes outside the task lock;
    /// racing observers block until the outcome is cached. Returns whether
    /// a fallback result is available.
    fn try_fallback(&self) -> bool {
        {
            let mut core = self.shared.core.lock();
            loop {
                if core.state != TaskState::Failed {
                    return false;
                }
                match core.fallback {
                    FallbackState::Succeeded => return true,
                    FallbackState::Failed => return false,
                    FallbackState::Claimed => self.shared.signal.wait(&mut core),
                    FallbackState::New => {
                        core.fallback = FallbackState::Claimed;
                        break;
                    }
                }
            }
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.shared.seat.command.fallback(&self.shared.args)
        }));
        let mut core = self.shared.core.lock();
        let succeeded = match outcome {
            Ok(None) => {
                core.fallback = FallbackState::Failed;
                false
            }
            Ok(Some(Ok(value))) => {
                core.fallback_result = Some(value);
                core.fallback = FallbackState::Succeeded;
                true
            }
            Ok(Some(Err(error))) => {
                error!(
                    task = self.shared.id,
                    command = %self.shared.seat.name,
                    error = %error,
                    "fallback failed"
                );
                core.fallback_error = Some(CommandError::from(error));
                core.fallback = FallbackState::Failed;
                false
            }
            Err(_) => {
                error!(
                    task = self.shared.id,
                    command = %self.shared.seat.name,
                    "fallback panicked"
                );
                core.fallback_error =
                    Some(CommandError::from(anyhow::anyhow!("fallback panicked")));
                core.fallback = FallbackState::Failed;
                false
            }
        };
        self.shared.signal.notify_all();
        succeeded
    }
}

impl<C: Command> std::fmt::Debug for Task<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.shared.id)
            .field("command", &self.shared.seat.name)
            .field("state", &self.state())
            .finish()
    }
}

impl<C: Command> TaskShared<C> {
    /// Fires the one-shot completion signal. Must be called with the task
    /// lock held, exactly when a terminal state is entered.
    fn fire_completion(&self, _core: &mut TaskCore<C::Output>) {
        self.completed.store(true, Ordering::Release);
        self.signal.notify_all();
    }
}

impl<C: Command> Runnable for TaskShared<C> {
    fn task_id(&self) -> u64 {
        self.id
    }

    fn exec(&self) {
        {
            let mut core = self.core.lock();
            if core.state != TaskState::Pending {
                // Canceled before pickup.
                return;
            }
            core.state = TaskState::Running;
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| self.seat.command.run(&self.args)));
        let outcome = match outcome {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("command {} panicked", self.seat.name)),
        };
        if let Err(error) = &outcome {
            error!(
                task = self.id,
                command = %self.seat.name,
                group = %self.seat.group.name(),
                error = %error,
                "command failed"
            );
        }
        {
            let mut core = self.core.lock();
            if core.state == TaskState::Running {
                match outcome {
                    Ok(value) => {
                        core.state = TaskState::Succeeded;
                        core.result = Some(value);
                    }
                    Err(error) => {
                        core.state = TaskState::Failed;
                        core.error = Some(CommandError::from(error));
                    }
                }
                self.fire_completion(&mut core);
            }
            // Already FAILED here means a cancel landed mid-run: the
            // outcome is discarded.
        }
        let cleaned = match catch_unwind(AssertUnwindSafe(|| self.seat.command.cleanup())) {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("cleanup panicked")),
        };
        if let Err(error) = cleaned {
            warn!(
                task = self.id,
                command = %self.seat.name,
                error = %error,
                "command cleanup failed"
            );
        }
    }

    fn abort(&self, error: CommandError) {
        let mut core = self.core.lock();
        if core.state.is_terminal() {
            return;
        }
        core.state = TaskState::Failed;
        core.canceled = true;
        core.error = Some(error);
        self.fire_completion(&mut core);
    }
}
