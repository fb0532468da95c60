//! End-to-end tests for the command/task lifecycle.
//!
//! Every test registers its commands in a test-specific group so the
//! process-wide registries never collide across parallel tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bulkhead::{register, Command, CommandError, TaskState};
use crossbeam_channel::{bounded, Receiver, Sender};

/// Poll `cond` until it holds or five seconds pass.
fn eventually(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

// ============================================================================
// Synchronous success
// ============================================================================

struct Echo;

impl Command for Echo {
    type Args = i64;
    type Output = i64;

    fn group(&self) -> &str {
        "cmd-sync"
    }

    fn run(&self, v: &i64) -> anyhow::Result<i64> {
        Ok(*v)
    }
}

#[test]
fn sync_success() {
    let echo = register(Echo).unwrap();
    assert_eq!(echo.task(5).result(None).unwrap(), 5);
    assert_eq!(echo.task(6).result(None).unwrap(), 6);

    let task = echo.task(7);
    assert!(task.result(None).is_ok());
    assert!(task.is_success());
    assert!(!task.is_failure());
    assert!(!task.is_canceled());
    assert!(task.has_result());
    assert!(task.exception(None).is_none());
}

#[test]
fn result_twice_returns_the_same_value() {
    struct EchoTwice;

    impl Command for EchoTwice {
        type Args = i64;
        type Output = i64;

        fn group(&self) -> &str {
            "cmd-result-twice"
        }

        fn run(&self, v: &i64) -> anyhow::Result<i64> {
            Ok(*v)
        }
    }

    let handle = register(EchoTwice).unwrap();
    let task = handle.task(9);
    assert_eq!(task.result(None).unwrap(), 9);
    assert_eq!(task.result(None).unwrap(), 9);
}

#[test]
fn submit_twice_is_a_no_op() {
    struct EchoAgain;

    impl Command for EchoAgain {
        type Args = i64;
        type Output = i64;

        fn group(&self) -> &str {
            "cmd-submit-twice"
        }

        fn run(&self, v: &i64) -> anyhow::Result<i64> {
            Ok(*v)
        }
    }

    let handle = register(EchoAgain).unwrap();
    let task = handle.task(3);
    assert_eq!(task.submit().unwrap().id(), task.id());
    assert_eq!(task.submit().unwrap().id(), task.id());
    assert_eq!(task.result(None).unwrap(), 3);
}

// ============================================================================
// Asynchronous execution and state observation
// ============================================================================

struct Waiter {
    started: Sender<()>,
    release: Receiver<()>,
}

impl Command for Waiter {
    type Args = i64;
    type Output = i64;

    fn group(&self) -> &str {
        "cmd-async"
    }

    fn run(&self, v: &i64) -> anyhow::Result<i64> {
        let _ = self.started.send(());
        let _ = self.release.recv();
        Ok(*v)
    }
}

#[test]
fn async_execute_observes_running_state() {
    let (started_tx, started_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let handle = register(Waiter {
        started: started_tx,
        release: release_rx,
    })
    .unwrap();

    let task = handle.task(5);
    assert_eq!(task.state(), TaskState::New);
    assert!(!task.is_running());
    assert!(!task.is_completed());

    let submitted = task.submit().unwrap();
    assert_eq!(submitted.id(), task.id());

    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(task.is_running());
    assert!(!task.is_completed());

    release_tx.send(()).unwrap();
    assert_eq!(task.result(None).unwrap(), 5);
    assert!(!task.is_running());
    assert!(task.is_completed());
}

// ============================================================================
// Fallback semantics
// ============================================================================

struct Divide;

impl Command for Divide {
    type Args = i64;
    type Output = i64;

    fn group(&self) -> &str {
        "cmd-fallback"
    }

    fn run(&self, v: &i64) -> anyhow::Result<i64> {
        if *v == 0 {
            anyhow::bail!("division by zero");
        }
        Ok(10 / v)
    }

    fn fallback(&self, _v: &i64) -> Option<anyhow::Result<i64>> {
        Some(Ok(0))
    }
}

#[test]
fn fallback_on_error() {
    let divide = register(Divide).unwrap();
    assert_eq!(divide.task(2).result(None).unwrap(), 5);
    assert_eq!(divide.task(0).result(None).unwrap(), 0);

    let task = divide.task(0);
    assert_eq!(task.result(None).unwrap(), 0);
    assert!(task.is_failure());
    assert!(task.is_fallback());
    assert!(task.has_result());
}

#[test]
fn no_fallback_surfaces_the_original_error() {
    struct DivideBare;

    impl Command for DivideBare {
        type Args = i64;
        type Output = i64;

        fn group(&self) -> &str {
            "cmd-no-fallback"
        }

        fn run(&self, v: &i64) -> anyhow::Result<i64> {
            if *v == 0 {
                anyhow::bail!("division by zero");
            }
            Ok(10 / v)
        }
    }

    let divide = register(DivideBare).unwrap();
    assert_eq!(divide.task(2).result(None).unwrap(), 5);

    let err = divide.task(0).result(None).unwrap_err();
    assert!(err.to_string().contains("division by zero"));

    let exc = divide.task(0).exception(None);
    assert!(exc.is_some_and(|e| e.to_string().contains("division by zero")));

    let task = divide.task(0);
    let _ = task.result(None);
    assert!(!task.is_fallback());
    assert!(!task.has_result());
}

#[test]
fn failing_fallback_reraises_the_original_error() {
    struct DivideBrokenFallback;

    impl Command for DivideBrokenFallback {
        type Args = i64;
        type Output = i64;

        fn group(&self) -> &str {
            "cmd-broken-fallback"
        }

        fn run(&self, v: &i64) -> anyhow::Result<i64> {
            if *v == 0 {
                anyhow::bail!("division by zero");
            }
            Ok(10 / v)
        }

        fn fallback(&self, _v: &i64) -> Option<anyhow::Result<i64>> {
            Some(Err(anyhow::anyhow!("fallback broken")))
        }
    }

    let divide = register(DivideBrokenFallback).unwrap();
    assert_eq!(divide.task(2).result(None).unwrap(), 5);

    let task = divide.task(0);
    // The observable error stays the run error, not the fallback's.
    let err = task.result(None).unwrap_err();
    assert!(err.to_string().contains("division by zero"));
    let fb = task.fallback_exception();
    assert!(fb.is_some_and(|e| e.to_string().contains("fallback broken")));
}

#[test]
fn fallback_runs_at_most_once() {
    struct CountedFallback {
        calls: Arc<AtomicUsize>,
    }

    impl Command for CountedFallback {
        type Args = ();
        type Output = i64;

        fn group(&self) -> &str {
            "cmd-fallback-once"
        }

        fn run(&self, _args: &()) -> anyhow::Result<i64> {
            anyhow::bail!("always fails");
        }

        fn fallback(&self, _args: &()) -> Option<anyhow::Result<i64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(Ok(11))
        }
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let handle = register(CountedFallback {
        calls: Arc::clone(&calls),
    })
    .unwrap();

    let task = handle.task(());
    assert_eq!(task.result(None).unwrap(), 11);
    assert_eq!(task.result(None).unwrap(), 11);
    assert!(task.is_fallback());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn early_cancel_completes_the_task() {
    struct Idle;

    impl Command for Idle {
        type Args = ();
        type Output = ();

        fn group(&self) -> &str {
            "cmd-cancel"
        }

        fn run(&self, _args: &()) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let handle = register(Idle).unwrap();
    let task = handle.task(());
    assert!(task.cancel(None));
    assert!(task.is_completed());
    assert!(task.is_canceled());
    assert!(!task.is_running());
    assert!(matches!(task.exception(None), Some(CommandError::Cancelled)));
    assert!(matches!(
        task.result(None),
        Err(CommandError::Cancelled)
    ));
    // Terminal tasks are unaffected by further cancels.
    assert!(!task.cancel(None));
}

#[test]
fn cancel_during_run_discards_the_outcome() {
    struct Hang {
        started: Sender<()>,
        release: Receiver<()>,
        finished: Arc<AtomicUsize>,
    }

    impl Command for Hang {
        type Args = ();
        type Output = i64;

        fn group(&self) -> &str {
            "cmd-midrun-cancel"
        }

        fn run(&self, _args: &()) -> anyhow::Result<i64> {
            let _ = self.started.send(());
            let _ = self.release.recv();
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(99)
        }
    }

    let (started_tx, started_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let finished = Arc::new(AtomicUsize::new(0));
    let handle = register(Hang {
        started: started_tx,
        release: release_rx,
        finished: Arc::clone(&finished),
    })
    .unwrap();

    let task = handle.task(());
    task.submit().unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(task.is_running());

    // Cancel lands while run() executes: not early.
    assert!(!task.cancel(None));
    assert!(task.is_completed());
    assert!(task.is_canceled());

    // Let the worker finish; its result must be discarded.
    release_tx.send(()).unwrap();
    assert!(eventually(|| finished.load(Ordering::SeqCst) == 1));
    assert!(task.is_failure());
    assert!(!task.is_success());
    assert!(matches!(task.result(None), Err(CommandError::Cancelled)));
}

// ============================================================================
// Timeouts
// ============================================================================

struct Sleepy;

impl Command for Sleepy {
    type Args = i64;
    type Output = i64;

    fn group(&self) -> &str {
        "cmd-timeout"
    }

    fn run(&self, v: &i64) -> anyhow::Result<i64> {
        std::thread::sleep(Duration::from_secs(1));
        Ok(*v)
    }
}

#[test]
fn result_timeout_cancels_the_task() {
    let sleepy = register(Sleepy).unwrap();

    let task = sleepy.task(5);
    let err = task.result(Some(Duration::from_millis(100))).unwrap_err();
    assert!(matches!(err, CommandError::Timeout));
    assert!(task.is_timeout());
    assert!(task.is_canceled());
    assert!(task.is_failure());

    let task = sleepy.task(6);
    assert!(matches!(
        task.exception(Some(Duration::from_millis(100))),
        Some(CommandError::Timeout)
    ));
}

#[test]
fn timeout_falls_back_when_defined() {
    struct SleepyWithFallback;

    impl Command for SleepyWithFallback {
        type Args = i64;
        type Output = String;

        fn group(&self) -> &str {
            "cmd-timeout-fallback"
        }

        fn run(&self, _v: &i64) -> anyhow::Result<String> {
            std::thread::sleep(Duration::from_secs(1));
            Ok("primary".to_string())
        }

        fn fallback(&self, _v: &i64) -> Option<anyhow::Result<String>> {
            Some(Ok("fallback".to_string()))
        }
    }

    let handle = register(SleepyWithFallback).unwrap();
    let task = handle.task(5);
    assert_eq!(
        task.result(Some(Duration::from_millis(100))).unwrap(),
        "fallback"
    );
    assert!(task.is_timeout());
    assert!(task.is_fallback());
}

#[test]
fn wait_does_not_cancel() {
    struct SlowEcho;

    impl Command for SlowEcho {
        type Args = i64;
        type Output = i64;

        fn group(&self) -> &str {
            "cmd-wait"
        }

        fn run(&self, v: &i64) -> anyhow::Result<i64> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(*v)
        }
    }

    let handle = register(SlowEcho).unwrap();
    let task = handle.task(8);
    task.submit().unwrap();
    assert!(!task.wait(Some(Duration::from_millis(20))));
    assert!(!task.is_canceled());
    // The task is still alive and finishes normally.
    assert_eq!(task.result(None).unwrap(), 8);
}

// ============================================================================
// Cleanup universality
// ============================================================================

struct Cleaning {
    hits: Arc<AtomicUsize>,
    fail_run: bool,
    fallback_kind: u8, // 0 = none, 1 = ok, 2 = err
}

impl Command for Cleaning {
    type Args = ();
    type Output = i64;

    fn group(&self) -> &str {
        "cmd-cleanup"
    }

    fn run(&self, _args: &()) -> anyhow::Result<i64> {
        if self.fail_run {
            anyhow::bail!("run failed");
        }
        Ok(1)
    }

    fn fallback(&self, _args: &()) -> Option<anyhow::Result<i64>> {
        match self.fallback_kind {
            1 => Some(Ok(5)),
            2 => Some(Err(anyhow::anyhow!("fallback failed"))),
            _ => None,
        }
    }

    fn cleanup(&self) -> anyhow::Result<()> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn cleanup_scenario(
    name: &'static str,
    fail_run: bool,
    fallback_kind: u8,
) -> (bulkhead::CommandHandle<Named<Cleaning>>, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let handle = register(Named {
        name,
        inner: Cleaning {
            hits: Arc::clone(&hits),
            fail_run,
            fallback_kind,
        },
    })
    .unwrap();
    (handle, hits)
}

/// Wrapper giving an inner command an explicit registration name.
struct Named<C> {
    name: &'static str,
    inner: C,
}

impl<C: Command> Command for Named<C> {
    type Args = C::Args;
    type Output = C::Output;

    fn name(&self) -> &'static str {
        self.name
    }

    fn group(&self) -> &str {
        self.inner.group()
    }

    fn pool(&self) -> &str {
        self.inner.pool()
    }

    fn run(&self, args: &Self::Args) -> anyhow::Result<Self::Output> {
        self.inner.run(args)
    }

    fn fallback(&self, args: &Self::Args) -> Option<anyhow::Result<Self::Output>> {
        self.inner.fallback(args)
    }

    fn cleanup(&self) -> anyhow::Result<()> {
        self.inner.cleanup()
    }
}

#[test]
fn cleanup_runs_exactly_once_per_scenario() {
    // Success.
    let (handle, hits) = cleanup_scenario("CleanupSuccess", false, 0);
    assert_eq!(handle.task(()).result(None).unwrap(), 1);
    assert!(eventually(|| hits.load(Ordering::SeqCst) == 1));

    // Run error, no fallback.
    let (handle, hits) = cleanup_scenario("CleanupRunError", true, 0);
    assert!(handle.task(()).exception(None).is_some());
    assert!(eventually(|| hits.load(Ordering::SeqCst) == 1));

    // Run error, successful fallback.
    let (handle, hits) = cleanup_scenario("CleanupFallbackOk", true, 1);
    assert_eq!(handle.task(()).result(None).unwrap(), 5);
    assert!(eventually(|| hits.load(Ordering::SeqCst) == 1));

    // Run error, failing fallback.
    let (handle, hits) = cleanup_scenario("CleanupFallbackErr", true, 2);
    assert!(handle.task(()).exception(None).is_some());
    assert!(eventually(|| hits.load(Ordering::SeqCst) == 1));

    // Exactly once: give workers a moment to double-fire if they would.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn cleanup_errors_are_swallowed() {
    struct NoisyCleanup;

    impl Command for NoisyCleanup {
        type Args = ();
        type Output = i64;

        fn group(&self) -> &str {
            "cmd-noisy-cleanup"
        }

        fn run(&self, _args: &()) -> anyhow::Result<i64> {
            Ok(2)
        }

        fn cleanup(&self) -> anyhow::Result<()> {
            anyhow::bail!("cleanup exploded");
        }
    }

    let handle = register(NoisyCleanup).unwrap();
    assert_eq!(handle.task(()).result(None).unwrap(), 2);
}

#[test]
fn cleanup_skipped_when_run_never_started() {
    let (handle, hits) = cleanup_scenario("CleanupNeverRan", false, 0);
    let task = handle.task(());
    assert!(task.cancel(None));
    assert!(matches!(task.result(None), Err(CommandError::Cancelled)));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Panicking commands
// ============================================================================

#[test]
fn panicking_run_fails_the_task() {
    struct Explosive;

    impl Command for Explosive {
        type Args = ();
        type Output = i64;

        fn group(&self) -> &str {
            "cmd-panic"
        }

        fn run(&self, _args: &()) -> anyhow::Result<i64> {
            panic!("kaboom");
        }
    }

    let handle = register(Explosive).unwrap();
    let task = handle.task(());
    let err = task.result(None).unwrap_err();
    assert!(err.to_string().contains("panicked"));
    assert!(task.is_failure());
}

// ============================================================================
// Unknown pool
// ============================================================================

#[test]
fn unknown_pool_fails_resolution() {
    struct Orphan;

    impl Command for Orphan {
        type Args = ();
        type Output = ();

        fn group(&self) -> &str {
            "cmd-orphan"
        }

        fn pool(&self) -> &str {
            "undefined"
        }

        fn run(&self, _args: &()) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let handle = register(Orphan).unwrap();
    let task = handle.task(());
    let err = task.result(None).unwrap_err();
    assert!(matches!(err, CommandError::ExecutorNotFound { .. }));
    // Resolution failures leave the task NEW and resubmittable.
    assert_eq!(task.state(), TaskState::New);
}
