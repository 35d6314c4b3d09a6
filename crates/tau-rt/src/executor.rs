use std::cell::RefCell;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_task::Runnable;
use concurrent_queue::ConcurrentQueue;
use futures::task::ArcWake;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::reactor::Reactor;
use crate::task::{JoinHandle, TaskSet};

/// Ready tasks polled before the reactor gets a turn, so timers still fire
/// while a busy task keeps rescheduling itself.
const TICK_BUDGET: usize = 128;

pub(crate) struct Shared {
    /// Ready queue: tasks whose wakers have fired.
    queue: ConcurrentQueue<Runnable>,
    pub(crate) reactor: Reactor,
    tasks: Arc<TaskSet>,
    stopping: AtomicBool,
}

thread_local! {
    static CURRENT: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

/// A single-threaded task executor.
///
/// The executor is driven by whichever thread calls [`Executor::run`] or
/// [`Executor::block_on`]; tasks are only ever polled on that thread.
/// Submission from other threads goes through [`Handle`].
pub struct Executor {
    shared: Arc<Shared>,
}

/// Cloneable, thread-safe handle to an [`Executor`].
#[derive(Clone)]
pub struct Handle {
    pub(crate) shared: Arc<Shared>,
}

/// Schedule function for async-task: pushes a runnable into the ready queue
/// and unparks the driving thread. Holds the executor weakly so a queued
/// runnable never keeps its own executor alive.
fn scheduler(shared: &Arc<Shared>) -> impl Fn(Runnable) + Send + Sync + 'static {
    let shared = Arc::downgrade(shared);
    move |runnable| {
        // Executor gone: dropping the runnable cancels the task.
        let Some(shared) = shared.upgrade() else {
            return;
        };
        // A closed queue hands the runnable back; dropping it cancels the task.
        if shared.queue.push(runnable).is_ok() {
            if let Err(err) = shared.reactor.notify() {
                warn!(%err, "failed to unpark executor");
            }
        }
    }
}

impl Executor {
    pub fn new() -> Result<Self> {
        Ok(Executor {
            shared: Arc::new(Shared {
                queue: ConcurrentQueue::unbounded(),
                reactor: Reactor::new()?,
                tasks: Arc::new(TaskSet::new()),
                stopping: AtomicBool::new(false),
            }),
        })
    }

    pub fn handle(&self) -> Handle {
        Handle {
            shared: self.shared.clone(),
        }
    }

    /// Pop one ready task and run it. Returns true if a task was polled.
    pub fn try_tick(&self) -> bool {
        match self.shared.queue.pop() {
            Ok(runnable) => {
                runnable.run();
                true
            }
            Err(_) => false,
        }
    }

    /// Drive the executor until [`Handle::stop`] is called, then shut down.
    ///
    /// Shutdown cancels every task that is still outstanding and keeps
    /// driving the executor until all of them have been dropped, so their
    /// `Drop` cleanup has run by the time this returns. Runnables that show
    /// up after that are discarded.
    pub fn run(&self) -> Result<()> {
        let _enter = self.enter();
        debug!("executor loop started");
        let result = self.run_until_stopped();
        self.shutdown();
        result
    }

    fn run_until_stopped(&self) -> Result<()> {
        while !self.is_stopping() {
            let mut did_work = false;
            for _ in 0..TICK_BUDGET {
                if self.is_stopping() || !self.try_tick() {
                    break;
                }
                did_work = true;
            }

            // Non-blocking if we just did work (there might be more tasks
            // after wakers fire), park otherwise.
            let timeout = if did_work { Some(Duration::ZERO) } else { None };
            self.shared.reactor.react(timeout)?;
        }
        Ok(())
    }

    fn shutdown(&self) {
        debug!("executor stop requested");
        let outstanding = self.shared.tasks.cancel_all();
        if outstanding > 0 {
            debug!(outstanding, "cancelling outstanding tasks");
        }

        if let Err(err) = self.block_on(self.shared.tasks.drained()) {
            warn!(%err, "executor failed while draining cancelled tasks");
        }

        self.shared.queue.close();
        let mut discarded = 0usize;
        while let Ok(runnable) = self.shared.queue.pop() {
            drop(runnable);
            discarded += 1;
        }
        debug!(discarded, "executor shut down");
    }

    /// Drive the executor and reactor until the given future completes.
    ///
    /// The future itself is polled in place on this thread, so it does not
    /// need to be `Send` or `'static`.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        let _enter = self.enter();

        let root = Arc::new(RootWaker {
            woken: AtomicBool::new(true),
            shared: Arc::downgrade(&self.shared),
        });
        let waker = futures::task::waker(root.clone());
        let mut cx = Context::from_waker(&waker);
        let mut future = pin!(future);

        loop {
            if root.woken.swap(false, Ordering::AcqRel) {
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return Ok(output);
                }
            }

            let mut did_work = false;
            for _ in 0..TICK_BUDGET {
                if !self.try_tick() {
                    break;
                }
                did_work = true;
            }

            let timeout = if did_work || root.woken.load(Ordering::Acquire) {
                Some(Duration::ZERO)
            } else {
                None
            };
            self.shared.reactor.react(timeout)?;
        }
    }

    fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    /// Bind this executor as the current one for the calling thread.
    fn enter(&self) -> EnterGuard {
        let previous = CURRENT.with(|current| current.borrow_mut().replace(self.handle()));
        EnterGuard { previous }
    }
}

/// Restores the previously bound executor on drop.
struct EnterGuard {
    previous: Option<Handle>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Waker for the future passed to `block_on`.
struct RootWaker {
    woken: AtomicBool,
    shared: Weak<Shared>,
}

impl ArcWake for RootWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.woken.store(true, Ordering::Release);
        if let Some(shared) = arc_self.shared.upgrade() {
            let _ = shared.reactor.notify();
        }
    }
}

impl Handle {
    /// The executor bound to the calling thread, if any.
    pub fn current() -> Option<Handle> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Spawn a future onto the executor. Callable from any thread.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if !self.is_running() {
            return Err(Error::Shutdown);
        }
        let (tracked, abort) = self.shared.tasks.track(future);
        let (runnable, task) = async_task::spawn(tracked, scheduler(&self.shared));
        trace!("task spawned");
        runnable.schedule(); // Push to queue for first poll.
        Ok(JoinHandle::new(task.fallible(), abort))
    }

    /// Ask the executor loop to stop. Thread-safe; returns immediately.
    ///
    /// Emits no events, so it is safe to call from a process-exit handler
    /// where the calling thread's locals are already gone. The loop logs
    /// the stop on its own thread.
    pub fn stop(&self) {
        if !self.shared.stopping.swap(true, Ordering::AcqRel) {
            // A failed notify only delays the stop until the next wakeup.
            let _ = self.shared.reactor.notify();
        }
    }

    /// True until [`Handle::stop`] has been called.
    pub fn is_running(&self) -> bool {
        !self.shared.stopping.load(Ordering::Acquire)
    }

    /// Spawned tasks whose futures have not been dropped yet.
    pub fn pending_tasks(&self) -> usize {
        self.shared.tasks.len()
    }

    pub fn pending_timers(&self) -> usize {
        self.shared.reactor.pending_timers()
    }

    /// Whether both handles refer to the same executor.
    pub fn ptr_eq(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

/// Spawn a future onto the executor bound to the calling thread.
pub fn spawn<F>(future: F) -> Result<JoinHandle<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Handle::current().ok_or(Error::NoExecutor)?.spawn(future)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::sleep;
    use std::sync::atomic::AtomicU64;
    use std::thread;
    use std::time::Instant;

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Run an executor on its own thread, returning its handle.
    fn spawn_executor() -> (Handle, thread::JoinHandle<Result<()>>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let thread = thread::spawn(move || {
            let executor = Executor::new()?;
            tx.send(executor.handle()).unwrap();
            executor.run()
        });
        (rx.recv().unwrap(), thread)
    }

    // ── Spawn + tick ────────────────────────────────────────────────

    #[test]
    fn spawn_and_tick_increments_counter() {
        let executor = Executor::new().unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        let counter_clone = counter.clone();

        let _task = executor
            .handle()
            .spawn(async move {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(executor.try_tick(), "should have had a task to run");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn try_tick_empty_queue() {
        let executor = Executor::new().unwrap();
        assert!(!executor.try_tick(), "no tasks should be in queue");
    }

    // ── block_on ────────────────────────────────────────────────────

    #[test]
    fn block_on_immediate() {
        let executor = Executor::new().unwrap();
        assert_eq!(executor.block_on(async { 5 }).unwrap(), 5);
    }

    #[test]
    fn block_on_with_timer() {
        let executor = Executor::new().unwrap();

        let start = Instant::now();
        executor
            .block_on(sleep(Duration::from_millis(20)))
            .unwrap();
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(20),
            "timer fired too early: {:?}",
            elapsed
        );
        // Allow generous tolerance for CI.
        assert!(
            elapsed <= Duration::from_millis(500),
            "timer fired too late: {:?}",
            elapsed
        );
    }

    #[test]
    fn block_on_awaits_spawned_task() {
        let executor = Executor::new().unwrap();
        let output = executor
            .block_on(async {
                let task = spawn(async {
                    sleep(Duration::from_millis(5)).await;
                    "done"
                })
                .unwrap();
                task.await
            })
            .unwrap();
        assert_eq!(output.unwrap(), "done");
    }

    #[test]
    fn current_is_bound_only_inside_executor() {
        assert!(Handle::current().is_none());
        let executor = Executor::new().unwrap();
        let inside = executor
            .block_on(async { Handle::current().map(|h| h.ptr_eq(&executor.handle())) })
            .unwrap();
        assert_eq!(inside, Some(true));
        assert!(Handle::current().is_none());
    }

    #[test]
    fn spawn_outside_executor_fails() {
        assert!(matches!(spawn(async {}), Err(Error::NoExecutor)));
    }

    // ── Cross-thread run loop ───────────────────────────────────────

    #[test]
    fn foreign_thread_spawn_wakes_executor() {
        let (handle, thread) = spawn_executor();

        let (tx, rx) = std::sync::mpsc::channel();
        handle
            .spawn(async move {
                sleep(Duration::from_millis(5)).await;
                tx.send(thread::current().id()).unwrap();
            })
            .unwrap();

        let ran_on = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_ne!(ran_on, thread::current().id());

        handle.stop();
        thread.join().unwrap().unwrap();
    }

    #[test]
    fn spawn_after_stop_is_rejected() {
        let (handle, thread) = spawn_executor();
        handle.stop();
        thread.join().unwrap().unwrap();

        assert!(!handle.is_running());
        assert!(matches!(handle.spawn(async {}), Err(Error::Shutdown)));
    }

    #[test]
    fn stop_cancels_outstanding_tasks_and_runs_cleanup() {
        let (handle, thread) = spawn_executor();
        let cleaned_up = Arc::new(AtomicBool::new(false));
        let guard = SetOnDrop(cleaned_up.clone());
        let (started_tx, started_rx) = std::sync::mpsc::channel();

        let task = handle
            .spawn(async move {
                let _guard = guard;
                started_tx.send(()).unwrap();
                sleep(Duration::from_secs(60)).await;
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(handle.pending_tasks(), 1);

        let start = Instant::now();
        handle.stop();
        thread.join().unwrap().unwrap();

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(cleaned_up.load(Ordering::SeqCst), "cleanup should run before run() returns");
        assert_eq!(handle.pending_tasks(), 0);
        assert_eq!(handle.pending_timers(), 0);
        assert!(task.is_finished());
        assert!(matches!(futures::executor::block_on(task), Err(Error::Cancelled)));
    }

    #[test]
    fn abort_cancels_a_running_task() {
        let executor = Executor::new().unwrap();
        let handle = executor.handle();
        let task = handle
            .spawn(async {
                sleep(Duration::from_secs(60)).await;
                1
            })
            .unwrap();
        task.abort();

        let output = executor.block_on(task).unwrap();
        assert!(matches!(output, Err(Error::Cancelled)));
        assert_eq!(handle.pending_tasks(), 0);
    }

    #[test]
    fn dropped_join_handle_detaches() {
        let executor = Executor::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        drop(
            executor
                .handle()
                .spawn(async move {
                    ran_clone.store(true, Ordering::SeqCst);
                })
                .unwrap(),
        );

        while executor.try_tick() {}
        assert!(ran.load(Ordering::SeqCst));
    }
}
