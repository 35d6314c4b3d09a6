use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use futures::future::{join_all, try_join_all};
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::{self, EngineHandle};
use crate::error::Error;
use crate::exit::{self, ExitKey};
use crate::task::{IntoTask, Task};

/// Lifecycle of a [`Runner`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Created,
    Running,
    Closing,
    Closed,
}

struct Lifecycle {
    state: RunnerState,
    thread: Option<thread::JoinHandle<()>>,
    exited: Option<Receiver<()>>,
    exit_key: Option<ExitKey>,
}

pub(crate) struct Inner {
    engine: EngineHandle,
    thread_id: ThreadId,
    join_timeout: Duration,
    lifecycle: Mutex<Lifecycle>,
}

/// Runs async tasks on a dedicated engine thread and blocks the caller until
/// they finish.
///
/// A runner owns one engine and the thread driving it. Any number of threads
/// may submit work concurrently through [`run`](Runner::run) and the gather
/// variants. Submitting from the engine thread itself is refused with
/// [`Error::Deadlock`] instead of hanging.
///
/// Cloning is cheap and every clone refers to the same engine. The runner
/// stays alive until [`close`](Runner::close) is called or the process
/// exits, even if every clone has been dropped; use
/// [`scoped`](Runner::scoped) to tie it to a scope.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<Inner>,
}

/// Weak counterpart of [`Runner`]; never keeps the engine alive.
#[derive(Clone, Default)]
pub(crate) struct WeakRunner {
    inner: Weak<Inner>,
}

impl WeakRunner {
    pub(crate) fn upgrade(&self) -> Option<Runner> {
        self.inner.upgrade().map(|inner| Runner { inner })
    }
}

impl Runner {
    /// Start a runner configured from the environment.
    ///
    /// Blocks until the engine loop is up, so work can be submitted as soon
    /// as this returns.
    pub fn new() -> Result<Self, Error> {
        Self::with_config(Config::from_env())
    }

    pub fn with_config(config: Config) -> Result<Self, Error> {
        let started = engine::start(&config)?;
        let thread_id = started.id();

        let inner = Arc::new(Inner {
            engine: started.handle,
            thread_id,
            join_timeout: config.join_timeout(),
            lifecycle: Mutex::new(Lifecycle {
                state: RunnerState::Created,
                thread: Some(started.thread),
                exited: Some(started.exited),
                exit_key: None,
            }),
        });

        let at_exit = inner.clone();
        let exit_key = exit::register(move || at_exit.close());
        {
            let mut lifecycle = inner.lifecycle.lock();
            lifecycle.exit_key = Some(exit_key);
            lifecycle.state = RunnerState::Running;
        }

        info!(engine = %config.engine(), thread = ?thread_id, "runner started");
        Ok(Runner { inner })
    }

    /// Start a runner that is closed when the returned guard goes out of
    /// scope, including during unwinding.
    pub fn scoped() -> Result<ScopedRunner, Error> {
        Ok(Self::new()?.into_scoped())
    }

    pub fn into_scoped(self) -> ScopedRunner {
        ScopedRunner { runner: self }
    }

    /// Run `task` on the engine thread and block until it finishes.
    ///
    /// With a `timeout`, the caller stops waiting once it elapses: the task
    /// is asked to cancel and [`Error::Timeout`] is returned at once, while
    /// the task may still be unwinding on the engine thread.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] if the runner has been closed.
    /// - [`Error::Deadlock`] if called from the engine thread.
    /// - [`Error::InvalidTask`] if the task was aborted before submission.
    /// - [`Error::Timeout`] if `timeout` elapsed first.
    /// - [`Error::Task`] with the task's own error if it failed.
    /// - [`Error::Panicked`] or [`Error::Cancelled`] if it did not finish.
    pub fn run<T>(
        &self,
        task: T,
        timeout: Option<Duration>,
    ) -> Result<T::Output, Error<T::Error>>
    where
        T: IntoTask,
    {
        let task = task.into_task();
        self.check_submit()?;
        check_valid(&task)?;
        self.submit(task, timeout)
    }

    /// Run every task concurrently and collect their values in input order.
    ///
    /// The first failure is returned and the remaining tasks are cancelled.
    /// Preconditions and `timeout` apply to the whole batch. An empty batch
    /// returns an empty vector without involving the engine.
    pub fn gather<I>(
        &self,
        tasks: I,
        timeout: Option<Duration>,
    ) -> Result<Vec<<I::Item as IntoTask>::Output>, Error<<I::Item as IntoTask>::Error>>
    where
        I: IntoIterator,
        I::Item: IntoTask,
    {
        self.check_submit()?;
        let tasks = collect_tasks(tasks)?;
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let batch = Task::from_outcome(try_join_all(tasks.into_iter().map(Task::execute)));
        self.submit(batch, timeout)
    }

    /// Like [`gather`](Runner::gather), but every position holds that task's
    /// own outcome. Task failures, panics and cancellations land in the
    /// vector; only whole-call failures such as a timeout are returned as
    /// the outer error.
    #[allow(clippy::type_complexity)]
    pub fn gather_settled<I>(
        &self,
        tasks: I,
        timeout: Option<Duration>,
    ) -> Result<
        Vec<Result<<I::Item as IntoTask>::Output, Error<<I::Item as IntoTask>::Error>>>,
        Error<<I::Item as IntoTask>::Error>,
    >
    where
        I: IntoIterator,
        I::Item: IntoTask,
    {
        self.check_submit()?;
        let tasks = collect_tasks(tasks)?;
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let batch = Task::from_outcome(join_all(tasks.into_iter().map(Task::execute)).map(Ok));
        self.submit(batch, timeout)
    }

    /// The engine driving this runner.
    ///
    /// Only the thread-safe handle operations (spawn, stop, status queries)
    /// should be used from outside the engine thread. Stopping the engine
    /// directly leaves the runner open but unable to run anything.
    pub fn engine(&self) -> &EngineHandle {
        &self.inner.engine
    }

    /// Stop the engine and wait for its thread to exit.
    ///
    /// Outstanding tasks are cancelled and their cleanup has run on the
    /// engine thread before it exits. The wait is bounded by
    /// [`Config::join_timeout`]; if the thread lingers past it, a warning is
    /// logged and the runner is marked closed anyway. Calling this again, or
    /// concurrently from several threads, is a no-op. Called from the engine
    /// thread it stops the engine without waiting.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn state(&self) -> RunnerState {
        self.inner.lifecycle.lock().state
    }

    /// True until [`close`](Runner::close) is called.
    pub fn is_open(&self) -> bool {
        self.state() == RunnerState::Running
    }

    /// Open and the engine loop still running.
    pub fn is_running(&self) -> bool {
        self.is_open() && self.inner.engine.is_running()
    }

    /// Identity of the engine thread.
    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread_id
    }

    pub(crate) fn downgrade(&self) -> WeakRunner {
        WeakRunner {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn check_submit<E>(&self) -> Result<(), Error<E>> {
        if !self.is_open() {
            error!("submission to a closed runner");
            return Err(Error::Closed);
        }
        if thread::current().id() == self.inner.thread_id {
            error!("submission from the runner's own engine thread");
            return Err(Error::Deadlock);
        }
        Ok(())
    }

    fn submit<T, E>(&self, task: Task<T, E>, timeout: Option<Duration>) -> Result<T, Error<E>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let abort = task.abort_handle();
        let (tx, rx) = bounded(1);
        self.inner
            .engine
            .spawn(async move {
                // The caller may have timed out and gone away.
                let _ = tx.send(task.execute().await);
            })
            .map_err(|err| {
                debug!(%err, "engine refused task");
                Error::Closed
            })?;

        let Some(timeout) = timeout else {
            // Sender dropped without a value: the engine discarded the task.
            return rx.recv().unwrap_or(Err(Error::Cancelled));
        };

        match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                warn!(?timeout, "task timed out, cancelling");
                abort.abort();
                Err(Error::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::Cancelled),
        }
    }
}

impl Inner {
    fn close(&self) {
        let (thread, exited, exit_key) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != RunnerState::Running {
                return;
            }
            lifecycle.state = RunnerState::Closing;
            (
                lifecycle.thread.take(),
                lifecycle.exited.take(),
                lifecycle.exit_key.take(),
            )
        };

        if exit::is_exiting() {
            self.close_at_exit(exited);
            return;
        }

        debug!(thread = ?self.thread_id, "stopping engine");
        self.engine.stop();

        if thread::current().id() == self.thread_id {
            debug!("close called on the engine thread, not joining");
        } else if let (Some(thread), Some(exited)) = (thread, exited) {
            self.join(thread, exited);
        }

        if let Some(key) = exit_key {
            exit::unregister(key);
        }
        self.lifecycle.lock().state = RunnerState::Closed;
        info!(thread = ?self.thread_id, "runner closed");
    }

    /// Close from a process-exit hook. The exiting thread has no usable
    /// thread-locals, so this emits no events and never asks for the
    /// current thread. The hook registry is already drained and the engine
    /// thread is left detached once its body has returned.
    fn close_at_exit(&self, exited: Option<Receiver<()>>) {
        self.engine.stop();
        if let Some(exited) = exited {
            let _ = exited.recv_timeout(self.join_timeout);
        }
        self.lifecycle.lock().state = RunnerState::Closed;
    }

    fn join(&self, thread: thread::JoinHandle<()>, exited: Receiver<()>) {
        match exited.recv_timeout(self.join_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout = ?self.join_timeout,
                    "engine thread did not exit in time, leaving it behind"
                );
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if thread.join().is_err() {
                    warn!("engine thread panicked");
                }
            }
        }
    }
}

fn check_valid<T, E>(task: &Task<T, E>) -> Result<(), Error<E>> {
    if task.is_aborted() {
        warn!("refusing a task that was aborted before submission");
        return Err(Error::InvalidTask("task was aborted before submission"));
    }
    Ok(())
}

type BatchOf<I> = Vec<
    Task<
        <<I as IntoIterator>::Item as IntoTask>::Output,
        <<I as IntoIterator>::Item as IntoTask>::Error,
    >,
>;

/// Convert every input up front so an invalid task fails the whole batch
/// before anything is scheduled.
fn collect_tasks<I>(tasks: I) -> Result<BatchOf<I>, Error<<I::Item as IntoTask>::Error>>
where
    I: IntoIterator,
    I::Item: IntoTask,
{
    let tasks: Vec<_> = tasks.into_iter().map(IntoTask::into_task).collect();
    for task in &tasks {
        check_valid(task)?;
    }
    Ok(tasks)
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("state", &self.state())
            .field("thread", &self.inner.thread_id)
            .field("engine", &self.inner.engine.kind())
            .finish()
    }
}

/// A [`Runner`] that is closed when dropped.
#[derive(Debug)]
pub struct ScopedRunner {
    runner: Runner,
}

impl Deref for ScopedRunner {
    type Target = Runner;

    fn deref(&self) -> &Runner {
        &self.runner
    }
}

impl Drop for ScopedRunner {
    fn drop(&mut self) {
        self.runner.close();
    }
}
