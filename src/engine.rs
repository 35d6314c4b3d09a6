//! The engine thread.
//!
//! Each runner owns one engine: an executor created on, and only ever polled
//! by, a dedicated thread. Other threads talk to it through [`EngineHandle`],
//! whose methods are all thread-safe.

use std::future::Future;
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};
use tracing::{debug, error};

use crate::config::{Config, EngineKind};
use crate::error::Error;

type Started = Result<EngineHandle, tau_rt::Error>;

/// Thread-safe handle to a running engine.
///
/// Spawning, stopping and the status queries are safe to call from any
/// thread. Anything that needs the engine to be bound to the calling thread
/// (timers, `tau_rt::spawn`) only works from tasks running on it.
#[derive(Clone)]
pub enum EngineHandle {
    Tau(tau_rt::Handle),
    #[cfg(feature = "tokio")]
    Tokio(tokio_engine::TokioHandle),
}

impl EngineHandle {
    pub fn kind(&self) -> EngineKind {
        match self {
            EngineHandle::Tau(_) => EngineKind::Tau,
            #[cfg(feature = "tokio")]
            EngineHandle::Tokio(_) => EngineKind::Tokio,
        }
    }

    /// Schedule a detached future on the engine thread.
    ///
    /// Fails with [`tau_rt::Error::Shutdown`] once the engine has been asked
    /// to stop. A future accepted while the engine is shutting down may be
    /// dropped without being polled.
    pub fn spawn<F>(&self, future: F) -> tau_rt::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self {
            EngineHandle::Tau(handle) => handle.spawn(future).map(drop),
            #[cfg(feature = "tokio")]
            EngineHandle::Tokio(handle) => handle.spawn(future),
        }
    }

    /// Ask the engine loop to stop. Returns immediately.
    pub fn stop(&self) {
        match self {
            EngineHandle::Tau(handle) => handle.stop(),
            #[cfg(feature = "tokio")]
            EngineHandle::Tokio(handle) => handle.stop(),
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            EngineHandle::Tau(handle) => handle.is_running(),
            #[cfg(feature = "tokio")]
            EngineHandle::Tokio(handle) => handle.is_running(),
        }
    }

    /// Spawned tasks that have not finished yet.
    pub fn pending_tasks(&self) -> usize {
        match self {
            EngineHandle::Tau(handle) => handle.pending_tasks(),
            #[cfg(feature = "tokio")]
            EngineHandle::Tokio(handle) => handle.pending_tasks(),
        }
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("kind", &self.kind())
            .field("running", &self.is_running())
            .finish()
    }
}

/// A started engine thread.
pub(crate) struct EngineThread {
    pub(crate) handle: EngineHandle,
    pub(crate) thread: thread::JoinHandle<()>,
    /// Disconnects when the thread body returns.
    pub(crate) exited: Receiver<()>,
}

impl EngineThread {
    pub(crate) fn id(&self) -> ThreadId {
        self.thread.thread().id()
    }
}

/// Spawn the engine thread and wait until its loop is about to run.
pub(crate) fn start(config: &Config) -> Result<EngineThread, Error> {
    let (started_tx, started_rx) = bounded::<Started>(1);
    let (exited_tx, exited_rx) = bounded::<()>(0);
    let kind = config.engine();

    let thread = thread::Builder::new()
        .name(config.thread_name().to_string())
        .spawn(move || {
            let _exited = exited_tx;
            debug!(engine = %kind, "engine thread started");
            match kind {
                EngineKind::Tau => run_tau(started_tx),
                #[cfg(feature = "tokio")]
                EngineKind::Tokio => tokio_engine::run(started_tx),
                #[cfg(not(feature = "tokio"))]
                EngineKind::Tokio => run_tau(started_tx),
            }
            debug!("engine thread exiting");
        })
        .map_err(Error::Spawn)?;

    let handle = match started_rx.recv() {
        Ok(Ok(handle)) => handle,
        Ok(Err(err)) => {
            let _ = thread.join();
            return Err(Error::Engine(err));
        }
        // The thread died before reporting back.
        Err(_) => {
            let _ = thread.join();
            return Err(Error::Engine(tau_rt::Error::Shutdown));
        }
    };

    Ok(EngineThread {
        handle,
        thread,
        exited: exited_rx,
    })
}

fn run_tau(started: Sender<Started>) {
    let executor = match tau_rt::Executor::new() {
        Ok(executor) => executor,
        Err(err) => {
            let _ = started.send(Err(err));
            return;
        }
    };
    let handle = executor.handle();
    if started.send(Ok(EngineHandle::Tau(handle.clone()))).is_err() {
        return;
    }

    if let Err(err) = executor.run() {
        error!(%err, "engine loop failed");
    }
    // Reject further spawns even if the loop bailed out on its own.
    handle.stop();
}

/// Sleep on whichever engine is driving the current task.
///
/// # Panics
///
/// Panics when polled outside of an engine thread.
pub async fn sleep(duration: Duration) {
    #[cfg(feature = "tokio")]
    if tau_rt::Handle::current().is_none() && tokio::runtime::Handle::try_current().is_ok() {
        tokio::time::sleep(duration).await;
        return;
    }
    tau_rt::time::sleep(duration).await
}

#[cfg(feature = "tokio")]
pub mod tokio_engine {
    //! Tokio current-thread runtime as an engine.

    use std::future::Future;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use crossbeam::channel::Sender;
    use tau_rt::TaskSet;
    use tokio::sync::Notify;
    use tracing::debug;

    use super::{EngineHandle, Started};

    struct Shared {
        stop: Notify,
        stopping: AtomicBool,
        tasks: Arc<TaskSet>,
    }

    #[derive(Clone)]
    pub struct TokioHandle {
        runtime: tokio::runtime::Handle,
        shared: Arc<Shared>,
    }

    impl TokioHandle {
        pub(super) fn spawn<F>(&self, future: F) -> tau_rt::Result<()>
        where
            F: Future<Output = ()> + Send + 'static,
        {
            if !self.is_running() {
                return Err(tau_rt::Error::Shutdown);
            }
            let (tracked, _abort) = self.shared.tasks.track(future);
            // A runtime that has already shut down drops the future instead.
            drop(self.runtime.spawn(tracked));
            Ok(())
        }

        pub(super) fn stop(&self) {
            if !self.shared.stopping.swap(true, Ordering::AcqRel) {
                self.shared.stop.notify_one();
            }
        }

        pub(super) fn is_running(&self) -> bool {
            !self.shared.stopping.load(Ordering::Acquire)
        }

        pub(super) fn pending_tasks(&self) -> usize {
            self.shared.tasks.len()
        }
    }

    pub(super) fn run(started: Sender<Started>) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                let _ = started.send(Err(tau_rt::Error::Io(err)));
                return;
            }
        };

        let shared = Arc::new(Shared {
            stop: Notify::new(),
            stopping: AtomicBool::new(false),
            tasks: Arc::new(TaskSet::new()),
        });
        let handle = TokioHandle {
            runtime: runtime.handle().clone(),
            shared: shared.clone(),
        };
        if started.send(Ok(EngineHandle::Tokio(handle))).is_err() {
            return;
        }

        // notify_one stores a permit, so a stop sent before this point is kept.
        runtime.block_on(shared.stop.notified());
        debug!("tokio engine stop requested");

        let outstanding = shared.tasks.cancel_all();
        if outstanding > 0 {
            debug!(outstanding, "cancelling outstanding tasks");
        }
        runtime.block_on(shared.tasks.drained());
        drop(runtime);
        debug!("tokio engine shut down");
    }
}
