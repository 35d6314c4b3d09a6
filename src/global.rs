//! A process-wide runner, created on first use.
//!
//! [`GlobalRunner`] holds a weak reference to at most one runner. The first
//! submission creates it; [`GlobalRunner::shutdown`] closes it, and the next
//! submission creates a fresh one. The slot never owns the runner: it is
//! kept alive by the process-exit hook until it is closed, and by any
//! [`Runner`] handle the caller holds on to.
//!
//! The free functions in the crate root use the instance returned by
//! [`get`]. Code that wants its own lifecycle, tests in particular, can
//! create a separate [`GlobalRunner`].

use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::Error;
use crate::runner::{Runner, WeakRunner};
use crate::task::IntoTask;

pub struct GlobalRunner {
    config: Config,
    slot: Mutex<WeakRunner>,
}

impl GlobalRunner {
    pub fn new(config: Config) -> Self {
        GlobalRunner {
            config,
            slot: Mutex::new(WeakRunner::default()),
        }
    }

    /// The live runner, starting a new one if there is none or the previous
    /// one has stopped.
    pub fn runner(&self) -> Result<Runner, Error> {
        let mut slot = self.slot.lock();
        if let Some(runner) = slot.upgrade().filter(Runner::is_running) {
            debug!("reusing global runner");
            return Ok(runner);
        }

        let runner = Runner::with_config(self.config.clone())?;
        *slot = runner.downgrade();
        debug!(thread = ?runner.thread_id(), "global runner created");
        Ok(runner)
    }

    /// [`Runner::run`] on the global runner.
    pub fn run<T>(&self, task: T, timeout: Option<Duration>) -> Result<T::Output, Error<T::Error>>
    where
        T: IntoTask,
    {
        self.runner().map_err(|err| err.widen())?.run(task, timeout)
    }

    /// [`Runner::gather`] on the global runner.
    pub fn gather<I>(
        &self,
        tasks: I,
        timeout: Option<Duration>,
    ) -> Result<Vec<<I::Item as IntoTask>::Output>, Error<<I::Item as IntoTask>::Error>>
    where
        I: IntoIterator,
        I::Item: IntoTask,
    {
        self.runner().map_err(|err| err.widen())?.gather(tasks, timeout)
    }

    /// [`Runner::gather_settled`] on the global runner.
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
        self.runner()
            .map_err(|err| err.widen())?
            .gather_settled(tasks, timeout)
    }

    /// Close the current runner, if any, and clear the slot.
    pub fn shutdown(&self) {
        let mut slot = self.slot.lock();
        if let Some(runner) = slot.upgrade() {
            runner.close();
            info!("global runner shut down");
        }
        *slot = WeakRunner::default();
    }

    pub fn is_alive(&self) -> bool {
        self.slot
            .lock()
            .upgrade()
            .is_some_and(|runner| runner.is_running())
    }
}

impl Default for GlobalRunner {
    fn default() -> Self {
        Self::new(Config::from_env())
    }
}

/// The process-wide instance, configured from the environment on first use.
pub fn get() -> &'static GlobalRunner {
    static GLOBAL: OnceLock<GlobalRunner> = OnceLock::new();
    GLOBAL.get_or_init(GlobalRunner::default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sleep;
    use std::convert::Infallible;
    use std::thread;

    async fn hello() -> Result<&'static str, Infallible> {
        sleep(Duration::from_millis(10)).await;
        Ok("hello")
    }

    fn global() -> GlobalRunner {
        GlobalRunner::new(Config::default())
    }

    #[test]
    fn first_use_creates_runner() {
        let global = global();
        assert!(!global.is_alive());
        assert_eq!(global.run(hello(), None).unwrap(), "hello");
        assert!(global.is_alive());
        global.shutdown();
        assert!(!global.is_alive());
    }

    #[test]
    fn runner_is_reused_while_running() {
        let global = global();
        let first = global.runner().unwrap();
        let second = global.runner().unwrap();
        assert_eq!(first.thread_id(), second.thread_id());
        global.shutdown();
    }

    #[test]
    fn shutdown_then_run_recreates() {
        let global = global();
        let before = global.runner().unwrap();
        global.shutdown();
        assert!(!before.is_open());

        assert_eq!(global.run(hello(), None).unwrap(), "hello");
        let after = global.runner().unwrap();
        assert_ne!(before.thread_id(), after.thread_id());
        global.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let global = global();
        global.shutdown();
        global.runner().unwrap();
        global.shutdown();
        global.shutdown();
        assert!(!global.is_alive());
    }

    #[test]
    fn stopped_runner_is_treated_as_absent() {
        let global = global();
        let first = global.runner().unwrap();
        first.close();
        assert!(!global.is_alive());

        let second = global.runner().unwrap();
        assert_ne!(first.thread_id(), second.thread_id());
        assert!(global.is_alive());
        global.shutdown();
    }

    #[test]
    fn gathers_delegate() {
        let global = global();
        assert_eq!(
            global.gather([hello(), hello(), hello()], None).unwrap(),
            ["hello", "hello", "hello"]
        );
        let settled = global.gather_settled([hello()], None).unwrap();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].as_ref().unwrap(), &"hello");
        global.shutdown();
    }

    #[test]
    fn concurrent_first_use_creates_one_runner() {
        let global = global();
        let threads: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| global.runner().unwrap().thread_id()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(threads.windows(2).all(|pair| pair[0] == pair[1]));
        global.shutdown();
    }
}
