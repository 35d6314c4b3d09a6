//! Run async tasks from synchronous code.
//!
//! A [`Runner`] owns a single-threaded executor running on a dedicated
//! thread. Any thread can hand it a future and block until the result comes
//! back, optionally with a timeout:
//!
//! ```no_run
//! use std::convert::Infallible;
//! use std::time::Duration;
//!
//! let runner = tau_bridge::Runner::scoped()?;
//! let value = runner.run(
//!     async {
//!         tau_bridge::sleep(Duration::from_millis(10)).await;
//!         Ok::<_, Infallible>("hello")
//!     },
//!     Some(Duration::from_secs(1)),
//! )?;
//! assert_eq!(value, "hello");
//! # Ok::<(), tau_bridge::Error>(())
//! ```
//!
//! The free functions [`run`], [`gather`] and [`gather_settled`] use a
//! process-wide runner that is created on first use and torn down by
//! [`shutdown`] or at process exit.

pub mod config;
pub mod engine;
mod error;
pub mod exit;
pub mod global;
pub mod logging;
mod runner;
mod task;

use std::time::Duration;

pub use config::{Config, EngineKind, Profile};
pub use engine::{sleep, EngineHandle};
pub use error::{Error, ErrorKind, Result};
pub use global::GlobalRunner;
pub use runner::{Runner, RunnerState, ScopedRunner};
pub use task::{IntoTask, Task};

/// [`Runner::run`] on the process-wide runner.
pub fn run<T>(task: T, timeout: Option<Duration>) -> Result<T::Output, Error<T::Error>>
where
    T: IntoTask,
{
    global::get().run(task, timeout)
}

/// [`Runner::gather`] on the process-wide runner.
pub fn gather<I>(
    tasks: I,
    timeout: Option<Duration>,
) -> Result<Vec<<I::Item as IntoTask>::Output>, Error<<I::Item as IntoTask>::Error>>
where
    I: IntoIterator,
    I::Item: IntoTask,
{
    global::get().gather(tasks, timeout)
}

/// [`Runner::gather_settled`] on the process-wide runner.
#[allow(clippy::type_complexity)]
pub fn gather_settled<I>(
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
    global::get().gather_settled(tasks, timeout)
}

/// Close the process-wide runner. The next submission starts a new one.
pub fn shutdown() {
    global::get().shutdown();
}

/// Whether the process-wide runner exists and is running.
pub fn is_alive() -> bool {
    global::get().is_alive()
}
