//! tau-rt: single-threaded cooperative executor.
//!
//! An [`Executor`] owns a ready queue and a timer reactor and is driven by
//! exactly one thread, the one that calls [`Executor::run`] or
//! [`Executor::block_on`]. Work can be submitted from any thread through a
//! cloneable [`Handle`]; foreign-thread submissions wake the driving thread
//! through the reactor's poller.
//!
//! Every spawned task is tracked in a [`TaskSet`], so shutdown can cancel
//! all outstanding work and wait until each cancelled future has been
//! dropped before the executor is released.
//!
//! ```ignore
//! use std::time::Duration;
//!
//! let executor = tau_rt::Executor::new()?;
//! let handle = executor.handle();
//! std::thread::spawn(move || {
//!     let task = handle.spawn(async {
//!         tau_rt::time::sleep(Duration::from_millis(10)).await;
//!         42
//!     });
//!     // ...
//!     handle.stop();
//! });
//! executor.run()?;
//! ```

mod error;
mod executor;
mod reactor;
mod task;
pub mod time;

pub use error::{Error, Result};
pub use executor::{spawn, Executor, Handle};
pub use task::{Drained, JoinHandle, TaskSet};
