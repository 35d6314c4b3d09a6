//! Async timers.
//!
//! Timers live in the reactor of the executor bound to the current thread,
//! so they must be created from inside a task or `block_on`.

use std::future::Future;
use std::pin::{pin, Pin};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::future::{select, Either};
use thiserror::Error;

use crate::executor::Handle;

/// Roughly 30 years; stands in for "never" when a deadline would overflow.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// A one-shot timer that resolves at a deadline.
///
/// Implements `Future` so you can `.await` it. Cancels the timer on drop if
/// it hasn't fired yet.
pub struct Sleep {
    handle: Handle,
    id: u64,
    deadline: Instant,
    fired: bool,
}

impl Sleep {
    /// Create a timer that fires after the given duration.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tau-rt executor.
    pub fn after(duration: Duration) -> Self {
        let now = Instant::now();
        let deadline = now
            .checked_add(duration)
            .unwrap_or_else(|| now + FAR_FUTURE);
        Self::until(deadline)
    }

    /// Create a timer that fires at `deadline`.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tau-rt executor.
    pub fn until(deadline: Instant) -> Self {
        let handle = Handle::current()
            .expect("tau_rt::time::Sleep must be created from within a tau-rt executor");
        let id = handle.shared.reactor.timer_create(deadline);
        Sleep {
            handle,
            id,
            deadline,
            fired: false,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_elapsed(&self) -> bool {
        self.fired || Instant::now() >= self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.fired {
            return Poll::Ready(());
        }
        match self.handle.shared.reactor.timer_poll(self.id, cx.waker()) {
            Poll::Ready(()) => {
                self.fired = true;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if !self.fired {
            self.handle.shared.reactor.timer_cancel(self.id);
        }
    }
}

/// Sleep for the given duration.
///
/// The timer is registered on first poll, so the returned future may be
/// created anywhere as long as it is awaited inside an executor.
pub async fn sleep(duration: Duration) {
    Sleep::after(duration).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deadline has elapsed")]
pub struct Elapsed;

/// Require `future` to complete within `duration`.
///
/// On expiry the inner future is dropped, which cancels it.
pub async fn timeout<F: Future>(duration: Duration, future: F) -> Result<F::Output, Elapsed> {
    let future = pin!(future);
    let sleep = pin!(sleep(duration));
    match select(future, sleep).await {
        Either::Left((output, _)) => Ok(output),
        Either::Right(((), _)) => Err(Elapsed),
    }
}
