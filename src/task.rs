use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::{AbortHandle, Abortable, Aborted, BoxFuture};
use futures::FutureExt;

use crate::error::{panic_message, Error};

/// A unit of asynchronous work for a [`Runner`](crate::Runner).
///
/// Wraps a `Send + 'static` future producing `Result<T, E>` together with an
/// abort handle. The handle can cancel the task from any thread, before it
/// is submitted or while it runs; cancellation takes effect at the task's
/// next suspension point. A task aborted before submission is rejected as
/// [`Error::InvalidTask`].
pub struct Task<T, E = Infallible> {
    future: Abortable<BoxFuture<'static, Result<T, Error<E>>>>,
    abort: AbortHandle,
}

impl<T, E> Task<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::from_outcome(future.map(|result| result.map_err(Error::Task)))
    }

    /// Build a task whose future already speaks in runner errors. Used for
    /// composites whose children have been executed individually.
    pub(crate) fn from_outcome<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, Error<E>>> + Send + 'static,
    {
        let (abort, registration) = AbortHandle::new_pair();
        Task {
            future: Abortable::new(future.boxed(), registration),
            abort,
        }
    }
}

impl<T, E> Task<T, E> {
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Drive the task to its outcome, folding cancellation and panics into
    /// the runner's error type.
    pub(crate) async fn execute(self) -> Result<T, Error<E>> {
        match AssertUnwindSafe(self.future).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(Aborted)) => Err(Error::Cancelled),
            Err(payload) => Err(Error::Panicked(panic_message(payload.as_ref()))),
        }
    }
}

impl<T, E> fmt::Debug for Task<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

/// Anything a runner accepts as a task: a [`Task`], or any `Send + 'static`
/// future producing a `Result`.
pub trait IntoTask {
    type Output: Send + 'static;
    type Error: Send + 'static;

    fn into_task(self) -> Task<Self::Output, Self::Error>;
}

impl<F, T, E> IntoTask for F
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    type Output = T;
    type Error = E;

    fn into_task(self) -> Task<T, E> {
        Task::new(self)
    }
}

impl<T, E> IntoTask for Task<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    type Output = T;
    type Error = E;

    fn into_task(self) -> Task<T, E> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[derive(Debug, PartialEq)]
    struct ValueError(&'static str);

    #[test]
    fn execute_passes_value_through() {
        let task = Task::new(async { Ok::<_, ValueError>("hello") });
        assert_eq!(block_on(task.execute()).unwrap(), "hello");
    }

    #[test]
    fn execute_keeps_task_error() {
        let task = Task::new(async { Err::<(), _>(ValueError("x")) });
        let err = block_on(task.execute()).unwrap_err();
        assert_eq!(err.into_task_error(), Some(ValueError("x")));
    }

    #[test]
    fn execute_catches_panics() {
        let task: Task<(), ValueError> = Task::new(async {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        match block_on(task.execute()) {
            Err(Error::Panicked(message)) => assert_eq!(message, "boom"),
            other => panic!("expected panic error, got {other:?}"),
        }
    }

    #[test]
    fn aborted_task_executes_as_cancelled() {
        let task: Task<(), ValueError> = Task::new(futures::future::pending());
        task.abort();
        assert!(task.is_aborted());
        assert!(matches!(block_on(task.execute()), Err(Error::Cancelled)));
    }

    #[test]
    fn abort_handle_cancels_from_another_thread() {
        let task: Task<(), ValueError> = Task::new(futures::future::pending());
        let handle = task.abort_handle();
        let aborter = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            handle.abort();
        });
        assert!(matches!(block_on(task.execute()), Err(Error::Cancelled)));
        aborter.join().unwrap();
    }

    #[test]
    fn futures_and_tasks_both_convert() {
        let from_future = async { Ok::<u8, ValueError>(1) }.into_task();
        let from_task = Task::new(async { Ok::<u8, ValueError>(2) }).into_task();
        assert_eq!(block_on(from_future.execute()).unwrap(), 1);
        assert_eq!(block_on(from_task.execute()).unwrap(), 2);
    }
}
