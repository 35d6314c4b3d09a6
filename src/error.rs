use std::any::Any;
use std::convert::Infallible;
use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything a submission can fail with.
///
/// `E` is the submitted task's own error type. A task's failure comes back
/// as [`Error::Task`] holding the original value untouched, so callers match
/// on it exactly as they would on the task's own `Result`.
#[derive(Debug, Error)]
pub enum Error<E = Infallible> {
    /// The runner has been closed.
    #[error("the runner has been closed and cannot accept new tasks")]
    Closed,

    /// Submission from the runner's own engine thread.
    #[error("cannot submit to the runner from its own engine thread; this would deadlock")]
    Deadlock,

    #[error("invalid task: {0}")]
    InvalidTask(&'static str),

    /// The caller stopped waiting. The task was asked to cancel but may
    /// still be unwinding on the engine thread.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("task was cancelled")]
    Cancelled,

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Task(E),

    #[error("failed to start engine")]
    Engine(#[source] tau_rt::Error),

    #[error("failed to spawn engine thread")]
    Spawn(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Closed,
    Deadlock,
    InvalidTask,
    Timeout,
    Cancelled,
    Panicked,
    Task,
    Engine,
}

impl<E> Error<E> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Closed => ErrorKind::Closed,
            Error::Deadlock => ErrorKind::Deadlock,
            Error::InvalidTask(_) => ErrorKind::InvalidTask,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Panicked(_) => ErrorKind::Panicked,
            Error::Task(_) => ErrorKind::Task,
            Error::Engine(_) | Error::Spawn(_) => ErrorKind::Engine,
        }
    }

    /// Runner-state violations: submitting to a closed runner or from its
    /// own engine thread.
    pub fn is_runner_error(&self) -> bool {
        matches!(self, Error::Closed | Error::Deadlock)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Failures that belong to one task rather than to the whole call.
    /// These are the ones `gather_settled` keeps per position.
    pub fn is_task_failure(&self) -> bool {
        matches!(
            self,
            Error::Task(_) | Error::Panicked(_) | Error::Cancelled
        )
    }

    pub fn task_error(&self) -> Option<&E> {
        match self {
            Error::Task(err) => Some(err),
            _ => None,
        }
    }

    pub fn into_task_error(self) -> Option<E> {
        match self {
            Error::Task(err) => Some(err),
            _ => None,
        }
    }

    pub fn map_task<F>(self, f: impl FnOnce(E) -> F) -> Error<F> {
        match self {
            Error::Closed => Error::Closed,
            Error::Deadlock => Error::Deadlock,
            Error::InvalidTask(reason) => Error::InvalidTask(reason),
            Error::Timeout(after) => Error::Timeout(after),
            Error::Cancelled => Error::Cancelled,
            Error::Panicked(message) => Error::Panicked(message),
            Error::Task(err) => Error::Task(f(err)),
            Error::Engine(err) => Error::Engine(err),
            Error::Spawn(err) => Error::Spawn(err),
        }
    }
}

impl Error<Infallible> {
    /// Lift an error that carries no task failure into any task error type.
    pub fn widen<E>(self) -> Error<E> {
        self.map_task(|never| match never {})
    }
}

/// Best-effort message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}
