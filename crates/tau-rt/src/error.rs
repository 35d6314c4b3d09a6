use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The executor has been asked to stop and no longer accepts work.
    #[error("executor has shut down")]
    Shutdown,

    /// No executor is bound to the calling thread.
    #[error("not called from within a tau-rt executor")]
    NoExecutor,

    /// The task was aborted or dropped before it produced a value.
    #[error("task was cancelled")]
    Cancelled,

    #[error("reactor error: {0}")]
    Io(#[from] io::Error),
}
