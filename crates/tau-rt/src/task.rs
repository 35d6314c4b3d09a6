use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_task::FallibleTask;
use futures::future::{AbortHandle, Abortable};
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use slab::Slab;

use crate::error::{Error, Result};

/// Handle to a spawned task.
///
/// Awaiting it yields the task's output, or [`Error::Cancelled`] if the task
/// was aborted or dropped first. Dropping the handle detaches the task; it
/// keeps running.
pub struct JoinHandle<T> {
    task: Option<FallibleTask<Option<T>>>,
    abort: AbortHandle,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(task: FallibleTask<Option<T>>, abort: AbortHandle) -> Self {
        JoinHandle {
            task: Some(task),
            abort,
        }
    }

    /// Request cancellation. Takes effect the next time the executor polls
    /// the task; the future is then dropped without running to completion.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// A cloneable handle that aborts this task from any thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let Some(task) = self.task.as_mut() else {
            return Poll::Ready(Err(Error::Cancelled));
        };
        match Pin::new(task).poll(cx) {
            Poll::Ready(output) => {
                self.task = None;
                // Outer None: the runnable was dropped. Inner None: aborted.
                Poll::Ready(output.flatten().ok_or(Error::Cancelled))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.detach();
        }
    }
}

struct Entries {
    handles: Slab<AbortHandle>,
    /// Set by `cancel_all`. Anything tracked afterwards starts aborted.
    closed: bool,
}

/// The set of tasks an executor still owns.
///
/// Every tracked future gets an abort handle stored in a slab; the slab entry
/// is removed when the future is dropped, whether it completed, was aborted,
/// or was never polled at all. Shutdown is `cancel_all` followed by awaiting
/// `drained`.
pub struct TaskSet {
    entries: Mutex<Entries>,
    drained: AtomicWaker,
}

impl TaskSet {
    pub fn new() -> Self {
        TaskSet {
            entries: Mutex::new(Entries {
                handles: Slab::new(),
                closed: false,
            }),
            drained: AtomicWaker::new(),
        }
    }

    /// Wrap `future` so it can be cancelled by `cancel_all`.
    ///
    /// The returned future yields `None` if it was aborted before finishing.
    pub fn track<F>(
        self: &Arc<Self>,
        future: F,
    ) -> (impl Future<Output = Option<F::Output>>, AbortHandle)
    where
        F: Future,
    {
        let (handle, registration) = AbortHandle::new_pair();
        let key = {
            let mut entries = self.entries.lock();
            if entries.closed {
                handle.abort();
            }
            entries.handles.insert(handle.clone())
        };

        // Captured by value so an unpolled future still releases its entry.
        let entry = Tracked {
            set: Arc::clone(self),
            key,
        };
        let tracked = async move {
            let output = Abortable::new(future, registration).await.ok();
            drop(entry);
            output
        };
        (tracked, handle)
    }

    /// Abort every tracked task and refuse new ones. Returns how many tasks
    /// were still outstanding.
    pub fn cancel_all(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.closed = true;
        for (_, handle) in entries.handles.iter() {
            handle.abort();
        }
        entries.handles.len()
    }

    pub fn is_closed(&self) -> bool {
        self.entries.lock().closed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once no tracked future is left alive.
    ///
    /// Only one `drained` future is woken at a time; it is meant for the
    /// single shutdown path of an executor.
    pub fn drained(&self) -> Drained<'_> {
        Drained { set: self }
    }
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

struct Tracked {
    set: Arc<TaskSet>,
    key: usize,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        let empty = {
            let mut entries = self.set.entries.lock();
            entries.handles.try_remove(self.key);
            entries.handles.is_empty()
        };
        if empty {
            self.set.drained.wake();
        }
    }
}

/// Future returned by [`TaskSet::drained`].
pub struct Drained<'a> {
    set: &'a TaskSet,
}

impl Future for Drained<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.set.drained.register(cx.waker());
        if self.set.is_empty() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn completed_future_releases_entry() {
        let set = Arc::new(TaskSet::new());
        let (tracked, _abort) = set.track(async { 7 });
        assert_eq!(set.len(), 1);

        assert_eq!(futures::executor::block_on(tracked), Some(7));
        assert!(set.is_empty());
    }

    #[test]
    fn unpolled_future_releases_entry_on_drop() {
        let set = Arc::new(TaskSet::new());
        let dropped = Arc::new(AtomicBool::new(false));
        let guard = SetOnDrop(dropped.clone());
        let (tracked, _abort) = set.track(async move {
            let _guard = guard;
        });
        assert_eq!(set.len(), 1);

        drop(tracked);
        assert!(set.is_empty());
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_all_aborts_pending_futures() {
        let set = Arc::new(TaskSet::new());
        let (tracked, _abort) = set.track(futures::future::pending::<()>());

        assert_eq!(set.cancel_all(), 1);
        assert!(set.is_closed());
        assert_eq!(futures::executor::block_on(tracked), None);
        assert!(set.is_empty());
    }

    #[test]
    fn track_after_cancel_all_starts_aborted() {
        let set = Arc::new(TaskSet::new());
        set.cancel_all();

        let (tracked, abort) = set.track(async { 1 });
        assert!(abort.is_aborted());
        assert_eq!(futures::executor::block_on(tracked), None);
    }

    #[test]
    fn drained_resolves_when_last_entry_drops() {
        let set = Arc::new(TaskSet::new());
        let (first, _a) = set.track(async { 1 });
        let (second, _b) = set.track(async { 2 });

        let remote = set.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            drop(first);
            drop(second);
            remote.len()
        });

        futures::executor::block_on(set.drained());
        assert_eq!(worker.join().unwrap(), 0);
    }
}
