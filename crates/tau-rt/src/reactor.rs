use std::collections::{BTreeMap, HashMap};
use std::io;
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use polling::{Events, Poller};

/// Pending timers of one executor.
///
/// `armed` holds timers that have been polled at least once, keyed by
/// `(deadline, id)` so the earliest one is always first. `deadlines` maps
/// every live timer to its deadline, armed or not.
#[derive(Default)]
struct Timers {
    next_id: u64,
    armed: BTreeMap<(Instant, u64), Waker>,
    deadlines: HashMap<u64, Instant>,
}

impl Timers {
    fn insert(&mut self, deadline: Instant) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.deadlines.insert(id, deadline);
        id
    }

    fn remove(&mut self, id: u64) {
        if let Some(deadline) = self.deadlines.remove(&id) {
            self.armed.remove(&(deadline, id));
        }
    }

    fn poll(&mut self, id: u64, now: Instant, waker: &Waker) -> Poll<()> {
        // Unknown ids have fired or been cancelled.
        let Some(&deadline) = self.deadlines.get(&id) else {
            return Poll::Ready(());
        };
        if deadline <= now {
            self.remove(id);
            return Poll::Ready(());
        }

        self.armed
            .entry((deadline, id))
            .and_modify(|stored| {
                if !stored.will_wake(waker) {
                    stored.clone_from(waker);
                }
            })
            .or_insert_with(|| waker.clone());
        Poll::Pending
    }

    /// Move the wakers of every timer due at `now` into `due`. Returns how
    /// long until the next armed timer.
    fn expire(&mut self, now: Instant, due: &mut Vec<Waker>) -> Option<Duration> {
        while let Some(entry) = self.armed.first_entry() {
            let (deadline, id) = *entry.key();
            if deadline > now {
                return Some(deadline - now);
            }
            due.push(entry.remove());
            self.deadlines.remove(&id);
        }
        None
    }
}

/// Parks the executor thread until a timer is due or another thread asks
/// for attention.
///
/// The poller never has sources registered; `wait` with a timeout and
/// `notify` are used as a park/unpark pair.
pub(crate) struct Reactor {
    poller: Poller,
    events: Mutex<Events>,
    timers: Mutex<Timers>,
}

impl Reactor {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Reactor {
            poller: Poller::new()?,
            events: Mutex::new(Events::new()),
            timers: Mutex::new(Timers::default()),
        })
    }

    /// Unpark the thread in `react`, or make its next call return at once.
    pub(crate) fn notify(&self) -> io::Result<()> {
        self.poller.notify()
    }

    /// Register a timer for `deadline`. It is armed by the first `timer_poll`.
    pub(crate) fn timer_create(&self, deadline: Instant) -> u64 {
        self.timers.lock().insert(deadline)
    }

    /// Drop a timer without waking its task.
    pub(crate) fn timer_cancel(&self, id: u64) {
        self.timers.lock().remove(id);
    }

    pub(crate) fn timer_poll(&self, id: u64, waker: &Waker) -> Poll<()> {
        self.timers.lock().poll(id, Instant::now(), waker)
    }

    pub(crate) fn pending_timers(&self) -> usize {
        self.timers.lock().deadlines.len()
    }

    /// Wake due timers, then park for at most `timeout` (forever if `None`),
    /// cut short by the next deadline or a `notify`.
    pub(crate) fn react(&self, timeout: Option<Duration>) -> io::Result<()> {
        let mut due = Vec::new();
        let until_next = self.timers.lock().expire(Instant::now(), &mut due);

        let park = if due.is_empty() {
            match (timeout, until_next) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            }
        } else {
            Some(Duration::ZERO)
        };

        {
            let mut events = self.events.lock();
            events.clear();
            self.poller.wait(&mut events, park)?;
        }

        self.timers.lock().expire(Instant::now(), &mut due);
        due.into_iter().for_each(Waker::wake);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::{noop_waker, waker, ArcWake};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[derive(Default)]
    struct CountingWaker(AtomicUsize);

    impl ArcWake for CountingWaker {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> (Arc<CountingWaker>, Waker) {
        let counter = Arc::new(CountingWaker::default());
        (counter.clone(), waker(counter))
    }

    #[test]
    fn past_deadline_is_ready_on_first_poll() {
        let reactor = Reactor::new().unwrap();
        let id = reactor.timer_create(Instant::now() - Duration::from_millis(1));
        assert_eq!(reactor.timer_poll(id, &noop_waker()), Poll::Ready(()));
        assert_eq!(reactor.pending_timers(), 0);
    }

    #[test]
    fn cancelled_timer_is_forgotten() {
        let reactor = Reactor::new().unwrap();
        let id = reactor.timer_create(Instant::now() + Duration::from_secs(5));
        assert!(reactor.timer_poll(id, &noop_waker()).is_pending());
        assert_eq!(reactor.pending_timers(), 1);

        reactor.timer_cancel(id);
        assert_eq!(reactor.pending_timers(), 0);
        assert!(reactor.timer_poll(id, &noop_waker()).is_ready());
    }

    #[test]
    fn repolling_replaces_the_waker() {
        let reactor = Reactor::new().unwrap();
        let id = reactor.timer_create(Instant::now() + Duration::from_millis(10));
        let (first, first_waker) = counting();
        let (second, second_waker) = counting();

        assert!(reactor.timer_poll(id, &first_waker).is_pending());
        assert!(reactor.timer_poll(id, &second_waker).is_pending());

        thread::sleep(Duration::from_millis(15));
        reactor.react(Some(Duration::ZERO)).unwrap();
        assert_eq!(first.0.load(Ordering::SeqCst), 0);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timers_fire_in_deadline_order_across_reacts() {
        let reactor = Reactor::new().unwrap();
        let start = Instant::now();
        let (early, early_waker) = counting();
        let (late, late_waker) = counting();
        let late_id = reactor.timer_create(start + Duration::from_millis(60));
        let early_id = reactor.timer_create(start + Duration::from_millis(20));
        assert!(reactor.timer_poll(late_id, &late_waker).is_pending());
        assert!(reactor.timer_poll(early_id, &early_waker).is_pending());

        reactor.react(None).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(early.0.load(Ordering::SeqCst), 1);
        assert_eq!(late.0.load(Ordering::SeqCst), 0);

        reactor.react(None).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert!(start.elapsed() < Duration::from_secs(1), "overslept");
        assert_eq!(late.0.load(Ordering::SeqCst), 1);
        assert_eq!(reactor.pending_timers(), 0);
    }

    #[test]
    fn notify_from_another_thread_unparks() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let remote = reactor.clone();
        let notifier = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.notify().unwrap();
        });

        let start = Instant::now();
        reactor.react(Some(Duration::from_secs(5))).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        notifier.join().unwrap();
    }

    #[test]
    fn notify_before_react_is_not_lost() {
        let reactor = Reactor::new().unwrap();
        reactor.notify().unwrap();
        let start = Instant::now();
        reactor.react(None).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
