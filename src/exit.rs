//! Process-exit hooks.
//!
//! Runners register a hook that closes them when the process exits normally
//! (return from `main` or `std::process::exit`). Hooks run on the exiting
//! thread, in registration order, after `main` has returned.
//!
//! By then libc has already torn down the exiting thread's thread-locals,
//! and `tracing` subscribers depend on them. Code reachable from a hook
//! checks [`is_exiting`] and stays silent.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once, OnceLock};

use parking_lot::Mutex;
use slab::Slab;
use tracing::{error, warn};

use crate::error::panic_message;

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Identifies one registered hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitKey {
    slot: usize,
    generation: u64,
}

struct Entry {
    generation: u64,
    hook: Hook,
}

/// An ordered set of hooks to run once.
///
/// The process-wide registry behind [`register`] is one of these; separate
/// instances are useful for scoping hooks to something other than the
/// process.
pub struct ExitHooks {
    entries: Mutex<Slab<Entry>>,
    generation: AtomicU64,
}

impl ExitHooks {
    pub fn new() -> Self {
        ExitHooks {
            entries: Mutex::new(Slab::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn register(&self, hook: impl Fn() + Send + Sync + 'static) -> ExitKey {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let slot = self.entries.lock().insert(Entry {
            generation,
            hook: Arc::new(hook),
        });
        ExitKey { slot, generation }
    }

    /// Remove a hook. Returns false if it already ran or was removed.
    pub fn unregister(&self, key: ExitKey) -> bool {
        let removed = {
            let mut entries = self.entries.lock();
            match entries.get(key.slot) {
                Some(entry) if entry.generation == key.generation => Some(entries.remove(key.slot)),
                _ => None,
            }
        };
        // Hooks may own the last reference to something with its own locks.
        removed.is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the set and run every hook, outside the lock. A panicking hook
    /// is logged and does not stop the rest. Returns how many hooks ran.
    pub fn run(&self) -> usize {
        let mut drained: Vec<Entry> = self.entries.lock().drain().collect();
        drained.sort_by_key(|entry| entry.generation);

        for entry in &drained {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (entry.hook)())) {
                if !is_exiting() {
                    error!(panic = %panic_message(payload.as_ref()), "exit hook panicked");
                }
            }
        }
        drained.len()
    }
}

impl Default for ExitHooks {
    fn default() -> Self {
        Self::new()
    }
}

static EXITING: AtomicBool = AtomicBool::new(false);

/// True once the process has started running its exit hooks.
pub fn is_exiting() -> bool {
    EXITING.load(Ordering::Acquire)
}

fn registry() -> &'static ExitHooks {
    static REGISTRY: OnceLock<ExitHooks> = OnceLock::new();
    REGISTRY.get_or_init(ExitHooks::new)
}

extern "C" fn at_exit() {
    EXITING.store(true, Ordering::Release);
    // Unwinding must not cross back into libc.
    let _ = panic::catch_unwind(run_hooks);
}

fn install() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // SAFETY: `at_exit` is a plain `extern "C" fn` that never unwinds.
        if unsafe { libc::atexit(at_exit) } != 0 {
            warn!("failed to install process exit handler; runners must be closed explicitly");
        }
    });
}

/// Run `hook` when the process exits, unless it is unregistered first.
pub fn register(hook: impl Fn() + Send + Sync + 'static) -> ExitKey {
    install();
    registry().register(hook)
}

pub fn unregister(key: ExitKey) -> bool {
    registry().unregister(key)
}

/// Run and clear every process-wide hook now.
pub fn run_hooks() -> usize {
    registry().run()
}
