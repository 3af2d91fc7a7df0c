//! Process lifecycle hooks.
//!
//! The bus runs user callbacks at fixed points of the process lifecycle:
//! before the cluster socket is bound, once the reactor is up, in a freshly
//! forked child, at orderly finish, at exit, and when a worker detects that
//! its parent died. Registration order is invocation order.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// Before the root binds its cluster socket.
    PreStart,
    /// After the process's cluster role is established.
    OnStart,
    /// In a forked child, after lock reinitialization.
    InChild,
    /// Orderly teardown (root unlinks the cluster socket here).
    OnFinish,
    /// Final drain of subscriptions, engines, and metadata producers.
    AtExit,
    /// A worker's upstream link closed without a shutdown frame.
    ParentCrash,
}

type HookFn = Arc<dyn Fn() + Send + Sync>;

pub struct HookRegistry {
    hooks: Mutex<HashMap<Hook, Vec<HookFn>>>,
}

impl HookRegistry {
    pub(crate) fn new() -> Self {
        HookRegistry {
            hooks: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, hook: Hook, f: impl Fn() + Send + Sync + 'static) {
        self.hooks
            .lock()
            .entry(hook)
            .or_default()
            .push(Arc::new(f));
    }

    /// Runs every callback registered for `hook`. Callbacks run outside the
    /// registry lock and may register further hooks.
    pub(crate) fn run(&self, hook: Hook) {
        let snapshot: Vec<HookFn> = self
            .hooks
            .lock()
            .get(&hook)
            .map(|v| v.clone())
            .unwrap_or_default();
        for f in snapshot {
            f();
        }
    }

    /// Post-fork lock recovery.
    ///
    /// # Safety
    /// Only sound when no thread of this process holds the lock (i.e. right
    /// after `fork` in the child, before any other thread exists).
    pub(crate) unsafe fn force_unlock(&self) {
        if self.hooks.is_locked() {
            self.hooks.force_unlock();
        }
    }
}
