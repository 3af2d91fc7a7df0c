//! Pluggable pub/sub engines.
//!
//! An engine is an external pub/sub backend (a real broker, a bridge, a
//! test double) that wants to mirror this process's channel table. Attached
//! engines are told about every pub/sub channel's creation and destruction,
//! and can be targeted directly by `Scope::Engine` publishes.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::channel::{ChannelId, Matcher};
use crate::core::message::Body;

/// External pub/sub backend notified of channel lifecycle and publishes.
///
/// `subscribe`/`unsubscribe` are called with the collection lock of the
/// affected channel held; implementations must not call back into the bus
/// from them.
pub trait Engine: Send + Sync {
    /// A pub/sub or pattern channel came into existence.
    fn subscribe(&self, channel: &ChannelId, matcher: Option<&Matcher>);

    /// The channel's last local subscriber is gone.
    fn unsubscribe(&self, channel: &ChannelId, matcher: Option<&Matcher>);

    /// A message was published with this engine as its scope.
    fn publish(&self, channel: Option<&Body>, payload: Option<&Body>);

    /// Called once the process's reactor is up (and again in each worker).
    fn on_startup(&self) {}
}

pub(crate) struct EngineRegistry {
    engines: Mutex<Vec<Arc<dyn Engine>>>,
}

impl EngineRegistry {
    pub(crate) fn new() -> Self {
        EngineRegistry {
            engines: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn insert(&self, engine: Arc<dyn Engine>) {
        let mut engines = self.engines.lock();
        if !engines.iter().any(|e| Arc::ptr_eq(e, &engine)) {
            engines.push(engine);
        }
    }

    /// Removes the engine; reports whether it was attached.
    pub(crate) fn remove(&self, engine: &Arc<dyn Engine>) -> bool {
        let mut engines = self.engines.lock();
        let before = engines.len();
        engines.retain(|e| !Arc::ptr_eq(e, engine));
        engines.len() != before
    }

    pub(crate) fn contains(&self, engine: &Arc<dyn Engine>) -> bool {
        self.engines.lock().iter().any(|e| Arc::ptr_eq(e, engine))
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn Engine>> {
        self.engines.lock().clone()
    }

    /// Notifies every attached engine of a channel creation. Runs with the
    /// channel's collection lock held.
    pub(crate) fn notify_subscribe(&self, channel: &ChannelId, matcher: Option<&Matcher>) {
        for engine in self.engines.lock().iter() {
            engine.subscribe(channel, matcher);
        }
    }

    /// Notifies every attached engine of a channel destruction.
    pub(crate) fn notify_unsubscribe(&self, channel: &ChannelId, matcher: Option<&Matcher>) {
        for engine in self.engines.lock().iter() {
            engine.unsubscribe(channel, matcher);
        }
    }

    pub(crate) fn drain(&self) -> Vec<Arc<dyn Engine>> {
        std::mem::take(&mut *self.engines.lock())
    }

    /// Post-fork lock recovery.
    ///
    /// # Safety
    /// Only sound when no thread of this process holds the lock.
    pub(crate) unsafe fn force_unlock(&self) {
        if self.engines.is_locked() {
            self.engines.force_unlock();
        }
    }
}
