//! Metadata producers.
//!
//! A producer runs once per pub/sub publish (filter == 0), before any
//! subscriber is scheduled, and may attach pre-serialized side data to the
//! envelope for every subscriber to reuse. The wire forms of the channel and
//! payload are handed to the producer so outgoing protocol frames can be
//! built once instead of per subscriber.

use std::sync::Arc;

use bytes::Bytes;

use crate::core::message::{Message, Metadata};

/// Builds metadata for one message: `(view, raw_channel, raw_payload)`.
/// Returning `None` attaches nothing.
pub type MetadataProducer =
    Arc<dyn Fn(&Message, &Bytes, &Bytes) -> Option<Metadata> + Send + Sync>;

/// The registered producer list. Snapshot-copied before invocation so user
/// code never runs under the registry lock.
pub(crate) struct MetadataRegistry {
    producers: parking_lot::Mutex<Vec<MetadataProducer>>,
}

impl MetadataRegistry {
    pub(crate) fn new() -> Self {
        MetadataRegistry {
            producers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Registers a producer. Re-registering the same producer moves it to
    /// the end of the invocation order instead of duplicating it.
    pub(crate) fn register(&self, producer: MetadataProducer) {
        let mut producers = self.producers.lock();
        producers.retain(|p| !Arc::ptr_eq(p, &producer));
        producers.push(producer);
    }

    pub(crate) fn unregister(&self, producer: &MetadataProducer) {
        self.producers.lock().retain(|p| !Arc::ptr_eq(p, producer));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.producers.lock().is_empty()
    }

    pub(crate) fn snapshot(&self) -> Vec<MetadataProducer> {
        self.producers.lock().clone()
    }

    pub(crate) fn clear(&self) {
        self.producers.lock().clear();
    }

    /// Post-fork lock recovery.
    ///
    /// # Safety
    /// Only sound when no thread of this process holds the lock.
    pub(crate) unsafe fn force_unlock(&self) {
        if self.producers.is_locked() {
            self.producers.force_unlock();
        }
    }
}
