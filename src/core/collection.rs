//! Lock-guarded channel tables.
//!
//! The postoffice keeps three collections: `filters`, `pubsub`, `patterns`.
//! Each one owns its channels exclusively; every insert, lookup, and removal
//! happens under the collection lock, and channel locks nest strictly inside
//! it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::channel::{Channel, ChannelId};

/// Which collection a channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CollectionKind {
    Filters,
    Pubsub,
    Patterns,
}

pub(crate) struct Collection {
    pub(crate) channels: Mutex<HashMap<ChannelId, Arc<Channel>>>,
}

/// Capacity below which the table is never compacted.
const COMPACT_MIN_CAPACITY: usize = 512;

impl Collection {
    pub(crate) fn new() -> Self {
        Collection {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Releases unused table memory once occupancy drops below half of a
    /// capacity larger than [`COMPACT_MIN_CAPACITY`]. Called with the
    /// collection lock held.
    pub(crate) fn compact(map: &mut HashMap<ChannelId, Arc<Channel>>) {
        if map.len() * 2 <= map.capacity() && map.capacity() > COMPACT_MIN_CAPACITY {
            tracing::debug!(
                len = map.len(),
                capacity = map.capacity(),
                "compacting channel table"
            );
            map.shrink_to_fit();
        }
    }

    /// Snapshot of the live channels, for replay and shutdown paths.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Channel>> {
        self.channels.lock().values().cloned().collect()
    }
}
