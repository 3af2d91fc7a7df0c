//! Channel identities and channel records.
//!
//! A channel groups subscriptions under an identity: either an opaque byte
//! string name or a process-local numeric filter. Pattern channels carry a
//! match function on top of a regular channel record.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::core::collection::CollectionKind;
use crate::core::glob::glob_match;
use crate::core::subscription::SubscriptionInner;

/// Identity of a delivery namespace.
///
/// Names are opaque bytes compared by content. Filters are non-zero integers
/// confined to the local process; filter 0 means "the pub/sub namespace" and
/// never appears as a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelId {
    Name(Bytes),
    Filter(i32),
}

impl ChannelId {
    /// The name bytes, if this is a named channel.
    pub fn as_name(&self) -> Option<&Bytes> {
        match self {
            ChannelId::Name(b) => Some(b),
            ChannelId::Filter(_) => None,
        }
    }

    /// The filter id, or 0 for named channels.
    pub fn filter(&self) -> i32 {
        match self {
            ChannelId::Name(_) => 0,
            ChannelId::Filter(f) => *f,
        }
    }
}

/// A pattern match function: `(pattern, candidate) -> matched`.
pub type MatchFn = fn(&[u8], &[u8]) -> bool;

/// A named match function.
///
/// The name is the matcher's identity on the wire: pattern subscriptions are
/// announced to the root by name, and the receiving side resolves the name
/// through [`register_matcher`]'s registry. Raw function pointers never cross
/// process boundaries.
#[derive(Clone, Copy)]
pub struct Matcher {
    pub name: &'static str,
    pub func: MatchFn,
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matcher").field("name", &self.name).finish()
    }
}

impl Matcher {
    /// The default glob matcher (`?`, `*`, `[..]`, `\`).
    pub fn glob() -> Matcher {
        Matcher {
            name: "glob",
            func: glob_match,
        }
    }
}

static MATCHERS: Lazy<Mutex<HashMap<&'static str, MatchFn>>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("glob", glob_match as MatchFn);
    Mutex::new(m)
});

/// Registers a match function under a symbolic name so that pattern
/// subscriptions using it can be announced across the cluster.
pub fn register_matcher(name: &'static str, func: MatchFn) {
    MATCHERS.lock().insert(name, func);
}

/// Resolves a matcher previously registered with [`register_matcher`].
pub fn lookup_matcher(name: &str) -> Option<Matcher> {
    let matchers = MATCHERS.lock();
    matchers.get_key_value(name).map(|(&name, &func)| Matcher { name, func })
}

/// A channel record: an identity plus the subscriptions listed under it.
///
/// A channel lives in exactly one collection and holds at least one
/// subscription from creation until it is removed (empty, under the
/// collection lock).
pub(crate) struct Channel {
    pub(crate) id: ChannelId,
    pub(crate) kind: CollectionKind,
    /// Set only for channels in the patterns collection.
    pub(crate) matcher: Option<Matcher>,
    pub(crate) subscriptions: Mutex<Vec<Arc<SubscriptionInner>>>,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, kind: CollectionKind, matcher: Option<Matcher>) -> Arc<Self> {
        Arc::new(Channel {
            id,
            kind,
            matcher,
            subscriptions: Mutex::new(Vec::new()),
        })
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("matcher", &self.matcher)
            .finish()
    }
}
