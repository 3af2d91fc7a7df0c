//! Message envelopes and the per-subscriber message view.

use std::any::Any;
use std::cell::Cell;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use crate::core::subscription::Udata;

/// A channel name or payload: raw bytes, or a structured value decoded from
/// the canonical JSON wire form.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Bytes(Bytes),
    Json(Value),
}

impl Body {
    /// The raw bytes, if this body was published as bytes.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Body::Bytes(b) => Some(b),
            Body::Json(_) => None,
        }
    }

    /// The decoded value, if this body was published as a structured value.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Bytes(_) => None,
            Body::Json(v) => Some(v),
        }
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Body::Bytes(b)
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Bytes(Bytes::from(s))
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(v))
    }
}

impl From<Value> for Body {
    fn from(v: Value) -> Self {
        Body::Json(v)
    }
}

/// Per-message side data produced once per publish and shared by every
/// subscriber (see [`crate::core::metadata`]).
pub struct Metadata {
    pub type_id: u64,
    pub data: Box<dyn Any + Send + Sync>,
}

/// Reference-counted message carrier.
///
/// Holds the decoded view forms of the channel and payload plus the
/// metadata list; subscriber lookup happens on the wire form before the
/// envelope is built. Dropped — along with its metadata — once every
/// scheduled delivery has completed.
pub(crate) struct Envelope {
    pub(crate) filter: i32,
    pub(crate) channel: Option<Body>,
    pub(crate) payload: Option<Body>,
    pub(crate) metadata: Vec<Metadata>,
}

/// The view passed to subscription callbacks.
///
/// Shares the envelope with every other subscriber of the same publish but
/// substitutes this subscription's user data slots.
pub struct Message<'a> {
    env: &'a Arc<Envelope>,
    udata1: Option<Udata>,
    udata2: Option<Udata>,
    deferred: Cell<bool>,
}

impl<'a> Message<'a> {
    pub(crate) fn new(env: &'a Arc<Envelope>, udata1: Option<Udata>, udata2: Option<Udata>) -> Self {
        Message {
            env,
            udata1,
            udata2,
            deferred: Cell::new(false),
        }
    }

    /// The filter id, or 0 for pub/sub messages.
    pub fn filter(&self) -> i32 {
        self.env.filter
    }

    /// The channel this message was published to, as the subscriber sees it.
    pub fn channel(&self) -> Option<&Body> {
        self.env.channel.as_ref()
    }

    pub fn payload(&self) -> Option<&Body> {
        self.env.payload.as_ref()
    }

    pub fn udata1(&self) -> Option<&Udata> {
        self.udata1.as_ref()
    }

    pub fn udata2(&self) -> Option<&Udata> {
        self.udata2.as_ref()
    }

    /// Asks the bus to run this callback again for the same message after
    /// other pending tasks get a chance to run. The only way a callback can
    /// voluntarily yield.
    pub fn defer(&self) {
        self.deferred.set(true);
    }

    pub(crate) fn is_deferred(&self) -> bool {
        self.deferred.get()
    }

    /// Looks up metadata attached to this message by producer type id.
    pub fn metadata(&self, type_id: u64) -> Option<&(dyn Any + Send + Sync)> {
        self.env
            .metadata
            .iter()
            .find(|m| m.type_id == type_id)
            .map(|m| &*m.data)
    }
}

impl std::fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("filter", &self.env.filter)
            .field("channel", &self.env.channel)
            .field("payload", &self.env.payload)
            .finish()
    }
}
