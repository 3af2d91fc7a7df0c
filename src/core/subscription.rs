//! Subscription records and the owning handle returned by `subscribe`.

use std::any::Any;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::core::bus::Postoffice;
use crate::core::channel::{Channel, ChannelId, Matcher};
use crate::core::message::{Envelope, Message};

/// Opaque user data attached to a subscription and surfaced on every
/// delivered message view.
pub type Udata = Arc<dyn Any + Send + Sync>;

pub(crate) type Callback = Arc<dyn Fn(&Message) + Send + Sync>;
pub(crate) type UnsubscribeFn = Box<dyn FnOnce(Option<Udata>, Option<Udata>) + Send>;

/// Arguments for [`Postoffice::subscribe`].
///
/// Exactly one of a named channel, a pattern, or a non-zero filter must be
/// chosen; the constructors encode the valid starting points and
/// [`Postoffice::subscribe`] rejects the remaining invalid combinations
/// (running `on_unsubscribe` with the supplied user data, as cleanup).
pub struct SubscribeOptions {
    pub(crate) filter: i32,
    pub(crate) channel: Option<Bytes>,
    pub(crate) matcher: Option<Matcher>,
    pub(crate) callback: Callback,
    pub(crate) on_unsubscribe: Option<UnsubscribeFn>,
    pub(crate) udata1: Option<Udata>,
    pub(crate) udata2: Option<Udata>,
}

impl SubscribeOptions {
    /// Subscribes to an exact channel name.
    pub fn channel(
        name: impl Into<Bytes>,
        callback: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Self {
        SubscribeOptions {
            filter: 0,
            channel: Some(name.into()),
            matcher: None,
            callback: Arc::new(callback),
            on_unsubscribe: None,
            udata1: None,
            udata2: None,
        }
    }

    /// Subscribes to a glob pattern over channel names.
    pub fn pattern(
        pattern: impl Into<Bytes>,
        callback: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Self {
        let mut opts = Self::channel(pattern, callback);
        opts.matcher = Some(Matcher::glob());
        opts
    }

    /// Subscribes to a process-local numeric filter (must be non-zero).
    pub fn filter(filter: i32, callback: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        SubscribeOptions {
            filter,
            channel: None,
            matcher: None,
            callback: Arc::new(callback),
            on_unsubscribe: None,
            udata1: None,
            udata2: None,
        }
    }

    /// Replaces the pattern matcher (see [`crate::core::channel::register_matcher`]).
    pub fn matcher(mut self, matcher: Matcher) -> Self {
        self.matcher = Some(matcher);
        self
    }

    /// Runs exactly once when the subscription's last reference is dropped,
    /// or immediately if the subscribe call itself is rejected.
    pub fn on_unsubscribe(
        mut self,
        f: impl FnOnce(Option<Udata>, Option<Udata>) + Send + 'static,
    ) -> Self {
        self.on_unsubscribe = Some(Box::new(f));
        self
    }

    pub fn udata1(mut self, udata: Udata) -> Self {
        self.udata1 = Some(udata);
        self
    }

    pub fn udata2(mut self, udata: Udata) -> Self {
        self.udata2 = Some(udata);
        self
    }
}

/// Internal subscription record.
///
/// Referenced by the channel's list, by the delivery task, and by the user
/// handle. `on_unsubscribe` runs when the last of those references drops.
pub(crate) struct SubscriptionInner {
    pub(crate) channel_id: ChannelId,
    /// Back-reference to the owning channel (relation, not ownership).
    pub(crate) parent: Weak<Channel>,
    pub(crate) callback: Callback,
    pub(crate) on_unsubscribe: Mutex<Option<UnsubscribeFn>>,
    pub(crate) udata1: Option<Udata>,
    pub(crate) udata2: Option<Udata>,
    /// Delivery queue; taken (and so closed) on unsubscribe.
    pub(crate) sender: Mutex<Option<mpsc::UnboundedSender<Arc<Envelope>>>>,
}

impl SubscriptionInner {
    /// Enqueues one envelope for delivery. A closed queue means the
    /// subscription is being torn down; the message is silently dropped.
    pub(crate) fn enqueue(&self, env: Arc<Envelope>) {
        if let Some(sender) = &*self.sender.lock() {
            let _ = sender.send(env);
        }
    }
}

impl Drop for SubscriptionInner {
    fn drop(&mut self) {
        if let Some(f) = self.on_unsubscribe.get_mut().take() {
            f(self.udata1.take(), self.udata2.take());
        }
    }
}

/// Spawns the per-subscription delivery task.
///
/// One task per subscription serializes its callback: it can never run
/// concurrently for two messages of the same subscription. The task holds a
/// reference to the record, so `on_unsubscribe` cannot fire before every
/// queued message has been delivered.
pub(crate) fn spawn_delivery_task(
    inner: Arc<SubscriptionInner>,
    mut rx: mpsc::UnboundedReceiver<Arc<Envelope>>,
) {
    tokio::spawn(async move {
        while let Some(env) = rx.recv().await {
            loop {
                let view = Message::new(&env, inner.udata1.clone(), inner.udata2.clone());
                (inner.callback)(&view);
                if !view.is_deferred() {
                    break;
                }
                // the callback asked to run again for this message; yield so
                // other tasks make progress in between
                tokio::task::yield_now().await;
            }
        }
    });
}

/// Handle to an active subscription.
///
/// Dropping the handle unsubscribes. In-flight messages may still be
/// delivered once more before `on_unsubscribe` runs.
pub struct Subscription {
    pub(crate) bus: Arc<Postoffice>,
    pub(crate) inner: Option<Arc<SubscriptionInner>>,
}

impl Subscription {
    /// The channel or filter identity this subscription is listed under.
    pub fn channel_id(&self) -> &ChannelId {
        &self
            .inner
            .as_ref()
            .expect("subscription handle already consumed")
            .channel_id
    }

    /// Cancels the subscription (equivalent to dropping the handle).
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            self.bus.unsubscribe_inner(inner);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel_id", &self.inner.as_ref().map(|i| &i.channel_id))
            .finish()
    }
}
