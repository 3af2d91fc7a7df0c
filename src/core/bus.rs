//! The postoffice: three channel collections, the engine and metadata
//! registries, and the cluster endpoint, behind one handle.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cluster::ClusterState;
use crate::config::Config;
use crate::core::channel::{Channel, ChannelId};
use crate::core::collection::{Collection, CollectionKind};
use crate::core::dispatch::Scope;
use crate::core::engine::{Engine, EngineRegistry};
use crate::core::metadata::{MetadataProducer, MetadataRegistry};
use crate::core::subscription::{
    spawn_delivery_task, SubscribeOptions, Subscription, SubscriptionInner,
};
use crate::hooks::{Hook, HookRegistry};

/// One process-wide pub/sub bus.
///
/// Most applications use the global instance behind [`crate::postoffice`];
/// embedding several instances in one process (each with its own cluster
/// endpoint) is supported and is how the integration tests exercise the
/// root/worker topology.
pub struct Postoffice {
    pub(crate) config: Config,
    pub(crate) filters: Collection,
    pub(crate) pubsub: Collection,
    pub(crate) patterns: Collection,
    pub(crate) engines: EngineRegistry,
    pub(crate) meta: MetadataRegistry,
    pub(crate) default_scope: Mutex<Scope>,
    pub(crate) cluster: ClusterState,
    pub hooks: HookRegistry,
    /// Back-reference to the owning `Arc`, for handles and spawned tasks.
    self_ref: Weak<Postoffice>,
}

impl Postoffice {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Postoffice {
            config,
            filters: Collection::new(),
            pubsub: Collection::new(),
            patterns: Collection::new(),
            engines: EngineRegistry::new(),
            meta: MetadataRegistry::new(),
            default_scope: Mutex::new(Scope::Cluster),
            cluster: ClusterState::new(),
            hooks: HookRegistry::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// A strong handle to this bus. Always succeeds while any caller holds
    /// the bus to invoke this on.
    pub(crate) fn handle(&self) -> Arc<Postoffice> {
        self.self_ref.upgrade().expect("postoffice still referenced")
    }

    pub(crate) fn collection(&self, kind: CollectionKind) -> &Collection {
        match kind {
            CollectionKind::Filters => &self.filters,
            CollectionKind::Pubsub => &self.pubsub,
            CollectionKind::Patterns => &self.patterns,
        }
    }

    /// Subscribes to a filter, a channel, or a pattern.
    ///
    /// Returns `None` on invalid argument combinations (a filter together
    /// with a channel or matcher); the options' `on_unsubscribe` still runs,
    /// with the supplied user data, so cleanup is never lost.
    ///
    /// Must be called from within a tokio runtime: each subscription owns a
    /// delivery task that serializes its callback.
    pub fn subscribe(&self, opts: SubscribeOptions) -> Option<Subscription> {
        let SubscribeOptions {
            filter,
            channel,
            matcher,
            callback,
            on_unsubscribe,
            udata1,
            udata2,
        } = opts;

        let target = if filter != 0 {
            // a filter subscription admits neither a channel nor a matcher
            if channel.is_none() && matcher.is_none() {
                Some((CollectionKind::Filters, ChannelId::Filter(filter)))
            } else {
                None
            }
        } else if matcher.is_some() {
            channel.map(|name| (CollectionKind::Patterns, ChannelId::Name(name)))
        } else {
            channel.map(|name| (CollectionKind::Pubsub, ChannelId::Name(name)))
        };
        let Some((kind, id)) = target else {
            warn!(filter, "rejected subscribe: needs exactly one of filter or channel");
            if let Some(f) = on_unsubscribe {
                f(udata1, udata2);
            }
            return None;
        };

        let collection = self.collection(kind);
        let mut map = collection.channels.lock();
        Collection::compact(&mut map);
        let ch = match map.get(&id) {
            Some(existing) => existing.clone(),
            None => {
                let ch = Channel::new(id.clone(), kind, matcher);
                map.insert(id.clone(), ch.clone());
                if kind != CollectionKind::Filters {
                    self.on_channel_create(&ch);
                }
                ch
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SubscriptionInner {
            channel_id: id,
            parent: Arc::downgrade(&ch),
            callback,
            on_unsubscribe: Mutex::new(on_unsubscribe),
            udata1,
            udata2,
            sender: Mutex::new(Some(tx)),
        });
        ch.subscriptions.lock().push(inner.clone());
        drop(map);

        spawn_delivery_task(inner.clone(), rx);
        Some(Subscription {
            bus: self.handle(),
            inner: Some(inner),
        })
    }

    /// Removes a subscription from its channel and destroys the channel if
    /// the subscription list drained. Queued messages still deliver before
    /// `on_unsubscribe` runs.
    pub(crate) fn unsubscribe_inner(&self, inner: Arc<SubscriptionInner>) {
        // closing the queue lets the delivery task drain and drop its reference
        let sender = inner.sender.lock().take();
        if let Some(ch) = inner.parent.upgrade() {
            let collection = self.collection(ch.kind);
            let mut map = collection.channels.lock();
            let now_empty = {
                let mut subs = ch.subscriptions.lock();
                subs.retain(|s| !Arc::ptr_eq(s, &inner));
                subs.is_empty()
            };
            if now_empty && map.get(&ch.id).is_some_and(|cur| Arc::ptr_eq(cur, &ch)) {
                map.remove(&ch.id);
                Collection::compact(&mut map);
                drop(map);
                if ch.kind != CollectionKind::Filters {
                    self.on_channel_destroy(&ch);
                }
            }
        }
        drop(sender);
    }

    /// A pub/sub or pattern channel was inserted: notify every engine, then
    /// forward the intent upstream. Runs with the collection lock held.
    pub(crate) fn on_channel_create(&self, ch: &Arc<Channel>) {
        self.engines.notify_subscribe(&ch.id, ch.matcher.as_ref());
        self.inform_root(&ch.id, ch.matcher.as_ref(), true);
    }

    pub(crate) fn on_channel_destroy(&self, ch: &Arc<Channel>) {
        self.engines.notify_unsubscribe(&ch.id, ch.matcher.as_ref());
        self.inform_root(&ch.id, ch.matcher.as_ref(), false);
    }

    // ------------------------------------------------------------------
    // Engines
    // ------------------------------------------------------------------

    /// Attaches an engine and replays every live pub/sub and pattern
    /// channel into it.
    pub fn attach(&self, engine: Arc<dyn Engine>) {
        self.engines.insert(engine.clone());
        self.replay_channels(&engine);
    }

    /// Detaches an engine. If it was the default publish target, the
    /// default reverts to the built-in cluster scope.
    pub fn detach(&self, engine: &Arc<dyn Engine>) {
        {
            let mut scope = self.default_scope.lock();
            if let Scope::Engine(default) = &*scope {
                if Arc::ptr_eq(default, engine) {
                    *scope = Scope::Cluster;
                }
            }
        }
        let was_attached = self.engines.remove(engine);
        if !was_attached {
            #[cfg(debug_assertions)]
            warn!("detach: engine was not attached");
        }
    }

    /// Replays every live channel into the engine without attaching it;
    /// lets an engine that lost its broker connection resubscribe.
    pub fn reattach(&self, engine: &Arc<dyn Engine>) {
        if !self.engines.contains(engine) {
            #[cfg(debug_assertions)]
            warn!("reattach: engine is not attached");
        }
        self.replay_channels(engine);
    }

    pub fn is_attached(&self, engine: &Arc<dyn Engine>) -> bool {
        self.engines.contains(engine)
    }

    /// Routes publishes with no explicit scope. Reverted to
    /// [`Scope::Cluster`] when a default engine detaches and at exit.
    pub fn set_default_scope(&self, scope: Scope) {
        *self.default_scope.lock() = scope;
    }

    fn replay_channels(&self, engine: &Arc<dyn Engine>) {
        {
            let map = self.pubsub.channels.lock();
            for ch in map.values() {
                engine.subscribe(&ch.id, None);
            }
        }
        {
            let map = self.patterns.channels.lock();
            for ch in map.values() {
                engine.subscribe(&ch.id, ch.matcher.as_ref());
            }
        }
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Registers a metadata producer, run once per pub/sub publish before
    /// any subscriber is scheduled.
    pub fn metadata_register(&self, producer: MetadataProducer) {
        self.meta.register(producer);
    }

    pub fn metadata_unregister(&self, producer: &MetadataProducer) {
        self.meta.unregister(producer);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Runs the start hooks and every attached engine's `on_startup`.
    /// Call once per process after `listen`/`connect`.
    pub fn startup(&self) {
        self.hooks.run(Hook::OnStart);
        for engine in self.engines.snapshot() {
            engine.on_startup();
        }
    }

    /// Reinitializes every lock and compacts the channel tables. Must run
    /// in a forked child before its runtime starts, because the parent may
    /// have held any of these locks at fork time.
    pub fn reinit_after_fork(&self) {
        unsafe {
            self.force_unlock_all();
        }
        for collection in [&self.filters, &self.pubsub, &self.patterns] {
            collection.channels.lock().shrink_to_fit();
        }
        self.hooks.run(Hook::InChild);
    }

    /// # Safety
    /// Only sound when no thread of this process holds any bus lock (i.e.
    /// right after `fork`, before the child spawns threads).
    unsafe fn force_unlock_all(&self) {
        for collection in [&self.filters, &self.pubsub, &self.patterns] {
            if collection.channels.is_locked() {
                collection.channels.force_unlock();
            }
            for ch in collection.snapshot() {
                if ch.subscriptions.is_locked() {
                    ch.subscriptions.force_unlock();
                }
            }
        }
        self.engines.force_unlock();
        self.meta.force_unlock();
        self.hooks.force_unlock();
        if self.default_scope.is_locked() {
            self.default_scope.force_unlock();
        }
        self.cluster.force_unlock();
    }

    /// Orderly teardown: runs the finish hooks and closes the cluster
    /// endpoint (the root unlinks its socket file here, exactly once).
    pub fn finish(&self) {
        self.hooks.run(Hook::OnFinish);
        let is_root = self.cluster.is_root();
        self.cluster_cleanup(is_root);
    }

    /// Final drain: cancels every remaining subscription, detaches every
    /// engine, and clears the metadata producers.
    pub fn at_exit(&self) {
        self.hooks.run(Hook::AtExit);
        for collection in [&self.patterns, &self.pubsub, &self.filters] {
            loop {
                let stale: Vec<Arc<SubscriptionInner>> = collection
                    .snapshot()
                    .iter()
                    .flat_map(|ch| ch.subscriptions.lock().clone())
                    .collect();
                if stale.is_empty() {
                    break;
                }
                for sub in stale {
                    self.unsubscribe_inner(sub);
                }
            }
        }
        *self.default_scope.lock() = Scope::Cluster;
        drop(self.engines.drain());
        self.meta.clear();
        debug!("postoffice drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatch::PublishOptions;
    use tokio::time::{timeout, Duration};

    // A fork can catch any bus lock held by another thread of the parent.
    // Leaking lock guards reproduces that state in-process.
    #[tokio::test]
    async fn reinit_after_fork_recovers_held_locks() {
        let bus = Postoffice::new(Config::default());
        let _named = bus
            .subscribe(SubscribeOptions::channel("held", |_msg| {}))
            .unwrap();
        let _pattern = bus
            .subscribe(SubscribeOptions::pattern("held.*", |_msg| {}))
            .unwrap();
        let _filter = bus
            .subscribe(SubscribeOptions::filter(2, |_msg| {}))
            .unwrap();

        let (hook_tx, mut hook_rx) = mpsc::unbounded_channel();
        bus.hooks.register(Hook::InChild, move || {
            let _ = hook_tx.send(());
        });

        let ch = bus.pubsub.snapshot().into_iter().next().unwrap();
        std::mem::forget(bus.filters.channels.lock());
        std::mem::forget(bus.pubsub.channels.lock());
        std::mem::forget(bus.patterns.channels.lock());
        std::mem::forget(ch.subscriptions.lock());
        std::mem::forget(bus.default_scope.lock());
        assert!(bus.pubsub.channels.is_locked());

        bus.reinit_after_fork();

        assert!(!bus.filters.channels.is_locked());
        assert!(!bus.pubsub.channels.is_locked());
        assert!(!bus.patterns.channels.is_locked());
        assert!(!ch.subscriptions.is_locked());
        assert!(!bus.default_scope.is_locked());
        hook_rx.try_recv().expect("in-child hook ran");

        // the recovered bus takes subscriptions and delivers again
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = bus
            .subscribe(SubscribeOptions::channel("after", move |msg| {
                let _ = tx.send(msg.payload().unwrap().as_bytes().unwrap().clone());
            }))
            .unwrap();
        bus.publish(
            PublishOptions::channel("after")
                .payload("x")
                .scope(Scope::Process),
        );
        let seen = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&seen[..], b"x");
    }
}
