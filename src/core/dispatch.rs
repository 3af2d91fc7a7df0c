//! Publishing: normalization, delivery scopes, and local fan-out.

use std::sync::Arc;

use bytes::Bytes;
use tracing::error;

use crate::cluster::frame::{Frame, FrameType};
use crate::core::bus::Postoffice;
use crate::core::channel::{Channel, ChannelId};
use crate::core::engine::Engine;
use crate::core::message::{Body, Envelope, Message};

/// Where a publish is delivered.
#[derive(Clone)]
pub enum Scope {
    /// Every process in the cluster, including this one. The default.
    Cluster,
    /// This process only.
    Process,
    /// Every other process, excluding this one.
    Siblings,
    /// The root process only.
    Root,
    /// A specific attached engine (pub/sub messages only).
    Engine(Arc<dyn Engine>),
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Cluster => f.write_str("Cluster"),
            Scope::Process => f.write_str("Process"),
            Scope::Siblings => f.write_str("Siblings"),
            Scope::Root => f.write_str("Root"),
            Scope::Engine(_) => f.write_str("Engine(..)"),
        }
    }
}

/// Arguments for [`Postoffice::publish`].
pub struct PublishOptions {
    pub(crate) scope: Option<Scope>,
    pub(crate) filter: i32,
    pub(crate) channel: Option<Body>,
    pub(crate) payload: Option<Body>,
}

impl PublishOptions {
    /// Publishes to a named channel (and any patterns matching it).
    pub fn channel(channel: impl Into<Body>) -> Self {
        PublishOptions {
            scope: None,
            filter: 0,
            channel: Some(channel.into()),
            payload: None,
        }
    }

    /// Publishes to a process-local numeric filter.
    pub fn filter(filter: i32) -> Self {
        PublishOptions {
            scope: None,
            filter,
            channel: None,
            payload: None,
        }
    }

    pub fn payload(mut self, payload: impl Into<Body>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }
}

/// A publish normalized to its wire form. Built exactly once per publish,
/// before any fan-out.
pub(crate) struct WireMsg {
    pub(crate) filter: i32,
    pub(crate) channel: Bytes,
    pub(crate) payload: Bytes,
    pub(crate) json: bool,
}

impl WireMsg {
    pub(crate) fn frame(&self, frame_type: FrameType) -> Frame {
        Frame {
            frame_type,
            filter: self.filter,
            channel: self.channel.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Serializes channel and payload. If both are plain bytes the message
/// stays byte-typed; otherwise both sides are rendered to canonical JSON
/// text and the message is marked as such.
fn normalize(filter: i32, channel: Option<Body>, payload: Option<Body>) -> WireMsg {
    let structured = matches!(channel, Some(Body::Json(_))) || matches!(payload, Some(Body::Json(_)));
    let render = |body: Option<Body>| -> Bytes {
        match body {
            None => Bytes::new(),
            Some(Body::Bytes(b)) if !structured => b,
            Some(Body::Bytes(b)) => {
                // byte half of a structured message rides along as a JSON string
                let text = String::from_utf8_lossy(&b).into_owned();
                Bytes::from(serde_json::to_vec(&serde_json::Value::String(text)).unwrap_or_default())
            }
            Some(Body::Json(v)) => Bytes::from(serde_json::to_vec(&v).unwrap_or_default()),
        }
    };
    WireMsg {
        filter,
        channel: render(channel),
        payload: render(payload),
        json: structured,
    }
}

/// Decodes a wire form back into view bodies, the same way a remote
/// process would, so local and remote subscribers observe equal views.
fn decode_wire(json: bool, bytes: Bytes) -> Option<Body> {
    if bytes.is_empty() {
        return None;
    }
    if json {
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(Body::Json(value)),
            // undecodable text is delivered as the raw bytes
            Err(_) => Some(Body::Bytes(bytes)),
        }
    } else {
        Some(Body::Bytes(bytes))
    }
}

impl Postoffice {
    /// Publishes a message to the relevant subscribers, if any.
    ///
    /// Defaults to the scope set with
    /// [`set_default_scope`](Postoffice::set_default_scope) (initially
    /// [`Scope::Cluster`]). Never blocks on user code or I/O; callbacks run
    /// later on their subscriptions' delivery tasks.
    pub fn publish(&self, opts: PublishOptions) {
        let scope = opts
            .scope
            .unwrap_or_else(|| self.default_scope.lock().clone());
        match scope {
            Scope::Cluster => {
                let m = normalize(opts.filter, opts.channel, opts.payload);
                self.send_frame_to_cluster(m.frame(if m.json {
                    FrameType::Json
                } else {
                    FrameType::Forward
                }));
                self.publish_local(&m);
            }
            Scope::Process => {
                let m = normalize(opts.filter, opts.channel, opts.payload);
                self.publish_local(&m);
            }
            Scope::Siblings => {
                let m = normalize(opts.filter, opts.channel, opts.payload);
                self.send_frame_to_cluster(m.frame(if m.json {
                    FrameType::Json
                } else {
                    FrameType::Forward
                }));
            }
            Scope::Root => {
                let m = normalize(opts.filter, opts.channel, opts.payload);
                if self.cluster.is_root() {
                    self.publish_local(&m);
                } else {
                    self.send_frame_to_cluster(m.frame(if m.json {
                        FrameType::RootJson
                    } else {
                        FrameType::Root
                    }));
                }
            }
            Scope::Engine(engine) => {
                if opts.filter != 0 {
                    error!("engines can only publish pub/sub messages (filter must be 0)");
                    return;
                }
                engine.publish(opts.channel.as_ref(), opts.payload.as_ref());
            }
        }
    }

    /// Fans a wire-form message out to this process's subscribers.
    /// Also the entry point for frames arriving over a cluster link.
    pub(crate) fn publish_local(&self, m: &WireMsg) {
        let mut env = Arc::new(Envelope {
            filter: m.filter,
            channel: decode_wire(m.json, m.channel.clone()),
            payload: decode_wire(m.json, m.payload.clone()),
            metadata: Vec::new(),
        });

        // metadata producers run once, before any subscriber is scheduled
        if m.filter == 0 && !self.meta.is_empty() {
            let view = Message::new(&env, None, None);
            let mut produced = Vec::new();
            for producer in self.meta.snapshot() {
                if let Some(meta) = producer(&view, &m.channel, &m.payload) {
                    produced.push(meta);
                }
            }
            drop(view);
            if let Some(inner) = Arc::get_mut(&mut env) {
                inner.metadata = produced;
            }
        }

        if m.filter != 0 {
            let map = self.filters.channels.lock();
            if let Some(ch) = map.get(&ChannelId::Filter(m.filter)) {
                enqueue_channel(ch, &env);
            }
            return;
        }

        // exact match first, then patterns
        {
            let map = self.pubsub.channels.lock();
            if let Some(ch) = map.get(&ChannelId::Name(m.channel.clone())) {
                enqueue_channel(ch, &env);
            }
        }
        {
            let map = self.patterns.channels.lock();
            for ch in map.values() {
                if let (Some(matcher), Some(pattern)) = (&ch.matcher, ch.id.as_name()) {
                    if (matcher.func)(pattern, &m.channel) {
                        enqueue_channel(ch, &env);
                    }
                }
            }
        }
    }
}

/// Schedules the message on every subscription of one channel, in list
/// order. Runs under the collection lock; the channel lock nests inside it.
fn enqueue_channel(ch: &Arc<Channel>, env: &Arc<Envelope>) {
    for sub in ch.subscriptions.lock().iter() {
        sub.enqueue(env.clone());
    }
}
