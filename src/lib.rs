//! forkbus — an in-process publish/subscribe bus with transparent
//! multi-process fan-out.
//!
//! Any publisher in any process of a cluster can deliver messages to every
//! matching subscriber across the cluster. A single *root* process owns a
//! local-domain socket; *worker* processes connect to it and share the
//! pub/sub namespace. Subscriptions target exact channel names, glob
//! patterns, or process-local numeric filters.
//!
//! ```rust,ignore
//! use forkbus::{PublishOptions, Scope, SubscribeOptions};
//!
//! let _sub = forkbus::subscribe(SubscribeOptions::channel("news", |msg| {
//!     println!("got {:?}", msg.payload());
//! }))
//! .expect("valid subscription");
//!
//! forkbus::publish(PublishOptions::channel("news").payload("hi").scope(Scope::Process));
//! ```

pub mod cluster;
pub mod config;
pub mod core;
pub mod hooks;
pub mod logging;

use std::sync::Arc;

use once_cell::sync::Lazy;

pub use crate::cluster::frame::{Frame, FrameError, FrameParser, FrameType};
pub use crate::cluster::SOCKET_ENV;
pub use crate::config::{ClusterConfig, Config};
pub use crate::core::{
    glob_match, register_matcher, Body, ChannelId, Engine, MatchFn, Matcher, Message, Metadata,
    MetadataProducer, Postoffice, PublishOptions, Scope, SubscribeOptions, Subscription, Udata,
};
pub use crate::hooks::Hook;

static POSTOFFICE: Lazy<Arc<Postoffice>> = Lazy::new(|| Postoffice::new(Config::default()));

/// The process-wide postoffice instance.
pub fn postoffice() -> &'static Arc<Postoffice> {
    &POSTOFFICE
}

/// Subscribes on the process-wide postoffice.
pub fn subscribe(opts: SubscribeOptions) -> Option<Subscription> {
    postoffice().subscribe(opts)
}

/// Publishes on the process-wide postoffice.
pub fn publish(opts: PublishOptions) {
    postoffice().publish(opts)
}

/// Broadcasts a shutdown request to every worker of the process-wide
/// postoffice's cluster.
pub fn signal_children() {
    postoffice().signal_children()
}
