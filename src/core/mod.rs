//! The postoffice core: channel collections, dispatch, engines, metadata.

pub mod bus;
pub mod channel;
pub(crate) mod collection;
pub mod dispatch;
pub mod engine;
pub mod glob;
pub mod message;
pub mod metadata;
pub mod subscription;

pub use bus::Postoffice;
pub use channel::{register_matcher, ChannelId, MatchFn, Matcher};
pub use dispatch::{PublishOptions, Scope};
pub use engine::Engine;
pub use glob::glob_match;
pub use message::{Body, Message, Metadata};
pub use metadata::MetadataProducer;
pub use subscription::{SubscribeOptions, Subscription, Udata};
