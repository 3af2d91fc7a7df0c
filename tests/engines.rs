use std::sync::Arc;

use forkbus::{
    Body, ChannelId, Config, Engine, Matcher, Postoffice, PublishOptions, Scope, SubscribeOptions,
};
use parking_lot::Mutex;

mod common;

fn test_bus() -> Arc<Postoffice> {
    common::init_logging();
    let mut cfg = Config::default();
    cfg.cluster.raise_signals = false;
    Postoffice::new(cfg)
}

#[derive(Default)]
struct RecordingEngine {
    events: Mutex<Vec<String>>,
}

fn id_text(channel: &ChannelId) -> String {
    match channel.as_name() {
        Some(name) => String::from_utf8_lossy(name).into_owned(),
        None => format!("#{}", channel.filter()),
    }
}

impl Engine for RecordingEngine {
    fn subscribe(&self, channel: &ChannelId, matcher: Option<&Matcher>) {
        self.events.lock().push(format!(
            "sub {} {}",
            id_text(channel),
            matcher.map(|m| m.name).unwrap_or("-")
        ));
    }

    fn unsubscribe(&self, channel: &ChannelId, matcher: Option<&Matcher>) {
        self.events.lock().push(format!(
            "unsub {} {}",
            id_text(channel),
            matcher.map(|m| m.name).unwrap_or("-")
        ));
    }

    fn publish(&self, channel: Option<&Body>, payload: Option<&Body>) {
        let text = |body: Option<&Body>| -> String {
            match body {
                Some(Body::Bytes(b)) => String::from_utf8_lossy(b).into_owned(),
                Some(Body::Json(v)) => v.to_string(),
                None => "-".into(),
            }
        };
        self.events
            .lock()
            .push(format!("pub {} {}", text(channel), text(payload)));
    }
}

#[tokio::test]
async fn engines_track_channel_lifecycle() {
    let bus = test_bus();
    let engine = Arc::new(RecordingEngine::default());
    let dyn_engine: Arc<dyn Engine> = engine.clone();

    bus.attach(dyn_engine.clone());
    assert!(bus.is_attached(&dyn_engine));

    let sub = bus.subscribe(SubscribeOptions::channel("t", |_msg| {})).unwrap();
    // the create notification lands before anything can publish through the
    // new channel
    assert_eq!(*engine.events.lock(), vec!["sub t -"]);

    sub.unsubscribe();
    assert_eq!(*engine.events.lock(), vec!["sub t -", "unsub t -"]);
}

#[tokio::test]
async fn attach_replays_existing_channels() {
    let bus = test_bus();
    let _named = bus.subscribe(SubscribeOptions::channel("a", |_msg| {})).unwrap();
    let _pattern = bus.subscribe(SubscribeOptions::pattern("b.*", |_msg| {})).unwrap();
    // filters never reach engines
    let _filter = bus.subscribe(SubscribeOptions::filter(3, |_msg| {})).unwrap();

    let engine = Arc::new(RecordingEngine::default());
    bus.attach(engine.clone() as Arc<dyn Engine>);

    let events = engine.events.lock().clone();
    assert!(events.contains(&"sub a -".to_string()));
    assert!(events.contains(&"sub b.* glob".to_string()));
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn reattach_replays_without_duplicating() {
    let bus = test_bus();
    let _named = bus.subscribe(SubscribeOptions::channel("a", |_msg| {})).unwrap();

    let engine = Arc::new(RecordingEngine::default());
    let dyn_engine: Arc<dyn Engine> = engine.clone();
    bus.attach(dyn_engine.clone());
    engine.events.lock().clear();

    bus.reattach(&dyn_engine);
    assert_eq!(*engine.events.lock(), vec!["sub a -"]);
    assert!(bus.is_attached(&dyn_engine));
}

#[tokio::test]
async fn engine_scoped_publish_goes_to_the_engine_only() {
    let bus = test_bus();
    let engine = Arc::new(RecordingEngine::default());
    let dyn_engine: Arc<dyn Engine> = engine.clone();
    bus.attach(dyn_engine.clone());

    bus.publish(
        PublishOptions::channel("t")
            .payload("m")
            .scope(Scope::Engine(dyn_engine.clone())),
    );
    assert_eq!(*engine.events.lock(), vec!["pub t m"]);

    // engines cannot carry filter messages: logged and dropped
    engine.events.lock().clear();
    bus.publish(
        PublishOptions::filter(9)
            .payload("m")
            .scope(Scope::Engine(dyn_engine)),
    );
    assert!(engine.events.lock().is_empty());
}

#[tokio::test]
async fn detaching_the_default_engine_reverts_to_cluster() {
    let bus = test_bus();
    let engine = Arc::new(RecordingEngine::default());
    let dyn_engine: Arc<dyn Engine> = engine.clone();
    bus.attach(dyn_engine.clone());
    bus.set_default_scope(Scope::Engine(dyn_engine.clone()));

    bus.publish(PublishOptions::channel("t").payload("one"));
    assert_eq!(*engine.events.lock(), vec!["pub t one"]);

    bus.detach(&dyn_engine);
    assert!(!bus.is_attached(&dyn_engine));
    engine.events.lock().clear();

    // the default reverted: this publish takes the cluster path, not the engine
    bus.publish(PublishOptions::channel("t").payload("two"));
    assert!(engine.events.lock().is_empty());
}
