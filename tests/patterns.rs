use std::sync::Arc;

use forkbus::{Config, Postoffice, PublishOptions, Scope, SubscribeOptions};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

mod common;

fn test_bus() -> Arc<Postoffice> {
    common::init_logging();
    let mut cfg = Config::default();
    cfg.cluster.raise_signals = false;
    Postoffice::new(cfg)
}

#[tokio::test]
async fn glob_pattern_matches_published_channels() {
    let bus = test_bus();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _sub = bus
        .subscribe(SubscribeOptions::pattern("ch.*", move |msg| {
            let _ = tx.send(msg.channel().unwrap().as_bytes().unwrap().clone());
        }))
        .unwrap();

    bus.publish(PublishOptions::channel("ch.42").payload("x").scope(Scope::Process));
    let seen = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(&seen[..], b"ch.42");

    bus.publish(PublishOptions::channel("other").payload("x").scope(Scope::Process));
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn exact_and_pattern_subscribers_both_fire() {
    let bus = test_bus();
    let (tx_exact, mut rx_exact) = mpsc::unbounded_channel();
    let (tx_pattern, mut rx_pattern) = mpsc::unbounded_channel();

    let _exact = bus
        .subscribe(SubscribeOptions::channel("logs.app", move |_msg| {
            let _ = tx_exact.send(());
        }))
        .unwrap();
    let _pattern = bus
        .subscribe(SubscribeOptions::pattern("logs.*", move |_msg| {
            let _ = tx_pattern.send(());
        }))
        .unwrap();

    bus.publish(PublishOptions::channel("logs.app").payload("x").scope(Scope::Process));
    assert!(timeout(Duration::from_secs(1), rx_exact.recv()).await.unwrap().is_some());
    assert!(timeout(Duration::from_secs(1), rx_pattern.recv()).await.unwrap().is_some());
}

#[tokio::test]
async fn character_class_patterns() {
    let bus = test_bus();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _sub = bus
        .subscribe(SubscribeOptions::pattern("[a-c]*", move |msg| {
            let _ = tx.send(msg.channel().unwrap().as_bytes().unwrap().clone());
        }))
        .unwrap();

    for channel in ["aX", "c"] {
        bus.publish(PublishOptions::channel(channel).payload("x").scope(Scope::Process));
        let seen = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(&seen[..], channel.as_bytes());
    }

    bus.publish(PublishOptions::channel("dX").payload("x").scope(Scope::Process));
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn escaped_star_is_a_literal() {
    let bus = test_bus();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _sub = bus
        .subscribe(SubscribeOptions::pattern("\\*", move |_msg| {
            let _ = tx.send(());
        }))
        .unwrap();

    bus.publish(PublishOptions::channel("*").payload("x").scope(Scope::Process));
    assert!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_some());

    bus.publish(PublishOptions::channel("anything").payload("x").scope(Scope::Process));
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn custom_matchers_can_be_registered() {
    fn prefix_match(pattern: &[u8], channel: &[u8]) -> bool {
        channel.starts_with(pattern)
    }
    forkbus::register_matcher("prefix", prefix_match);

    let bus = test_bus();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let matcher = forkbus::Matcher {
        name: "prefix",
        func: prefix_match,
    };
    let _sub = bus
        .subscribe(
            SubscribeOptions::pattern("sensor/", move |msg| {
                let _ = tx.send(msg.channel().unwrap().as_bytes().unwrap().clone());
            })
            .matcher(matcher),
        )
        .unwrap();

    bus.publish(PublishOptions::channel("sensor/1/temp").payload("20").scope(Scope::Process));
    let seen = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(&seen[..], b"sensor/1/temp");
}
