use std::path::{Path, PathBuf};
use std::sync::Arc;

use forkbus::{
    Body, ChannelId, Config, Engine, Hook, Matcher, Postoffice, PublishOptions, Scope,
    SubscribeOptions,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

mod common;

/// Records channel-lifecycle notifications the root's bookkeeping emits.
#[derive(Default)]
struct ChannelLog {
    seen: parking_lot::Mutex<Vec<String>>,
}

impl Engine for ChannelLog {
    fn subscribe(&self, channel: &ChannelId, _matcher: Option<&Matcher>) {
        if let Some(name) = channel.as_name() {
            self.seen
                .lock()
                .push(format!("sub {}", String::from_utf8_lossy(name)));
        }
    }

    fn unsubscribe(&self, channel: &ChannelId, _matcher: Option<&Matcher>) {
        if let Some(name) = channel.as_name() {
            self.seen
                .lock()
                .push(format!("unsub {}", String::from_utf8_lossy(name)));
        }
    }

    fn publish(&self, _channel: Option<&Body>, _payload: Option<&Body>) {}
}

fn cluster_config(dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.cluster.socket_dir = Some(dir.to_path_buf());
    cfg.cluster.ping_interval_ms = 100;
    cfg.cluster.raise_signals = false;
    cfg
}

fn root_bus(dir: &Path) -> (Arc<Postoffice>, PathBuf) {
    common::init_logging();
    let bus = Postoffice::new(cluster_config(dir));
    let path = bus.listen().expect("bind cluster socket");
    (bus, path)
}

async fn worker_bus(dir: &Path, path: &Path) -> Arc<Postoffice> {
    let bus = Postoffice::new(cluster_config(dir));
    bus.connect(Some(path.to_path_buf()))
        .await
        .expect("connect to root");
    bus
}

#[tokio::test]
async fn cluster_publish_reaches_remote_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let (_root, path) = root_bus(dir.path());
    let worker1 = worker_bus(dir.path(), &path).await;
    let worker2 = worker_bus(dir.path(), &path).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = worker1
        .subscribe(SubscribeOptions::channel("t", move |msg| {
            let _ = tx.send(msg.payload().unwrap().as_bytes().unwrap().clone());
        }))
        .unwrap();
    // let the link settle before publishing from the sibling
    sleep(Duration::from_millis(50)).await;

    worker2.publish(
        PublishOptions::channel("t")
            .payload("m")
            .scope(Scope::Cluster),
    );

    let seen = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(&seen[..], b"m");
    // exactly once
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
}

#[tokio::test]
async fn siblings_scope_skips_the_publishing_process() {
    let dir = tempfile::tempdir().unwrap();
    let (_root, path) = root_bus(dir.path());
    let worker1 = worker_bus(dir.path(), &path).await;
    let worker2 = worker_bus(dir.path(), &path).await;

    let (tx1, mut rx1) = mpsc::unbounded_channel();
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    let _s1 = worker1
        .subscribe(SubscribeOptions::channel("t", move |_msg| {
            let _ = tx1.send(());
        }))
        .unwrap();
    let _s2 = worker2
        .subscribe(SubscribeOptions::channel("t", move |_msg| {
            let _ = tx2.send(());
        }))
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    worker2.publish(
        PublishOptions::channel("t")
            .payload("m")
            .scope(Scope::Siblings),
    );

    // the sibling fires, the publisher's own subscription does not
    assert!(timeout(Duration::from_secs(2), rx1.recv()).await.unwrap().is_some());
    assert!(timeout(Duration::from_millis(200), rx2.recv()).await.is_err());
}

#[tokio::test]
async fn root_scope_delivers_in_the_root_only() {
    let dir = tempfile::tempdir().unwrap();
    let (root, path) = root_bus(dir.path());
    let worker1 = worker_bus(dir.path(), &path).await;
    let worker2 = worker_bus(dir.path(), &path).await;

    let (tx_root, mut rx_root) = mpsc::unbounded_channel();
    let (tx_w2, mut rx_w2) = mpsc::unbounded_channel();
    let _root_sub = root
        .subscribe(SubscribeOptions::channel("up", move |msg| {
            let _ = tx_root.send(msg.payload().unwrap().as_bytes().unwrap().clone());
        }))
        .unwrap();
    let _w2_sub = worker2
        .subscribe(SubscribeOptions::channel("up", move |_msg| {
            let _ = tx_w2.send(());
        }))
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    worker1.publish(
        PublishOptions::channel("up")
            .payload("report")
            .scope(Scope::Root),
    );

    let seen = timeout(Duration::from_secs(2), rx_root.recv()).await.unwrap().unwrap();
    assert_eq!(&seen[..], b"report");
    // not rebroadcast to the other worker
    assert!(timeout(Duration::from_millis(200), rx_w2.recv()).await.is_err());
}

#[tokio::test]
async fn filters_cross_the_cluster_but_not_channel_lookups() {
    let dir = tempfile::tempdir().unwrap();
    let (_root, path) = root_bus(dir.path());
    let worker1 = worker_bus(dir.path(), &path).await;
    let worker2 = worker_bus(dir.path(), &path).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = worker1
        .subscribe(SubscribeOptions::filter(5, move |msg| {
            let _ = tx.send(msg.filter());
        }))
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    worker2.publish(PublishOptions::filter(5).payload("p").scope(Scope::Cluster));
    assert_eq!(
        timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap(),
        5
    );
}

#[tokio::test]
async fn worker_replays_channels_on_connect() {
    let dir = tempfile::tempdir().unwrap();
    let (root, path) = root_bus(dir.path());
    let log = Arc::new(ChannelLog::default());
    root.attach(log.clone() as Arc<dyn Engine>);

    // the worker subscribes before it ever connects
    let worker = Postoffice::new(cluster_config(dir.path()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = worker
        .subscribe(SubscribeOptions::channel("early", move |msg| {
            let _ = tx.send(msg.payload().unwrap().as_bytes().unwrap().clone());
        }))
        .unwrap();

    worker.connect(Some(path.clone())).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    // the replayed intent surfaced on the root as a channel creation
    assert!(log.seen.lock().contains(&"sub early".to_string()));

    root.publish(
        PublishOptions::channel("early")
            .payload("caught-up")
            .scope(Scope::Cluster),
    );
    let seen = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(&seen[..], b"caught-up");
}

#[tokio::test]
async fn shutdown_broadcast_stops_workers() {
    let dir = tempfile::tempdir().unwrap();
    let (root, path) = root_bus(dir.path());
    let worker = worker_bus(dir.path(), &path).await;
    sleep(Duration::from_millis(50)).await;

    assert!(worker.cluster_running());
    root.signal_children();

    timeout(Duration::from_secs(2), async {
        while worker.cluster_running() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker should observe the shutdown frame");
}

#[tokio::test]
async fn parent_crash_fires_hook_and_unlinks_socket() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sock");
    // a bare listener stands in for a root that dies without a shutdown frame
    let listener = tokio::net::UnixListener::bind(&path).unwrap();

    let worker = Postoffice::new(cluster_config(dir.path()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    worker.hooks.register(Hook::ParentCrash, move || {
        let _ = tx.send(());
    });
    worker.connect(Some(path.clone())).await.unwrap();

    let (stream, _) = listener.accept().await.unwrap();
    drop(stream); // parent "crashes"

    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("crash hook within the ping interval")
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    assert!(!path.exists(), "worker unlinks the socket it held");
    assert!(!worker.cluster_running());
}

#[tokio::test]
async fn root_finish_unlinks_the_socket_once() {
    let dir = tempfile::tempdir().unwrap();
    let (root, path) = root_bus(dir.path());
    assert!(path.exists());
    root.finish();
    assert!(!path.exists());
    // a second finish is a no-op
    root.finish();
}
