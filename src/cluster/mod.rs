//! Multi-process fan-out over a local-domain socket.
//!
//! The first process to call [`Postoffice::listen`] becomes the *root*: it
//! owns the cluster socket and fans published messages out to every
//! connected child. Worker processes call [`Postoffice::connect`] and
//! forward their subscribe/unsubscribe intent upstream so the root can
//! aggregate the cluster's channel table.

pub mod frame;
mod root;
mod worker;

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::core::bus::Postoffice;
use crate::core::channel::{ChannelId, Matcher};
use frame::{Frame, FrameError, FrameType};

/// Environment variable carrying the cluster socket path to spawned
/// workers. Set by the root when it starts listening.
pub const SOCKET_ENV: &str = "FORKBUS_SOCKET";

const SOCKET_PREFIX: &str = "forkbus-sock-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// No cluster endpoint yet; behaves as a root for `Scope::Root`.
    Standalone,
    Root,
    Worker,
}

#[derive(Clone)]
pub(crate) struct LinkHandle {
    pub(crate) id: u64,
    pub(crate) tx: mpsc::UnboundedSender<Bytes>,
}

pub(crate) struct ClusterInner {
    pub(crate) role: Role,
    pub(crate) socket_path: Option<PathBuf>,
    pub(crate) running: bool,
    /// Worker side: the single upstream link to the root.
    pub(crate) upstream: Option<LinkHandle>,
    /// Root side: one handle per connected child.
    pub(crate) links: Vec<LinkHandle>,
    pub(crate) next_link_id: u64,
    /// Root side: the accept loop, stopped on cleanup.
    pub(crate) accept_task: Option<tokio::task::JoinHandle<()>>,
}

pub(crate) struct ClusterState {
    pub(crate) inner: Mutex<ClusterInner>,
}

impl ClusterState {
    pub(crate) fn new() -> Self {
        ClusterState {
            inner: Mutex::new(ClusterInner {
                role: Role::Standalone,
                socket_path: None,
                running: false,
                upstream: None,
                links: Vec::new(),
                next_link_id: 0,
                accept_task: None,
            }),
        }
    }

    pub(crate) fn is_root(&self) -> bool {
        self.inner.lock().role != Role::Worker
    }

    /// Post-fork lock recovery.
    ///
    /// # Safety
    /// Only sound when no thread of this process holds the lock.
    pub(crate) unsafe fn force_unlock(&self) {
        if self.inner.is_locked() {
            self.inner.force_unlock();
        }
    }
}

/// The cluster socket path for this process: an override directory from the
/// config, else `TMPDIR`, else `/tmp`, joined with the fixed prefix and the
/// process id in octal.
pub(crate) fn default_socket_path(bus: &Postoffice) -> PathBuf {
    let dir = bus
        .config
        .cluster
        .socket_dir
        .clone()
        .or_else(|| std::env::var_os("TMPDIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    dir.join(format!("{}{:o}", SOCKET_PREFIX, std::process::id()))
}

impl Postoffice {
    /// Binds the cluster socket and starts accepting worker links; this
    /// process becomes the root. Runs the pre-start hooks first, unlinks
    /// any stale socket file, and exports the path via [`SOCKET_ENV`] so
    /// spawned workers can find it.
    ///
    /// Must be called from within a tokio runtime, before workers exist.
    pub fn listen(&self) -> std::io::Result<PathBuf> {
        self.hooks.run(crate::hooks::Hook::PreStart);
        let path = default_socket_path(self);
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path)?;
        {
            let mut inner = self.cluster.inner.lock();
            inner.role = Role::Root;
            inner.socket_path = Some(path.clone());
            inner.running = true;
        }
        std::env::set_var(SOCKET_ENV, &path);
        let accept_task = tokio::spawn(root::accept_loop(self.handle(), listener));
        self.cluster.inner.lock().accept_task = Some(accept_task);
        info!(path = %path.display(), "cluster socket listening");
        Ok(path)
    }

    /// Connects to the root's cluster socket; this process becomes a
    /// worker. With no explicit path, [`SOCKET_ENV`] is consulted and the
    /// process-derived default used last. Live pub/sub and pattern channels
    /// are replayed upstream so the root can aggregate.
    pub async fn connect(&self, path: Option<PathBuf>) -> std::io::Result<()> {
        let path = path
            .or_else(|| std::env::var_os(SOCKET_ENV).map(PathBuf::from))
            .unwrap_or_else(|| default_socket_path(self));
        let stream = tokio::net::UnixStream::connect(&path).await?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.cluster.inner.lock();
            inner.role = Role::Worker;
            inner.socket_path = Some(path.clone());
            inner.running = true;
            inner.upstream = Some(LinkHandle { id: 0, tx });
        }
        tokio::spawn(link_writer(self.ping_interval(), write_half, rx));
        tokio::spawn(worker::worker_reader(self.handle(), read_half));
        info!(path = %path.display(), "connected to cluster root");

        // replay current channels so the root's bookkeeping catches up
        for ch in self.pubsub.snapshot() {
            self.inform_root(&ch.id, None, true);
        }
        for ch in self.patterns.snapshot() {
            self.inform_root(&ch.id, ch.matcher.as_ref(), true);
        }
        Ok(())
    }

    /// Signals every worker to shut down. Called in a worker, the process
    /// signals itself instead.
    pub fn signal_children(&self) {
        let is_worker = { self.cluster.inner.lock().role == Role::Worker };
        if is_worker {
            self.raise_sigint();
            return;
        }
        if let Ok(bytes) = Frame::control(FrameType::Shutdown).encode() {
            self.broadcast_to_links(None, bytes);
        }
    }

    /// Whether this process currently has an active cluster endpoint.
    pub fn cluster_running(&self) -> bool {
        self.cluster.inner.lock().running
    }

    pub(crate) fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.config.cluster.ping_interval_ms)
    }

    /// Sends a frame toward the rest of the cluster: upstream when this
    /// process is a worker, to every child when it is the root.
    pub(crate) fn send_frame_to_cluster(&self, frame: Frame) {
        let bytes = match frame.encode() {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "dropping oversized cluster message");
                return;
            }
        };
        let inner = self.cluster.inner.lock();
        if !inner.running {
            error!("cluster inactive, message dropped");
            return;
        }
        match &inner.upstream {
            Some(upstream) => {
                let _ = upstream.tx.send(bytes);
            }
            None => {
                for link in &inner.links {
                    let _ = link.tx.send(bytes.clone());
                }
            }
        }
    }

    /// Root side: forwards raw frame bytes to every child except the one a
    /// frame arrived on.
    pub(crate) fn broadcast_to_links(&self, except: Option<u64>, bytes: Bytes) {
        let inner = self.cluster.inner.lock();
        for link in &inner.links {
            if Some(link.id) != except {
                let _ = link.tx.send(bytes.clone());
            }
        }
    }

    /// Worker side: tells the root that a pub/sub or pattern channel came
    /// into (or went out of) existence here. Filters never cross the link.
    pub(crate) fn inform_root(&self, id: &ChannelId, matcher: Option<&Matcher>, add: bool) {
        let Some(name) = id.as_name() else { return };
        let frame = match matcher {
            Some(m) => Frame {
                frame_type: if add {
                    FrameType::PatternSub
                } else {
                    FrameType::PatternUnsub
                },
                filter: 0,
                channel: name.clone(),
                payload: Bytes::copy_from_slice(m.name.as_bytes()),
            },
            None => Frame {
                frame_type: if add {
                    FrameType::PubsubSub
                } else {
                    FrameType::PubsubUnsub
                },
                filter: 0,
                channel: name.clone(),
                payload: Bytes::new(),
            },
        };
        let inner = self.cluster.inner.lock();
        let Some(upstream) = &inner.upstream else {
            return;
        };
        match frame.encode() {
            Ok(bytes) => {
                let _ = upstream.tx.send(bytes);
            }
            Err(e) => error!(error = %e, "cannot announce channel upstream"),
        }
    }

    /// Tears the cluster endpoint down. The socket file is unlinked at most
    /// once, and only when `delete_file` is set (the root at finish, or a
    /// worker that detected a parent crash).
    pub(crate) fn cluster_cleanup(&self, delete_file: bool) {
        let shutdown = Frame::control(FrameType::Shutdown).encode().ok();
        let mut inner = self.cluster.inner.lock();
        if let Some(bytes) = shutdown {
            if let Some(upstream) = &inner.upstream {
                let _ = upstream.tx.send(bytes.clone());
            }
            for link in &inner.links {
                let _ = link.tx.send(bytes.clone());
            }
        }
        if delete_file {
            if let Some(path) = inner.socket_path.take() {
                debug!(path = %path.display(), "unlinking cluster socket");
                let _ = std::fs::remove_file(&path);
            }
        }
        inner.socket_path = None;
        inner.upstream = None;
        inner.links.clear();
        inner.running = false;
        if let Some(task) = inner.accept_task.take() {
            task.abort();
        }
    }

    /// Self-SIGINT for orderly teardown; suppressed when the config asks
    /// the bus not to raise process signals (embedding tests).
    pub(crate) fn raise_sigint(&self) {
        if !self.config.cluster.raise_signals {
            debug!("signal raising disabled, skipping SIGINT");
            return;
        }
        let _ = nix::sys::signal::raise(nix::sys::signal::Signal::SIGINT);
    }

    /// A link produced a frame the process cannot survive (length
    /// overflow). Logs and terminates, unless signals are suppressed.
    pub(crate) fn fatal_protocol_error(&self, err: &FrameError) {
        error!(error = %err, "fatal cluster protocol error");
        if self.config.cluster.raise_signals {
            std::process::exit(1);
        }
    }
}

/// Per-link writer: drains the outgoing queue into the socket and emits
/// keepalive pings when the link sits idle.
pub(crate) async fn link_writer(
    ping_interval: Duration,
    mut write: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    let ping = Frame::control(FrameType::Ping).encode().ok();
    let period = if ping_interval.is_zero() {
        Duration::from_secs(3600)
    } else {
        ping_interval
    };
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(bytes) => {
                    if write.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !ping_interval.is_zero() {
                    if let Some(ping) = &ping {
                        if write.write_all(ping).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    let _ = write.shutdown().await;
}
