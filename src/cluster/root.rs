//! Root-side link handling.
//!
//! The root accepts every worker connection, rebroadcasts pub/sub traffic
//! to the rest of the cluster, and keeps a per-link table of *mock*
//! subscriptions mirroring the worker's channels — so that by the root's
//! own bookkeeping those channels exist and engines hear about them.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::cluster::frame::{Frame, FrameParser, FrameType};
use crate::cluster::{link_writer, LinkHandle};
use crate::core::bus::Postoffice;
use crate::core::channel::lookup_matcher;
use crate::core::dispatch::WireMsg;
use crate::core::message::Message;
use crate::core::subscription::{SubscribeOptions, Subscription};

/// Callback of the mock subscriptions mirroring a worker's channels.
fn mock_on_message(_msg: &Message) {}

pub(crate) async fn accept_loop(bus: Arc<Postoffice>, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let link_id = {
                    let mut inner = bus.cluster.inner.lock();
                    inner.next_link_id += 1;
                    inner.next_link_id
                };
                let (read_half, write_half) = stream.into_split();
                let (tx, rx) = mpsc::unbounded_channel();
                bus.cluster
                    .inner
                    .lock()
                    .links
                    .push(LinkHandle { id: link_id, tx });
                tokio::spawn(link_writer(bus.ping_interval(), write_half, rx));
                tokio::spawn(root_reader(bus.clone(), link_id, read_half));
                debug!(link = link_id, "cluster link accepted");
            }
            Err(e) => {
                error!(error = %e, "cluster accept failed");
                break;
            }
        }
    }
    // losing the listener while the cluster runs takes the whole process
    // group down with it
    let still_running = { bus.cluster.inner.lock().running };
    if still_running && bus.config.cluster.raise_signals {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(0),
            nix::sys::signal::Signal::SIGINT,
        );
    }
}

async fn root_reader(bus: Arc<Postoffice>, link_id: u64, mut read: OwnedReadHalf) {
    let mut parser = FrameParser::new();
    let mut buf = BytesMut::with_capacity(16 * 1024);
    // the worker's channels, mirrored as no-op subscriptions
    let mut mock_pubsub: HashMap<Bytes, Subscription> = HashMap::new();
    let mut mock_patterns: HashMap<Bytes, Subscription> = HashMap::new();

    'link: loop {
        match read.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break 'link,
            Ok(_) => {}
        }
        loop {
            match parser.feed(&mut buf) {
                Ok(Some(frame)) => {
                    let keep_going = handle_frame(
                        &bus,
                        link_id,
                        frame,
                        &mut mock_pubsub,
                        &mut mock_patterns,
                    );
                    if !keep_going {
                        break 'link;
                    }
                }
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    bus.fatal_protocol_error(&e);
                    break 'link;
                }
                Err(e) => {
                    warn!(link = link_id, error = %e, "dropping cluster link");
                    break 'link;
                }
            }
        }
    }

    // a child was lost; respawning is handled elsewhere
    bus.cluster.inner.lock().links.retain(|l| l.id != link_id);
    debug!(link = link_id, "cluster link closed");
    // dropping the mock tables unsubscribes the worker's channels
}

/// Dispatches one frame from a worker. Returns false when the link should
/// close.
fn handle_frame(
    bus: &Arc<Postoffice>,
    link_id: u64,
    frame: Frame,
    mock_pubsub: &mut HashMap<Bytes, Subscription>,
    mock_patterns: &mut HashMap<Bytes, Subscription>,
) -> bool {
    match frame.frame_type {
        FrameType::Forward | FrameType::Json => {
            // every other child gets the frame verbatim; then deliver here
            if let Ok(bytes) = frame.encode() {
                bus.broadcast_to_links(Some(link_id), bytes);
            }
            bus.publish_local(&WireMsg {
                filter: frame.filter,
                channel: frame.channel,
                payload: frame.payload,
                json: frame.frame_type == FrameType::Json,
            });
        }
        FrameType::Root | FrameType::RootJson => {
            bus.publish_local(&WireMsg {
                filter: frame.filter,
                channel: frame.channel,
                payload: frame.payload,
                json: frame.frame_type == FrameType::RootJson,
            });
        }
        FrameType::PubsubSub => {
            if let Some(sub) =
                bus.subscribe(SubscribeOptions::channel(frame.channel.clone(), mock_on_message))
            {
                // replacing an existing entry drops (and so cancels) it
                mock_pubsub.insert(frame.channel, sub);
            }
        }
        FrameType::PubsubUnsub => {
            mock_pubsub.remove(&frame.channel);
        }
        FrameType::PatternSub => {
            let matcher_name = String::from_utf8_lossy(&frame.payload);
            let opts = match lookup_matcher(&matcher_name) {
                Some(matcher) => {
                    SubscribeOptions::channel(frame.channel.clone(), mock_on_message).matcher(matcher)
                }
                None => {
                    warn!(matcher = %matcher_name, "unknown pattern matcher, mirroring as exact channel");
                    SubscribeOptions::channel(frame.channel.clone(), mock_on_message)
                }
            };
            if let Some(sub) = bus.subscribe(opts) {
                mock_patterns.insert(frame.channel, sub);
            }
        }
        FrameType::PatternUnsub => {
            mock_patterns.remove(&frame.channel);
        }
        FrameType::Shutdown => return false,
        FrameType::Error | FrameType::Ping => {}
    }
    true
}
