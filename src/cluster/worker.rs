//! Worker-side link handling.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::unix::OwnedReadHalf;
use tracing::{error, info, warn};

use crate::cluster::frame::{FrameParser, FrameType};
use crate::core::bus::Postoffice;
use crate::core::dispatch::WireMsg;
use crate::hooks::Hook;

pub(crate) async fn worker_reader(bus: Arc<Postoffice>, mut read: OwnedReadHalf) {
    let mut parser = FrameParser::new();
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut shutdown_seen = false;

    'link: loop {
        match read.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break 'link,
            Ok(_) => {}
        }
        loop {
            match parser.feed(&mut buf) {
                Ok(Some(frame)) => match frame.frame_type {
                    FrameType::Forward | FrameType::Json => {
                        bus.publish_local(&WireMsg {
                            filter: frame.filter,
                            channel: frame.channel,
                            payload: frame.payload,
                            json: frame.frame_type == FrameType::Json,
                        });
                    }
                    FrameType::Shutdown => {
                        shutdown_seen = true;
                        break 'link;
                    }
                    // the remaining types are root-bound; not addressed to us
                    _ => {}
                },
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    bus.fatal_protocol_error(&e);
                    break 'link;
                }
                Err(e) => {
                    warn!(error = %e, "dropping upstream cluster link");
                    break 'link;
                }
            }
        }
    }

    if shutdown_seen {
        info!("shutdown requested by cluster root");
        bus.cluster.inner.lock().running = false;
        bus.raise_sigint();
        return;
    }

    let was_running = { bus.cluster.inner.lock().running };
    if was_running {
        // no shutdown frame first: the parent is gone
        error!("parent process crash detected");
        bus.hooks.run(Hook::ParentCrash);
        bus.cluster_cleanup(true);
        bus.raise_sigint();
    }
}
