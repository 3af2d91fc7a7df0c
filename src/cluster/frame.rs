//! Cluster link wire format.
//!
//! Every frame is a 16-byte header followed by the channel and payload
//! bytes:
//!
//! ```text
//! u32  channel_len   (big-endian)
//! u32  payload_len   (big-endian)
//! u32  type          (big-endian)
//! i32  filter        (big-endian)
//! [channel_len bytes] [payload_len bytes]
//! ```
//!
//! Channel names are capped at 16 MiB and payloads at 64 MiB; a header
//! announcing more is a fatal protocol error. The parser is an incremental
//! state machine that accepts arbitrary partial reads and never blocks.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const HEADER_LEN: usize = 16;
pub const MAX_CHANNEL_LEN: u32 = 16 * 1024 * 1024;
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// Initial capacity for body accumulation; grows on demand so a hostile
/// header cannot force a huge up-front allocation.
const INITIAL_BODY_CAPACITY: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameType {
    /// Bytes-typed pub/sub message.
    Forward = 0,
    /// JSON-encoded channel/payload.
    Json = 1,
    /// Forward delivered by the root only (sent by a worker).
    Root = 2,
    RootJson = 3,
    /// worker→root: subscribe to a channel.
    PubsubSub = 4,
    PubsubUnsub = 5,
    /// worker→root: subscribe a pattern; the payload names the matcher.
    PatternSub = 6,
    PatternUnsub = 7,
    /// Graceful termination, sent before closing.
    Shutdown = 8,
    /// Reserved.
    Error = 9,
    /// Keepalive.
    Ping = 10,
}

impl From<FrameType> for u32 {
    fn from(t: FrameType) -> u32 {
        t as u32
    }
}

impl TryFrom<u32> for FrameType {
    type Error = FrameError;

    fn try_from(value: u32) -> Result<Self, FrameError> {
        Ok(match value {
            0 => FrameType::Forward,
            1 => FrameType::Json,
            2 => FrameType::Root,
            3 => FrameType::RootJson,
            4 => FrameType::PubsubSub,
            5 => FrameType::PubsubUnsub,
            6 => FrameType::PatternSub,
            7 => FrameType::PatternUnsub,
            8 => FrameType::Shutdown,
            9 => FrameType::Error,
            10 => FrameType::Ping,
            other => return Err(FrameError::UnknownType(other)),
        })
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("cluster message name too long ({0} bytes, 16 MiB limit)")]
    ChannelTooLong(u32),

    #[error("cluster message data too long ({0} bytes, 64 MiB limit)")]
    PayloadTooLong(u32),

    #[error("unknown cluster frame type: {0}")]
    UnknownType(u32),
}

impl FrameError {
    /// Length overflows terminate the process; everything else only drops
    /// the offending link.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::ChannelTooLong(_) | FrameError::PayloadTooLong(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub filter: i32,
    pub channel: Bytes,
    pub payload: Bytes,
}

impl Frame {
    /// A body-less control frame (ping, shutdown).
    pub fn control(frame_type: FrameType) -> Frame {
        Frame {
            frame_type,
            filter: 0,
            channel: Bytes::new(),
            payload: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        if self.channel.len() as u64 >= MAX_CHANNEL_LEN as u64 {
            return Err(FrameError::ChannelTooLong(self.channel.len() as u32));
        }
        if self.payload.len() as u64 >= MAX_PAYLOAD_LEN as u64 {
            return Err(FrameError::PayloadTooLong(self.payload.len() as u32));
        }
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.channel.len() + self.payload.len());
        buf.put_u32(self.channel.len() as u32);
        buf.put_u32(self.payload.len() as u32);
        buf.put_u32(self.frame_type.into());
        buf.put_i32(self.filter);
        buf.put_slice(&self.channel);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Header,
    Channel,
    Payload,
}

/// Incremental frame parser, one per connection.
///
/// Feed it the read buffer as data arrives; it consumes what it can and
/// yields at most one frame per call. Length checks happen at header time,
/// before anything is buffered.
pub struct FrameParser {
    state: ParseState,
    frame_type: FrameType,
    filter: i32,
    exp_channel: usize,
    exp_payload: usize,
    channel: BytesMut,
    payload: BytesMut,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        FrameParser {
            state: ParseState::Header,
            frame_type: FrameType::Ping,
            filter: 0,
            exp_channel: 0,
            exp_payload: 0,
            channel: BytesMut::new(),
            payload: BytesMut::new(),
        }
    }

    pub fn feed(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        loop {
            match self.state {
                ParseState::Header => {
                    if buf.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let channel_len = buf.get_u32();
                    let payload_len = buf.get_u32();
                    let type_code = buf.get_u32();
                    let filter = buf.get_i32();
                    if channel_len >= MAX_CHANNEL_LEN {
                        return Err(FrameError::ChannelTooLong(channel_len));
                    }
                    if payload_len >= MAX_PAYLOAD_LEN {
                        return Err(FrameError::PayloadTooLong(payload_len));
                    }
                    self.frame_type = FrameType::try_from(type_code)?;
                    self.filter = filter;
                    self.exp_channel = channel_len as usize;
                    self.exp_payload = payload_len as usize;
                    self.channel =
                        BytesMut::with_capacity(self.exp_channel.min(INITIAL_BODY_CAPACITY));
                    self.payload =
                        BytesMut::with_capacity(self.exp_payload.min(INITIAL_BODY_CAPACITY));
                    self.state = ParseState::Channel;
                }
                ParseState::Channel => {
                    if !consume(buf, &mut self.channel, self.exp_channel) {
                        return Ok(None);
                    }
                    self.state = ParseState::Payload;
                }
                ParseState::Payload => {
                    if !consume(buf, &mut self.payload, self.exp_payload) {
                        return Ok(None);
                    }
                    self.state = ParseState::Header;
                    return Ok(Some(Frame {
                        frame_type: self.frame_type,
                        filter: self.filter,
                        channel: self.channel.split().freeze(),
                        payload: self.payload.split().freeze(),
                    }));
                }
            }
        }
    }
}

/// Moves up to `expected - dst.len()` bytes from `src` into `dst`.
/// Returns true once `dst` holds the full `expected` length.
fn consume(src: &mut BytesMut, dst: &mut BytesMut, expected: usize) -> bool {
    let missing = expected - dst.len();
    if missing > 0 {
        let take = missing.min(src.len());
        dst.extend_from_slice(&src.split_to(take));
    }
    dst.len() == expected
}
