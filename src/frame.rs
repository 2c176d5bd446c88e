//! Cluster wire format.
//!
//! Every frame on a cluster link is a fixed 16-byte header followed by the
//! channel and payload bodies:
//!
//! ```text
//! u32 channel_len | u32 payload_len | u32 kind | i32 filter | channel | payload
//! ```
//!
//! All header fields are big-endian. Frames are written whole, so ordering
//! per link is the stream's ordering. The parser is an incremental state
//! machine that accepts arbitrary partial reads and never blocks.

use bytes::Bytes;

use crate::{Error, Result};

pub const HEADER_LEN: usize = 16;
pub const CHANNEL_LIMIT: usize = 1 << 24; // 16 MiB
pub const PAYLOAD_LIMIT: usize = 1 << 26; // 64 MiB

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Bytes-typed pub/sub message.
    Forward = 0,
    /// JSON-normalized channel/payload.
    Json = 1,
    /// Delivered by the root only, on a worker's behalf.
    Root = 2,
    RootJson = 3,
    /// worker→root: channel gained its first subscriber.
    Sub = 4,
    Unsub = 5,
    /// worker→root: pattern subscription; payload is the matcher name.
    PatternSub = 6,
    PatternUnsub = 7,
    /// Graceful termination, sent before closing.
    Shutdown = 8,
    /// Reserved.
    Error = 9,
    /// Keepalive.
    Ping = 10,
}

impl FrameKind {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => FrameKind::Forward,
            1 => FrameKind::Json,
            2 => FrameKind::Root,
            3 => FrameKind::RootJson,
            4 => FrameKind::Sub,
            5 => FrameKind::Unsub,
            6 => FrameKind::PatternSub,
            7 => FrameKind::PatternUnsub,
            8 => FrameKind::Shutdown,
            9 => FrameKind::Error,
            10 => FrameKind::Ping,
            _ => return None,
        })
    }

    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub filter: i32,
    pub channel: Bytes,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, filter: i32, channel: Bytes, payload: Bytes) -> Self {
        Self {
            kind,
            filter,
            channel,
            payload,
        }
    }

    /// A bodyless control frame (shutdown, ping).
    pub fn control(kind: FrameKind) -> Self {
        Self::new(kind, 0, Bytes::new(), Bytes::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.channel.len() >= CHANNEL_LIMIT {
            return Err(Error::FrameOverflow {
                field: "channel",
                len: self.channel.len(),
            });
        }
        if self.payload.len() >= PAYLOAD_LIMIT {
            return Err(Error::FrameOverflow {
                field: "payload",
                len: self.payload.len(),
            });
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + self.channel.len() + self.payload.len());
        buf.extend_from_slice(&(self.channel.len() as u32).to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.kind.as_u32().to_be_bytes());
        buf.extend_from_slice(&self.filter.to_be_bytes());
        buf.extend_from_slice(&self.channel);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Header,
    Channel,
    Payload,
}

/// Per-connection frame parser.
///
/// Feed it whatever the socket delivered; complete frames are handed to the
/// sink as they materialize. A length over the limit or an unknown frame
/// kind is a protocol error and poisons the connection: the caller must drop
/// the link (a partial frame is dropped with it).
pub struct FrameParser {
    state: ParseState,
    header: [u8; HEADER_LEN],
    filled: usize,
    kind: FrameKind,
    filter: i32,
    channel_len: usize,
    payload_len: usize,
    channel: Vec<u8>,
    payload: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::Header,
            header: [0u8; HEADER_LEN],
            filled: 0,
            kind: FrameKind::Ping,
            filter: 0,
            channel_len: 0,
            payload_len: 0,
            channel: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn feed<F: FnMut(Frame)>(&mut self, mut bytes: &[u8], sink: &mut F) -> Result<()> {
        while !bytes.is_empty() {
            match self.state {
                ParseState::Header => {
                    let want = HEADER_LEN - self.filled;
                    let take = want.min(bytes.len());
                    self.header[self.filled..self.filled + take].copy_from_slice(&bytes[..take]);
                    self.filled += take;
                    bytes = &bytes[take..];
                    if self.filled == HEADER_LEN {
                        self.begin_bodies()?;
                        self.advance(sink);
                    }
                }
                ParseState::Channel => {
                    let want = self.channel_len - self.channel.len();
                    let take = want.min(bytes.len());
                    self.channel.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    self.advance(sink);
                }
                ParseState::Payload => {
                    let want = self.payload_len - self.payload.len();
                    let take = want.min(bytes.len());
                    self.payload.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    self.advance(sink);
                }
            }
        }
        Ok(())
    }

    fn begin_bodies(&mut self) -> Result<()> {
        let channel_len = u32::from_be_bytes(self.header[0..4].try_into().expect("header slice"));
        let payload_len = u32::from_be_bytes(self.header[4..8].try_into().expect("header slice"));
        let raw_kind = u32::from_be_bytes(self.header[8..12].try_into().expect("header slice"));
        let filter = i32::from_be_bytes(self.header[12..16].try_into().expect("header slice"));
        let channel_len = channel_len as usize;
        let payload_len = payload_len as usize;
        if channel_len >= CHANNEL_LIMIT {
            return Err(Error::FrameOverflow {
                field: "channel",
                len: channel_len,
            });
        }
        if payload_len >= PAYLOAD_LIMIT {
            return Err(Error::FrameOverflow {
                field: "payload",
                len: payload_len,
            });
        }
        self.kind =
            FrameKind::from_u32(raw_kind).ok_or(Error::FrameMalformed("unknown frame kind"))?;
        self.filter = filter;
        self.channel_len = channel_len;
        self.payload_len = payload_len;
        self.channel = Vec::with_capacity(channel_len);
        self.payload = Vec::with_capacity(payload_len);
        self.state = ParseState::Channel;
        Ok(())
    }

    // Moves past any body that is already complete (zero-length bodies
    // included) and hands the frame to the sink once both are in.
    fn advance<F: FnMut(Frame)>(&mut self, sink: &mut F) {
        if self.state == ParseState::Channel && self.channel.len() == self.channel_len {
            self.state = ParseState::Payload;
        }
        if self.state == ParseState::Payload && self.payload.len() == self.payload_len {
            let frame = Frame {
                kind: self.kind,
                filter: self.filter,
                channel: Bytes::from(std::mem::take(&mut self.channel)),
                payload: Bytes::from(std::mem::take(&mut self.payload)),
            };
            self.state = ParseState::Header;
            self.filled = 0;
            sink(frame);
        }
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}
