//! Message framing for object-host links.
//!
//! One logical [`ObjectMessage`] is serialized into exactly one
//! [`Frame`], and one frame is handed to exactly one `send` call on the
//! underlying reliable-ordered stream. The stream delimits frames, so
//! no length prefix is added here.

use bincode::Options;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::LinkError;

/// Default upper bound on an encoded frame (256 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024;

// ── Frame ────────────────────────────────────────────────────────

/// An owned, opaque payload holding one serialized message.
///
/// Cloning is cheap (reference counted); moving a frame into a send
/// call transfers it to the transport.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Frame(Bytes);

impl Frame {
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Bytes> for Frame {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Frame {
    fn from(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame").field("len", &self.0.len()).finish()
    }
}

// ── ObjectMessage ────────────────────────────────────────────────

/// An application message exchanged between objects.
///
/// The payload is opaque to this crate; only the addressing fields are
/// read, and only by the space server's forwarder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMessage {
    pub source_object: u64,
    pub source_port: u16,
    pub dest_object: u64,
    pub dest_port: u16,
    /// Sender-assigned id, unique per source object.
    pub unique: u64,
    pub payload: Vec<u8>,
}

impl ObjectMessage {
    pub fn new(source_object: u64, dest_object: u64, payload: Vec<u8>) -> Self {
        Self {
            source_object,
            source_port: 0,
            dest_object,
            dest_port: 0,
            unique: 0,
            payload,
        }
    }

    /// Builder-style setter for both ports.
    pub fn with_ports(mut self, source_port: u16, dest_port: u16) -> Self {
        self.source_port = source_port;
        self.dest_port = dest_port;
        self
    }

    pub fn with_unique(mut self, unique: u64) -> Self {
        self.unique = unique;
        self
    }
}

// ── MessageFramer ────────────────────────────────────────────────

/// Encodes and decodes [`ObjectMessage`]s to and from [`Frame`]s.
#[derive(Debug, Clone, Copy)]
pub struct MessageFramer {
    max_frame_size: usize,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn options(&self) -> impl Options {
        bincode::DefaultOptions::new().with_limit(self.max_frame_size as u64)
    }

    /// Serialize one message into one frame.
    ///
    /// An oversized message reports its full encoded length.
    pub fn encode(&self, msg: &ObjectMessage) -> Result<Frame, LinkError> {
        let bytes = self.options().serialize(msg).map_err(|e| match *e {
            bincode::ErrorKind::SizeLimit => LinkError::FrameTooLarge {
                size: encoded_len(msg),
                max: self.max_frame_size,
            },
            other => LinkError::Encoding(other.to_string()),
        })?;
        Ok(Frame::from(bytes))
    }

    /// Parse one frame back into a message.
    ///
    /// Fails on oversize frames, truncated input and trailing bytes.
    pub fn decode(&self, frame: &[u8]) -> Result<ObjectMessage, LinkError> {
        if frame.len() > self.max_frame_size {
            return Err(LinkError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }
        Ok(self.options().deserialize(frame)?)
    }
}

/// Encoded length of `msg` with no size limit applied.
fn encoded_len(msg: &ObjectMessage) -> usize {
    bincode::DefaultOptions::new()
        .serialized_size(msg)
        .map_or(msg.payload.len(), |n| n as usize)
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────
