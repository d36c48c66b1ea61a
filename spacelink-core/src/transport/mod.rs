//! Stream abstraction consumed by the connection registry.
//!
//! The registry never touches sockets. A transport hands it accepted
//! [`Stream`]s through an [`AcceptHandler`] and, in exchange, receives
//! the [`StreamHandler`] it must invoke for every inbound frame and
//! connection-status change on that stream.
//!
//! `tcp` provides the length-delimited TCP implementation used by the
//! space server; anything reliable and ordered can stand in for it.

pub mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::LinkError;
use crate::framer::Frame;

pub use tcp::{TcpLink, TcpStreamListener};

// ── ConnectionStatus ─────────────────────────────────────────────

/// Lifecycle notifications delivered by a transport stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    ConnectionFailed,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::ConnectionFailed => write!(f, "ConnectionFailed"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

// ── Traits ───────────────────────────────────────────────────────

/// A reliable-ordered, message-delimited byte stream.
pub trait Stream: Send + Sync + 'static {
    /// Queue one frame for delivery. Returns `false` if the stream is
    /// closed or cannot take more data right now.
    fn send(&self, frame: Frame) -> bool;

    /// Close the stream. Further sends fail.
    fn close(&self);

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Callbacks a transport invokes for one stream, from its I/O tasks.
pub trait StreamHandler: Send + Sync + 'static {
    /// One complete inbound frame.
    fn on_read(&self, chunk: Bytes);

    fn on_status(&self, status: ConnectionStatus, reason: &str);
}

/// Receives newly accepted streams.
pub trait AcceptHandler: Send + Sync + 'static {
    /// Called once per accepted stream, before any data is read from it.
    ///
    /// `None` is the "no more substreams on this socket" signal some
    /// transports emit. Returning `None` rejects the stream and the
    /// transport closes it.
    fn on_accept(&self, stream: Option<Arc<dyn Stream>>) -> Option<Arc<dyn StreamHandler>>;
}

/// A factory for accepted streams bound to a local address.
#[async_trait]
pub trait StreamListener: Send + Sync + 'static {
    /// Bind `addr` and start accepting in the background.
    async fn listen(
        &mut self,
        addr: &str,
        handler: Arc<dyn AcceptHandler>,
    ) -> Result<SocketAddr, LinkError>;

    /// Stop accepting. Streams already accepted stay open.
    fn close(&mut self);
}
