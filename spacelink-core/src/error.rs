//! Domain-specific error types for spacelink.
//!
//! Setup paths (binding, connecting, configuration) and the message
//! framer return `Result<T, LinkError>`. The per-message hot paths of
//! the registry and scheduler report failure as `bool` / `Option` and
//! log the reason instead; nothing in this crate panics on bad input.

use thiserror::Error;

/// The canonical error type for spacelink.
#[derive(Debug, Error)]
pub enum LinkError {
    // ── Framing Errors ───────────────────────────────────────────
    /// Encoding or decoding of a message failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A frame exceeded the configured maximum size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// The handle or short id does not name a live connection.
    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    /// The component was already shut down.
    #[error("{0} is shut down")]
    ShutDown(&'static str),

    // ── Configuration Errors ─────────────────────────────────────
    /// An address or option could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for LinkError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        LinkError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for LinkError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        LinkError::Encoding(e.to_string())
    }
}

impl From<std::net::AddrParseError> for LinkError {
    fn from(e: std::net::AddrParseError) -> Self {
        LinkError::Config(e.to_string())
    }
}
