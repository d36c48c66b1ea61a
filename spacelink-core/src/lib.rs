//! # spacelink-core
//!
//! Inter-node transport core of a space server.
//!
//! This crate contains:
//! - **Registry**: `ConnectionRegistry`, accepting object-host streams behind small integer ids
//! - **Scheduler**: `FairMessageScheduler`, weighted fair queuing of per-server outbound queues
//! - **Framer**: `MessageFramer` and `ObjectMessage`, one message per frame
//! - **Capacity**: `CapacityEstimator`, exponentially windowed throughput
//! - **Strand / Context**: serialized executors and the shared `SpaceContext`
//! - **Transport**: the `Stream` traits and a length-delimited TCP implementation
//! - **Error**: `LinkError`, a `thiserror`-based error type

pub mod capacity;
pub mod context;
pub mod error;
pub mod fair_queue;
pub mod framer;
pub mod registry;
pub mod scheduler;
pub mod strand;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capacity::CapacityEstimator;
pub use context::SpaceContext;
pub use error::LinkError;
pub use fair_queue::{FairQueue, QueueStats};
pub use framer::{DEFAULT_MAX_FRAME_SIZE, Frame, MessageFramer, ObjectMessage};
pub use registry::{
    ConnectionHandle, ConnectionPhase, ConnectionRef, ConnectionRegistry, Listener,
    RegistryConfig, RegistryStats, ShortConnectionId,
};
pub use scheduler::{
    FairMessageScheduler, RoundOutcome, SchedulerConfig, SchedulerStats, Sender, ServerId,
};
pub use strand::Strand;
pub use transport::tcp::{DEFAULT_LINK_CAPACITY, LinkConfig};
pub use transport::{
    AcceptHandler, ConnectionStatus, Stream, StreamHandler, StreamListener, TcpLink,
    TcpStreamListener,
};
