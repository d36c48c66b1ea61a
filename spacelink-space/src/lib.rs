//! # spacelink-space — Space Server
//!
//! Accepts object-host connections, learns which objects live behind
//! which connection, and routes object messages either to a local
//! object host or, through the fair scheduler, to the peer space server
//! that owns the destination object.
//!
//! ## Modules
//!
//! - **config**: TOML configuration with defaults for every section.
//! - **service**: the forwarder, peer outboxes and server lifecycle.

pub mod config;
pub mod service;
