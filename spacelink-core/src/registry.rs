//! Registry of object-host connections.
//!
//! Every accepted stream becomes a connection with two names: a
//! [`ConnectionHandle`] (arena slot plus generation, so a handle kept
//! past teardown never aliases a newer connection) and a
//! [`ShortConnectionId`] that is never reused while the process lives.
//!
//! Lifecycle:
//!
//! ```text
//!   accept ──► Pending ──(session bound)──► Connected
//!                 │                             │
//!                 └──────(transport down)───────┴──► Disconnected ──► Destroyed
//! ```
//!
//! All table mutations, inbound frame delivery and listener callbacks
//! run on the context's main strand, in the order the transport raised
//! them. `send` may be called from any thread; it only takes a read
//! lock on the tables.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

use crate::context::SpaceContext;
use crate::error::LinkError;
use crate::framer::{DEFAULT_MAX_FRAME_SIZE, MessageFramer, ObjectMessage};
use crate::transport::{AcceptHandler, ConnectionStatus, Stream, StreamHandler, StreamListener};

// ── Identifiers ──────────────────────────────────────────────────

/// Process-local connection number, assigned from 1 upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShortConnectionId(pub u32);

impl std::fmt::Display for ShortConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "oh#{}", self.0)
    }
}

/// Arena handle of a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    index: u32,
    generation: u32,
}

impl ConnectionHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Either name of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRef {
    Handle(ConnectionHandle),
    Short(ShortConnectionId),
}

impl From<ConnectionHandle> for ConnectionRef {
    fn from(handle: ConnectionHandle) -> Self {
        Self::Handle(handle)
    }
}

impl From<ShortConnectionId> for ConnectionRef {
    fn from(short_id: ShortConnectionId) -> Self {
        Self::Short(short_id)
    }
}

// ── ConnectionPhase ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionPhase {
    /// Accepted, waiting for its session.
    Pending = 0,
    Connected = 1,
    /// The transport went down; teardown is queued.
    Disconnected = 2,
    Destroyed = 3,
}

impl ConnectionPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::Connected,
            2 => Self::Disconnected,
            _ => Self::Destroyed,
        }
    }
}

// ── Listener ─────────────────────────────────────────────────────

/// Receives object-host traffic and lifecycle events.
///
/// Called on the main strand only, never concurrently.
pub trait Listener: Send + Sync + 'static {
    /// A decoded message. Return `false` if it was dropped.
    fn on_object_host_message_received(
        &self,
        handle: ConnectionHandle,
        short_id: ShortConnectionId,
        msg: ObjectMessage,
    ) -> bool;

    fn on_object_host_connected(
        &self,
        handle: ConnectionHandle,
        short_id: ShortConnectionId,
        session: Arc<dyn Stream>,
    );

    fn on_object_host_disconnected(&self, handle: ConnectionHandle, short_id: ShortConnectionId);
}

// ── Config & stats ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Treat the accepted stream as the session, without waiting for
    /// [`ConnectionRegistry::on_session_established`].
    pub bind_session_on_accept: bool,
    pub max_frame_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bind_session_on_accept: false,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub accepted: u64,
    pub destroyed: u64,
    pub frames_received: u64,
    pub malformed_frames: u64,
    /// Messages the listener reported as dropped.
    pub dropped_by_listener: u64,
    pub sends_ok: u64,
    pub sends_failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    destroyed: AtomicU64,
    frames_received: AtomicU64,
    malformed_frames: AtomicU64,
    dropped_by_listener: AtomicU64,
    sends_ok: AtomicU64,
    sends_failed: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ── Connection ───────────────────────────────────────────────────

struct Connection {
    short_id: ShortConnectionId,
    stream: Arc<dyn Stream>,
    session: Mutex<Option<Arc<dyn Stream>>>,
    phase: AtomicU8,
}

impl Connection {
    fn new(short_id: ShortConnectionId, stream: Arc<dyn Stream>) -> Self {
        Self {
            short_id,
            stream,
            session: Mutex::new(None),
            phase: AtomicU8::new(ConnectionPhase::Pending as u8),
        }
    }

    fn phase(&self) -> ConnectionPhase {
        ConnectionPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn transition(&self, from: ConnectionPhase, to: ConnectionPhase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Flip to `Disconnected` unless already past it.
    fn mark_disconnected(&self) -> bool {
        self.transition(ConnectionPhase::Pending, ConnectionPhase::Disconnected)
            || self.transition(ConnectionPhase::Connected, ConnectionPhase::Disconnected)
    }

    fn session(&self) -> Option<Arc<dyn Stream>> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    fn close(&self) {
        self.phase
            .store(ConnectionPhase::Destroyed as u8, Ordering::SeqCst);
        self.stream.close();
        let session = self.session.lock().ok().and_then(|mut s| s.take());
        if let Some(session) = session {
            if !Arc::ptr_eq(&session, &self.stream) {
                session.close();
            }
        }
    }
}

// ── Tables ───────────────────────────────────────────────────────

#[derive(Default)]
struct Slot {
    generation: u32,
    conn: Option<Arc<Connection>>,
}

#[derive(Default)]
struct Tables {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_short: HashMap<ShortConnectionId, ConnectionHandle>,
}

impl Tables {
    fn insert(&mut self, conn: Arc<Connection>) -> ConnectionHandle {
        let short_id = conn.short_id;
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.conn = Some(conn);
        let handle = ConnectionHandle {
            index,
            generation: slot.generation,
        };
        self.by_short.insert(short_id, handle);
        handle
    }

    fn get(&self, target: ConnectionRef) -> Option<(ConnectionHandle, Arc<Connection>)> {
        let handle = match target {
            ConnectionRef::Handle(handle) => handle,
            ConnectionRef::Short(short_id) => *self.by_short.get(&short_id)?,
        };
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.conn.clone().map(|conn| (handle, conn))
    }

    fn remove(&mut self, handle: ConnectionHandle) -> Option<Arc<Connection>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let conn = slot.conn.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.by_short.remove(&conn.short_id);
        Some(conn)
    }
}

// ── Registry internals ───────────────────────────────────────────

struct RegistryInner {
    ctx: Arc<SpaceContext>,
    listener: Arc<dyn Listener>,
    config: RegistryConfig,
    framer: MessageFramer,
    next_short_id: AtomicU32,
    tables: RwLock<Tables>,
    shut_down: AtomicBool,
    counters: Counters,
}

impl RegistryInner {
    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn allocate_short_id(&self) -> ShortConnectionId {
        loop {
            let id = self.next_short_id.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return ShortConnectionId(id);
            }
        }
    }

    // ── Strand jobs ──────────────────────────────────────────────

    fn insert_connection(&self, conn: Arc<Connection>) {
        if self.is_shut_down() {
            debug!(short_id = %conn.short_id, "closing connection accepted during shutdown");
            conn.close();
            return;
        }
        let handle = self.write().insert(Arc::clone(&conn));
        debug!(short_id = %conn.short_id, index = handle.index, "object host connection registered");

        if self.config.bind_session_on_accept {
            let session = Arc::clone(&conn.stream);
            self.bind_session(handle, &conn, session);
        }
    }

    fn session_established(&self, short_id: ShortConnectionId, session: Arc<dyn Stream>) {
        let found = self.read().get(ConnectionRef::Short(short_id));
        match found {
            Some((handle, conn)) => self.bind_session(handle, &conn, session),
            None => {
                debug!(%short_id, "session for unknown connection, closing it");
                session.close();
            }
        }
    }

    fn bind_session(&self, handle: ConnectionHandle, conn: &Connection, session: Arc<dyn Stream>) {
        if !conn.transition(ConnectionPhase::Pending, ConnectionPhase::Connected) {
            debug!(short_id = %conn.short_id, phase = ?conn.phase(), "session arrived too late");
            if !Arc::ptr_eq(&session, &conn.stream) {
                session.close();
            }
            return;
        }
        if let Ok(mut slot) = conn.session.lock() {
            *slot = Some(Arc::clone(&session));
        }
        info!(short_id = %conn.short_id, "object host connected");
        self.listener
            .on_object_host_connected(handle, conn.short_id, session);
    }

    fn handle_read(&self, conn: &Connection, chunk: Bytes) {
        let found = self.read().get(ConnectionRef::Short(conn.short_id));
        let Some((handle, _)) = found else {
            trace!(short_id = %conn.short_id, "frame for a torn-down connection dropped");
            return;
        };
        bump(&self.counters.frames_received);

        let msg = match self.framer.decode(&chunk) {
            Ok(msg) => msg,
            Err(e) => {
                bump(&self.counters.malformed_frames);
                warn!(short_id = %conn.short_id, len = chunk.len(), "dropping malformed frame: {e}");
                return;
            }
        };
        if !self
            .listener
            .on_object_host_message_received(handle, conn.short_id, msg)
        {
            bump(&self.counters.dropped_by_listener);
        }
    }

    fn destroy_connection(&self, short_id: ShortConnectionId) {
        let found = self.read().get(ConnectionRef::Short(short_id));
        let Some((handle, _)) = found else {
            trace!(%short_id, "connection already destroyed");
            return;
        };
        self.listener.on_object_host_disconnected(handle, short_id);

        let removed = self.write().remove(handle);
        if let Some(conn) = removed {
            conn.close();
            bump(&self.counters.destroyed);
            info!(%short_id, "object host connection destroyed");
        }
    }

    fn close_all_connections(&self) {
        let short_ids: Vec<ShortConnectionId> = self.read().by_short.keys().copied().collect();
        debug!(count = short_ids.len(), "draining object host connections");
        for short_id in short_ids {
            if let Some((_, conn)) = self.read().get(ConnectionRef::Short(short_id)) {
                conn.mark_disconnected();
            }
            self.destroy_connection(short_id);
        }
    }

    // ── Sending ──────────────────────────────────────────────────

    fn send_message(&self, target: ConnectionRef, msg: &ObjectMessage) -> Result<(), LinkError> {
        if self.is_shut_down() {
            return Err(LinkError::ShutDown("connection registry"));
        }
        let found = self.read().get(target);
        let Some((_, conn)) = found else {
            return Err(LinkError::UnknownConnection(format!("{target:?}")));
        };
        if conn.phase() != ConnectionPhase::Connected {
            return Err(LinkError::UnknownConnection(format!(
                "{} is {:?}",
                conn.short_id,
                conn.phase()
            )));
        }
        let frame = self.framer.encode(msg)?;
        let stream = conn.session().unwrap_or_else(|| Arc::clone(&conn.stream));
        if stream.send(frame) {
            Ok(())
        } else {
            Err(LinkError::ChannelClosed)
        }
    }
}

/// Accept hook handed to the transport.
struct Acceptor {
    registry: Arc<RegistryInner>,
}

impl AcceptHandler for Acceptor {
    fn on_accept(&self, stream: Option<Arc<dyn Stream>>) -> Option<Arc<dyn StreamHandler>> {
        let Some(stream) = stream else {
            trace!("transport signalled end of substreams");
            return None;
        };
        let registry = &self.registry;
        if registry.is_shut_down() {
            debug!("refusing stream accepted after shutdown");
            return None;
        }

        let short_id = registry.allocate_short_id();
        let conn = Arc::new(Connection::new(short_id, stream));
        let job_registry = Arc::clone(registry);
        let job_conn = Arc::clone(&conn);
        let posted = registry
            .ctx
            .main_strand()
            .post("registry::insert_connection", move || {
                job_registry.insert_connection(job_conn)
            });
        if !posted {
            warn!(%short_id, "main strand stopped, refusing stream");
            return None;
        }
        bump(&registry.counters.accepted);
        debug!(%short_id, remote = ?conn.stream.remote_addr(), "accepted object host stream");

        Some(Arc::new(ConnectionEvents {
            conn,
            registry: Arc::clone(registry),
        }))
    }
}

/// Per-stream callbacks, bound to one connection.
struct ConnectionEvents {
    conn: Arc<Connection>,
    registry: Arc<RegistryInner>,
}

impl StreamHandler for ConnectionEvents {
    fn on_read(&self, chunk: Bytes) {
        let registry = Arc::clone(&self.registry);
        let conn = Arc::clone(&self.conn);
        self.registry
            .ctx
            .main_strand()
            .post("registry::read", move || registry.handle_read(&conn, chunk));
    }

    fn on_status(&self, status: ConnectionStatus, reason: &str) {
        match status {
            ConnectionStatus::Connected => {
                trace!(short_id = %self.conn.short_id, "transport connected");
            }
            ConnectionStatus::ConnectionFailed | ConnectionStatus::Disconnected => {
                debug!(short_id = %self.conn.short_id, %status, reason, "object host stream down");
                self.conn.mark_disconnected();
                let registry = Arc::clone(&self.registry);
                let short_id = self.conn.short_id;
                self.registry
                    .ctx
                    .main_strand()
                    .post("registry::destroy_connection", move || {
                        registry.destroy_connection(short_id)
                    });
            }
        }
    }
}

// ── ConnectionRegistry ───────────────────────────────────────────

/// Accepts object-host streams and tracks them until they go away.
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
    stream_listener: Mutex<Option<Box<dyn StreamListener>>>,
}

impl ConnectionRegistry {
    pub fn new(
        ctx: Arc<SpaceContext>,
        stream_listener: Box<dyn StreamListener>,
        listener: Arc<dyn Listener>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                ctx,
                listener,
                config,
                framer: MessageFramer::with_max_frame_size(config.max_frame_size),
                next_short_id: AtomicU32::new(1),
                tables: RwLock::new(Tables::default()),
                shut_down: AtomicBool::new(false),
                counters: Counters::default(),
            }),
            stream_listener: Mutex::new(Some(stream_listener)),
        }
    }

    /// Start accepting object hosts on `addr`.
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr, LinkError> {
        if self.inner.is_shut_down() {
            error!(severity = "fatal", addr, "listen after registry shutdown");
            return Err(LinkError::ShutDown("connection registry"));
        }
        let taken = self.stream_listener.lock().ok().and_then(|mut l| l.take());
        let Some(mut stream_listener) = taken else {
            return Err(LinkError::Config(format!(
                "listener unavailable, cannot bind {addr}"
            )));
        };

        let acceptor = Arc::new(Acceptor {
            registry: Arc::clone(&self.inner),
        });
        let result = stream_listener.listen(addr, acceptor).await;

        // Shutdown may have run while the bind was in flight.
        if self.inner.is_shut_down() {
            stream_listener.close();
        }
        if let Ok(mut slot) = self.stream_listener.lock() {
            *slot = Some(stream_listener);
        }
        let local = result?;
        info!(%local, "listening for object hosts");
        Ok(local)
    }

    /// Bind a separately negotiated session stream to `short_id`.
    ///
    /// If the connection is already gone the session is closed. After
    /// shutdown the session is closed at once and `false` is returned.
    pub fn on_session_established(
        &self,
        short_id: ShortConnectionId,
        session: Arc<dyn Stream>,
    ) -> bool {
        if self.inner.is_shut_down() {
            error!(severity = "fatal", %short_id, "session established after registry shutdown");
            session.close();
            return false;
        }
        let inner = Arc::clone(&self.inner);
        let job_session = Arc::clone(&session);
        let posted = self
            .inner
            .ctx
            .main_strand()
            .post("registry::session_established", move || {
                inner.session_established(short_id, job_session)
            });
        if !posted {
            session.close();
        }
        posted
    }

    /// Frame and send `msg` to a connected object host.
    ///
    /// Returns `false` for unknown, stale or not-yet-connected targets,
    /// encoding failures, a refusing stream, and after shutdown.
    #[must_use]
    pub fn send(&self, target: impl Into<ConnectionRef>, msg: ObjectMessage) -> bool {
        let target = target.into();
        match self.inner.send_message(target, &msg) {
            Ok(()) => {
                bump(&self.inner.counters.sends_ok);
                true
            }
            Err(e) => {
                bump(&self.inner.counters.sends_failed);
                match e {
                    LinkError::ShutDown(_) => {
                        error!(severity = "fatal", ?target, "send after registry shutdown")
                    }
                    LinkError::UnknownConnection(_) => error!(?target, "send failed: {e}"),
                    _ => debug!(?target, "send failed: {e}"),
                }
                false
            }
        }
    }

    pub fn phase(&self, target: impl Into<ConnectionRef>) -> Option<ConnectionPhase> {
        self.inner
            .read()
            .get(target.into())
            .map(|(_, conn)| conn.phase())
    }

    pub fn handle_of(&self, short_id: ShortConnectionId) -> Option<ConnectionHandle> {
        self.inner
            .read()
            .get(ConnectionRef::Short(short_id))
            .map(|(handle, _)| handle)
    }

    pub fn short_id_of(&self, handle: ConnectionHandle) -> Option<ShortConnectionId> {
        self.inner
            .read()
            .get(ConnectionRef::Handle(handle))
            .map(|(_, conn)| conn.short_id)
    }

    /// Connections currently registered, in any phase before `Destroyed`.
    pub fn connection_count(&self) -> usize {
        self.inner.read().by_short.len()
    }

    pub fn stats(&self) -> RegistryStats {
        let c = &self.inner.counters;
        RegistryStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            destroyed: c.destroyed.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            malformed_frames: c.malformed_frames.load(Ordering::Relaxed),
            dropped_by_listener: c.dropped_by_listener.load(Ordering::Relaxed),
            sends_ok: c.sends_ok.load(Ordering::Relaxed),
            sends_failed: c.sends_failed.load(Ordering::Relaxed),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }

    /// Stop accepting and queue teardown of every connection.
    ///
    /// Returns `false` if already shut down. Use
    /// [`wait_drained`](Self::wait_drained) to wait for the teardown.
    pub fn shutdown(&self) -> bool {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            debug!("connection registry already shut down");
            return false;
        }
        if let Ok(mut slot) = self.stream_listener.lock() {
            if let Some(stream_listener) = slot.as_mut() {
                stream_listener.close();
            }
        }
        let inner = Arc::clone(&self.inner);
        self.inner
            .ctx
            .main_strand()
            .post("registry::close_all_connections", move || {
                inner.close_all_connections()
            });
        info!("connection registry shutting down");
        true
    }

    /// Wait until every registry job queued so far has run.
    pub async fn wait_drained(&self) -> bool {
        self.inner.ctx.main_strand().flush().await
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.stream_listener.lock() {
            if let Some(stream_listener) = slot.as_mut() {
                stream_listener.close();
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
