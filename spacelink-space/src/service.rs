//! Space server wiring.
//!
//! ```text
//!  object hosts ──► oh registry ──► Forwarder ──┬──► oh registry.send   (route known)
//!                                               └──► PeerOutbox ──► FairMessageScheduler ──► TcpLink ──► peer
//!  peers ──► peer registry ──► PeerInbound ──► Forwarder (local delivery only)
//! ```
//!
//! Objects are learned from the messages their hosts send: the
//! `source_object` of every inbound message is bound to the short id of
//! the connection it arrived on. Messages for objects with no local
//! route go to the server owning `dest_object % servers`.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use spacelink_core::{
    ConnectionHandle, ConnectionRegistry, ConnectionStatus, FairMessageScheduler, Frame,
    LinkConfig, LinkError, Listener, MessageFramer, ObjectMessage, RegistryConfig, Sender,
    ServerId, ShortConnectionId, SpaceContext, Stream, StreamHandler, TcpLink, TcpStreamListener,
};

use crate::config::{PeerConfig, SpaceConfig};

/// Frames held per peer while its link is down or slow.
pub const MAX_QUEUED_PER_PEER: usize = 4096;
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── PeerOutbox ───────────────────────────────────────────────────

/// Per-peer frame queues and the links that drain them.
#[derive(Default)]
pub struct PeerOutbox {
    links: RwLock<HashMap<ServerId, Arc<TcpLink>>>,
    queues: Mutex<HashMap<ServerId, VecDeque<Frame>>>,
}

impl PeerOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `frame` for `dest`. Returns `false` if the queue is full.
    pub fn push(&self, dest: ServerId, frame: Frame) -> bool {
        let mut queues = lock(&self.queues);
        let queue = queues.entry(dest).or_default();
        if queue.len() >= MAX_QUEUED_PER_PEER {
            warn!(%dest, "peer outbox full, dropping frame");
            return false;
        }
        queue.push_back(frame);
        true
    }

    pub fn queued(&self, dest: ServerId) -> usize {
        lock(&self.queues).get(&dest).map_or(0, VecDeque::len)
    }

    pub fn attach(&self, dest: ServerId, link: Arc<TcpLink>) {
        if let Ok(mut links) = self.links.write() {
            links.insert(dest, link);
        }
    }

    pub fn detach(&self, dest: ServerId) -> Option<Arc<TcpLink>> {
        self.links.write().ok().and_then(|mut links| links.remove(&dest))
    }

    pub fn is_attached(&self, dest: ServerId) -> bool {
        self.links
            .read()
            .map(|links| links.contains_key(&dest))
            .unwrap_or(false)
    }
}

impl Sender for PeerOutbox {
    fn pull_next(&self, dest: ServerId) -> Option<Frame> {
        lock(&self.queues).get_mut(&dest)?.pop_front()
    }

    fn try_send(&self, dest: ServerId, frame: &Frame) -> bool {
        let link = self
            .links
            .read()
            .ok()
            .and_then(|links| links.get(&dest).cloned());
        match link {
            Some(link) if !link.is_closed() => link.send(frame.clone()),
            _ => false,
        }
    }
}

// ── Forwarder ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    pub delivered_local: u64,
    pub forwarded: u64,
    pub unroutable: u64,
}

/// Routes object messages to local object hosts or peer servers.
pub struct Forwarder {
    server_id: ServerId,
    /// Every server in the segmentation, sorted; includes this one.
    segments: Vec<ServerId>,
    routes: Mutex<HashMap<u64, ShortConnectionId>>,
    registry: OnceLock<Weak<ConnectionRegistry>>,
    scheduler: OnceLock<Weak<FairMessageScheduler<PeerOutbox>>>,
    outbox: Arc<PeerOutbox>,
    framer: MessageFramer,
    delivered_local: AtomicU64,
    forwarded: AtomicU64,
    unroutable: AtomicU64,
}

impl Forwarder {
    pub fn new(
        server_id: ServerId,
        peers: impl IntoIterator<Item = ServerId>,
        outbox: Arc<PeerOutbox>,
        framer: MessageFramer,
    ) -> Self {
        let mut segments: Vec<ServerId> = peers.into_iter().collect();
        segments.push(server_id);
        segments.sort();
        segments.dedup();
        Self {
            server_id,
            segments,
            routes: Mutex::new(HashMap::new()),
            registry: OnceLock::new(),
            scheduler: OnceLock::new(),
            outbox,
            framer,
            delivered_local: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            unroutable: AtomicU64::new(0),
        }
    }

    pub fn attach_registry(&self, registry: &Arc<ConnectionRegistry>) {
        let _ = self.registry.set(Arc::downgrade(registry));
    }

    pub fn attach_scheduler(&self, scheduler: &Arc<FairMessageScheduler<PeerOutbox>>) {
        let _ = self.scheduler.set(Arc::downgrade(scheduler));
    }

    /// The server responsible for `object`.
    pub fn owner_of(&self, object: u64) -> ServerId {
        let slot = (object % self.segments.len() as u64) as usize;
        self.segments[slot]
    }

    pub fn route_of(&self, object: u64) -> Option<ShortConnectionId> {
        lock(&self.routes).get(&object).copied()
    }

    /// Deliver locally if the destination object is known here,
    /// otherwise forward to its owning server.
    pub fn route(&self, msg: ObjectMessage) -> bool {
        if self.route_of(msg.dest_object).is_some() {
            return self.deliver_local(msg);
        }
        let owner = self.owner_of(msg.dest_object);
        if owner == self.server_id {
            return self.unroutable(&msg);
        }
        self.forward(owner, msg)
    }

    /// Deliver to a locally connected object host, never forwarding.
    pub fn deliver_local(&self, msg: ObjectMessage) -> bool {
        let Some(short_id) = self.route_of(msg.dest_object) else {
            return self.unroutable(&msg);
        };
        let Some(registry) = self.registry.get().and_then(Weak::upgrade) else {
            return false;
        };
        let delivered = registry.send(short_id, msg);
        if delivered {
            self.delivered_local.fetch_add(1, Ordering::Relaxed);
        }
        delivered
    }

    fn forward(&self, dest: ServerId, msg: ObjectMessage) -> bool {
        let frame = match self.framer.encode(&msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%dest, "cannot forward message: {e}");
                return false;
            }
        };
        if !self.outbox.push(dest, frame) {
            return false;
        }
        let Some(scheduler) = self.scheduler.get().and_then(Weak::upgrade) else {
            return false;
        };
        let ready = scheduler.message_ready(dest);
        if ready {
            self.forwarded.fetch_add(1, Ordering::Relaxed);
        }
        ready
    }

    fn unroutable(&self, msg: &ObjectMessage) -> bool {
        self.unroutable.fetch_add(1, Ordering::Relaxed);
        debug!(
            source = msg.source_object,
            dest = msg.dest_object,
            "no route for object, dropping message"
        );
        false
    }

    pub fn stats(&self) -> ForwarderStats {
        ForwarderStats {
            delivered_local: self.delivered_local.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
        }
    }
}

impl Listener for Forwarder {
    fn on_object_host_message_received(
        &self,
        _handle: ConnectionHandle,
        short_id: ShortConnectionId,
        msg: ObjectMessage,
    ) -> bool {
        let previous = lock(&self.routes).insert(msg.source_object, short_id);
        if previous != Some(short_id) {
            debug!(object = msg.source_object, %short_id, "learned object route");
        }
        self.route(msg)
    }

    fn on_object_host_connected(
        &self,
        _handle: ConnectionHandle,
        short_id: ShortConnectionId,
        session: Arc<dyn Stream>,
    ) {
        info!(%short_id, remote = ?session.remote_addr(), "object host session up");
    }

    fn on_object_host_disconnected(&self, _handle: ConnectionHandle, short_id: ShortConnectionId) {
        let mut routes = lock(&self.routes);
        let before = routes.len();
        routes.retain(|_, route| *route != short_id);
        debug!(%short_id, dropped = before - routes.len(), "forgot object routes");
    }
}

/// Listener for the peer registry: messages from other servers are
/// only ever delivered locally.
pub struct PeerInbound {
    forwarder: Arc<Forwarder>,
}

impl Listener for PeerInbound {
    fn on_object_host_message_received(
        &self,
        _handle: ConnectionHandle,
        _short_id: ShortConnectionId,
        msg: ObjectMessage,
    ) -> bool {
        self.forwarder.deliver_local(msg)
    }

    fn on_object_host_connected(
        &self,
        _handle: ConnectionHandle,
        short_id: ShortConnectionId,
        session: Arc<dyn Stream>,
    ) {
        info!(%short_id, remote = ?session.remote_addr(), "peer server connected");
    }

    fn on_object_host_disconnected(&self, _handle: ConnectionHandle, short_id: ShortConnectionId) {
        info!(%short_id, "peer server disconnected");
    }
}

// ── Peer links ───────────────────────────────────────────────────

/// Callbacks of an outgoing peer link.
struct PeerLinkEvents {
    dest: ServerId,
    down: mpsc::UnboundedSender<String>,
}

impl StreamHandler for PeerLinkEvents {
    fn on_read(&self, chunk: Bytes) {
        trace!(dest = %self.dest, len = chunk.len(), "ignoring data on outgoing peer link");
    }

    fn on_status(&self, status: ConnectionStatus, reason: &str) {
        if status != ConnectionStatus::Connected {
            let _ = self.down.send(reason.to_string());
        }
    }
}

/// Keep a link to `peer` up until the context stops.
async fn maintain_peer_link(
    ctx: Arc<SpaceContext>,
    peer: PeerConfig,
    link_config: LinkConfig,
    outbox: Arc<PeerOutbox>,
    scheduler: Weak<FairMessageScheduler<PeerOutbox>>,
) {
    let dest = ServerId(peer.id);
    while !ctx.is_stopped() {
        let (down_tx, mut down_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(PeerLinkEvents {
            dest,
            down: down_tx,
        });

        match TcpLink::connect(&peer.address, link_config, handler).await {
            Ok(link) => {
                let ready = scheduler.clone();
                let ready_ctx = Arc::clone(&ctx);
                link.on_ready_to_send(move || {
                    if ready_ctx.is_stopped() {
                        return;
                    }
                    if let Some(scheduler) = ready.upgrade() {
                        scheduler.enable_downstream(dest);
                    }
                });
                outbox.attach(dest, Arc::clone(&link));
                info!(%dest, address = %peer.address, "peer link up");
                if let Some(scheduler) = scheduler.upgrade() {
                    scheduler.enable_downstream(dest);
                }

                tokio::select! {
                    reason = down_rx.recv() => {
                        warn!(%dest, reason = reason.as_deref().unwrap_or("unknown"), "peer link down");
                    }
                    _ = wait_for_stop(&ctx) => {
                        link.close();
                    }
                }
                outbox.detach(dest);
            }
            Err(e) => debug!(%dest, address = %peer.address, "peer connect failed: {e}"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn wait_for_stop(ctx: &SpaceContext) {
    loop {
        if ctx.is_stopped() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ── SpaceServer ──────────────────────────────────────────────────

/// The top-level space server.
pub struct SpaceServer {
    config: SpaceConfig,
    ctx: Arc<SpaceContext>,
}

/// A started server: listeners bound, peer links being maintained.
pub struct RunningSpace {
    pub oh_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    ctx: Arc<SpaceContext>,
    oh_registry: Arc<ConnectionRegistry>,
    peer_registry: ConnectionRegistry,
    scheduler: Arc<FairMessageScheduler<PeerOutbox>>,
    forwarder: Arc<Forwarder>,
    peer_tasks: Vec<JoinHandle<()>>,
}

impl SpaceServer {
    /// Must be called from within a tokio runtime.
    pub fn new(config: SpaceConfig) -> Self {
        let ctx = SpaceContext::new(config.server_id);
        Self { config, ctx }
    }

    /// Handle used to stop the server from another task.
    pub fn context(&self) -> Arc<SpaceContext> {
        Arc::clone(&self.ctx)
    }

    /// Bind both listeners and start the peer links.
    pub async fn start(&self) -> Result<RunningSpace, LinkError> {
        let config = &self.config;
        let ctx = Arc::clone(&self.ctx);
        let server_id = ServerId(config.server_id);
        let link_config = config.to_link_config();
        let framer = MessageFramer::with_max_frame_size(link_config.max_frame_size);

        let outbox = Arc::new(PeerOutbox::new());
        let scheduler = Arc::new(FairMessageScheduler::new(
            Arc::clone(&ctx),
            Arc::clone(&outbox),
            config.to_scheduler_config(),
        ));
        let forwarder = Arc::new(Forwarder::new(
            server_id,
            config.peers.iter().map(|p| ServerId(p.id)),
            Arc::clone(&outbox),
            framer,
        ));
        forwarder.attach_scheduler(&scheduler);

        let oh_registry = Arc::new(ConnectionRegistry::new(
            Arc::clone(&ctx),
            Box::new(TcpStreamListener::new(link_config)),
            forwarder.clone(),
            config.to_registry_config(),
        ));
        forwarder.attach_registry(&oh_registry);
        let oh_addr = oh_registry.listen(&config.network.oh_listen).await?;

        let peer_registry = ConnectionRegistry::new(
            Arc::clone(&ctx),
            Box::new(TcpStreamListener::new(link_config)),
            Arc::new(PeerInbound {
                forwarder: Arc::clone(&forwarder),
            }),
            RegistryConfig {
                bind_session_on_accept: true,
                ..config.to_registry_config()
            },
        );
        let peer_addr = peer_registry.listen(&config.network.peer_listen).await?;

        let mut peer_tasks = Vec::new();
        for peer in &config.peers {
            if peer.id == config.server_id {
                continue;
            }
            scheduler.update_weight(ServerId(peer.id), peer.weight);
            peer_tasks.push(tokio::spawn(maintain_peer_link(
                Arc::clone(&ctx),
                peer.clone(),
                link_config,
                Arc::clone(&outbox),
                Arc::downgrade(&scheduler),
            )));
        }

        info!(
            %server_id,
            %oh_addr,
            %peer_addr,
            peers = peer_tasks.len(),
            "space server started"
        );
        Ok(RunningSpace {
            oh_addr,
            peer_addr,
            ctx,
            oh_registry,
            peer_registry,
            scheduler,
            forwarder,
            peer_tasks,
        })
    }

    /// Run until the context is stopped, then shut down cleanly.
    pub async fn run(&self) -> Result<(), LinkError> {
        let running = self.start().await?;
        wait_for_stop(&self.ctx).await;
        running.shutdown().await;
        Ok(())
    }
}

impl RunningSpace {
    pub fn oh_registry(&self) -> &Arc<ConnectionRegistry> {
        &self.oh_registry
    }

    pub fn peer_registry(&self) -> &ConnectionRegistry {
        &self.peer_registry
    }

    pub fn scheduler(&self) -> &Arc<FairMessageScheduler<PeerOutbox>> {
        &self.scheduler
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    /// Stop accepting, tear down every connection and log final stats.
    pub async fn shutdown(self) {
        self.ctx.stop();
        self.oh_registry.shutdown();
        self.peer_registry.shutdown();
        self.scheduler.shutdown();
        for task in &self.peer_tasks {
            task.abort();
        }

        self.oh_registry.wait_drained().await;
        self.scheduler.join().await;

        let oh = self.oh_registry.stats();
        let fwd = self.forwarder.stats();
        info!(
            accepted = oh.accepted,
            destroyed = oh.destroyed,
            frames = oh.frames_received,
            malformed = oh.malformed_frames,
            delivered_local = fwd.delivered_local,
            forwarded = fwd.forwarded,
            unroutable = fwd.unroutable,
            "space server stopped"
        );
        self.ctx.join().await;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// An object host: one TCP link plus the frames it receives.
    struct ObjectHost {
        link: Arc<TcpLink>,
        reads: mpsc::UnboundedReceiver<Bytes>,
        framer: MessageFramer,
    }

    struct ReadSink(mpsc::UnboundedSender<Bytes>);

    impl StreamHandler for ReadSink {
        fn on_read(&self, chunk: Bytes) {
            let _ = self.0.send(chunk);
        }

        fn on_status(&self, _status: ConnectionStatus, _reason: &str) {}
    }

    impl ObjectHost {
        async fn connect(addr: SocketAddr) -> Self {
            let (tx, reads) = mpsc::unbounded_channel();
            let link = TcpLink::connect(&addr.to_string(), LinkConfig::default(), Arc::new(ReadSink(tx)))
                .await
                .unwrap();
            Self {
                link,
                reads,
                framer: MessageFramer::new(),
            }
        }

        fn send(&self, src: u64, dst: u64, payload: &[u8]) {
            let msg = ObjectMessage::new(src, dst, payload.to_vec());
            assert!(self.link.send(self.framer.encode(&msg).unwrap()));
        }

        async fn recv(&mut self) -> ObjectMessage {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.reads.recv())
                .await
                .expect("timeout")
                .expect("link closed");
            self.framer.decode(&frame).unwrap()
        }
    }

    fn local_config(server_id: u32) -> SpaceConfig {
        let mut cfg = SpaceConfig::default();
        cfg.server_id = server_id;
        cfg.network.oh_listen = "127.0.0.1:0".into();
        cfg.network.peer_listen = "127.0.0.1:0".into();
        cfg
    }

    #[test]
    fn objects_are_segmented_across_servers() {
        let outbox = Arc::new(PeerOutbox::new());
        let fwd = Forwarder::new(
            ServerId(2),
            [ServerId(3), ServerId(1)],
            outbox,
            MessageFramer::new(),
        );
        assert_eq!(fwd.owner_of(0), ServerId(1));
        assert_eq!(fwd.owner_of(1), ServerId(2));
        assert_eq!(fwd.owner_of(5), ServerId(3));
    }

    #[test]
    fn outbox_refuses_without_a_link() {
        let outbox = PeerOutbox::new();
        assert!(outbox.push(ServerId(4), Frame::from(&b"x"[..])));
        assert_eq!(outbox.queued(ServerId(4)), 1);
        assert!(!outbox.is_attached(ServerId(4)));

        let frame = outbox.pull_next(ServerId(4)).unwrap();
        assert!(!outbox.try_send(ServerId(4), &frame));
        assert!(outbox.pull_next(ServerId(4)).is_none());
    }

    #[tokio::test]
    async fn messages_reach_local_object_hosts() {
        let server = SpaceServer::new(local_config(1));
        let running = server.start().await.unwrap();

        let mut bob = ObjectHost::connect(running.oh_addr).await;
        bob.send(20, 20, b"self");
        assert_eq!(bob.recv().await.payload, b"self");

        let alice = ObjectHost::connect(running.oh_addr).await;
        alice.send(10, 99, b"nobody");
        alice.send(10, 20, b"hi bob");
        let got = bob.recv().await;
        assert_eq!(got.source_object, 10);
        assert_eq!(got.payload, b"hi bob");

        let stats = running.forwarder().stats();
        assert_eq!(stats.unroutable, 1);
        assert_eq!(stats.delivered_local, 2);
        running.shutdown().await;
    }

    #[tokio::test]
    async fn messages_cross_to_the_owning_server() {
        let far = SpaceServer::new(local_config(2));
        let far_running = far.start().await.unwrap();

        let mut near_cfg = local_config(1);
        near_cfg.peers.push(PeerConfig {
            id: 2,
            address: far_running.peer_addr.to_string(),
            weight: 2.0,
        });
        let near = SpaceServer::new(near_cfg);
        let near_running = near.start().await.unwrap();

        // Object 3 lives on the far server (3 % 2 selects server 2).
        let mut bob = ObjectHost::connect(far_running.oh_addr).await;
        bob.send(3, 3, b"register");
        bob.recv().await;

        let alice = ObjectHost::connect(near_running.oh_addr).await;
        alice.send(4, 3, b"across");
        let got = bob.recv().await;
        assert_eq!(got.source_object, 4);
        assert_eq!(got.payload, b"across");

        assert_eq!(near_running.forwarder().stats().forwarded, 1);
        assert_eq!(near_running.scheduler().queue_weight(ServerId(2)), Some(2.0));

        near_running.shutdown().await;
        far_running.shutdown().await;
    }
}
