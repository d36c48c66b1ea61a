//! Length-delimited TCP implementation of [`Stream`].
//!
//! Each [`TcpLink`] owns two background tasks, mirroring a classic
//! split connection:
//!
//! ```text
//!  send() ──► bounded mpsc ──► writer task ──► Framed sink ──► socket
//!  socket ──► Framed stream ──► reader task ──► StreamHandler::on_read
//! ```
//!
//! `send` never waits: a full channel is reported as `false` and the
//! link remembers it was blocked. Once the writer has drained a frame
//! from a blocked link it fires the ready-to-send callback, which is
//! how flow-control readiness reaches the fair scheduler. The flag is
//! set before a final retry, so every refused send is followed by a
//! drain that observes it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, trace, warn};

use super::{AcceptHandler, ConnectionStatus, Stream, StreamHandler, StreamListener};
use crate::error::LinkError;
use crate::framer::{DEFAULT_MAX_FRAME_SIZE, Frame};

/// Default number of frames a link buffers before reporting backpressure.
pub const DEFAULT_LINK_CAPACITY: usize = 256;

type ReadyCallback = Arc<dyn Fn() + Send + Sync + 'static>;
type FramedTcp = Framed<TcpStream, LengthDelimitedCodec>;

// ── LinkConfig ───────────────────────────────────────────────────

/// Per-link tuning shared by accepted and outgoing links.
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    /// Frames buffered ahead of the socket.
    pub capacity: usize,
    /// Largest frame accepted from or written to the wire.
    pub max_frame_size: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LINK_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

// ── Shared link state ────────────────────────────────────────────

struct LinkShared {
    remote_addr: Option<SocketAddr>,
    closed: AtomicBool,
    blocked: AtomicBool,
    status_reported: AtomicBool,
    close_tx: watch::Sender<bool>,
    on_ready: Mutex<Option<ReadyCallback>>,
    bytes_sent: AtomicU64,
    frames_sent: AtomicU64,
}

impl LinkShared {
    /// Deliver a terminal status to the handler exactly once.
    fn report_down(&self, handler: &dyn StreamHandler, reason: &str) {
        if !self.status_reported.swap(true, Ordering::SeqCst) {
            handler.on_status(ConnectionStatus::Disconnected, reason);
        }
    }

    fn signal_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.close_tx.send(true);
    }

    fn fire_ready(&self) {
        let callback = self.on_ready.lock().ok().and_then(|cb| cb.clone());
        if let Some(callback) = callback {
            callback();
        }
    }
}

// ── TcpLink ──────────────────────────────────────────────────────

/// One framed TCP connection.
pub struct TcpLink {
    tx: mpsc::Sender<Frame>,
    shared: Arc<LinkShared>,
}

/// The halves of a link whose I/O tasks have not been started yet.
struct PendingLinkTasks {
    framed: FramedTcp,
    rx: mpsc::Receiver<Frame>,
    close_rx: watch::Receiver<bool>,
    shared: Arc<LinkShared>,
}

impl TcpLink {
    fn from_tcp(stream: TcpStream, config: LinkConfig) -> (Arc<Self>, PendingLinkTasks) {
        let remote_addr = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {e}");
        }
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(config.max_frame_size)
            .new_codec();
        let framed = Framed::new(stream, codec);

        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let (close_tx, close_rx) = watch::channel(false);
        let shared = Arc::new(LinkShared {
            remote_addr,
            closed: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            status_reported: AtomicBool::new(false),
            close_tx,
            on_ready: Mutex::new(None),
            bytes_sent: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
        });

        let link = Arc::new(Self {
            tx,
            shared: Arc::clone(&shared),
        });
        let tasks = PendingLinkTasks {
            framed,
            rx,
            close_rx,
            shared,
        };
        (link, tasks)
    }

    /// Connect to `addr` and start the link's I/O tasks.
    pub async fn connect(
        addr: &str,
        config: LinkConfig,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<Arc<Self>, LinkError> {
        let stream = TcpStream::connect(addr).await?;
        let (link, tasks) = Self::from_tcp(stream, config);
        tasks.start(handler);
        Ok(link)
    }

    /// Register the callback fired when a blocked link can take data again.
    pub fn on_ready_to_send<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.shared.on_ready.lock() {
            *slot = Some(Arc::new(callback));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Whether the last `send` found the buffer full.
    pub fn is_blocked(&self) -> bool {
        self.shared.blocked.load(Ordering::SeqCst)
    }

    /// Total payload bytes written to the socket.
    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.shared.frames_sent.load(Ordering::Relaxed)
    }
}

impl Stream for TcpLink {
    fn send(&self, frame: Frame) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                self.shared.blocked.store(true, Ordering::SeqCst);
                // The writer may have drained the channel before the flag
                // was set; retry once so that case never parks the caller.
                self.tx.try_send(frame).is_ok()
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn close(&self) {
        self.shared.signal_close();
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote_addr
    }
}

impl std::fmt::Debug for TcpLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpLink")
            .field("remote_addr", &self.shared.remote_addr)
            .field("closed", &self.is_closed())
            .field("blocked", &self.is_blocked())
            .finish()
    }
}

// ── I/O tasks ────────────────────────────────────────────────────

impl PendingLinkTasks {
    fn start(self, handler: Arc<dyn StreamHandler>) {
        let (sink, stream) = self.framed.split();
        tokio::spawn(write_loop(
            sink,
            self.rx,
            self.close_rx.clone(),
            Arc::clone(&self.shared),
            Arc::clone(&handler),
        ));
        tokio::spawn(read_loop(stream, self.close_rx, self.shared, handler));
    }
}

async fn write_loop(
    mut sink: SplitSink<FramedTcp, bytes::Bytes>,
    mut rx: mpsc::Receiver<Frame>,
    mut close_rx: watch::Receiver<bool>,
    shared: Arc<LinkShared>,
    handler: Arc<dyn StreamHandler>,
) {
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => frame,
            _ = close_rx.changed() => None,
        };
        let Some(frame) = frame else { break };

        let len = frame.len() as u64;
        if let Err(e) = sink.send(frame.into_bytes()).await {
            warn!(remote = ?shared.remote_addr, "link write error: {e}");
            shared.signal_close();
            shared.report_down(handler.as_ref(), &e.to_string());
            break;
        }
        shared.bytes_sent.fetch_add(len, Ordering::Relaxed);
        shared.frames_sent.fetch_add(1, Ordering::Relaxed);

        if shared.blocked.swap(false, Ordering::SeqCst) {
            trace!(remote = ?shared.remote_addr, "link ready to send");
            shared.fire_ready();
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<FramedTcp>,
    mut close_rx: watch::Receiver<bool>,
    shared: Arc<LinkShared>,
    handler: Arc<dyn StreamHandler>,
) {
    let reason = loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = close_rx.changed() => break "closed locally".to_string(),
        };
        match next {
            Some(Ok(chunk)) => handler.on_read(chunk.freeze()),
            Some(Err(e)) => break format!("read error: {e}"),
            None => break "remote closed".to_string(),
        }
    };
    debug!(remote = ?shared.remote_addr, reason = %reason, "link reader finished");
    shared.signal_close();
    shared.report_down(handler.as_ref(), &reason);
}

// ── TcpStreamListener ────────────────────────────────────────────

/// Accepts TCP connections and hands each one out as a [`TcpLink`].
#[derive(Debug, Default)]
pub struct TcpStreamListener {
    config: LinkConfig,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpStreamListener {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            accept_task: None,
        }
    }

    fn hand_off(stream: TcpStream, config: LinkConfig, handler: &dyn AcceptHandler) {
        let (link, tasks) = TcpLink::from_tcp(stream, config);
        let as_stream: Arc<dyn Stream> = link.clone();
        match handler.on_accept(Some(as_stream)) {
            Some(stream_handler) => tasks.start(stream_handler),
            None => link.close(),
        }
    }
}

#[async_trait]
impl StreamListener for TcpStreamListener {
    async fn listen(
        &mut self,
        addr: &str,
        handler: Arc<dyn AcceptHandler>,
    ) -> Result<SocketAddr, LinkError> {
        if self.accept_task.is_some() {
            return Err(LinkError::Config(format!("already listening, cannot bind {addr}")));
        }
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let config = self.config;

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted tcp connection");
                        Self::hand_off(stream, config, handler.as_ref());
                    }
                    Err(e) => {
                        warn!("accept error: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                }
            }
        }));
        debug!(%local, "tcp listener bound");
        Ok(local)
    }

    fn close(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

impl Drop for TcpStreamListener {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    /// Forwards every callback into a channel.
    struct ChannelHandler {
        events: mpsc::UnboundedSender<Event>,
    }

    #[derive(Debug, PartialEq)]
    enum Event {
        Read(Bytes),
        Status(ConnectionStatus),
    }

    impl StreamHandler for ChannelHandler {
        fn on_read(&self, chunk: Bytes) {
            let _ = self.events.send(Event::Read(chunk));
        }

        fn on_status(&self, status: ConnectionStatus, _reason: &str) {
            let _ = self.events.send(Event::Status(status));
        }
    }

    struct ChannelAcceptor {
        handler: Arc<ChannelHandler>,
        streams: mpsc::UnboundedSender<Arc<dyn Stream>>,
    }

    impl AcceptHandler for ChannelAcceptor {
        fn on_accept(&self, stream: Option<Arc<dyn Stream>>) -> Option<Arc<dyn StreamHandler>> {
            let stream = stream?;
            let _ = self.streams.send(stream);
            Some(self.handler.clone())
        }
    }

    fn handler() -> (Arc<ChannelHandler>, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelHandler { events }), rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout")
            .expect("handler dropped")
    }

    #[tokio::test]
    async fn frames_cross_a_loopback_link_in_order() {
        let (server_handler, mut server_events) = handler();
        let (streams_tx, mut streams_rx) = mpsc::unbounded_channel();
        let mut listener = TcpStreamListener::new(LinkConfig::default());
        let addr = listener
            .listen(
                "127.0.0.1:0",
                Arc::new(ChannelAcceptor {
                    handler: server_handler,
                    streams: streams_tx,
                }),
            )
            .await
            .unwrap();

        let (client_handler, mut client_events) = handler();
        let client = TcpLink::connect(&addr.to_string(), LinkConfig::default(), client_handler)
            .await
            .unwrap();

        for i in 0u8..5 {
            assert!(client.send(Frame::from(vec![i; 3])));
        }
        for i in 0u8..5 {
            assert_eq!(
                next_event(&mut server_events).await,
                Event::Read(Bytes::from(vec![i; 3]))
            );
        }

        let server_side = streams_rx.recv().await.unwrap();
        assert!(server_side.send(Frame::from(&b"pong"[..])));
        assert_eq!(
            next_event(&mut client_events).await,
            Event::Read(Bytes::from_static(b"pong"))
        );
    }

    #[tokio::test]
    async fn peer_close_is_reported_once() {
        let (server_handler, mut server_events) = handler();
        let (streams_tx, _streams_rx) = mpsc::unbounded_channel();
        let mut listener = TcpStreamListener::new(LinkConfig::default());
        let addr = listener
            .listen(
                "127.0.0.1:0",
                Arc::new(ChannelAcceptor {
                    handler: server_handler,
                    streams: streams_tx,
                }),
            )
            .await
            .unwrap();

        let (client_handler, _client_events) = handler();
        let client = TcpLink::connect(&addr.to_string(), LinkConfig::default(), client_handler)
            .await
            .unwrap();
        client.close();
        assert!(!client.send(Frame::from(&b"late"[..])));

        assert_eq!(
            next_event(&mut server_events).await,
            Event::Status(ConnectionStatus::Disconnected)
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_link_reports_blocked_then_ready() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let accept = tokio::spawn(async move { tcp.accept().await.unwrap().0 });
        let stream = TcpStream::connect(addr).await.unwrap();
        let _server = accept.await.unwrap();

        let config = LinkConfig {
            capacity: 1,
            ..LinkConfig::default()
        };
        let (link, tasks) = TcpLink::from_tcp(stream, config);
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
        link.on_ready_to_send(move || {
            let _ = ready_tx.send(());
        });

        // Writer not running yet: the single slot fills up.
        assert!(link.send(Frame::from(&b"a"[..])));
        assert!(!link.send(Frame::from(&b"b"[..])));
        assert!(link.is_blocked());

        let (h, _events) = handler();
        tasks.start(h);
        tokio::time::timeout(Duration::from_secs(5), ready_rx.recv())
            .await
            .expect("timeout")
            .expect("callback dropped");
        assert!(!link.is_blocked());
        assert!(link.send(Frame::from(&b"c"[..])));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn refused_sends_always_get_a_ready_signal() {
        let (server_handler, mut server_events) = handler();
        let (streams_tx, _streams_rx) = mpsc::unbounded_channel();
        let mut listener = TcpStreamListener::new(LinkConfig::default());
        let addr = listener
            .listen(
                "127.0.0.1:0",
                Arc::new(ChannelAcceptor {
                    handler: server_handler,
                    streams: streams_tx,
                }),
            )
            .await
            .unwrap();

        let tight = LinkConfig {
            capacity: 1,
            ..LinkConfig::default()
        };
        let (client_handler, _client_events) = handler();
        let link = TcpLink::connect(&addr.to_string(), tight, client_handler)
            .await
            .unwrap();
        let ready = Arc::new(tokio::sync::Notify::new());
        let signal = Arc::clone(&ready);
        link.on_ready_to_send(move || signal.notify_one());

        // Only the ready callback resumes a refused sender; a lost signal
        // shows up as a timeout.
        const FRAMES: u32 = 2000;
        for i in 0..FRAMES {
            let frame = Frame::from(i.to_be_bytes().to_vec());
            while !link.send(frame.clone()) {
                tokio::time::timeout(Duration::from_secs(5), ready.notified())
                    .await
                    .expect("ready signal lost");
            }
        }
        for i in 0..FRAMES {
            assert_eq!(
                next_event(&mut server_events).await,
                Event::Read(Bytes::from(i.to_be_bytes().to_vec()))
            );
        }
    }
}
