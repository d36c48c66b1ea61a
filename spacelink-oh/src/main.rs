//! spacelink object host — entry point.
//!
//! Connects to a space server as one object, sends a burst of object
//! messages and prints whatever comes back before the linger period
//! ends.
//!
//! ```text
//! spacelink-oh --object 7 --dest 7 --count 3         Echo to yourself
//! spacelink-oh --server 10.0.0.2:7777 --object 8 --dest 7 --payload ping
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spacelink_core::{
    ConnectionStatus, LinkConfig, MessageFramer, ObjectMessage, Stream, StreamHandler, TcpLink,
};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "spacelink-oh", about = "spacelink object-host client")]
struct Cli {
    /// Space server object-host address.
    #[arg(short, long, default_value = "127.0.0.1:7777")]
    server: String,

    /// Id of the object this host speaks for.
    #[arg(short, long)]
    object: u64,

    /// Destination object id.
    #[arg(short, long)]
    dest: u64,

    /// Number of messages to send.
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u64,

    /// Message payload (UTF-8).
    #[arg(short, long, default_value = "hello")]
    payload: String,

    /// How long to wait for replies, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    linger_ms: u64,

    /// Log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

// ── Link events ──────────────────────────────────────────────────

enum LinkEvent {
    Frame(Bytes),
    Down(String),
}

struct ClientEvents {
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl StreamHandler for ClientEvents {
    fn on_read(&self, chunk: Bytes) {
        let _ = self.tx.send(LinkEvent::Frame(chunk));
    }

    fn on_status(&self, status: ConnectionStatus, reason: &str) {
        if status != ConnectionStatus::Connected {
            let _ = self.tx.send(LinkEvent::Down(reason.to_string()));
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (tx, mut events) = mpsc::unbounded_channel();
    let link = TcpLink::connect(&cli.server, LinkConfig::default(), Arc::new(ClientEvents { tx }))
        .await?;
    info!("connected to {} as object {}", cli.server, cli.object);

    let framer = MessageFramer::new();
    for unique in 0..cli.count {
        let msg = ObjectMessage::new(cli.object, cli.dest, cli.payload.clone().into_bytes())
            .with_unique(unique);
        let frame = framer.encode(&msg)?;
        // The link buffers a bounded number of frames; wait for room.
        let mut frame = Some(frame);
        while let Some(f) = frame.take() {
            if !link.send(f.clone()) {
                if link.is_closed() {
                    return Err("connection closed while sending".into());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                frame = Some(f);
            }
        }
    }
    info!("sent {} message(s) to object {}", cli.count, cli.dest);

    let linger = tokio::time::sleep(Duration::from_millis(cli.linger_ms));
    tokio::pin!(linger);
    loop {
        tokio::select! {
            _ = &mut linger => break,
            event = events.recv() => match event {
                Some(LinkEvent::Frame(chunk)) => match framer.decode(&chunk) {
                    Ok(msg) => println!(
                        "{} -> {} #{}: {}",
                        msg.source_object,
                        msg.dest_object,
                        msg.unique,
                        String::from_utf8_lossy(&msg.payload)
                    ),
                    Err(e) => warn!("undecodable frame: {e}"),
                },
                Some(LinkEvent::Down(reason)) => {
                    warn!("server closed the connection: {reason}");
                    break;
                }
                None => break,
            },
        }
    }

    link.close();
    Ok(())
}
