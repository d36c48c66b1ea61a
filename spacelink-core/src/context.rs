//! Process-wide services shared by the registry and the scheduler.
//!
//! A single [`SpaceContext`] is built at startup and handed to every
//! component that needs the main strand, the clock or the stop flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::info;

use crate::strand::Strand;

/// Shared context for one space-server process.
#[derive(Debug)]
pub struct SpaceContext {
    /// Numeric id of this space server.
    server_id: u32,
    stopped: AtomicBool,
    main_strand: Strand,
    main_worker: Mutex<Option<JoinHandle<()>>>,
}

impl SpaceContext {
    /// Build a context and spawn its main strand.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(server_id: u32) -> Arc<Self> {
        let (main_strand, worker) = Strand::spawn("main");
        Arc::new(Self {
            server_id,
            stopped: AtomicBool::new(false),
            main_strand,
            main_worker: Mutex::new(Some(worker)),
        })
    }

    pub fn server_id(&self) -> u32 {
        self.server_id
    }

    /// The strand on which registry bookkeeping runs.
    pub fn main_strand(&self) -> &Strand {
        &self.main_strand
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Mark the process as stopping.
    ///
    /// Components refuse new work once this is set. Returns `false` if
    /// the context was already stopped.
    pub fn stop(&self) -> bool {
        let first = !self.stopped.swap(true, Ordering::SeqCst);
        if first {
            info!(server_id = self.server_id, "space context stopping");
        }
        first
    }

    /// Stop the main strand after its queued work and wait for it.
    pub async fn join(&self) {
        self.main_strand.stop();
        let worker = self.main_worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}
