//! Serialized task execution.
//!
//! A [`Strand`] is a FIFO queue of jobs drained by a single tokio task.
//! Work is *posted* onto a strand rather than called directly: jobs on
//! one strand never run concurrently and always run in post order.
//! Nothing is guaranteed about ordering between different strands.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum StrandCommand {
    Run { label: &'static str, job: Job },
    Stop,
}

/// Cloneable handle to a serialized execution context.
#[derive(Clone)]
pub struct Strand {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<StrandCommand>,
}

impl Strand {
    /// Spawn the worker task for a new strand.
    ///
    /// Must be called from within a tokio runtime. The returned
    /// `JoinHandle` completes once [`stop`](Self::stop) has been
    /// processed or every handle has been dropped.
    pub fn spawn(name: &str) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<StrandCommand>();
        let name: Arc<str> = Arc::from(name);
        let worker_name = Arc::clone(&name);

        let handle = tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    StrandCommand::Run { label, job } => {
                        trace!(strand = %worker_name, task = label, "running");
                        job();
                    }
                    StrandCommand::Stop => break,
                }
            }
            debug!(strand = %worker_name, "strand stopped");
        });

        (Self { name, tx }, handle)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `job` behind everything already posted.
    ///
    /// Returns `false` if the strand has stopped; the job is dropped.
    pub fn post<F>(&self, label: &'static str, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(StrandCommand::Run {
                label,
                job: Box::new(job),
            })
            .is_ok()
    }

    /// Wait until every job posted before this call has run.
    ///
    /// Returns `false` if the strand stopped first.
    pub async fn flush(&self) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        let posted = self.post("strand::flush", move || {
            let _ = done_tx.send(());
        });
        posted && done_rx.await.is_ok()
    }

    /// Stop the worker after the jobs already queued have run.
    pub fn stop(&self) {
        let _ = self.tx.send(StrandCommand::Stop);
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for Strand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strand").field("name", &self.name).finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn jobs_run_in_post_order() {
        let (strand, _worker) = Strand::spawn("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..50 {
            let seen = Arc::clone(&seen);
            assert!(strand.post("push", move || seen.lock().unwrap().push(i)));
        }
        assert!(strand.flush().await);

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn stop_drains_queued_jobs_then_refuses() {
        let (strand, worker) = Strand::spawn("test");
        let seen = Arc::new(Mutex::new(0));

        let counter = Arc::clone(&seen);
        strand.post("bump", move || *counter.lock().unwrap() += 1);
        strand.stop();
        worker.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), 1);
        assert!(strand.is_stopped());
        assert!(!strand.post("late", || {}));
        assert!(!strand.flush().await);
    }

    #[tokio::test]
    async fn jobs_posted_from_jobs_run_later() {
        let (strand, _worker) = Strand::spawn("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner_strand = strand.clone();
        let outer_seen = Arc::clone(&seen);
        strand.post("outer", move || {
            let inner_seen = Arc::clone(&outer_seen);
            inner_strand.post("inner", move || inner_seen.lock().unwrap().push("inner"));
            outer_seen.lock().unwrap().push("outer");
        });

        // Two flushes: the inner job is posted while the first flush is queued.
        assert!(strand.flush().await);
        assert!(strand.flush().await);
        assert_eq!(*seen.lock().unwrap(), vec!["outer", "inner"]);
    }
}
