//! Weighted fair scheduling of outbound server messages.
//!
//! Every destination server gets its own logical queue. The frames
//! themselves stay with the [`Sender`]; the scheduler only pulls the
//! head of each queue on demand and decides, by weighted fair queuing,
//! which destination may put its next frame on the wire.
//!
//! Service rounds run on the scheduler's own [`Strand`]:
//!
//! ```text
//! message_ready / enable_downstream
//!        │ (at most one round queued)
//!        ▼
//!   service round ──► front() ──► Sender::try_send ──► pop ──┐
//!        ▲                              │ refused             │
//!        │ budget exhausted             ▼                     │
//!        └──────────────────────  disable queue ◄─────────────┘
//! ```
//!
//! A round stops when the budget is spent (and reposts itself), when
//! every queue is empty, or when every backlogged queue is blocked. The
//! latter two wait for the next external trigger.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::capacity::CapacityEstimator;
use crate::context::SpaceContext;
use crate::fair_queue::FairQueue;
use crate::framer::Frame;
use crate::strand::Strand;

/// Default cap on frames sent per service round.
pub const DEFAULT_MAX_MESSAGES_PER_ROUND: usize = 100;

// ── ServerId ─────────────────────────────────────────────────────

/// Identifier of a space server, used as the queue key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub u32);

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server#{}", self.0)
    }
}

impl From<u32> for ServerId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

// ── Sender ───────────────────────────────────────────────────────

/// Source and sink of outbound frames, one logical queue per destination.
///
/// Both methods are called with the scheduler's internal lock held and
/// must not call back into the scheduler synchronously. Readiness after
/// a refused `try_send` is reported later through
/// [`FairMessageScheduler::enable_downstream`].
pub trait Sender: Send + Sync + 'static {
    /// Remove and return the next frame queued for `dest`.
    fn pull_next(&self, dest: ServerId) -> Option<Frame>;

    /// Hand `frame` to the network without waiting. `false` means the
    /// downstream for `dest` is full; the frame is offered again once
    /// the destination has been re-enabled.
    fn try_send(&self, dest: ServerId, frame: &Frame) -> bool;
}

// ── Config & stats ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Frames sent per round before yielding the strand.
    pub max_messages_per_round: usize,
    /// Averaging window of the capacity estimator.
    pub capacity_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_messages_per_round: DEFAULT_MAX_MESSAGES_PER_ROUND,
            capacity_window: Duration::from_secs(1),
        }
    }
}

/// Why a service round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The per-round budget ran out; another round was queued.
    Exhausted,
    /// No queue holds a frame.
    Underflow,
    /// Frames are waiting, but only on disabled queues.
    Blocked,
    /// The context is stopping.
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStats {
    pub rounds: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub stopped_budget: u64,
    pub stopped_underflow: u64,
    pub stopped_blocked: u64,
    /// Refused sends per destination.
    pub blocked_by_dest: BTreeMap<ServerId, u64>,
}

// ── FairMessageScheduler ─────────────────────────────────────────

struct SchedulerState {
    queue: FairQueue<ServerId>,
    capacity: CapacityEstimator,
    stats: SchedulerStats,
}

struct SchedulerInner<S: Sender> {
    ctx: Arc<SpaceContext>,
    sender: Arc<S>,
    config: SchedulerConfig,
    strand: Strand,
    state: Mutex<SchedulerState>,
    /// Set while a service round is queued on the strand.
    scheduled: AtomicBool,
    shut_down: AtomicBool,
}

/// Multiplexes per-destination queues onto one [`Sender`].
pub struct FairMessageScheduler<S: Sender> {
    inner: Arc<SchedulerInner<S>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Sender> FairMessageScheduler<S> {
    /// Create a scheduler and spawn its strand.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(ctx: Arc<SpaceContext>, sender: Arc<S>, config: SchedulerConfig) -> Self {
        let (strand, worker) = Strand::spawn("fair-sender");
        let config = SchedulerConfig {
            max_messages_per_round: config.max_messages_per_round.max(1),
            ..config
        };
        let state = SchedulerState {
            queue: FairQueue::new(),
            capacity: CapacityEstimator::with_window(config.capacity_window),
            stats: SchedulerStats::default(),
        };
        Self {
            inner: Arc::new(SchedulerInner {
                ctx,
                sender,
                config,
                strand,
                state: Mutex::new(state),
                scheduled: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
            }),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn sender(&self) -> &Arc<S> {
        &self.inner.sender
    }

    pub fn config(&self) -> SchedulerConfig {
        self.inner.config
    }

    /// `dest` has new data at the head of its source queue.
    ///
    /// Creates the queue on first use, weighted with the current
    /// average weight. Returns `false` only after shutdown.
    pub fn message_ready(&self, dest: ServerId) -> bool {
        if self.inner.refuse_after_shutdown("message_ready", dest) {
            return false;
        }
        {
            let mut state = self.inner.state();
            if !state.queue.has_queue(&dest) {
                let weight = state.queue.avg_weight();
                state.queue.add_queue(dest, weight);
                debug!(%dest, weight, "created destination queue");
            }
            let sender = &self.inner.sender;
            state.queue.notify_push_front(&dest, |d| sender.pull_next(*d));
        }
        self.inner.schedule();
        true
    }

    /// Set the weight of `dest`, creating its queue if needed.
    pub fn update_weight(&self, dest: ServerId, weight: f64) -> bool {
        if self.inner.refuse_after_shutdown("update_weight", dest) {
            return false;
        }
        let mut state = self.inner.state();
        if state.queue.has_queue(&dest) {
            state.queue.set_weight(&dest, weight);
        } else {
            state.queue.add_queue(dest, weight);
        }
        debug!(%dest, weight, "updated destination weight");
        true
    }

    /// `dest`'s downstream can take data again.
    pub fn enable_downstream(&self, dest: ServerId) -> bool {
        if self.inner.refuse_after_shutdown("enable_downstream", dest) {
            return false;
        }
        let known = self.inner.state().queue.enable(&dest);
        if known {
            trace!(%dest, "downstream enabled");
            self.inner.schedule();
        }
        known
    }

    /// Stop selecting `dest` until it is enabled again.
    pub fn disable_downstream(&self, dest: ServerId) -> bool {
        if self.inner.refuse_after_shutdown("disable_downstream", dest) {
            return false;
        }
        self.inner.state().queue.disable(&dest)
    }

    /// Drop `dest`'s queue. A frame already pulled from the sender for
    /// that destination is discarded.
    pub fn remove_queue(&self, dest: ServerId) -> bool {
        if self.inner.refuse_after_shutdown("remove_queue", dest) {
            return false;
        }
        let removed = self.inner.state().queue.remove_queue(&dest);
        if removed {
            debug!(%dest, "removed destination queue");
        }
        removed
    }

    pub fn has_queue(&self, dest: ServerId) -> bool {
        self.inner.state().queue.has_queue(&dest)
    }

    pub fn queue_weight(&self, dest: ServerId) -> Option<f64> {
        self.inner.state().queue.weight(&dest)
    }

    pub fn is_enabled(&self, dest: ServerId) -> Option<bool> {
        self.inner.state().queue.is_enabled(&dest)
    }

    /// Estimated outbound bytes/second.
    pub fn capacity_rate(&self) -> f64 {
        self.inner.state().capacity.current_rate()
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state();
        let mut stats = state.stats.clone();
        for dest in state.queue.keys() {
            if let Some(q) = state.queue.stats(dest).filter(|q| q.blocked > 0) {
                stats.blocked_by_dest.insert(*dest, q.blocked);
            }
        }
        stats
    }

    /// Wait until every round queued before this call has run.
    pub async fn flush(&self) -> bool {
        self.inner.strand.flush().await
    }

    /// Refuse further work and stop the strand after queued rounds.
    ///
    /// Returns `false` if already shut down.
    pub fn shutdown(&self) -> bool {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            debug!("fair scheduler already shut down");
            return false;
        }
        self.inner.strand.stop();
        info!("fair scheduler shutting down");
        true
    }

    /// Wait for the strand to finish after [`shutdown`](Self::shutdown).
    pub async fn join(&self) {
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl<S: Sender> Drop for FairMessageScheduler<S> {
    fn drop(&mut self) {
        let stats = self.stats();
        info!(
            rounds = stats.rounds,
            messages = stats.messages_sent,
            bytes = stats.bytes_sent,
            stopped_budget = stats.stopped_budget,
            stopped_underflow = stats.stopped_underflow,
            stopped_blocked = stats.stopped_blocked,
            "fair scheduler finished"
        );
        self.inner.shut_down.store(true, Ordering::SeqCst);
        self.inner.strand.stop();
    }
}

// ── Service rounds ───────────────────────────────────────────────

impl<S: Sender> SchedulerInner<S> {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refuse_after_shutdown(&self, op: &'static str, dest: ServerId) -> bool {
        if self.shut_down.load(Ordering::SeqCst) {
            error!(severity = "fatal", op, %dest, "fair scheduler used after shutdown");
            return true;
        }
        false
    }

    /// Queue a service round unless one is already queued.
    fn schedule(self: &Arc<Self>) {
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        if !self.strand.post("fair_scheduler::service", move || inner.service()) {
            self.scheduled.store(false, Ordering::SeqCst);
        }
    }

    fn service(self: &Arc<Self>) {
        self.scheduled.store(false, Ordering::SeqCst);
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        if self.run_round() == RoundOutcome::Exhausted {
            self.schedule();
        }
    }

    /// One service round. The state lock is taken per frame so that
    /// readiness and new traffic can land between sends.
    fn run_round(&self) -> RoundOutcome {
        let mut sent = 0usize;
        let mut bytes = 0u64;

        let outcome = loop {
            if self.ctx.is_stopped() {
                break RoundOutcome::Stopped;
            }
            if sent >= self.config.max_messages_per_round {
                break RoundOutcome::Exhausted;
            }
            let mut state = self.state();
            let Some((dest, frame)) = state.queue.front() else {
                break if state.queue.is_empty() {
                    RoundOutcome::Underflow
                } else {
                    RoundOutcome::Blocked
                };
            };
            let dest = *dest;
            let len = frame.len();

            // Refusal and disable happen under one guard, so a readiness
            // signal racing the refusal re-enables after the disable.
            if !self.sender.try_send(dest, frame) {
                trace!(%dest, "downstream full, disabling queue");
                state.queue.disable(&dest);
                state.queue.record_blocked(&dest);
                continue;
            }
            state.queue.pop(&dest, |d| self.sender.pull_next(*d));
            sent += 1;
            bytes += len as u64;
        };

        let mut state = self.state();
        let stats = &mut state.stats;
        stats.rounds += 1;
        stats.messages_sent += sent as u64;
        stats.bytes_sent += bytes;
        match outcome {
            RoundOutcome::Exhausted => stats.stopped_budget += 1,
            RoundOutcome::Underflow => stats.stopped_underflow += 1,
            RoundOutcome::Blocked => stats.stopped_blocked += 1,
            RoundOutcome::Stopped => {}
        }
        state.capacity.sample(self.ctx.now(), bytes);
        trace!(sent, bytes, ?outcome, "service round finished");
        outcome
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet, VecDeque};

    /// In-memory sender: per-destination backlogs and a log of what went out.
    #[derive(Default)]
    struct FakeSender {
        backlog: Mutex<HashMap<ServerId, VecDeque<Frame>>>,
        blocked: Mutex<HashSet<ServerId>>,
        sent: Mutex<Vec<(ServerId, Frame)>>,
    }

    impl FakeSender {
        fn queue(&self, dest: u32, count: usize, len: usize) {
            let mut backlog = self.backlog.lock().unwrap();
            let q = backlog.entry(ServerId(dest)).or_default();
            for i in 0..count {
                let mut bytes = vec![0u8; len.max(4)];
                bytes[..4].copy_from_slice(&(i as u32).to_be_bytes());
                q.push_back(Frame::from(bytes));
            }
        }

        fn block(&self, dest: u32, blocked: bool) {
            let mut set = self.blocked.lock().unwrap();
            if blocked {
                set.insert(ServerId(dest));
            } else {
                set.remove(&ServerId(dest));
            }
        }

        fn sent_to(&self, dest: u32) -> Vec<u32> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(d, _)| *d == ServerId(dest))
                .map(|(_, f)| u32::from_be_bytes(f.as_bytes()[..4].try_into().unwrap()))
                .collect()
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl Sender for FakeSender {
        fn pull_next(&self, dest: ServerId) -> Option<Frame> {
            self.backlog.lock().unwrap().get_mut(&dest)?.pop_front()
        }

        fn try_send(&self, dest: ServerId, frame: &Frame) -> bool {
            if self.blocked.lock().unwrap().contains(&dest) {
                return false;
            }
            self.sent.lock().unwrap().push((dest, frame.clone()));
            true
        }
    }

    fn scheduler() -> (FairMessageScheduler<FakeSender>, Arc<FakeSender>) {
        let sender = Arc::new(FakeSender::default());
        let ctx = SpaceContext::new(1);
        let sched = FairMessageScheduler::new(ctx, Arc::clone(&sender), SchedulerConfig::default());
        (sched, sender)
    }

    #[tokio::test]
    async fn round_stops_at_budget_and_reposts() {
        let (sched, sender) = scheduler();
        sender.queue(1, 250, 16);
        assert!(sched.message_ready(ServerId(1)));

        // Reposted rounds run behind the flush marker on the same strand.
        while sender.sent_count() < 250 {
            assert!(sched.flush().await);
        }

        let stats = sched.stats();
        assert_eq!(stats.rounds, 3);
        assert_eq!(stats.stopped_budget, 2);
        assert_eq!(stats.stopped_underflow, 1);
        assert_eq!(stats.messages_sent, 250);
        assert_eq!(stats.bytes_sent, 250 * 16);
    }

    #[tokio::test]
    async fn weights_split_service_two_to_one() {
        let (sched, sender) = scheduler();
        sched.update_weight(ServerId(1), 2.0);
        sched.update_weight(ServerId(2), 1.0);
        sender.queue(1, 300, 100);
        sender.queue(2, 300, 100);
        sched.message_ready(ServerId(1));
        sched.message_ready(ServerId(2));
        while sender.sent_count() < 450 {
            assert!(sched.flush().await);
        }

        let sent = sender.sent.lock().unwrap();
        let first: Vec<ServerId> = sent.iter().take(90).map(|(d, _)| *d).collect();
        assert_eq!(first.iter().filter(|d| **d == ServerId(1)).count(), 60);
        assert_eq!(first.iter().filter(|d| **d == ServerId(2)).count(), 30);
    }

    #[tokio::test]
    async fn each_destination_is_served_in_order() {
        let (sched, sender) = scheduler();
        sender.queue(1, 40, 8);
        sender.queue(2, 40, 8);
        sched.message_ready(ServerId(1));
        sched.message_ready(ServerId(2));
        sched.flush().await;

        assert_eq!(sender.sent_to(1), (0..40).collect::<Vec<_>>());
        assert_eq!(sender.sent_to(2), (0..40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn blocked_destination_waits_for_enable() {
        let (sched, sender) = scheduler();
        sender.block(1, true);
        sender.queue(1, 5, 8);
        sender.queue(2, 5, 8);
        sched.message_ready(ServerId(1));
        sched.message_ready(ServerId(2));
        sched.flush().await;

        assert!(sender.sent_to(1).is_empty());
        assert_eq!(sender.sent_to(2).len(), 5);
        assert_eq!(sched.is_enabled(ServerId(1)), Some(false));
        let stats = sched.stats();
        assert_eq!(stats.stopped_blocked, 1);
        assert_eq!(stats.blocked_by_dest.get(&ServerId(1)), Some(&1));

        // More traffic for the blocked destination does not wake it.
        sched.message_ready(ServerId(1));
        sched.flush().await;
        assert!(sender.sent_to(1).is_empty());

        sender.block(1, false);
        assert!(sched.enable_downstream(ServerId(1)));
        sched.flush().await;
        assert_eq!(sender.sent_to(1), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn disabled_destination_is_skipped_despite_earliest_finish() {
        let (sched, sender) = scheduler();
        sched.update_weight(ServerId(1), 4.0);
        sched.update_weight(ServerId(2), 1.0);
        assert!(sched.disable_downstream(ServerId(1)));
        sender.queue(1, 10, 100);
        sender.queue(2, 10, 100);
        sched.message_ready(ServerId(1));
        sched.message_ready(ServerId(2));
        sched.flush().await;

        assert!(sender.sent_to(1).is_empty());
        assert_eq!(sender.sent_to(2).len(), 10);
        let stats = sched.stats();
        assert_eq!(stats.stopped_blocked, 1);
        assert!(stats.blocked_by_dest.is_empty());

        assert!(sched.enable_downstream(ServerId(1)));
        sched.flush().await;
        assert_eq!(sender.sent_to(1), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn new_queues_take_the_average_weight() {
        let (sched, _sender) = scheduler();
        sched.message_ready(ServerId(9));
        assert_eq!(sched.queue_weight(ServerId(9)), Some(1.0));

        let (sched, _sender) = scheduler();
        sched.update_weight(ServerId(1), 1.0);
        sched.update_weight(ServerId(2), 2.0);
        sched.update_weight(ServerId(3), 3.0);
        sched.message_ready(ServerId(4));
        assert_eq!(sched.queue_weight(ServerId(4)), Some(2.0));
    }

    #[tokio::test]
    async fn empty_source_ends_in_underflow() {
        let (sched, sender) = scheduler();
        assert!(sched.message_ready(ServerId(3)));
        sched.flush().await;
        assert_eq!(sender.sent_count(), 0);
        assert!(sched.has_queue(ServerId(3)));
        assert_eq!(sched.stats().stopped_underflow, 1);
    }

    #[tokio::test]
    async fn unknown_destination_cannot_be_enabled() {
        let (sched, _sender) = scheduler();
        assert!(!sched.enable_downstream(ServerId(5)));
        assert!(!sched.disable_downstream(ServerId(5)));
        assert!(!sched.remove_queue(ServerId(5)));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_refuses_work() {
        let (sched, sender) = scheduler();
        sender.queue(1, 3, 8);
        assert!(sched.shutdown());
        assert!(!sched.shutdown());

        assert!(!sched.message_ready(ServerId(1)));
        assert!(!sched.update_weight(ServerId(1), 2.0));
        sched.join().await;
        assert_eq!(sender.sent_count(), 0);
        assert!(!sched.flush().await);
    }

    #[tokio::test]
    async fn queues_survive_removal_after_shutdown() {
        let (sched, _sender) = scheduler();
        assert!(sched.update_weight(ServerId(1), 2.0));
        assert!(sched.shutdown());

        assert!(!sched.remove_queue(ServerId(1)));
        assert!(sched.has_queue(ServerId(1)));
        assert!(!sched.enable_downstream(ServerId(1)));
        assert!(!sched.disable_downstream(ServerId(1)));
        assert_eq!(sched.is_enabled(ServerId(1)), Some(true));
    }

    #[tokio::test]
    async fn stopped_context_halts_service() {
        let sender = Arc::new(FakeSender::default());
        let ctx = SpaceContext::new(1);
        let sched = FairMessageScheduler::new(
            Arc::clone(&ctx),
            Arc::clone(&sender),
            SchedulerConfig::default(),
        );
        sender.queue(1, 10, 8);
        ctx.stop();
        sched.message_ready(ServerId(1));
        sched.flush().await;
        assert_eq!(sender.sent_count(), 0);
    }

    #[tokio::test]
    async fn capacity_estimate_follows_traffic() {
        let (sched, sender) = scheduler();
        assert_eq!(sched.capacity_rate(), 0.0);
        for _ in 0..3 {
            sender.queue(1, 10, 1000);
            sched.message_ready(ServerId(1));
            sched.flush().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(sched.capacity_rate() > 0.0);
    }
}
