//! Weighted fair-queue index.
//!
//! One input queue per key. Each queue buffers at most one frame (its
//! head), pulled on demand from an external source. Queues are ordered
//! by the virtual finish time of their head frame:
//!
//! ```text
//! finish(head) = start + len(head) / weight
//! start        = finish(previous head)             after a pop
//!              = max(virtual_time, last finish)     when a queue refills
//! ```
//!
//! Ties go to the queue created first. Disabled queues keep their place
//! in the index but are skipped by [`FairQueue::front`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::warn;

use crate::framer::Frame;

/// Weight used when no other queue exists to average over.
pub const DEFAULT_WEIGHT: f64 = 1.0;

/// Transmit time charged to a zero-weight queue.
const ZERO_WEIGHT_TX_TIME: Duration = Duration::from_secs(1000);
/// Smallest transmit time charged for any frame.
const MIN_TX_TIME: Duration = Duration::from_micros(1);

// ── QueueInfo ────────────────────────────────────────────────────

#[derive(Debug)]
struct QueueInfo {
    weight: f64,
    enabled: bool,
    /// Buffered head frame, pulled from the source.
    head: Option<Frame>,
    /// Virtual finish time of `head`; meaningful only while `head` is set.
    finish: Duration,
    /// Finish time of the most recently popped frame.
    last_finish: Duration,
    /// Creation order, used to break finish-time ties.
    order: u64,
    stats: QueueStats,
}

/// Per-queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub frames_popped: u64,
    pub bytes_popped: u64,
    /// Times the downstream refused this queue's head.
    pub blocked: u64,
}

// ── FairQueue ────────────────────────────────────────────────────

/// Weighted fair queuing over pull-based per-key sources.
#[derive(Debug)]
pub struct FairQueue<K> {
    queues: BTreeMap<K, QueueInfo>,
    /// Queues holding a head frame, by `(finish, order)`.
    by_finish: BTreeSet<(Duration, u64, K)>,
    virtual_time: Duration,
    next_order: u64,
    zero_weight_warned: bool,
}

impl<K: Ord + Clone + std::fmt::Debug> FairQueue<K> {
    pub fn new() -> Self {
        Self {
            queues: BTreeMap::new(),
            by_finish: BTreeSet::new(),
            virtual_time: Duration::ZERO,
            next_order: 0,
            zero_weight_warned: false,
        }
    }

    // ── Queue management ──────────────────────────────────────────

    /// Register a queue. Returns `false` if one already exists for `key`.
    pub fn add_queue(&mut self, key: K, weight: f64) -> bool {
        if self.queues.contains_key(&key) {
            return false;
        }
        let order = self.next_order;
        self.next_order += 1;
        self.queues.insert(
            key,
            QueueInfo {
                weight: sanitize_weight(weight),
                enabled: true,
                head: None,
                finish: Duration::ZERO,
                last_finish: Duration::ZERO,
                order,
                stats: QueueStats::default(),
            },
        );
        true
    }

    /// Unregister a queue, discarding its buffered head frame.
    pub fn remove_queue(&mut self, key: &K) -> bool {
        match self.queues.remove(key) {
            Some(qi) => {
                if qi.head.is_some() {
                    self.by_finish.remove(&(qi.finish, qi.order, key.clone()));
                }
                true
            }
            None => false,
        }
    }

    pub fn has_queue(&self, key: &K) -> bool {
        self.queues.contains_key(key)
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.queues.keys()
    }

    /// Change a queue's weight. Returns `false` for unknown keys.
    ///
    /// The new weight applies from the next head frame on, except for a
    /// queue leaving zero weight: its head is re-timed from the current
    /// virtual time so it does not sit out the zero-weight penalty.
    pub fn set_weight(&mut self, key: &K, weight: f64) -> bool {
        let weight = sanitize_weight(weight);
        let virtual_time = self.virtual_time;
        let Some(qi) = self.queues.get_mut(key) else {
            return false;
        };
        let old_weight = qi.weight;
        qi.weight = weight;

        if old_weight == 0.0 && weight > 0.0 && qi.head.is_some() {
            self.by_finish.remove(&(qi.finish, qi.order, key.clone()));
            let len = qi.head.as_ref().map_or(0, Frame::len);
            qi.finish = virtual_time.saturating_add(tx_time(len, weight));
            self.by_finish.insert((qi.finish, qi.order, key.clone()));
        }
        true
    }

    pub fn weight(&self, key: &K) -> Option<f64> {
        self.queues.get(key).map(|qi| qi.weight)
    }

    /// Mean weight over all queues, or [`DEFAULT_WEIGHT`] when there are none.
    pub fn avg_weight(&self) -> f64 {
        if self.queues.is_empty() {
            return DEFAULT_WEIGHT;
        }
        let sum: f64 = self.queues.values().map(|qi| qi.weight).sum();
        sum / self.queues.len() as f64
    }

    pub fn enable(&mut self, key: &K) -> bool {
        match self.queues.get_mut(key) {
            Some(qi) => {
                qi.enabled = true;
                true
            }
            None => false,
        }
    }

    pub fn disable(&mut self, key: &K) -> bool {
        match self.queues.get_mut(key) {
            Some(qi) => {
                qi.enabled = false;
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, key: &K) -> Option<bool> {
        self.queues.get(key).map(|qi| qi.enabled)
    }

    pub fn stats(&self, key: &K) -> Option<QueueStats> {
        self.queues.get(key).map(|qi| qi.stats)
    }

    pub fn record_blocked(&mut self, key: &K) {
        if let Some(qi) = self.queues.get_mut(key) {
            qi.stats.blocked += 1;
        }
    }

    // ── Scheduling ────────────────────────────────────────────────

    /// Tell the index that `key`'s source may have data.
    ///
    /// If the queue has no buffered head, one frame is pulled from
    /// `pull` and timed from the current virtual time. A queue that
    /// already holds a head keeps its finish time. Returns whether the
    /// queue now holds a head frame.
    pub fn notify_push_front<F>(&mut self, key: &K, pull: F) -> bool
    where
        F: FnOnce(&K) -> Option<Frame>,
    {
        let virtual_time = self.virtual_time;
        let Some(qi) = self.queues.get_mut(key) else {
            return false;
        };
        if qi.head.is_some() {
            return true;
        }
        let Some(frame) = pull(key) else {
            return false;
        };

        let start = virtual_time.max(qi.last_finish);
        let charge = charge(key, qi.weight, frame.len(), &mut self.zero_weight_warned);
        qi.finish = start.saturating_add(charge);
        qi.head = Some(frame);
        self.by_finish.insert((qi.finish, qi.order, key.clone()));
        true
    }

    /// The enabled queue with the smallest finish time, and its head.
    pub fn front(&self) -> Option<(&K, &Frame)> {
        self.by_finish.iter().find_map(|(_, _, key)| {
            let qi = self.queues.get(key)?;
            if !qi.enabled {
                return None;
            }
            qi.head.as_ref().map(|frame| (key, frame))
        })
    }

    /// Remove and return `key`'s head frame, refilling from `pull`.
    ///
    /// Advances the global virtual time to the popped frame's finish
    /// time and times the next head from there.
    pub fn pop<F>(&mut self, key: &K, pull: F) -> Option<Frame>
    where
        F: FnOnce(&K) -> Option<Frame>,
    {
        let qi = self.queues.get_mut(key)?;
        let frame = qi.head.take()?;
        self.by_finish.remove(&(qi.finish, qi.order, key.clone()));

        let finish = qi.finish;
        qi.last_finish = finish;
        qi.stats.frames_popped += 1;
        qi.stats.bytes_popped += frame.len() as u64;
        self.virtual_time = self.virtual_time.max(finish);

        if let Some(next) = pull(key) {
            let charge = charge(key, qi.weight, next.len(), &mut self.zero_weight_warned);
            qi.finish = finish.saturating_add(charge);
            qi.head = Some(next);
            self.by_finish.insert((qi.finish, qi.order, key.clone()));
        }
        Some(frame)
    }

    /// `true` when no queue holds a head frame, enabled or not.
    pub fn is_empty(&self) -> bool {
        self.by_finish.is_empty()
    }

    /// Number of queues holding a head frame.
    pub fn backlogged(&self) -> usize {
        self.by_finish.len()
    }

    pub fn virtual_time(&self) -> Duration {
        self.virtual_time
    }

    pub fn finish_time(&self, key: &K) -> Option<Duration> {
        self.queues
            .get(key)
            .filter(|qi| qi.head.is_some())
            .map(|qi| qi.finish)
    }
}

impl<K: Ord + Clone + std::fmt::Debug> Default for FairQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Virtual transmit time for `len` bytes on a queue of `weight`.
fn charge<K: std::fmt::Debug>(key: &K, weight: f64, len: usize, warned: &mut bool) -> Duration {
    if weight == 0.0 && !*warned {
        *warned = true;
        warn!(?key, "fair queue encountered zero weight");
    }
    tx_time(len, weight)
}

fn sanitize_weight(weight: f64) -> f64 {
    if weight.is_finite() && weight > 0.0 {
        weight
    } else {
        0.0
    }
}

fn tx_time(len: usize, weight: f64) -> Duration {
    if weight <= 0.0 {
        return ZERO_WEIGHT_TX_TIME;
    }
    Duration::try_from_secs_f64(len as f64 / weight)
        .unwrap_or(ZERO_WEIGHT_TX_TIME)
        .max(MIN_TX_TIME)
}

// ── Tests ────────────────────────────────────────────────────────
