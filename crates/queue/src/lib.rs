//! ekspose dispatch queue.
//!
//! Per key the queue tracks one of: absent, queued, processing, or
//! processing+dirty. A key is handed to at most one worker at a time; enqueues
//! that arrive while it is checked out collapse into a single redelivery once
//! the worker calls [`DispatchQueue::done`]. Failed keys are re-added through a
//! per-key exponential backoff with a hard attempt cap, and their redelivery
//! additionally draws from one token bucket shared by every key.
//!
//! All transitions happen under one mutex; waiting workers park on a
//! [`tokio::sync::Notify`] and never hold the lock across an await.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroU32;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ekspose_core::{ControllerConfig, LogicalKey};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

mod backoff;

pub use backoff::ExponentialBackoff;

/// Observable state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Absent,
    /// Withheld until its delay elapses.
    Waiting,
    Queued,
    Processing,
    ProcessingDirty,
}

/// What happened to a key after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    /// Attempt cap reached; the key was dropped and its counter cleared.
    GiveUp(u32),
}

struct Delayed<K> {
    at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Delayed<K> {
    fn eq(&self, other: &Self) -> bool { self.at == other.at && self.seq == other.seq }
}
impl<K> Eq for Delayed<K> {}
impl<K> PartialOrd for Delayed<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl<K> Ord for Delayed<K> {
    // Reversed: BinaryHeap is a max-heap and we want the earliest deadline on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<K> {
    order: VecDeque<K>,
    queued: FxHashSet<K>,
    processing: FxHashSet<K>,
    dirty: FxHashSet<K>,
    /// Earliest pending deadline per key; heap entries not matching it are stale.
    waiting: FxHashMap<K, Instant>,
    heap: BinaryHeap<Delayed<K>>,
    failures: FxHashMap<K, u32>,
    /// Waiting keys scheduled by a failed attempt; their delivery needs a bucket token.
    limited: FxHashSet<K>,
    seq: u64,
    shutting_down: bool,
}

impl<K: Clone + Eq + Hash> State<K> {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            queued: FxHashSet::default(),
            processing: FxHashSet::default(),
            dirty: FxHashSet::default(),
            waiting: FxHashMap::default(),
            heap: BinaryHeap::new(),
            failures: FxHashMap::default(),
            limited: FxHashSet::default(),
            seq: 0,
            shutting_down: false,
        }
    }

    /// Returns true when the key became deliverable.
    fn add(&mut self, key: K) -> bool {
        if self.processing.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        if !self.queued.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        true
    }

    fn push_delayed(&mut self, key: K, at: Instant) {
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        self.waiting.insert(key.clone(), at);
        self.heap.push(Delayed { at, seq, key });
    }

    /// Move due keys to the ready list. Retries the bucket refuses are pushed
    /// back to the moment a token frees up. Returns how many were held back.
    fn promote_due(&mut self, now: Instant, bucket: Option<&DefaultDirectRateLimiter>) -> usize {
        let mut throttled = 0;
        while self.heap.peek().map_or(false, |d| d.at <= now) {
            let Some(d) = self.heap.pop() else { break };
            if self.waiting.get(&d.key) != Some(&d.at) {
                continue;
            }
            if self.limited.contains(&d.key) {
                if let Some(Err(not_until)) = bucket.map(|b| b.check()) {
                    let wait = not_until.wait_time_from(DefaultClock::default().now()).max(Duration::from_millis(1));
                    self.push_delayed(d.key, now + wait);
                    throttled += 1;
                    continue;
                }
                self.limited.remove(&d.key);
            }
            self.waiting.remove(&d.key);
            self.add(d.key);
        }
        throttled
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|d| d.at)
    }
}

/// Deduplicating, coalescing, rate-limited work queue shared by all workers.
pub struct DispatchQueue<K = LogicalKey> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: ExponentialBackoff,
    max_attempts: u32,
    bucket: Option<DefaultDirectRateLimiter>,
}

impl DispatchQueue<LogicalKey> {
    pub fn from_config(name: impl Into<String>, cfg: &ControllerConfig) -> Self {
        Self::new(name, ExponentialBackoff::new(cfg.base_delay, cfg.max_delay), cfg.max_attempts)
            .with_retry_budget(cfg.retry_qps, cfg.retry_burst)
    }
}

impl<K> DispatchQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send,
{
    pub fn new(name: impl Into<String>, backoff: ExponentialBackoff, max_attempts: u32) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::new()),
            notify: Notify::new(),
            backoff,
            max_attempts: max_attempts.max(1),
            bucket: None,
        }
    }

    /// Cap the rate at which failed keys are redelivered, across all keys, at
    /// `qps` per second with bursts of `burst`. A `qps` of 0 leaves it uncapped.
    pub fn with_retry_budget(mut self, qps: u32, burst: u32) -> Self {
        self.bucket = NonZeroU32::new(qps).map(|qps| {
            let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
            RateLimiter::direct(Quota::per_second(qps).allow_burst(burst))
        });
        self
    }

    pub fn name(&self) -> &str { &self.name }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        // Transitions never panic midway, so a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// absent -> queued, processing -> processing+dirty; otherwise a no-op.
    pub fn enqueue(&self, key: K) {
        let delivered = {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            let delivered = st.add(key);
            gauge!("queue_depth", st.order.len() as f64, "queue" => self.name.clone());
            delivered
        };
        counter!("queue_adds", 1u64, "queue" => self.name.clone());
        if delivered {
            self.notify.notify_one();
        }
    }

    /// Same transition as [`enqueue`](Self::enqueue), withheld until `delay` elapses.
    /// A key already waiting keeps the earlier of the two deadlines.
    pub fn enqueue_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.enqueue(key);
        }
        self.schedule(key, delay, false);
    }

    fn schedule(&self, key: K, delay: Duration, limited: bool) {
        let at = Instant::now() + delay;
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            if limited && self.bucket.is_some() {
                st.limited.insert(key.clone());
            }
            if st.waiting.get(&key).map_or(false, |cur| *cur <= at) {
                return;
            }
            st.push_delayed(key, at);
        }
        // Sleeping workers recompute their wake-up deadline.
        self.notify.notify_waiters();
    }

    /// Block until a key is deliverable and check it out, or return `None` once shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                let throttled = st.promote_due(Instant::now(), self.bucket.as_ref());
                if throttled > 0 {
                    counter!("queue_throttled", throttled as u64, "queue" => self.name.clone());
                }
                if let Some(key) = st.order.pop_front() {
                    st.queued.remove(&key);
                    st.processing.insert(key.clone());
                    gauge!("queue_depth", st.order.len() as f64, "queue" => self.name.clone());
                    if !st.order.is_empty() {
                        // Pass the baton so another idle worker picks up the rest.
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                st.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// processing -> absent, processing+dirty -> queued. Must be called once per `get`.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut st = self.lock();
            if !st.processing.remove(key) {
                warn!(queue = %self.name, key = ?key, "done called for a key that is not processing");
                return;
            }
            if st.dirty.remove(key) && !st.shutting_down {
                debug!(queue = %self.name, key = ?key, "coalesced redelivery");
                st.add(key.clone())
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Clear the failure counter for `key`.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Record a failed attempt and either schedule a delayed retry or drop the key.
    /// The returned delay is a lower bound: redelivery also waits for a retry-budget token.
    pub fn requeue_rate_limited(&self, key: K) -> RetryDecision {
        let decision = {
            let mut st = self.lock();
            let failures = st.failures.entry(key.clone()).or_insert(0);
            *failures = failures.saturating_add(1);
            let attempts = *failures;
            if attempts >= self.max_attempts {
                st.failures.remove(&key);
                RetryDecision::GiveUp(attempts)
            } else {
                RetryDecision::Retry(self.backoff.delay(attempts - 1))
            }
        };
        match decision {
            RetryDecision::Retry(delay) => {
                counter!("queue_retries", 1u64, "queue" => self.name.clone());
                self.schedule(key, delay, true);
            }
            RetryDecision::GiveUp(attempts) => {
                counter!("queue_dropped", 1u64, "queue" => self.name.clone());
                warn!(queue = %self.name, key = ?key, attempts, "dropping key after max attempts");
            }
        }
        decision
    }

    /// Stop delivering: every pending and future `get` returns `None`.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Keys ready for delivery.
    pub fn len(&self) -> usize { self.lock().order.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Keys withheld behind a delay.
    pub fn delayed_len(&self) -> usize { self.lock().waiting.len() }

    pub fn state(&self, key: &K) -> KeyState {
        let st = self.lock();
        if st.processing.contains(key) {
            if st.dirty.contains(key) { KeyState::ProcessingDirty } else { KeyState::Processing }
        } else if st.queued.contains(key) {
            KeyState::Queued
        } else if st.waiting.contains_key(key) {
            KeyState::Waiting
        } else {
            KeyState::Absent
        }
    }

    /// Check out a key wrapped in a [`Lease`] that calls `done` when dropped.
    pub async fn lease(&self) -> Option<Lease<'_, K>> {
        let key = self.get().await?;
        Some(Lease { queue: self, key, released: false })
    }
}

/// A checked-out key. Releases it with `done` exactly once, on [`Lease::finish`] or drop.
pub struct Lease<'a, K>
where
    K: Clone + Eq + Hash + Debug + Send,
{
    queue: &'a DispatchQueue<K>,
    key: K,
    released: bool,
}

impl<'a, K> Lease<'a, K>
where
    K: Clone + Eq + Hash + Debug + Send,
{
    pub fn key(&self) -> &K { &self.key }

    /// Call `done` now and hand back the key for follow-up calls such as retries.
    pub fn finish(mut self) -> K {
        self.released = true;
        self.queue.done(&self.key);
        self.key.clone()
    }
}

impl<'a, K> Drop for Lease<'a, K>
where
    K: Clone + Eq + Hash + Debug + Send,
{
    fn drop(&mut self) {
        if !self.released {
            self.queue.done(&self.key);
        }
    }
}
