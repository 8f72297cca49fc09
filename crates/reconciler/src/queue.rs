//! Deduplicating, rate-limited work queue.
//!
//! Semantics follow the Kubernetes controller work queue:
//!
//! - A key is pending at most once; adding it again while pending is a no-op.
//! - A key handed out by [`WorkQueue::get`] is "processing" until
//!   [`WorkQueue::done`]. Adds that arrive meanwhile mark it dirty and it is
//!   re-queued on `done`, so no two workers ever hold the same key.
//! - After [`WorkQueue::shut_down`], adds are ignored and `get` keeps handing
//!   out what is already queued before returning `None`.
//! - After [`WorkQueue::shut_down_with_drain`], adds are ignored too, but
//!   delayed retries still land and `get` returns `None` only once none are
//!   pending.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ItemBackoff<K> {
    base: Duration,
    max: Duration,
    failures: HashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> ItemBackoff<K> {
    /// Create a backoff with the given bounds.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying it.
    pub fn when(&mut self, key: &K) -> Duration {
        let failures = self.failures.entry(key.clone()).or_insert(0);
        let exponent = *failures;
        *failures = failures.saturating_add(1);

        2u32.checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Number of failures recorded for `key` since it was last forgotten.
    pub fn failures(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    /// Reset the failure count for `key`.
    pub fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }
}

#[derive(Debug)]
struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
    draining: bool,
    delayed: usize,
}

impl<K: Eq + Hash + Clone> QueueState<K> {
    /// Mark `key` dirty; returns whether it became available to `get`.
    fn push(&mut self, key: K) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    const fn accepts_retries(&self) -> bool {
        !self.shutting_down || self.draining
    }

    const fn exhausted(&self) -> bool {
        self.shutting_down && (!self.draining || self.delayed == 0)
    }
}

#[derive(Debug)]
struct Shared<K> {
    state: Mutex<QueueState<K>>,
    backoff: Mutex<ItemBackoff<K>>,
    notify: Notify,
}

/// Work queue handle. Clones share the same queue.
#[derive(Debug)]
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create a queue whose rate-limited adds back off between `base` and `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                    draining: false,
                    delayed: 0,
                }),
                backoff: Mutex::new(ItemBackoff::new(base, max)),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue a key. Never blocks.
    pub fn add(&self, key: K) {
        let mut state = self.shared.state.lock();
        if state.shutting_down || !state.push(key) {
            return;
        }
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue is shut down and empty, and, when
    /// draining, no delayed retry is still pending.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.exhausted() {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a key as no longer being processed.
    pub fn done(&self, key: &K) {
        let mut state = self.shared.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Enqueue a key after `delay`.
    ///
    /// Returns `false` when the queue is shut down without draining and the
    /// key was discarded. Must be called from within a tokio runtime when
    /// `delay` is non-zero.
    pub fn add_after(&self, key: K, delay: Duration) -> bool {
        let mut state = self.shared.state.lock();
        if !state.accepts_retries() {
            return false;
        }
        if delay.is_zero() {
            let pushed = state.push(key);
            drop(state);
            if pushed {
                self.shared.notify.notify_one();
            }
            return true;
        }
        state.delayed = state.delayed.saturating_add(1);
        drop(state);

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.land_delayed(key);
        });
        true
    }

    fn land_delayed(&self, key: K) {
        let mut state = self.shared.state.lock();
        state.delayed = state.delayed.saturating_sub(1);
        let pushed = state.accepts_retries() && state.push(key);
        let exhausted = state.exhausted();
        drop(state);

        if pushed {
            self.shared.notify.notify_one();
        }
        if exhausted {
            self.shared.notify.notify_waiters();
        }
    }

    /// Enqueue a key after its backoff delay, recording one more failure.
    ///
    /// Returns `false` when the key was discarded because the queue stopped.
    pub fn add_rate_limited(&self, key: K) -> bool {
        let delay = self.shared.backoff.lock().when(&key);
        trace!(delay_ms = delay.as_millis(), "Rate-limited requeue");
        self.add_after(key, delay)
    }

    /// Clear the failure history of a key.
    pub fn forget(&self, key: &K) {
        self.shared.backoff.lock().forget(key);
    }

    /// Number of rate-limited requeues since the key was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.shared.backoff.lock().failures(key)
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Whether no keys are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys, discard pending retries, and wake every waiting `get`.
    pub fn shut_down(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutting_down = true;
            state.draining = false;
        }
        self.shared.notify.notify_waiters();
    }

    /// Stop accepting new keys but keep delayed retries alive until they land.
    ///
    /// Has no effect on a queue already shut down without draining.
    pub fn shut_down_with_drain(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.shutting_down {
                state.shutting_down = true;
                state.draining = true;
            }
        }
        self.shared.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }
}
