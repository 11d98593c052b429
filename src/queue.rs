//! De-duplicating, rate-limited work queue.
//!
//! The queue is the delivery mechanism between resource-change notifications
//! and the worker loop. It guarantees that a key is never held by two
//! workers at once: an `add` for a key that is already queued or currently
//! being processed coalesces into a single pending entry, and a key that was
//! re-added mid-processing is only handed out again after the in-flight pass
//! releases it with [`WorkQueue::done`].
//!
//! Keys that fail reconciliation are re-enqueued through
//! [`WorkQueue::add_rate_limited`], which delays redelivery on a per-key
//! capped exponential schedule; [`WorkQueue::forget`] resets that schedule
//! after a successful pass.
//!
//! The queue carries only key identities, never payloads. Each pass re-reads
//! the resource, so work is never done against a snapshot that went stale
//! while the key sat in the queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::retry::BackoffPolicy;

struct Inner<K> {
    /// Delivery order of keys ready to be handed to a worker
    queue: VecDeque<K>,
    /// Keys queued or awaiting re-queue after their in-flight pass releases
    dirty: HashSet<K>,
    /// Keys currently held by a worker
    processing: HashSet<K>,
    /// Consecutive failure count per key, for backoff
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

/// A de-duplicating FIFO of keys with per-key retry backoff.
///
/// All state is internally synchronized; the queue is shared across workers
/// and the notification source behind an [`Arc`].
pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
    backoff: BackoffPolicy,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create a queue with the given retry backoff policy
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff,
        }
    }

    fn locked(&self) -> MutexGuard<'_, Inner<K>> {
        // a panicked holder cannot leave the sets half-updated in a way that
        // matters more than continuing, so poison is ignored
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a key.
    ///
    /// Duplicate adds for a key already queued, or re-adds while the key is
    /// being processed, coalesce into a single pending entry. Adds after
    /// shutdown are dropped.
    pub fn add(&self, key: K) {
        let mut inner = self.locked();
        if inner.shutting_down || inner.dirty.contains(&key) {
            return;
        }
        inner.dirty.insert(key.clone());
        if !inner.processing.contains(&key) {
            inner.queue.push_back(key);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Wait for the next key.
    ///
    /// Blocks until a key is available and returns it marked in-flight, or
    /// returns `None` once the queue is shutting down and drained. Every
    /// returned key must be released with [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register interest before checking state so a notify between
            // the check and the await is not lost
            notified.as_mut().enable();

            {
                let mut inner = self.locked();
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    let more = !inner.queue.is_empty();
                    drop(inner);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release a key after processing, success or failure.
    ///
    /// If the key was re-added while in flight, it becomes deliverable
    /// again. Skipping this call leaves the key permanently in-flight, so
    /// the worker loop calls it on every exit path.
    pub fn done(&self, key: &K) {
        let mut inner = self.locked();
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutting_down {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Clear retry bookkeeping for a key after a successful (or terminally
    /// failed) pass, resetting its backoff to the base delay.
    pub fn forget(&self, key: &K) {
        self.locked().failures.remove(key);
    }

    /// Re-enqueue a failed key after its per-key backoff delay.
    ///
    /// Takes an owned handle because the delayed add outlives the caller;
    /// callers holding an `Arc` clone it: `queue.clone().add_rate_limited(k)`.
    pub fn add_rate_limited(self: Arc<Self>, key: K) {
        let delay = {
            let mut inner = self.locked();
            if inner.shutting_down {
                return;
            }
            let failures = inner.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            self.backoff.delay_for(*failures)
        };

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.add(key);
        });
    }

    /// Consecutive failures recorded for a key
    pub fn num_failures(&self, key: &K) -> u32 {
        self.locked().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting for delivery (excludes in-flight keys)
    pub fn len(&self) -> usize {
        self.locked().queue.len()
    }

    /// True if no keys are waiting for delivery
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Begin shutdown: drop future adds, wake all blocked getters.
    ///
    /// Keys already queued are still delivered so in-flight work drains;
    /// once the queue is empty, every `get` returns `None`.
    pub fn shut_down(&self) {
        let mut inner = self.locked();
        inner.shutting_down = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// True once shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        self.locked().shutting_down
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}
