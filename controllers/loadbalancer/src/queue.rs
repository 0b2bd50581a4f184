//! Deduplicating, rate-limited work queue.
//!
//! Producers (the watchers) call [`WorkQueue::add`] concurrently; a single
//! consumer takes one item at a time with [`WorkQueue::get`] and hands it
//! back with [`WorkQueue::done`]. An item is never handed out twice at
//! once: if its key is re-added while it is being processed, it is parked
//! and queued again when `done` is called. A pending item re-added before it
//! is taken keeps its queue position but carries the newer payload.

use crate::backoff::BackoffState;
use crate::resource::{WorkItem, WorkKey};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<WorkKey>,
    /// Latest payload per key waiting to be processed
    pending: HashMap<WorkKey, WorkItem>,
    processing: HashSet<WorkKey>,
    failures: HashMap<WorkKey, BackoffState>,
    shutting_down: bool,
}

/// Queue of pending work items shared by the watchers and the worker
#[derive(Debug, Default)]
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl WorkQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue an item; ignored after shutdown
    pub fn add(&self, item: WorkItem) {
        let key = item.key();
        let mut inner = self.lock();
        if inner.shutting_down {
            return;
        }

        if key.delete {
            // A pending update for an object that is now gone is obsolete
            let update = WorkKey { delete: false, ..key.clone() };
            if !inner.processing.contains(&update) && inner.pending.remove(&update).is_some() {
                inner.queue.retain(|k| k != &update);
            }
        }

        let already_pending = inner.pending.insert(key.clone(), item).is_some();
        if already_pending || inner.processing.contains(&key) {
            return;
        }
        inner.queue.push_back(key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Wait for the next item; `None` once shut down and drained
    pub async fn get(&self) -> Option<WorkItem> {
        loop {
            {
                let mut inner = self.lock();
                while let Some(key) = inner.queue.pop_front() {
                    if let Some(item) = inner.pending.remove(&key) {
                        inner.processing.insert(key);
                        return Some(item);
                    }
                }
                if inner.shutting_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark an item as processed; re-queues it if it was re-added meanwhile
    pub fn done(&self, key: &WorkKey) {
        let mut inner = self.lock();
        inner.processing.remove(key);
        if inner.pending.contains_key(key) {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Re-enqueue after a per-item exponential delay
    pub fn add_rate_limited(self: &Arc<Self>, item: WorkItem) {
        let key = item.key();
        let delay = {
            let mut inner = self.lock();
            if inner.shutting_down {
                return;
            }
            inner.failures.entry(key.clone()).or_default().next_delay()
        };
        debug!(key = %key, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "Requeueing with backoff");
        self.add_after(item, delay);
    }

    /// Re-enqueue after a fixed delay without touching the failure history
    pub fn add_after(self: &Arc<Self>, item: WorkItem, delay: Duration) {
        if self.lock().shutting_down {
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Clear the failure history of an item
    pub fn forget(&self, key: &WorkKey) {
        self.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for an item
    pub fn num_requeues(&self, key: &WorkKey) -> u32 {
        self.lock().failures.get(key).map_or(0, |s| s.error_count())
    }

    /// Number of items waiting to be processed
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// True when nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting items; `get` returns `None` once the backlog is drained
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}
