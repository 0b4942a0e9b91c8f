//! Deduplicating work queue.
//!
//! Items are keyed. Putting an item whose key is already pending replaces the
//! pending value in place instead of appending, so a consumer only ever sees
//! the latest value for a key, in the order keys were first enqueued.
//!
//! The queue is shared between synchronous producers and one async consumer:
//! `put` never blocks beyond a short mutex hold, and `get` waits on a
//! [`Notify`] with a timeout instead of polling.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

struct Inner<K, V> {
    pending: HashMap<K, V>,
    order: VecDeque<K>,
    /// Keys handed out by `get` and not yet acknowledged with `task_done`.
    in_flight: usize,
}

pub struct DedupQueue<K, V> {
    inner: Mutex<Inner<K, V>>,
    ready: Notify,
    idle: Notify,
}

impl<K, V> Default for DedupQueue<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> DedupQueue<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                order: VecDeque::new(),
                in_flight: 0,
            }),
            ready: Notify::new(),
            idle: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `value` under `key`, replacing any pending value for it.
    ///
    /// Returns `true` when the key was not pending before.
    pub fn put(&self, key: K, value: V) -> bool {
        let fresh = {
            let mut inner = self.lock();
            let fresh = inner.pending.insert(key.clone(), value).is_none();
            if fresh {
                inner.order.push_back(key);
            }
            fresh
        };
        self.ready.notify_one();
        fresh
    }

    /// Enqueue `value` only if nothing is pending for `key`.
    ///
    /// Used to retry a failed item without overwriting a newer value that was
    /// enqueued while the item was being processed.
    pub fn put_if_absent(&self, key: K, value: V) -> bool {
        let fresh = {
            let mut inner = self.lock();
            if inner.pending.contains_key(&key) {
                false
            } else {
                inner.pending.insert(key.clone(), value);
                inner.order.push_back(key);
                true
            }
        };
        if fresh {
            self.ready.notify_one();
        }
        fresh
    }

    /// Take the oldest pending item without waiting.
    pub fn try_get(&self) -> Option<(K, V)> {
        let mut inner = self.lock();
        let key = inner.order.pop_front()?;
        let value = inner.pending.remove(&key)?;
        inner.in_flight += 1;
        Some((key, value))
    }

    /// Take the oldest pending item, waiting up to `timeout` for one.
    ///
    /// Returns `None` when the timeout elapses with the queue still empty.
    pub async fn get(&self, timeout: Duration) -> Option<(K, V)> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.try_get() {
                return Some(item);
            }
            // `notify_one` leaves a permit when nobody waits, so a put racing
            // with the check above still wakes us.
            if tokio::time::timeout_at(deadline, self.ready.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    /// Acknowledge an item obtained from `get`/`try_get`.
    pub fn task_done(&self) {
        let idle = {
            let mut inner = self.lock();
            inner.in_flight = inner.in_flight.saturating_sub(1);
            inner.in_flight == 0 && inner.order.is_empty()
        };
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Wait until nothing is pending and every taken item was acknowledged.
    pub async fn join(&self) {
        loop {
            let notified = self.idle.notified();
            {
                let inner = self.lock();
                if inner.order.is_empty() && inner.in_flight == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Wake a consumer blocked in `get` without enqueuing anything.
    pub fn wake(&self) {
        self.ready.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().order.is_empty()
    }
}
