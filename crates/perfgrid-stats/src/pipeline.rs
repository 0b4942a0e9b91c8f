//! Persistence pipeline — background write and read loops.
//!
//! Both loops sit between the in-memory profiles and a [`ProfileStore`], so
//! request-serving code never waits on storage I/O.
//!
//! # Write path
//!
//! [`WriteBehind`] owns a [`DedupQueue`] of `(key, record)` snapshots and a
//! dedicated task that drains it. A snapshot enqueued for a key that is still
//! pending replaces the older one, so the store only ever receives the latest
//! value for a key. The task takes one item with a bounded wait, drains up to
//! `batch_size` more ready items, and applies the batch in one
//! [`ProfileStore::put_profiles`] call. A failed batch is requeued (without
//! overwriting anything newer) and retried after a fixed backoff.
//!
//! # Read path
//!
//! [`Hydrator`] owns a queue of keys to load. For each key it fetches the
//! record and hands it to a [`ProfileSink`]. Fetch failures are requeued and
//! retried indefinitely; they are never surfaced to callers.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use perfgrid_state::{ProfileRecord, ProfileStore};

use crate::config::PipelineConfig;
use crate::queue::DedupQueue;

type WriteQueue = DedupQueue<String, ProfileRecord>;
type LoadQueue = DedupQueue<String, ()>;

/// Handle to the background write loop.
///
/// Dropping the handle requests shutdown; the task still drains whatever is
/// pending before it exits. Call [`WriteBehind::stop`] to wait for that.
pub struct WriteBehind {
    queue: Arc<WriteQueue>,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl WriteBehind {
    /// Spawn the write loop on the current tokio runtime.
    pub fn spawn(store: Arc<dyn ProfileStore>, config: PipelineConfig) -> Self {
        let queue = Arc::new(WriteQueue::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task_queue = queue.clone();
        let handle = tokio::spawn(async move {
            run_write_loop(task_queue, store, config, shutdown_rx).await;
        });

        Self {
            queue,
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Queue a snapshot for persistence, replacing any pending one for `key`.
    pub fn enqueue(&self, key: &str, record: ProfileRecord) {
        if !self.queue.put(key.to_string(), record) {
            trace!(%key, "pending profile write superseded");
        }
    }

    /// Number of keys waiting to be written.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Wait until every snapshot enqueued so far has reached the store.
    pub async fn flush(&self) {
        self.queue.join().await;
    }

    /// Request shutdown and wait for the loop to drain and exit.
    ///
    /// On return the queue is empty and the store holds every snapshot that
    /// was enqueued before the call. Calling it twice is harmless.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.queue.wake();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "profile write loop panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for WriteBehind {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.queue.wake();
    }
}

async fn run_write_loop(
    queue: Arc<WriteQueue>,
    store: Arc<dyn ProfileStore>,
    config: PipelineConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(batch_size = config.batch_size, "profile write loop starting");

    loop {
        // A dropped sender counts as a shutdown request.
        let stopping = *shutdown.borrow() || shutdown.has_changed().is_err();
        if stopping && queue.is_empty() {
            break;
        }

        let first = tokio::select! {
            item = queue.get(config.poll_timeout()) => item,
            _ = shutdown.changed(), if !stopping => continue,
        };
        let Some(first) = first else {
            continue;
        };

        let mut batch = vec![first];
        while batch.len() <= config.batch_size {
            match queue.try_get() {
                Some(item) => batch.push(item),
                None => break,
            }
        }

        let taken = batch.len();
        let failed = match store.put_profiles(&batch) {
            Ok(()) => {
                debug!(count = taken, "profile batch persisted");
                false
            }
            Err(e) => {
                error!(error = %e, count = taken, "failed to persist profiles, will retry");
                for (key, record) in batch {
                    queue.put_if_absent(key, record);
                }
                true
            }
        };
        for _ in 0..taken {
            queue.task_done();
        }
        if failed {
            tokio::time::sleep(config.retry_backoff()).await;
        }
    }

    info!("profile write loop stopped");
}

/// Receives records fetched by the [`Hydrator`].
pub trait ProfileSink: Send + Sync + 'static {
    /// Deliver the stored record for `key`, `None` when it was never persisted.
    fn hydrate(&self, key: &str, record: Option<ProfileRecord>);
}

/// Handle to the background read loop.
///
/// The loop runs until the handle is dropped.
pub struct Hydrator {
    queue: Arc<LoadQueue>,
    handle: JoinHandle<()>,
}

impl Hydrator {
    /// Spawn the read loop on the current tokio runtime.
    pub fn spawn(
        store: Arc<dyn ProfileStore>,
        sink: Arc<dyn ProfileSink>,
        config: PipelineConfig,
    ) -> Self {
        let queue = Arc::new(LoadQueue::new());
        let task_queue = queue.clone();
        let handle = tokio::spawn(async move {
            run_read_loop(task_queue, store, sink, config).await;
        });
        Self { queue, handle }
    }

    /// Schedule a load of `key`. Duplicate requests collapse into one.
    pub fn schedule(&self, key: &str) {
        if self.queue.put(key.to_string(), ()) {
            trace!(%key, "profile load scheduled");
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Wait until every scheduled load has been delivered to the sink.
    pub async fn wait_idle(&self) {
        self.queue.join().await;
    }
}

impl Drop for Hydrator {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run_read_loop(
    queue: Arc<LoadQueue>,
    store: Arc<dyn ProfileStore>,
    sink: Arc<dyn ProfileSink>,
    config: PipelineConfig,
) {
    debug!("profile read loop starting");

    loop {
        let Some((key, ())) = queue.get(config.poll_timeout()).await else {
            continue;
        };

        match store.get_profile(&key) {
            Ok(record) => {
                debug!(%key, found = record.is_some(), "profile fetched");
                sink.hydrate(&key, record);
                queue.task_done();
            }
            Err(e) => {
                error!(%key, error = %e, "failed to load profile, will retry");
                queue.put_if_absent(key, ());
                queue.task_done();
                tokio::time::sleep(config.retry_backoff()).await;
            }
        }
    }
}
