//! Backing-store contract and its redb implementation.
//!
//! The persistence pipeline only needs `get` and `put` by key. Stores that
//! support transactions can also override [`ProfileStore::put_profiles`] so a
//! whole batch of writes lands atomically; the default implementation simply
//! writes the records one by one.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTableMetadata};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::PROFILES;
use crate::types::ProfileRecord;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Key-value store holding one [`ProfileRecord`] per worker key.
///
/// Any call may fail transiently. Callers are expected to retry.
pub trait ProfileStore: Send + Sync + 'static {
    /// Fetch the record for `key`, `None` if it was never persisted.
    fn get_profile(&self, key: &str) -> StateResult<Option<ProfileRecord>>;

    /// Insert or replace the record for `key`.
    fn put_profile(&self, key: &str, record: &ProfileRecord) -> StateResult<()>;

    /// Apply a batch of writes inside one transactional scope.
    ///
    /// Stores without transactions fall back to sequential puts.
    fn put_profiles(&self, batch: &[(String, ProfileRecord)]) -> StateResult<()> {
        for (key, record) in batch {
            self.put_profile(key, record)?;
        }
        Ok(())
    }
}

impl<S: ProfileStore + ?Sized> ProfileStore for Arc<S> {
    fn get_profile(&self, key: &str) -> StateResult<Option<ProfileRecord>> {
        (**self).get_profile(key)
    }

    fn put_profile(&self, key: &str, record: &ProfileRecord) -> StateResult<()> {
        (**self).put_profile(key, record)
    }

    fn put_profiles(&self, batch: &[(String, ProfileRecord)]) -> StateResult<()> {
        (**self).put_profiles(batch)
    }
}

/// Thread-safe profile store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "profile store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory profile store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(PROFILES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Number of persisted profiles.
    pub fn len(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROFILES).map_err(map_err!(Table))?;
        table.len().map_err(map_err!(Read))
    }

    /// True when no profile has been persisted yet.
    pub fn is_empty(&self) -> StateResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl ProfileStore for StateStore {
    fn get_profile(&self, key: &str) -> StateResult<Option<ProfileRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROFILES).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: ProfileRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn put_profile(&self, key: &str, record: &ProfileRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PROFILES).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, samples = record.sample_count, "profile stored");
        Ok(())
    }

    fn put_profiles(&self, batch: &[(String, ProfileRecord)]) -> StateResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PROFILES).map_err(map_err!(Table))?;
            for (key, record) in batch {
                let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = batch.len(), "profile batch stored");
        Ok(())
    }
}
