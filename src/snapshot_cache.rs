//! Snapshot records indexed in memory and persisted in a metadata store.
//!
//! The store is the source of truth across restarts; the in-memory map is a
//! read-through cache rebuilt by [`SnapshotCache::load`]. Writes update the
//! map first and the store afterwards, outside the lock. A crash between the
//! two leaves the map ahead of the store, which the next full reload repairs.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::metadata::{MetadataError, MetadataStore};

const KEY_PREFIX: &str = "snapshot-";

/// Snapshot state remembered between requests.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SnapshotRecord {
    /// Remote snapshot identifier.
    pub id: String,
    /// Caller supplied name; the idempotency key for creation.
    pub name: String,
    /// Volume the snapshot was taken from.
    pub source_volume_id: String,
    /// Size in bytes as last reported.
    pub size_bytes: u64,
    /// Creation timestamp as reported by the provider.
    #[serde(default)]
    pub created_at: Option<String>,
    /// Whether the snapshot was last seen ready to use.
    pub ready_to_use: bool,
}

fn store_key(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}

/// Mutex-guarded snapshot index backed by a [`MetadataStore`].
#[derive(Debug)]
pub struct SnapshotCache<S> {
    entries: Mutex<HashMap<String, SnapshotRecord>>,
    store: S,
}

impl<S: MetadataStore> SnapshotCache<S> {
    /// Creates an empty cache over `store`. Call [`Self::load`] to replay it.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Replays every persisted record into memory and returns the count.
    ///
    /// Undecodable documents are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError`] when the store cannot be enumerated.
    pub fn load(&self) -> Result<usize, MetadataError> {
        let mut loaded = Vec::new();
        self.store.for_all(KEY_PREFIX, &mut |key, value| {
            match serde_json::from_slice::<SnapshotRecord>(value) {
                Ok(record) => loaded.push(record),
                Err(err) => warn!(key, error = %err, "skipping unreadable snapshot record"),
            }
            Ok(())
        })?;

        let count = loaded.len();
        let mut entries = self.lock();
        for record in loaded {
            entries.insert(record.id.clone(), record);
        }
        drop(entries);
        info!(count, "snapshot records restored");
        Ok(count)
    }

    /// Finds a record by its name.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<SnapshotRecord> {
        self.lock()
            .values()
            .find(|record| record.name == name)
            .cloned()
    }

    /// Looks a record up by id, falling back to the durable store.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError`] when the store read fails or the stored
    /// document is malformed.
    pub fn get(&self, id: &str) -> Result<Option<SnapshotRecord>, MetadataError> {
        if let Some(record) = self.lock().get(id).cloned() {
            return Ok(Some(record));
        }

        let key = store_key(id);
        let bytes = match self.store.get(&key) {
            Ok(bytes) => bytes,
            Err(MetadataError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };
        let record: SnapshotRecord =
            serde_json::from_slice(&bytes).map_err(|err| MetadataError::Codec {
                key,
                message: err.to_string(),
            })?;
        self.lock().insert(record.id.clone(), record.clone());
        Ok(Some(record))
    }

    /// Records `record` in memory and persists it.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError`] when persistence fails; the in-memory entry
    /// is kept in that case.
    pub fn put(&self, record: &SnapshotRecord) -> Result<(), MetadataError> {
        self.lock().insert(record.id.clone(), record.clone());

        let key = store_key(&record.id);
        let bytes = serde_json::to_vec(record).map_err(|err| MetadataError::Codec {
            key: key.clone(),
            message: err.to_string(),
        })?;
        self.store.create(&key, &bytes)?;
        debug!(snapshot_id = %record.id, ready = record.ready_to_use, "snapshot record persisted");
        Ok(())
    }

    /// Removes the record from memory and from the store.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError`] when the store deletion fails.
    pub fn remove(&self, id: &str) -> Result<(), MetadataError> {
        self.lock().remove(id);
        self.store.delete(&store_key(id))
    }

    /// Number of records held in memory.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` when no records are held in memory.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SnapshotRecord>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
