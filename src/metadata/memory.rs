//! In-memory metadata store for tests and ephemeral runs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::{MetadataError, MetadataStore, Visitor, validate_key};

/// Mutex-guarded map implementing [`MetadataStore`].
///
/// Clones share the same underlying map, which lets tests hand one copy to
/// the controller and inspect the other.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored keys in order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl MetadataStore for MemoryStore {
    fn create(&self, key: &str, value: &[u8]) -> Result<(), MetadataError> {
        validate_key(key)?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, MetadataError> {
        validate_key(key)?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| MetadataError::NotFound {
                key: key.to_owned(),
            })
    }

    fn delete(&self, key: &str) -> Result<(), MetadataError> {
        validate_key(key)?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    fn for_all(&self, prefix: &str, visit: &mut Visitor<'_>) -> Result<(), MetadataError> {
        let matched: Vec<(String, Vec<u8>)> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for (key, value) in &matched {
            visit(key, value)?;
        }
        Ok(())
    }
}
