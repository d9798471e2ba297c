//! Durable key/value storage for controller metadata.
//!
//! Values are opaque JSON documents; callers own their serialisation. Keys
//! are restricted to a filesystem-safe alphabet so every backend can use them
//! verbatim.

use thiserror::Error;

mod file_store;
mod memory;

pub use file_store::FileStore;
pub use memory::MemoryStore;

/// Errors raised by metadata stores.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MetadataError {
    /// Raised when the requested key does not exist.
    #[error("metadata key {key} not found")]
    NotFound {
        /// Key that was looked up.
        key: String,
    },
    /// Raised when a key contains characters outside the allowed set.
    #[error("invalid metadata key {key:?}")]
    InvalidKey {
        /// Offending key.
        key: String,
    },
    /// Raised when the backing storage cannot be accessed.
    #[error("metadata storage failure for {key}: {message}")]
    Io {
        /// Key (or prefix) being accessed.
        key: String,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a stored document cannot be (de)serialised.
    #[error("metadata document {key} is malformed: {message}")]
    Codec {
        /// Key of the document.
        key: String,
        /// Decoder message.
        message: String,
    },
}

/// Visitor invoked for every entry matched by [`MetadataStore::for_all`].
pub type Visitor<'a> = dyn FnMut(&str, &[u8]) -> Result<(), MetadataError> + 'a;

/// Keyed persistence used as the source of truth across restarts.
pub trait MetadataStore: Send + Sync {
    /// Stores `value` under `key`, replacing any previous document.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError`] when the key is invalid or the write fails.
    fn create(&self, key: &str, value: &[u8]) -> Result<(), MetadataError>;

    /// Loads the document stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::NotFound`] when no document exists.
    fn get(&self, key: &str) -> Result<Vec<u8>, MetadataError>;

    /// Removes `key`. Removing an absent key succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError`] when the key is invalid or removal fails.
    fn delete(&self, key: &str) -> Result<(), MetadataError>;

    /// Calls `visit` for every key starting with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by the store or by `visit`.
    fn for_all(&self, prefix: &str, visit: &mut Visitor<'_>) -> Result<(), MetadataError>;
}

/// Validates that `key` only uses `[A-Za-z0-9._-]` and does not start with a dot.
///
/// # Errors
///
/// Returns [`MetadataError::InvalidKey`] otherwise.
pub fn validate_key(key: &str) -> Result<(), MetadataError> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(MetadataError::InvalidKey {
            key: key.to_owned(),
        })
    }
}
