//! Tracks mutating requests that are currently being processed.
//!
//! Each request is reduced to a fingerprint string. At most one request per
//! fingerprint may be in flight; a second caller is told the operation is
//! already in progress and is expected to retry later. The lock is held only
//! for the insert/remove check, never for the guarded operation itself.
//! Entries live in memory and are not shared between processes.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

/// Canonical identity of a request used for in-flight deduplication.
pub trait Fingerprint {
    /// Returns a string that is equal for two requests with the same identity.
    fn fingerprint(&self) -> String;
}

/// Set of in-flight request fingerprints.
#[derive(Debug, Default)]
pub struct InFlight {
    entries: Mutex<HashSet<String>>,
}

impl InFlight {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `key` as in flight. Returns `false` when it already is.
    #[must_use]
    pub fn insert(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned())
    }

    /// Removes `key`, allowing a later request with the same identity.
    pub fn delete(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Returns `true` when `key` is currently in flight.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    /// Marks `key` as in flight and returns a guard that removes it on drop.
    ///
    /// Returns `None` when another request with the same key is running.
    #[must_use]
    pub fn try_acquire(&self, key: impl Into<String>) -> Option<InFlightGuard<'_>> {
        let fingerprint = key.into();
        if !self.insert(&fingerprint) {
            return None;
        }
        Some(InFlightGuard {
            tracker: self,
            key: fingerprint,
        })
    }
}

/// Removes its fingerprint from the tracker on every exit path.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    tracker: &'a InFlight,
    key: String,
}

impl InFlightGuard<'_> {
    /// Fingerprint held by this guard.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.tracker.delete(&self.key);
    }
}
