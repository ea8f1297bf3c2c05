//! In-Memory Document Store
//!
//! Concurrent map-backed implementation of [`DocumentStore`]. Used by tests
//! and local runs; production deployments swap in a store adapter behind the
//! same trait.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{Document, DocumentStore, StoreError};

#[derive(Debug, Clone)]
struct Stored {
    version: u64,
    data: Value,
}

/// DashMap-backed store. Versioned writes are atomic per document via the
/// map's per-entry locking.
#[derive(Default)]
pub struct MemoryStore {
    docs: DashMap<(String, String), Stored>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a store outage. While set, every operation fails with
    /// [`StoreError::Unavailable`]. Test hook for fail-safe paths.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated outage".into()));
        }
        Ok(())
    }

    fn key(collection: &str, id: &str) -> (String, String) {
        (collection.to_string(), id.to_string())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.check_available()?;
        Ok(self.docs.get(&Self::key(collection, id)).map(|entry| Document {
            id: id.to_string(),
            version: entry.version,
            data: entry.data.clone(),
        }))
    }

    async fn put(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError> {
        self.check_available()?;
        self.docs
            .entry(Self::key(collection, id))
            .and_modify(|stored| {
                stored.version += 1;
                stored.data = data.clone();
            })
            .or_insert(Stored { version: 1, data });
        Ok(())
    }

    async fn compare_and_put(
        &self,
        collection: &str,
        id: &str,
        expected_version: Option<u64>,
        data: Value,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        match self.docs.entry(Self::key(collection, id)) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if expected_version == Some(occupied.get().version) {
                    let next = occupied.get().version + 1;
                    occupied.insert(Stored { version: next, data });
                    Ok(())
                } else {
                    Err(StoreError::Conflict)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                if expected_version.is_none() {
                    vacant.insert(Stored { version: 1, data });
                    Ok(())
                } else {
                    Err(StoreError::Conflict)
                }
            }
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.docs.remove(&Self::key(collection, id));
        Ok(())
    }

    async fn scan(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        self.check_available()?;
        Ok(self
            .docs
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .map(|entry| Document {
                id: entry.key().1.clone(),
                version: entry.version,
                data: entry.data.clone(),
            })
            .collect())
    }
}
