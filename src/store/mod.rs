//! Transactional Document Store
//!
//! The persistence collaborator, modeled as a JSON document store addressed
//! by `(collection, id)` with optimistic single-document transactions and
//! whole-collection scans standing in for collection-group queries.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// How many attempts a transaction gets before a conflict is surfaced.
pub const TXN_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document version conflict")]
    Conflict,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A versioned document. The version increments on every committed write and
/// backs optimistic concurrency.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub version: u64,
    pub data: Value,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Unconditional upsert.
    async fn put(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError>;

    /// Versioned write. `expected_version = None` asserts the document does
    /// not exist yet; a mismatch fails with [`StoreError::Conflict`].
    async fn compare_and_put(
        &self,
        collection: &str,
        id: &str,
        expected_version: Option<u64>,
        data: Value,
    ) -> Result<(), StoreError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// Full scan of one collection. Ordering is unspecified.
    async fn scan(&self, collection: &str) -> Result<Vec<Document>, StoreError>;
}

/// Read and deserialize one document.
pub async fn get_doc<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(collection, id).await? {
        Some(doc) => Ok(Some(serde_json::from_value(doc.data)?)),
        None => Ok(None),
    }
}

/// Serialize and upsert one document.
pub async fn put_doc<T: Serialize>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
    value: &T,
) -> Result<(), StoreError> {
    store
        .put(collection, id, serde_json::to_value(value)?)
        .await
}

/// Run `apply` against the current state of one document and commit its
/// result atomically. Conflicts are retried transparently up to
/// [`TXN_ATTEMPTS`] times; other errors (including aborts raised by `apply`)
/// propagate immediately.
pub async fn run_transaction<T, E, F>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
    mut apply: F,
) -> Result<T, E>
where
    E: From<StoreError>,
    F: FnMut(Option<Value>) -> Result<(Value, T), E>,
{
    for _attempt in 0..TXN_ATTEMPTS {
        let existing = store.get(collection, id).await.map_err(E::from)?;
        let (expected_version, current) = match existing {
            Some(doc) => (Some(doc.version), Some(doc.data)),
            None => (None, None),
        };
        let (next, out) = apply(current)?;
        match store
            .compare_and_put(collection, id, expected_version, next)
            .await
        {
            Ok(()) => return Ok(out),
            Err(StoreError::Conflict) => continue,
            Err(other) => return Err(E::from(other)),
        }
    }
    Err(E::from(StoreError::Conflict))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn transaction_commits_on_first_attempt() {
        let store = MemoryStore::new();
        let out: Result<u64, StoreError> =
            run_transaction(&store, "counters", "c1", |current| {
                let n = current
                    .and_then(|v| v.get("n").and_then(Value::as_u64))
                    .unwrap_or(0);
                Ok((json!({ "n": n + 1 }), n + 1))
            })
            .await;
        assert_eq!(out.unwrap(), 1);

        let doc = store.get("counters", "c1").await.unwrap().unwrap();
        assert_eq!(doc.data["n"], 1);
        assert_eq!(doc.version, 1);
    }

    #[tokio::test]
    async fn transaction_retries_conflicts() {
        let store = MemoryStore::new();
        store.put("counters", "c1", json!({ "n": 0 })).await.unwrap();

        // Interfere on the first pass only, forcing one conflict retry.
        let mut interfered = false;
        let out: Result<u64, StoreError> =
            run_transaction(&store, "counters", "c1", |current| {
                if !interfered {
                    interfered = true;
                    futures::executor::block_on(async {
                        store
                            .put("counters", "c1", json!({ "n": 100 }))
                            .await
                            .unwrap();
                    });
                }
                let n = current
                    .and_then(|v| v.get("n").and_then(Value::as_u64))
                    .unwrap_or(0);
                Ok((json!({ "n": n + 1 }), n + 1))
            })
            .await;
        // Second pass read the interfering write.
        assert_eq!(out.unwrap(), 101);
    }

    #[tokio::test]
    async fn transaction_propagates_apply_errors() {
        let store = MemoryStore::new();
        let out: Result<(), StoreError> =
            run_transaction(&store, "x", "y", |_| {
                Err(StoreError::Unavailable("abort".into()))
            })
            .await;
        assert!(matches!(out, Err(StoreError::Unavailable(_))));
    }
}
