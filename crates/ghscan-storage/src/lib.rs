//! Document store contract, backends and typed per-entity stores for ghscan.
//!
//! Every collection is keyed on a natural key and written exclusively through
//! [`UpsertOp`]s, so re-running any stage converges on the same records.

pub mod accounts;
pub mod memory;
pub mod pipeline;
pub mod postgres;
pub mod repos;
pub mod stats;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ghscan_core::{partition, timestamp};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

pub use accounts::AccountStore;
pub use memory::MemoryStore;
pub use pipeline::{Accumulator, Filter, Group, Pipeline, SortKey};
pub use postgres::PgStore;
pub use repos::{OwnerRepos, RepoStore, RepoTotals};
pub use stats::StatStore;

pub const CRATE_NAME: &str = "ghscan-storage";

pub const USERS: &str = "users";
pub const REPOS: &str = "repos";
pub const STATS: &str = "stats";

pub const CREATED_AT: &str = "createdAt";
pub const UPDATED_AT: &str = "updatedAt";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{collection}: no record for {key}")]
    NotFound { collection: String, key: String },
    #[error("{collection}: duplicate key {key}")]
    Conflict { collection: String, key: String },
    #[error("{collection}: record is missing its natural key `{field}`")]
    InvalidKey { collection: String, field: String },
    #[error("cancelled after {committed} committed chunk(s)")]
    Cancelled { committed: usize },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// One keyed write: `set` paths are always written, `set_if_absent` paths only
/// when they hold no value yet (set-on-insert for fresh records).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpsertOp {
    pub key: String,
    pub set: Map<String, Value>,
    pub set_if_absent: Map<String, Value>,
}

impl UpsertOp {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn set(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.set.insert(path.to_string(), value.into());
        self
    }

    pub fn set_if_absent(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.set_if_absent.insert(path.to_string(), value.into());
        self
    }

    /// Build an upsert from a whole record. `createdAt` is moved to the
    /// set-if-absent side (falling back to `now`) so it never changes once
    /// written; `updatedAt` is left as the record carries it.
    pub fn from_record<T: Serialize>(
        collection: &str,
        key_field: &str,
        record: &T,
        now: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        let Value::Object(mut fields) = serde_json::to_value(record)? else {
            return Err(StoreError::InvalidKey {
                collection: collection.to_string(),
                field: key_field.to_string(),
            });
        };
        let key = match fields.get(key_field) {
            Some(Value::String(k)) if !k.is_empty() => k.clone(),
            _ => {
                return Err(StoreError::InvalidKey {
                    collection: collection.to_string(),
                    field: key_field.to_string(),
                })
            }
        };
        let created_at = fields
            .remove(CREATED_AT)
            .filter(|v| !v.is_null())
            .unwrap_or_else(|| Value::from(timestamp(now)));
        Ok(Self {
            key,
            set: fields,
            set_if_absent: Map::from_iter([(CREATED_AT.to_string(), created_at)]),
        })
    }

    /// Apply this op on top of an existing document (or a fresh one).
    pub fn apply(&self, key_field: &str, existing: Option<Value>) -> Value {
        let mut doc = match existing {
            Some(doc @ Value::Object(_)) => doc,
            _ => Value::Object(Map::new()),
        };
        for (path, value) in &self.set {
            pipeline::set_path(&mut doc, path, value.clone());
        }
        for (path, value) in &self.set_if_absent {
            if matches!(pipeline::get_path(&doc, path), None | Some(Value::Null)) {
                pipeline::set_path(&mut doc, path, value.clone());
            }
        }
        pipeline::set_path(&mut doc, key_field, Value::from(self.key.clone()));
        doc
    }
}

/// A named collection of JSON documents with a unique natural key.
///
/// Backends implement the primitive operations; querying is layered on top of
/// [`Collection::scan`] through the shared [`Pipeline`] evaluator.
#[async_trait]
pub trait Collection: Send + Sync {
    fn name(&self) -> &str;

    fn key_field(&self) -> &str;

    /// Create the backing storage and the unique index on the natural key.
    async fn init(&self) -> Result<(), StoreError>;

    async fn find_one(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    /// Remove every document. Administrative only.
    async fn drop_all(&self) -> Result<(), StoreError>;

    /// Apply one chunk of upserts atomically.
    async fn bulk_write(&self, ops: Vec<UpsertOp>) -> Result<(), StoreError>;

    /// All documents in insertion order.
    async fn scan(&self) -> Result<Vec<Value>, StoreError>;

    async fn upsert(&self, op: UpsertOp) -> Result<(), StoreError> {
        self.bulk_write(vec![op]).await
    }

    async fn find_all(
        &self,
        limit: Option<usize>,
        sort: &[SortKey],
    ) -> Result<Vec<Value>, StoreError> {
        let mut pipeline = Pipeline::new().sort(sort.to_vec());
        if let Some(limit) = limit {
            pipeline = pipeline.limit(limit);
        }
        self.pipe(&pipeline).await
    }

    /// Distinct non-null values of `field`; array fields contribute each element.
    async fn distinct(&self, field: &str) -> Result<Vec<Value>, StoreError> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for doc in self.scan().await? {
            let values = match pipeline::get_path(&doc, field) {
                None | Some(Value::Null) => continue,
                Some(Value::Array(items)) => items.clone(),
                Some(v) => vec![v.clone()],
            };
            for v in values {
                if seen.insert(v.to_string()) {
                    out.push(v);
                }
            }
        }
        Ok(out)
    }

    async fn pipe(&self, pipeline: &Pipeline) -> Result<Vec<Value>, StoreError> {
        Ok(pipeline.run(self.scan().await?))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    pub records: usize,
    pub chunks: usize,
}

/// Write `ops` in contiguous chunks of at most `per_bulk`, one bulk operation
/// per chunk, in order. Stops at the first failing chunk; chunks already
/// written stay written. Cancellation is observed between chunks.
pub async fn bulk_upsert(
    collection: &dyn Collection,
    ops: Vec<UpsertOp>,
    per_bulk: usize,
    cancel: &CancellationToken,
) -> Result<BulkReport, StoreError> {
    let total = ops.len();
    let ranges = partition(per_bulk, total);
    let mut ops = ops.into_iter();
    let mut report = BulkReport::default();

    for range in ranges {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled {
                committed: report.chunks,
            });
        }
        let chunk: Vec<UpsertOp> = ops.by_ref().take(range.len()).collect();
        let size = chunk.len();
        collection
            .bulk_write(chunk)
            .instrument(info_span!("bulk_write", collection = collection.name(), size))
            .await?;
        report.chunks += 1;
        report.records += size;
        debug!(
            collection = collection.name(),
            chunk = report.chunks,
            size,
            "bulk chunk written"
        );
    }
    Ok(report)
}

/// Serialize and bulk-upsert whole records keyed on `collection.key_field()`.
pub async fn bulk_upsert_records<T: Serialize>(
    collection: &dyn Collection,
    records: &[T],
    now: DateTime<Utc>,
    per_bulk: usize,
    cancel: &CancellationToken,
) -> Result<BulkReport, StoreError> {
    let ops = records
        .iter()
        .map(|r| UpsertOp::from_record(collection.name(), collection.key_field(), r, now))
        .collect::<Result<Vec<_>, _>>()?;
    bulk_upsert(collection, ops, per_bulk, cancel).await
}

/// Shared handle over the three collections. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pub users: Arc<dyn Collection>,
    pub repos: Arc<dyn Collection>,
    pub stats: Arc<dyn Collection>,
}

impl Store {
    pub fn memory() -> Self {
        MemoryStore::new().into_store()
    }

    pub async fn postgres(database_url: &str) -> Result<Self, StoreError> {
        Ok(PgStore::connect(database_url).await?.into_store())
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.users.init().await?;
        self.repos.init().await?;
        self.stats.init().await?;
        Ok(())
    }

    pub fn accounts(&self) -> AccountStore {
        AccountStore::new(self.users.clone())
    }

    pub fn repositories(&self) -> RepoStore {
        RepoStore::new(self.repos.clone())
    }

    pub fn stat_records(&self) -> StatStore {
        StatStore::new(self.stats.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingCollection {
        sizes: Mutex<Vec<usize>>,
        fail_on_chunk: Option<usize>,
    }

    #[async_trait]
    impl Collection for RecordingCollection {
        fn name(&self) -> &str {
            "recording"
        }
        fn key_field(&self) -> &str {
            "id"
        }
        async fn init(&self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn find_one(&self, _key: &str) -> Result<Option<Value>, StoreError> {
            Ok(None)
        }
        async fn count(&self) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn drop_all(&self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn bulk_write(&self, ops: Vec<UpsertOp>) -> Result<(), StoreError> {
            let mut sizes = self.sizes.lock().unwrap();
            if self.fail_on_chunk == Some(sizes.len()) {
                return Err(StoreError::Conflict {
                    collection: "recording".into(),
                    key: ops[0].key.clone(),
                });
            }
            sizes.push(ops.len());
            Ok(())
        }
        async fn scan(&self) -> Result<Vec<Value>, StoreError> {
            Ok(vec![])
        }
    }

    fn ops(n: usize) -> Vec<UpsertOp> {
        (0..n).map(|i| UpsertOp::new(i.to_string())).collect()
    }

    #[tokio::test]
    async fn bulk_upsert_issues_500_500_337() {
        let coll = RecordingCollection {
            sizes: Mutex::new(vec![]),
            fail_on_chunk: None,
        };
        let report = bulk_upsert(&coll, ops(1337), 500, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(*coll.sizes.lock().unwrap(), vec![500, 500, 337]);
        assert_eq!(report, BulkReport { records: 1337, chunks: 3 });
    }

    #[tokio::test]
    async fn bulk_upsert_stops_at_first_failing_chunk() {
        let coll = RecordingCollection {
            sizes: Mutex::new(vec![]),
            fail_on_chunk: Some(1),
        };
        let err = bulk_upsert(&coll, ops(1200), 500, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(*coll.sizes.lock().unwrap(), vec![500]);
    }

    #[tokio::test]
    async fn bulk_upsert_observes_cancellation_between_chunks() {
        let coll = RecordingCollection {
            sizes: Mutex::new(vec![]),
            fail_on_chunk: None,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = bulk_upsert(&coll, ops(10), 5, &cancel).await.unwrap_err();
        assert!(matches!(err, StoreError::Cancelled { committed: 0 }));
        assert!(coll.sizes.lock().unwrap().is_empty());
    }

    #[test]
    fn from_record_routes_created_at_to_set_if_absent() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let op = UpsertOp::from_record(
            "users",
            "login",
            &json!({"login": "alice", "createdAt": "2020-01-01T00:00:00Z", "bio": "hi"}),
            now,
        )
        .unwrap();
        assert_eq!(op.key, "alice");
        assert!(op.set.get(CREATED_AT).is_none());
        assert_eq!(op.set_if_absent[CREATED_AT], "2020-01-01T00:00:00Z");

        let fresh = UpsertOp::from_record("users", "login", &json!({"login": "bob"}), now).unwrap();
        assert_eq!(fresh.set_if_absent[CREATED_AT], "2024-01-01T00:00:00Z");
    }

    #[test]
    fn from_record_rejects_missing_key() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let err = UpsertOp::from_record("users", "login", &json!({"login": ""}), now).unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey { .. }));
    }

    #[test]
    fn apply_keeps_existing_created_at() {
        let existing = json!({"login": "alice", "createdAt": "2019-01-01T00:00:00Z", "bio": "old"});
        let op = UpsertOp::new("alice")
            .set("bio", "new")
            .set("profile.watchers", 3)
            .set_if_absent(CREATED_AT, "2024-01-01T00:00:00Z");
        let doc = op.apply("login", Some(existing));
        assert_eq!(doc["createdAt"], "2019-01-01T00:00:00Z");
        assert_eq!(doc["bio"], "new");
        assert_eq!(doc["profile"]["watchers"], 3);
        assert_eq!(doc["login"], "alice");
    }
}
