//! In-process backend: each collection is an insertion-ordered document list
//! with a key index, guarded by a `tokio` read/write lock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{Collection, Store, StoreError, UpsertOp, REPOS, STATS, USERS};

#[derive(Debug, Default)]
struct Documents {
    docs: Vec<Value>,
    index: HashMap<String, usize>,
}

#[derive(Debug)]
pub struct MemoryCollection {
    name: String,
    key_field: String,
    inner: RwLock<Documents>,
}

impl MemoryCollection {
    pub fn new(name: &str, key_field: &str) -> Self {
        Self {
            name: name.to_string(),
            key_field: key_field.to_string(),
            inner: RwLock::new(Documents::default()),
        }
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_field(&self) -> &str {
        &self.key_field
    }

    async fn init(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn find_one(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.index.get(key).map(|&i| inner.docs[i].clone()))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.inner.read().await.docs.len() as u64)
    }

    async fn drop_all(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.docs.clear();
        inner.index.clear();
        Ok(())
    }

    async fn bulk_write(&self, ops: Vec<UpsertOp>) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        for op in ops {
            match inner.index.get(&op.key) {
                Some(&i) => {
                    let existing = std::mem::take(&mut inner.docs[i]);
                    inner.docs[i] = op.apply(&self.key_field, Some(existing));
                }
                None => {
                    let doc = op.apply(&self.key_field, None);
                    inner.index.insert(op.key.clone(), inner.docs.len());
                    inner.docs.push(doc);
                }
            }
        }
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<Value>, StoreError> {
        Ok(self.inner.read().await.docs.clone())
    }
}

/// The three ghscan collections held in memory.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    pub users: Arc<MemoryCollection>,
    pub repos: Arc<MemoryCollection>,
    pub stats: Arc<MemoryCollection>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            users: Arc::new(MemoryCollection::new(USERS, "login")),
            repos: Arc::new(MemoryCollection::new(REPOS, "nameWithOwner")),
            stats: Arc::new(MemoryCollection::new(STATS, "type")),
        }
    }

    pub fn into_store(self) -> Store {
        Store {
            users: self.users,
            repos: self.repos,
            stats: self.stats,
        }
    }
}
