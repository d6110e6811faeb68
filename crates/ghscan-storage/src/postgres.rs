//! PostgreSQL backend: one JSONB document table per collection.
//!
//! Table layout: `(seq BIGSERIAL, key TEXT PRIMARY KEY, doc JSONB NOT NULL)`.
//! `seq` keeps natural insertion order for scans. Every bulk chunk runs in a
//! single transaction; an uncommitted transaction rolls back when dropped.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;

use crate::{Collection, Store, StoreError, UpsertOp, REPOS, STATS, USERS};

#[derive(Debug, Clone)]
pub struct PgCollection {
    pool: PgPool,
    name: String,
    key_field: String,
    table: String,
}

impl PgCollection {
    pub fn new(pool: PgPool, name: &str, key_field: &str) -> Self {
        let table = format!(
            "ghscan_{}",
            name.chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect::<String>()
        );
        Self {
            pool,
            name: name.to_string(),
            key_field: key_field.to_string(),
            table,
        }
    }
}

#[async_trait]
impl Collection for PgCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_field(&self) -> &str {
        &self.key_field
    }

    async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                seq BIGSERIAL,
                key TEXT PRIMARY KEY,
                doc JSONB NOT NULL
            )
            "#,
            table = self.table
        ))
        .execute(&self.pool)
        .await?;
        info!(collection = %self.name, table = %self.table, "collection ready");
        Ok(())
    }

    async fn find_one(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query(&format!("SELECT doc FROM {} WHERE key = $1", self.table))
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let Json(doc): Json<Value> = row.try_get("doc")?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", self.table))
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    async fn drop_all(&self) -> Result<(), StoreError> {
        sqlx::query(&format!("TRUNCATE {}", self.table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bulk_write(&self, ops: Vec<UpsertOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        let keys: Vec<String> = ops.iter().map(|op| op.key.clone()).collect();
        let rows = sqlx::query(&format!(
            "SELECT key, doc FROM {} WHERE key = ANY($1) FOR UPDATE",
            self.table
        ))
        .bind(&keys)
        .fetch_all(&mut *tx)
        .await?;

        let mut current: HashMap<String, Value> = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key")?;
            let Json(doc): Json<Value> = row.try_get("doc")?;
            current.insert(key, doc);
        }

        for op in ops {
            let doc = op.apply(&self.key_field, current.remove(&op.key));
            sqlx::query(&format!(
                r#"
                INSERT INTO {} (key, doc) VALUES ($1, $2)
                ON CONFLICT (key) DO UPDATE SET doc = EXCLUDED.doc
                "#,
                self.table
            ))
            .bind(&op.key)
            .bind(Json(&doc))
            .execute(&mut *tx)
            .await?;
            current.insert(op.key, doc);
        }

        tx.commit().await?;
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<Value>, StoreError> {
        let rows = sqlx::query(&format!("SELECT doc FROM {} ORDER BY seq", self.table))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| -> Result<Value, StoreError> {
                let Json(doc): Json<Value> = row.try_get("doc")?;
                Ok(doc)
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pub pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn into_store(self) -> Store {
        Store {
            users: Arc::new(PgCollection::new(self.pool.clone(), USERS, "login")),
            repos: Arc::new(PgCollection::new(self.pool.clone(), REPOS, "nameWithOwner")),
            stats: Arc::new(PgCollection::new(self.pool, STATS, "type")),
        }
    }
}
