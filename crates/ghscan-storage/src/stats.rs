//! Singleton precomputed analytics records, keyed on `type`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ghscan_core::{timestamp, StatPayload, StatType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Collection, StoreError, UpsertOp, CREATED_AT, UPDATED_AT};

/// A stored stat document: its type, timestamps and the flat payload fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatRecord {
    #[serde(rename = "type")]
    pub stat_type: StatType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

#[derive(Clone)]
pub struct StatStore {
    coll: Arc<dyn Collection>,
}

impl StatStore {
    pub fn new(coll: Arc<dyn Collection>) -> Self {
        Self { coll }
    }

    /// Overwrite the record for `stat`. Returns `false` without writing when
    /// the payload is empty, so a pass over an empty source keeps the last
    /// good value.
    pub async fn upsert(
        &self,
        stat: StatType,
        payload: &StatPayload,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if payload.is_empty() {
            return Ok(false);
        }
        let Value::Object(fields) = serde_json::to_value(payload)? else {
            return Ok(false);
        };
        let mut op = UpsertOp::new(stat.as_str())
            .set(UPDATED_AT, timestamp(now))
            .set_if_absent(CREATED_AT, timestamp(now));
        op.set.extend(fields);
        self.coll.upsert(op).await?;
        Ok(true)
    }

    pub async fn find(&self, stat: StatType) -> Result<StatRecord, StoreError> {
        match self.coll.find_one(stat.as_str()).await? {
            Some(doc) => Ok(serde_json::from_value(doc)?),
            None => Err(StoreError::NotFound {
                collection: self.coll.name().to_string(),
                key: stat.to_string(),
            }),
        }
    }

    pub async fn drop_all(&self) -> Result<(), StoreError> {
        self.coll.drop_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use chrono::TimeZone;
    use ghscan_core::LanguageCount;
    use serde_json::json;

    #[tokio::test]
    async fn recompute_only_advances_updated_at() {
        let stats = Store::memory().stat_records();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let payload = StatPayload::Count { count: 42 };

        assert!(stats.upsert(StatType::UserCount, &payload, t1).await.unwrap());
        let first = stats.find(StatType::UserCount).await.unwrap();
        assert!(stats.upsert(StatType::UserCount, &payload, t2).await.unwrap());
        let second = stats.find(StatType::UserCount).await.unwrap();

        assert_eq!(first.payload, second.payload);
        assert_eq!(second.payload["count"], json!(42));
        assert_eq!(second.created_at, Some(t1));
        assert_eq!(second.updated_at, Some(t2));
    }

    #[tokio::test]
    async fn empty_payload_keeps_previous_record() {
        let stats = Store::memory().stat_records();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let langs = StatPayload::Languages {
            languages: vec![LanguageCount { name: "Rust".into(), count: 3 }],
        };
        stats.upsert(StatType::LanguagesMostPopular, &langs, now).await.unwrap();

        let empty = StatPayload::Languages { languages: vec![] };
        assert!(!stats.upsert(StatType::LanguagesMostPopular, &empty, now).await.unwrap());
        let record = stats.find(StatType::LanguagesMostPopular).await.unwrap();
        assert_eq!(record.payload["languages"][0]["name"], "Rust");
    }

    #[tokio::test]
    async fn never_computed_stat_is_not_found() {
        let stats = Store::memory().stat_records();
        let err = stats.find(StatType::CompanyCount).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
