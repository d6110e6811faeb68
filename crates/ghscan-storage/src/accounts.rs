//! Typed access to the `users` collection.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ghscan_core::{timestamp, Account, CompanyUsers, Profile, UserRef};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    bulk_upsert, bulk_upsert_records, Accumulator, BulkReport, Collection, Filter, Group,
    Pipeline, SortKey, StoreError, UpsertOp, CREATED_AT,
};

#[derive(Clone)]
pub struct AccountStore {
    coll: Arc<dyn Collection>,
}

fn decode(doc: Value) -> Result<Account, StoreError> {
    Ok(serde_json::from_value(doc)?)
}

impl AccountStore {
    pub fn new(coll: Arc<dyn Collection>) -> Self {
        Self { coll }
    }

    pub async fn find(&self, login: &str) -> Result<Account, StoreError> {
        match self.coll.find_one(login).await? {
            Some(doc) => decode(doc),
            None => Err(StoreError::NotFound {
                collection: self.coll.name().to_string(),
                key: login.to_string(),
            }),
        }
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        self.coll.count().await
    }

    /// `createdAt` of the most recently created account, if any.
    pub async fn latest_created_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let docs = self
            .coll
            .find_all(Some(1), &[SortKey::desc(CREATED_AT)])
            .await?;
        match docs.into_iter().next() {
            Some(doc) => Ok(decode(doc)?.created_at),
            None => Ok(None),
        }
    }

    /// The `limit` accounts fetched longest ago; never-fetched accounts first.
    pub async fn find_stale(&self, limit: usize) -> Result<Vec<Account>, StoreError> {
        self.coll
            .find_all(Some(limit), &[SortKey::asc("fetchedAt")])
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Accounts carrying a non-empty profile, in store order.
    pub async fn with_profiles(&self) -> Result<Vec<Account>, StoreError> {
        let docs = self
            .coll
            .pipe(&Pipeline::new().matching(Filter::Exists("profile".into())))
            .await?;
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            let account = decode(doc)?;
            if account.has_profile() {
                out.push(account);
            }
        }
        Ok(out)
    }

    pub async fn bulk_upsert(
        &self,
        accounts: &[Account],
        now: DateTime<Utc>,
        per_bulk: usize,
        cancel: &CancellationToken,
    ) -> Result<BulkReport, StoreError> {
        bulk_upsert_records(self.coll.as_ref(), accounts, now, per_bulk, cancel).await
    }

    pub async fn mark_fetched(&self, login: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.coll
            .upsert(UpsertOp::new(login).set("fetchedAt", timestamp(now)))
            .await
    }

    pub async fn logins(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .coll
            .distinct("login")
            .await?
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }

    /// Write computed profiles onto existing accounts; logins with no account
    /// are skipped. `profile.matches` is owned by the similarity ranker and
    /// left untouched here.
    pub async fn update_profiles(
        &self,
        profiles: &[(String, Profile)],
        now: DateTime<Utc>,
        per_bulk: usize,
        cancel: &CancellationToken,
    ) -> Result<BulkReport, StoreError> {
        let known = self.logins().await?;
        let ops = profiles
            .iter()
            .filter(|(login, _)| known.contains(login))
            .map(|(login, p)| -> Result<UpsertOp, StoreError> {
                Ok(UpsertOp::new(login.clone())
                    .set("profile.watchers", p.watchers)
                    .set("profile.stargazers", p.stargazers)
                    .set("profile.forks", p.forks)
                    .set("profile.languages", serde_json::to_value(&p.languages)?)
                    .set("profile.keywords", serde_json::to_value(&p.keywords)?)
                    .set("profile.updatedAt", timestamp(now))
                    .set_if_absent("profile.createdAt", timestamp(now)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        bulk_upsert(self.coll.as_ref(), ops, per_bulk, cancel).await
    }

    /// Replace `profile.matches` on existing accounts.
    pub async fn update_matches(
        &self,
        matches: &[(String, Vec<UserRef>)],
        now: DateTime<Utc>,
        per_bulk: usize,
        cancel: &CancellationToken,
    ) -> Result<BulkReport, StoreError> {
        let known = self.logins().await?;
        let ops = matches
            .iter()
            .filter(|(login, _)| known.contains(login))
            .map(|(login, refs)| -> Result<UpsertOp, StoreError> {
                Ok(UpsertOp::new(login.clone())
                    .set("profile.matches", serde_json::to_value(refs)?)
                    .set("profile.updatedAt", timestamp(now)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        bulk_upsert(self.coll.as_ref(), ops, per_bulk, cancel).await
    }

    /// Number of distinct non-empty companies.
    pub async fn company_count(&self) -> Result<i64, StoreError> {
        let companies = self.coll.distinct("company").await?;
        Ok(companies
            .iter()
            .filter(|c| c.as_str().is_some_and(|s| !s.trim().is_empty()))
            .count() as i64)
    }

    /// Companies with at least `min_users` members, largest first.
    pub async fn users_by_company(
        &self,
        min_users: usize,
        limit: usize,
    ) -> Result<Vec<CompanyUsers>, StoreError> {
        let pipeline = Pipeline::new()
            .matching(Filter::NotEmpty("company".into()))
            .group(
                Group::by("company")
                    .with("count", Accumulator::Count)
                    .with(
                        "users",
                        Accumulator::Push(vec![
                            ("login".into(), "login".into()),
                            ("avatarUrl".into(), "avatarUrl".into()),
                        ]),
                    ),
            )
            .matching(Filter::gte("count", min_users as i64))
            .project(&[("company", "_id"), ("count", "count"), ("users", "users")])
            .sort(vec![SortKey::desc("count"), SortKey::asc("company")])
            .limit(limit);
        self.coll
            .pipe(&pipeline)
            .await?
            .into_iter()
            .map(|doc| Ok(serde_json::from_value(doc)?))
            .collect()
    }

    pub async fn drop_all(&self) -> Result<(), StoreError> {
        self.coll.drop_all().await
    }
}
