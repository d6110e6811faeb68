//! Typed access to the `repos` collection and the aggregations built on it.
//!
//! Leaderboards (`most_*`, `count_by_user`) consider every repository.
//! Language and per-owner aggregates skip forks.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ghscan_core::{LanguageCount, Repository, UserCount};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    bulk_upsert_records, Accumulator, BulkReport, Collection, Filter, Group, Pipeline, SortKey,
    StoreError, CREATED_AT, UPDATED_AT,
};

/// Non-fork totals for one owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepoTotals {
    pub watchers: i64,
    pub stargazers: i64,
    pub forks: i64,
}

/// What the profile builder needs to know about one owner's repositories.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OwnerRepos {
    pub totals: RepoTotals,
    /// Top languages by non-fork repository count, then name.
    pub languages: Vec<LanguageCount>,
    /// Non-empty descriptions, forks included.
    pub descriptions: Vec<String>,
}

#[derive(Clone)]
pub struct RepoStore {
    coll: Arc<dyn Collection>,
}

fn decode_all<T: serde::de::DeserializeOwned>(docs: Vec<Value>) -> Result<Vec<T>, StoreError> {
    docs.into_iter()
        .map(|doc| Ok(serde_json::from_value(doc)?))
        .collect()
}

fn int(doc: &Value, field: &str) -> i64 {
    doc.get(field).and_then(Value::as_i64).unwrap_or(0)
}

fn group_key(doc: &Value) -> Option<&str> {
    doc.get("_id").and_then(Value::as_str)
}

/// String values of `field` inside a group's pushed array.
fn pushed<'a>(doc: &'a Value, list: &str, field: &'a str) -> impl Iterator<Item = &'a str> {
    doc.get(list)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(move |item| item.get(field)?.as_str())
}

impl RepoStore {
    pub fn new(coll: Arc<dyn Collection>) -> Self {
        Self { coll }
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        self.coll.count().await
    }

    pub async fn bulk_upsert(
        &self,
        repos: &[Repository],
        now: DateTime<Utc>,
        per_bulk: usize,
        cancel: &CancellationToken,
    ) -> Result<BulkReport, StoreError> {
        bulk_upsert_records(self.coll.as_ref(), repos, now, per_bulk, cancel).await
    }

    /// `createdAt` of the owner's newest repository, if any.
    pub async fn latest_created_at_for(
        &self,
        login: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let pipeline = Pipeline::new()
            .matching(Filter::eq("login", login))
            .sort(vec![SortKey::desc(CREATED_AT)])
            .limit(1);
        let repos: Vec<Repository> = decode_all(self.coll.pipe(&pipeline).await?)?;
        Ok(repos.into_iter().next().and_then(|r| r.created_at))
    }

    async fn top_by(&self, field: &str, n: usize) -> Result<Vec<Repository>, StoreError> {
        decode_all(self.coll.find_all(Some(n), &[SortKey::desc(field)]).await?)
    }

    pub async fn most_recent(&self, n: usize) -> Result<Vec<Repository>, StoreError> {
        self.top_by(UPDATED_AT, n).await
    }

    pub async fn most_stars(&self, n: usize) -> Result<Vec<Repository>, StoreError> {
        self.top_by("stargazers", n).await
    }

    pub async fn most_forks(&self, n: usize) -> Result<Vec<Repository>, StoreError> {
        self.top_by("forks", n).await
    }

    fn owners_by_count(filter: Filter, n: usize) -> Pipeline {
        Pipeline::new()
            .matching(filter)
            .group(
                Group::by("login")
                    .with("count", Accumulator::Count)
                    .with("avatarUrl", Accumulator::First("avatarUrl".into())),
            )
            .project(&[("name", "_id"), ("count", "count"), ("avatarUrl", "avatarUrl")])
            .sort(vec![SortKey::desc("count"), SortKey::asc("name")])
            .limit(n)
    }

    /// Owners with the most repositories.
    pub async fn count_by_user(&self, n: usize) -> Result<Vec<UserCount>, StoreError> {
        let pipeline = Self::owners_by_count(Filter::NotEmpty("login".into()), n);
        decode_all(self.coll.pipe(&pipeline).await?)
    }

    fn languages_pipeline(filter: Filter, n: usize) -> Pipeline {
        Pipeline::new()
            .matching(filter)
            .unwind("languages")
            .group(Group::by("languages").with("count", Accumulator::Count))
            .project(&[("name", "_id"), ("count", "count")])
            .sort(vec![SortKey::desc("count"), SortKey::asc("name")])
            .limit(n)
    }

    pub async fn popular_languages(&self, n: usize) -> Result<Vec<LanguageCount>, StoreError> {
        let pipeline = Self::languages_pipeline(Filter::not_fork(), n);
        decode_all(self.coll.pipe(&pipeline).await?)
    }

    pub async fn most_recent_for_language(
        &self,
        language: &str,
        n: usize,
    ) -> Result<Vec<Repository>, StoreError> {
        let pipeline = Pipeline::new()
            .matching(Filter::And(vec![
                Filter::not_fork(),
                Filter::eq("languages", language),
            ]))
            .sort(vec![SortKey::desc(UPDATED_AT)])
            .limit(n);
        decode_all(self.coll.pipe(&pipeline).await?)
    }

    /// Owners with the most non-fork repositories in `language`.
    pub async fn users_for_language(
        &self,
        language: &str,
        n: usize,
    ) -> Result<Vec<UserCount>, StoreError> {
        let pipeline = Self::owners_by_count(
            Filter::And(vec![
                Filter::not_fork(),
                Filter::eq("languages", language),
                Filter::NotEmpty("login".into()),
            ]),
            n,
        );
        decode_all(self.coll.pipe(&pipeline).await?)
    }

    /// Per-owner aggregates for the profile builder, from a single read of
    /// the collection. Owners come back in first-seen order. Totals and
    /// languages skip forks; descriptions cover every repository.
    pub async fn owner_summaries(
        &self,
        k_languages: usize,
    ) -> Result<Vec<(String, OwnerRepos)>, StoreError> {
        let docs = self.coll.scan().await?;
        let owned = Filter::NotEmpty("login".into());
        let owned_sources = Filter::And(vec![owned.clone(), Filter::not_fork()]);

        let described = Pipeline::new()
            .matching(owned)
            .group(Group::by("login").with(
                "descriptions",
                Accumulator::Push(vec![("text".into(), "description".into())]),
            ))
            .run(docs.clone());
        let totals = Pipeline::new()
            .matching(owned_sources.clone())
            .group(
                Group::by("login")
                    .with("watchers", Accumulator::Sum("watchers".into()))
                    .with("stargazers", Accumulator::Sum("stargazers".into()))
                    .with("forks", Accumulator::Sum("forks".into())),
            )
            .run(docs.clone());
        let languages = Pipeline::new()
            .matching(owned_sources)
            .unwind("languages")
            .group(Group::by("login").with(
                "languages",
                Accumulator::Push(vec![("name".into(), "languages".into())]),
            ))
            .run(docs);

        let mut out: Vec<(String, OwnerRepos)> = Vec::with_capacity(described.len());
        let mut index: HashMap<String, usize> = HashMap::with_capacity(described.len());
        for doc in described {
            let Some(login) = group_key(&doc) else { continue };
            let descriptions = pushed(&doc, "descriptions", "text")
                .filter(|d| !d.trim().is_empty())
                .map(str::to_string)
                .collect();
            index.insert(login.to_string(), out.len());
            out.push((
                login.to_string(),
                OwnerRepos {
                    descriptions,
                    ..Default::default()
                },
            ));
        }

        for doc in totals {
            let Some(slot) = group_key(&doc).and_then(|login| index.get(login)) else {
                continue;
            };
            out[*slot].1.totals = RepoTotals {
                watchers: int(&doc, "watchers"),
                stargazers: int(&doc, "stargazers"),
                forks: int(&doc, "forks"),
            };
        }

        for doc in languages {
            let Some(slot) = group_key(&doc).and_then(|login| index.get(login)) else {
                continue;
            };
            let mut tally: HashMap<&str, i64> = HashMap::new();
            for name in pushed(&doc, "languages", "name") {
                *tally.entry(name).or_default() += 1;
            }
            let mut counts: Vec<LanguageCount> = tally
                .into_iter()
                .map(|(name, count)| LanguageCount {
                    name: name.to_string(),
                    count,
                })
                .collect();
            counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
            counts.truncate(k_languages);
            out[*slot].1.languages = counts;
        }

        Ok(out)
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

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn repo(owner: &str, name: &str, langs: &[&str], fork: bool, stars: i64) -> Repository {
        Repository {
            name: name.into(),
            name_with_owner: format!("{owner}/{name}"),
            created_at: Some(at(2020, 1, (stars % 28 + 1) as u32)),
            updated_at: Some(at(2021, 1, (stars % 28 + 1) as u32)),
            description: format!("{name} tool"),
            languages: langs.iter().map(|l| l.to_string()).collect(),
            is_fork: fork,
            login: owner.into(),
            avatar_url: format!("https://avatars/{owner}"),
            stargazers: stars,
            watchers: stars * 2,
            forks: stars / 2,
            ..Default::default()
        }
    }

    async fn seeded() -> RepoStore {
        let store = Store::memory().repositories();
        store
            .bulk_upsert(
                &[
                    repo("alice", "cli", &["Rust", "Shell"], false, 10),
                    repo("alice", "web", &["Go"], false, 4),
                    repo("alice", "fork", &["Rust"], true, 20),
                    repo("bob", "api", &["Go", "Rust"], false, 7),
                    repo("carol", "site", &[], false, 1),
                ],
                at(2024, 1, 1),
                2,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn leaderboards_include_forks() {
        let store = seeded().await;
        assert_eq!(store.count().await.unwrap(), 5);
        let stars: Vec<String> = store
            .most_stars(2)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(stars, vec!["fork", "cli"]);

        let by_user = store.count_by_user(10).await.unwrap();
        assert_eq!(by_user[0].name, "alice");
        assert_eq!(by_user[0].count, 3);
        assert_eq!(by_user[0].avatar_url, "https://avatars/alice");
    }

    #[tokio::test]
    async fn language_aggregates_skip_forks() {
        let store = seeded().await;
        let langs = store.popular_languages(10).await.unwrap();
        assert_eq!(
            langs,
            vec![
                LanguageCount { name: "Go".into(), count: 2 },
                LanguageCount { name: "Rust".into(), count: 2 },
                LanguageCount { name: "Shell".into(), count: 1 },
            ]
        );

        let rust_users = store.users_for_language("Rust", 10).await.unwrap();
        assert_eq!(rust_users.len(), 2);
        assert!(rust_users.iter().all(|u| u.count == 1));

        let recent = store.most_recent_for_language("Rust", 10).await.unwrap();
        assert!(recent.iter().all(|r| !r.is_fork));
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn owner_summaries_in_one_pass() {
        let store = seeded().await;
        let summaries = store.owner_summaries(10).await.unwrap();
        let owners: Vec<&str> = summaries.iter().map(|(login, _)| login.as_str()).collect();
        assert_eq!(owners, vec!["alice", "bob", "carol"]);

        let alice = &summaries[0].1;
        assert_eq!(alice.totals, RepoTotals { watchers: 28, stargazers: 14, forks: 7 });
        assert_eq!(
            alice.languages,
            vec![
                LanguageCount { name: "Go".into(), count: 1 },
                LanguageCount { name: "Rust".into(), count: 1 },
                LanguageCount { name: "Shell".into(), count: 1 },
            ]
        );
        assert_eq!(alice.descriptions, vec!["cli tool", "web tool", "fork tool"]);

        let carol = &summaries[2].1;
        assert!(carol.languages.is_empty());
        assert_eq!(carol.totals.stargazers, 1);

        assert_eq!(store.owner_summaries(1).await.unwrap()[0].1.languages.len(), 1);
        assert_eq!(
            store.latest_created_at_for("alice").await.unwrap(),
            Some(at(2020, 1, 21))
        );
        assert_eq!(store.latest_created_at_for("nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn fork_only_owner_has_zero_totals_but_keeps_descriptions() {
        let store = Store::memory().repositories();
        store
            .bulk_upsert(
                &[repo("dave", "mirror", &["C"], true, 9)],
                at(2024, 1, 1),
                500,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let summaries = store.owner_summaries(10).await.unwrap();
        assert_eq!(summaries.len(), 1);
        let (login, dave) = &summaries[0];
        assert_eq!(login, "dave");
        assert_eq!(dave.totals, RepoTotals::default());
        assert!(dave.languages.is_empty());
        assert_eq!(dave.descriptions, vec!["mirror tool"]);
    }
}
