//! Recomputation passes: one aggregation read, one stat record written.

use anyhow::{Context, Result};
use ghscan_core::{LanguageRepos, LanguageUsers, StatPayload, StatType};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::SyncPipeline;

#[derive(Debug, Clone, Serialize)]
pub struct RecomputeReport {
    pub stat: StatType,
    /// Entries in the payload (the value itself for counts).
    pub items: usize,
    /// `false` when the source was empty and the stored record was kept.
    pub written: bool,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassFailure {
    pub stat: StatType,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecomputeAllReport {
    pub passes: Vec<RecomputeReport>,
    pub failures: Vec<PassFailure>,
    pub cancelled: bool,
}

fn payload_items(payload: &StatPayload) -> usize {
    match payload {
        StatPayload::Count { count } => (*count).max(0) as usize,
        StatPayload::Repos { repos } => repos.len(),
        StatPayload::Users { users } => users.len(),
        StatPayload::Languages { languages } => languages.len(),
        StatPayload::ReposByLanguage { repos } => repos.len(),
        StatPayload::UsersByLanguage { users } => users.len(),
        StatPayload::UsersByCompany { users } => users.len(),
    }
}

impl SyncPipeline {
    async fn compute(&self, stat: StatType) -> Result<StatPayload> {
        let accounts = self.store.accounts();
        let repos = self.store.repositories();
        let n = self.config.stats_limit;

        Ok(match stat {
            StatType::UserCount => StatPayload::Count {
                count: accounts.count().await? as i64,
            },
            // All repositories, forks included.
            StatType::RepoCount => StatPayload::Count {
                count: repos.count().await? as i64,
            },
            StatType::ReposMostRecent => StatPayload::Repos {
                repos: repos.most_recent(n).await?,
            },
            StatType::RepoCountByUser => StatPayload::Users {
                users: repos.count_by_user(n).await?,
            },
            StatType::ReposMostStars => StatPayload::Repos {
                repos: repos.most_stars(n).await?,
            },
            StatType::ReposMostForks => StatPayload::Repos {
                repos: repos.most_forks(n).await?,
            },
            StatType::LanguagesMostPopular => StatPayload::Languages {
                languages: repos.popular_languages(n).await?,
            },
            StatType::ReposMostRecentByLanguage => {
                let mut out = Vec::new();
                for lang in repos.popular_languages(n).await? {
                    let top = repos.most_recent_for_language(&lang.name, n).await?;
                    out.push(LanguageRepos {
                        language: lang.name,
                        repos: top,
                    });
                }
                StatPayload::ReposByLanguage { repos: out }
            }
            StatType::ReposByLanguage => {
                let mut out = Vec::new();
                for lang in repos.popular_languages(n).await? {
                    let users = repos.users_for_language(&lang.name, n).await?;
                    out.push(LanguageUsers {
                        language: lang.name,
                        users,
                    });
                }
                StatPayload::UsersByLanguage { users: out }
            }
            StatType::CompanyCount => StatPayload::Count {
                count: accounts.company_count().await?,
            },
            StatType::UsersByCompany => StatPayload::UsersByCompany {
                users: accounts
                    .users_by_company(self.config.company_min_users, n)
                    .await?,
            },
        })
    }

    /// Recompute and store one stat. An empty aggregation leaves the stored
    /// record untouched.
    pub async fn recompute(
        &self,
        stat: StatType,
        cancel: &CancellationToken,
    ) -> Result<RecomputeReport> {
        if cancel.is_cancelled() {
            return Ok(RecomputeReport {
                stat,
                items: 0,
                written: false,
                cancelled: true,
            });
        }
        let payload = self
            .compute(stat)
            .await
            .with_context(|| format!("aggregating {stat}"))?;
        let items = payload_items(&payload);
        let written = self
            .store
            .stat_records()
            .upsert(stat, &payload, self.clock.now())
            .await
            .with_context(|| format!("storing {stat}"))?;
        info!(stat = %stat, items, written, "stat recomputed");
        Ok(RecomputeReport {
            stat,
            items,
            written,
            cancelled: false,
        })
    }

    /// Run every pass in catalog order. A failing pass is logged and
    /// recorded; the remaining passes still run.
    pub async fn recompute_all(&self, cancel: &CancellationToken) -> Result<RecomputeAllReport> {
        let mut report = RecomputeAllReport::default();
        for stat in StatType::ALL {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.recompute(stat, cancel).await {
                Ok(pass) => report.passes.push(pass),
                Err(err) => {
                    warn!(stat = %stat, error = %format!("{err:#}"), "stat pass failed");
                    report.failures.push(PassFailure {
                        stat,
                        error: format!("{err:#}"),
                    });
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::{at, pipeline_at};
    use crate::SyncConfig;
    use ghscan_core::{Account, Repository, StatType};
    use tokio_util::sync::CancellationToken;

    fn repo(owner: &str, name: &str, langs: &[&str], fork: bool, stars: i64, day: u32) -> Repository {
        Repository {
            name: name.into(),
            name_with_owner: format!("{owner}/{name}"),
            updated_at: Some(at(2023, 1, day)),
            languages: langs.iter().map(|l| l.to_string()).collect(),
            is_fork: fork,
            login: owner.into(),
            stargazers: stars,
            forks: stars % 3,
            ..Default::default()
        }
    }

    fn account(login: &str, company: &str) -> Account {
        Account {
            login: login.into(),
            company: company.into(),
            created_at: Some(at(2019, 1, 1)),
            ..Default::default()
        }
    }

    async fn seeded() -> (crate::SyncPipeline, ghscan_storage::Store) {
        let (pipeline, store, _) = pipeline_at(at(2024, 1, 1), SyncConfig::default());
        let cancel = CancellationToken::new();
        store
            .accounts()
            .bulk_upsert(
                &[account("alice", "acme"), account("bob", "acme"), account("carol", "")],
                at(2024, 1, 1),
                500,
                &cancel,
            )
            .await
            .unwrap();
        store
            .repositories()
            .bulk_upsert(
                &[
                    repo("alice", "cli", &["Rust"], false, 10, 3),
                    repo("alice", "web", &["Go", "Rust"], false, 2, 9),
                    repo("bob", "fork", &["Go"], true, 50, 20),
                    repo("bob", "svc", &["Go"], false, 5, 1),
                ],
                at(2024, 1, 1),
                500,
                &cancel,
            )
            .await
            .unwrap();
        (pipeline, store)
    }

    #[tokio::test]
    async fn every_pass_writes_its_record() {
        let (pipeline, store) = seeded().await;
        let report = pipeline.recompute_all(&CancellationToken::new()).await.unwrap();
        assert!(report.failures.is_empty());
        assert_eq!(report.passes.len(), StatType::ALL.len());
        assert!(report.passes.iter().all(|p| p.written));

        let stats = store.stat_records();
        let repo_count = stats.find(StatType::RepoCount).await.unwrap();
        assert_eq!(repo_count.payload["count"], 4);

        let langs = stats.find(StatType::LanguagesMostPopular).await.unwrap();
        assert_eq!(langs.payload["languages"][0]["name"], "Go");
        assert_eq!(langs.payload["languages"][0]["count"], 2);

        let recent = stats.find(StatType::ReposMostRecent).await.unwrap();
        assert_eq!(recent.payload["repos"][0]["name"], "fork");

        let by_lang = stats.find(StatType::ReposMostRecentByLanguage).await.unwrap();
        let go = &by_lang.payload["repos"][0];
        assert_eq!(go["language"], "Go");
        assert_eq!(go["repos"].as_array().unwrap().len(), 2);
        assert_eq!(go["repos"][0]["name"], "web");

        let users_by_lang = stats.find(StatType::ReposByLanguage).await.unwrap();
        assert_eq!(users_by_lang.payload["users"][1]["language"], "Rust");
        assert_eq!(users_by_lang.payload["users"][1]["users"][0]["name"], "alice");
        assert_eq!(users_by_lang.payload["users"][1]["users"][0]["count"], 2);

        let companies = stats.find(StatType::CompanyCount).await.unwrap();
        assert_eq!(companies.payload["count"], 1);
        let grouped = stats.find(StatType::UsersByCompany).await.unwrap();
        assert_eq!(grouped.payload["users"][0]["company"], "acme");
        assert_eq!(grouped.payload["users"][0]["count"], 2);
    }

    #[tokio::test]
    async fn recomputing_twice_only_advances_updated_at() {
        let (pipeline, store) = seeded().await;
        let cancel = CancellationToken::new();
        pipeline.recompute(StatType::UserCount, &cancel).await.unwrap();
        let first = store.stat_records().find(StatType::UserCount).await.unwrap();
        pipeline.recompute(StatType::UserCount, &cancel).await.unwrap();
        let second = store.stat_records().find(StatType::UserCount).await.unwrap();
        assert_eq!(first.payload, second.payload);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.payload["count"], 3);
    }

    #[tokio::test]
    async fn empty_sources_do_not_overwrite() {
        let (pipeline, store, _) = pipeline_at(at(2024, 1, 1), SyncConfig::default());
        let cancel = CancellationToken::new();
        let report = pipeline.recompute(StatType::ReposMostStars, &cancel).await.unwrap();
        assert!(!report.written);
        assert!(store
            .stat_records()
            .find(StatType::ReposMostStars)
            .await
            .unwrap_err()
            .is_not_found());
    }
}
