//! Orchestration core: ingestion loops, analytics passes, the profile builder,
//! the similarity ranker and the cron scheduler that drives them.

pub mod analytics;
pub mod config;
pub mod ingest;
pub mod keywords;
pub mod profiles;
pub mod scheduler;
pub mod similarity;

use std::sync::Arc;

use anyhow::{Context, Result};
use ghscan_core::{Clock, SystemClock};
use ghscan_github::GithubClient;
use ghscan_storage::Store;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use analytics::{RecomputeAllReport, RecomputeReport};
pub use config::{Stage, StageSchedule, SyncConfig};
pub use ingest::{FetchAccountsReport, FetchRepositoriesReport};
pub use profiles::ProfileBuildReport;
pub use similarity::MatchReport;

pub const CRATE_NAME: &str = "ghscan-sync";

/// Outcome of one stage run, tagged with the stage that produced it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageReport {
    FetchAccounts(FetchAccountsReport),
    FetchRepositories(FetchRepositoriesReport),
    Recompute(RecomputeReport),
    RecomputeAll(RecomputeAllReport),
    BuildProfiles(ProfileBuildReport),
    RankMatches(MatchReport),
}

/// Shared handles every stage runs against. Cheap to clone.
#[derive(Clone)]
pub struct SyncPipeline {
    config: Arc<SyncConfig>,
    store: Store,
    github: GithubClient,
    clock: Arc<dyn Clock>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Store, github: GithubClient) -> Self {
        Self::with_clock(config, store, github, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: SyncConfig,
        store: Store,
        github: GithubClient,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            github,
            clock,
        }
    }

    /// Store chosen by `DATABASE_URL`: PostgreSQL when set, in-memory otherwise.
    pub async fn from_env() -> Result<Self> {
        let config = SyncConfig::from_env();
        let store = match &config.database_url {
            Some(url) => Store::postgres(url)
                .await
                .context("connecting to DATABASE_URL")?,
            None => {
                warn!("DATABASE_URL not set; using the in-memory store, nothing will persist");
                Store::memory()
            }
        };
        store.init().await.context("initialising collections")?;
        let github =
            GithubClient::from_config(config.http_config()).context("building GraphQL client")?;
        Ok(Self::new(config, store, github))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn run_stage_with(
        &self,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> Result<StageReport> {
        Ok(match stage {
            Stage::FetchAccounts => StageReport::FetchAccounts(self.fetch_accounts(cancel).await?),
            Stage::FetchRepositories => {
                StageReport::FetchRepositories(self.fetch_repositories(cancel).await?)
            }
            Stage::Recompute(stat) => StageReport::Recompute(self.recompute(stat, cancel).await?),
            Stage::BuildProfiles => StageReport::BuildProfiles(self.build_profiles(cancel).await?),
            Stage::RankMatches => StageReport::RankMatches(self.rank_matches(cancel).await?),
        })
    }

    /// Run one stage with its own cancellation token, under a `stage` span
    /// carrying a fresh run id. The configured stage timeout cancels that
    /// token; the stage then returns whatever it had committed.
    pub async fn run_stage(&self, stage: Stage) -> Result<StageReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("stage", stage = stage.name(), %run_id);
        let cancel = CancellationToken::new();

        async {
            info!("stage started");
            let run = self.run_stage_with(stage, &cancel);
            tokio::pin!(run);
            let result = match self.config.stage_timeout() {
                Some(limit) => tokio::select! {
                    res = &mut run => res,
                    _ = tokio::time::sleep(limit) => {
                        warn!(timeout_secs = limit.as_secs(), "stage timed out; cancelling");
                        cancel.cancel();
                        run.await
                    }
                },
                None => run.await,
            };
            match &result {
                Ok(_) => info!("stage finished"),
                Err(err) => warn!(error = %format!("{err:#}"), "stage failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}
