//! Incremental ingestion: accounts by creation-date window, then each stale
//! account's repositories since its newest known one.

use anyhow::{anyhow, Context, Result};
use ghscan_core::{format_date, window_end, Account, Repository, DEFAULT_START_DATE};
use ghscan_storage::{BulkReport, StoreError};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::SyncPipeline;

#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchAccountsReport {
    pub location: String,
    pub start: String,
    pub end: String,
    /// No account was stored yet, so the window opened at the launch date.
    pub default_start: bool,
    pub pages: usize,
    pub fetched: usize,
    /// Search hits without a login (organizations and the like).
    pub skipped: usize,
    pub upserted: usize,
    pub chunks: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchRepositoriesReport {
    pub accounts: usize,
    pub accounts_skipped: usize,
    pub pages: usize,
    pub fetched: usize,
    pub upserted: usize,
    pub chunks: usize,
    pub cancelled: bool,
}

/// Outcome of writing one walk's records.
enum Persisted {
    Done(BulkReport),
    Cancelled { committed: usize },
}

fn persist_outcome(result: Result<BulkReport, StoreError>) -> Result<Persisted, StoreError> {
    match result {
        Ok(report) => Ok(Persisted::Done(report)),
        Err(StoreError::Cancelled { committed }) => Ok(Persisted::Cancelled { committed }),
        Err(err) => Err(err),
    }
}

impl SyncPipeline {
    /// Pull the next creation-date window of accounts for the configured
    /// location. A walk that fails part-way still persists the pages it read
    /// before the error is returned.
    pub async fn fetch_accounts(&self, cancel: &CancellationToken) -> Result<FetchAccountsReport> {
        let accounts = self.store.accounts();
        let latest = accounts
            .latest_created_at()
            .await
            .context("reading latest account createdAt")?;
        let (start, default_start) = match latest {
            Some(created) => (format_date(created.date_naive()), false),
            None => (DEFAULT_START_DATE.to_string(), true),
        };
        let end = format_date(window_end(
            &start,
            self.config.months_window,
            self.clock.today(),
        ));

        let mut report = FetchAccountsReport {
            location: self.config.location.clone(),
            start: start.clone(),
            end: end.clone(),
            default_start,
            ..Default::default()
        };

        let walk = self
            .github
            .list_accounts(
                &self.config.location,
                &start,
                &end,
                self.config.user_page_size,
                cancel,
            )
            .await?;
        report.pages = walk.pages;
        report.cancelled = walk.is_cancelled();
        let (items, fault) = walk.into_parts();
        report.fetched = items.len();

        let records: Vec<Account> = items.into_iter().filter(|a| !a.login.is_empty()).collect();
        report.skipped = report.fetched - records.len();

        if !report.cancelled {
            let written = accounts
                .bulk_upsert(&records, self.clock.now(), self.config.per_bulk, cancel)
                .await;
            match persist_outcome(written).context("upserting accounts")? {
                Persisted::Done(bulk) => {
                    report.upserted = bulk.records;
                    report.chunks = bulk.chunks;
                }
                Persisted::Cancelled { committed } => {
                    report.cancelled = true;
                    report.chunks = committed;
                }
            }
        }

        if let Some(err) = fault {
            return Err(anyhow!(err).context(format!(
                "account walk {start}..{end} failed after {} page(s); {} account(s) kept",
                report.pages, report.upserted
            )));
        }

        info!(
            start = %report.start,
            end = %report.end,
            fetched = report.fetched,
            upserted = report.upserted,
            cancelled = report.cancelled,
            "accounts fetched"
        );
        Ok(report)
    }

    /// Refresh repositories for the `user_page_size` least recently fetched
    /// accounts. The first hard failure aborts the batch; that account keeps
    /// its previous `fetchedAt`.
    pub async fn fetch_repositories(
        &self,
        cancel: &CancellationToken,
    ) -> Result<FetchRepositoriesReport> {
        let accounts = self.store.accounts();
        let repos = self.store.repositories();
        let batch = accounts
            .find_stale(self.config.user_page_size)
            .await
            .context("selecting stale accounts")?;

        let mut report = FetchRepositoriesReport::default();
        for account in batch {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let login = account.login.trim();
            if login.is_empty() {
                report.accounts_skipped += 1;
                continue;
            }

            let start = repos
                .latest_created_at_for(login)
                .await
                .with_context(|| format!("reading latest repository for {login}"))?
                .map(|created| format_date(created.date_naive()))
                .unwrap_or_else(|| DEFAULT_START_DATE.to_string());
            let end = format_date(self.clock.today());

            let walk = self
                .github
                .list_repositories(login, &start, &end, self.config.repo_page_size, cancel)
                .await
                .with_context(|| format!("listing repositories for {login}"))?;
            report.pages += walk.pages;
            if walk.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let (items, fault) = walk.into_parts();
            report.fetched += items.len();
            let records: Vec<Repository> = items
                .into_iter()
                .filter(|r| !r.name_with_owner.is_empty())
                .collect();

            let written = repos
                .bulk_upsert(&records, self.clock.now(), self.config.per_bulk, cancel)
                .await;
            match persist_outcome(written)
                .with_context(|| format!("upserting repositories for {login}"))?
            {
                Persisted::Done(bulk) => {
                    report.upserted += bulk.records;
                    report.chunks += bulk.chunks;
                }
                Persisted::Cancelled { committed } => {
                    report.chunks += committed;
                    report.cancelled = true;
                    break;
                }
            }

            if let Some(err) = fault {
                warn!(login, error = %err, "repository walk failed; aborting batch");
                return Err(anyhow!(err).context(format!(
                    "repository walk for {login} ({start}..{end}) failed"
                )));
            }

            accounts
                .mark_fetched(login, self.clock.now())
                .await
                .with_context(|| format!("marking {login} fetched"))?;
            report.accounts += 1;
        }

        info!(
            accounts = report.accounts,
            fetched = report.fetched,
            upserted = report.upserted,
            cancelled = report.cancelled,
            "repositories fetched"
        );
        Ok(report)
    }
}
