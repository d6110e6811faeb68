//! Per-owner profile builder.
//!
//! Repository aggregates for every owner are read in one grouped pass. A
//! producer then feeds owners through a single-slot channel to `W` workers;
//! each worker turns one owner into a profile and hands it to the collector.
//! Every send, receive and unit of work races the cancellation token. The
//! collected profiles are written in one bulk update only when the whole run
//! completed.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ghscan_core::Profile;
use ghscan_storage::{OwnerRepos, StoreError};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::keywords::top_keywords;
use crate::SyncPipeline;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileBuildReport {
    pub owners: usize,
    pub built: usize,
    /// Profiles written onto existing accounts.
    pub written: usize,
    pub chunks: usize,
    pub cancelled: bool,
}

/// Profile for one owner; `languages` already hold the top `k_languages`.
pub fn build_profile(owner: &OwnerRepos, k_keywords: usize, now: DateTime<Utc>) -> Profile {
    Profile {
        watchers: owner.totals.watchers,
        stargazers: owner.totals.stargazers,
        forks: owner.totals.forks,
        languages: owner.languages.clone(),
        keywords: top_keywords(&owner.descriptions, k_keywords),
        matches: Vec::new(),
        updated_at: Some(now),
        created_at: None,
    }
}

/// Results collected by [`fan_out`], in completion order.
pub(crate) struct FanOut<T> {
    pub results: Vec<(String, T)>,
    pub cancelled: bool,
}

/// Run `work` over keyed items on `workers` tasks fed by a single-slot
/// channel. Stops at the first failing item, returning its key, or when
/// `cancel` fires, returning what was collected so far. Every task has been
/// joined when this returns.
pub(crate) async fn fan_out<I, T, E, F, Fut>(
    items: Vec<(String, I)>,
    workers: usize,
    cancel: &CancellationToken,
    work: F,
) -> Result<FanOut<T>, (String, E)>
where
    I: Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    F: Fn(String, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    let workers = workers.max(1);
    // Stops producer and workers early on a failure without touching the
    // caller's token.
    let run = cancel.child_token();
    let work = Arc::new(work);

    let (item_tx, item_rx) = mpsc::channel::<(String, I)>(1);
    let item_rx = Arc::new(Mutex::new(item_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<(String, Result<T, E>)>(workers);

    let producer = {
        let run = run.clone();
        tokio::spawn(async move {
            for item in items {
                tokio::select! {
                    biased;
                    _ = run.cancelled() => break,
                    sent = item_tx.send(item) => if sent.is_err() { break },
                }
            }
        })
    };

    let mut pool = JoinSet::new();
    for worker in 0..workers {
        let item_rx = item_rx.clone();
        let result_tx = result_tx.clone();
        let run = run.clone();
        let work = work.clone();
        pool.spawn(async move {
            loop {
                let next = {
                    let mut rx = item_rx.lock().await;
                    tokio::select! {
                        biased;
                        _ = run.cancelled() => None,
                        item = rx.recv() => item,
                    }
                };
                let Some((key, item)) = next else { break };
                let done = tokio::select! {
                    biased;
                    _ = run.cancelled() => break,
                    done = (*work)(key.clone(), item) => done,
                };
                debug!(worker, key = %key, ok = done.is_ok(), "item processed");
                tokio::select! {
                    biased;
                    _ = run.cancelled() => break,
                    sent = result_tx.send((key, done)) => if sent.is_err() { break },
                }
            }
        });
    }
    drop(result_tx);

    let mut out = FanOut {
        results: Vec::new(),
        cancelled: false,
    };
    let mut failure = None;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                out.cancelled = true;
                break;
            }
            msg = result_rx.recv() => match msg {
                Some((key, Ok(value))) => out.results.push((key, value)),
                Some((key, Err(err))) => {
                    failure = Some((key, err));
                    break;
                }
                None => break,
            },
        }
    }

    run.cancel();
    drop(result_rx);
    while let Some(joined) = pool.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "fan-out worker ended abnormally");
        }
    }
    if let Err(err) = producer.await {
        warn!(error = %err, "fan-out producer ended abnormally");
    }

    match failure {
        Some(failed) => Err(failed),
        None => Ok(out),
    }
}

impl SyncPipeline {
    pub async fn build_profiles(&self, cancel: &CancellationToken) -> Result<ProfileBuildReport> {
        let owners = self
            .store
            .repositories()
            .owner_summaries(self.config.k_languages)
            .await
            .context("aggregating repositories per owner")?;
        let now = self.clock.now();
        let mut report = ProfileBuildReport {
            owners: owners.len(),
            ..Default::default()
        };

        let k_keywords = self.config.k_keywords;
        let gathered = fan_out(owners, self.config.workers, cancel, move |_, owner| async move {
            Ok::<_, Infallible>(build_profile(&owner, k_keywords, now))
        })
        .await;
        let gathered = match gathered {
            Ok(gathered) => gathered,
            Err((_, never)) => match never {},
        };

        report.built = gathered.results.len();
        if gathered.cancelled {
            report.cancelled = true;
            info!(built = report.built, "profile build cancelled; nothing written");
            return Ok(report);
        }

        match self
            .store
            .accounts()
            .update_profiles(&gathered.results, now, self.config.per_bulk, cancel)
            .await
        {
            Ok(bulk) => {
                report.written = bulk.records;
                report.chunks = bulk.chunks;
            }
            Err(StoreError::Cancelled { committed }) => {
                report.cancelled = true;
                report.chunks = committed;
            }
            Err(err) => return Err(err).context("writing profiles"),
        }

        info!(
            owners = report.owners,
            built = report.built,
            written = report.written,
            "profiles built"
        );
        Ok(report)
    }
}
