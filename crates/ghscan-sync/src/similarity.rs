//! Pairwise user similarity and bounded top-K match lists.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use ghscan_core::{partition, Account, UserRef};
use ghscan_storage::StoreError;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::SyncPipeline;

#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchReport {
    pub candidates: usize,
    pub ranked: usize,
    pub written: usize,
    pub chunks: usize,
    pub cancelled: bool,
}

/// The comparable part of an account with a profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Features {
    pub login: String,
    pub avatar_url: String,
    /// repositories, gists, followers, following, watchers, stargazers, forks
    pub counts: [i64; 7],
    pub languages: HashMap<String, i64>,
    pub keywords: HashMap<String, i64>,
}

impl From<&Account> for Features {
    fn from(a: &Account) -> Self {
        let profile = a.profile.clone().unwrap_or_default();
        Features {
            login: a.login.clone(),
            avatar_url: a.avatar_url.clone(),
            counts: [
                a.repositories,
                a.gists,
                a.followers,
                a.following,
                profile.watchers,
                profile.stargazers,
                profile.forks,
            ],
            languages: profile
                .languages
                .into_iter()
                .map(|l| (l.name, l.count))
                .collect(),
            keywords: profile
                .keywords
                .into_iter()
                .map(|k| (k.id, k.value))
                .collect(),
        }
    }
}

fn sq(a: i64, b: i64) -> f64 {
    let d = (a - b) as f64;
    d * d
}

fn shared_sq(a: &HashMap<String, i64>, b: &HashMap<String, i64>) -> f64 {
    a.iter()
        .filter_map(|(key, x)| b.get(key).map(|y| sq(*x, *y)))
        .sum()
}

/// `1 / (1 + euclidean distance)` over the counts plus the languages and
/// keywords both sides share. Symmetric, in `(0, 1]`, and 1 for identical
/// features.
pub fn score(a: &Features, b: &Features) -> f64 {
    let counts: f64 = a.counts.iter().zip(b.counts.iter()).map(|(x, y)| sq(*x, *y)).sum();
    let sum_sq = counts + shared_sq(&a.languages, &b.languages) + shared_sq(&a.keywords, &b.keywords);
    1.0 / (1.0 + sum_sq.sqrt())
}

/// Heap entry ordered by score, then by insertion (earlier ranks higher).
#[derive(Debug, Clone, Copy)]
struct Candidate {
    score: f64,
    seq: usize,
    index: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Top `k` matches for `users[i]`, best first. Uses a min-heap of size `k`;
/// a candidate replaces the current minimum only with a strictly higher
/// score. `users[i]` itself is never a candidate.
pub fn top_k(users: &[Features], i: usize, k: usize) -> Vec<UserRef> {
    if k == 0 {
        return Vec::new();
    }
    let me = &users[i];
    let mut heap: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(k + 1);
    let mut seq = 0usize;
    for (j, other) in users.iter().enumerate() {
        if j == i {
            continue;
        }
        let candidate = Candidate {
            score: score(me, other),
            seq,
            index: j,
        };
        seq += 1;
        if heap.len() < k {
            heap.push(Reverse(candidate));
        } else if let Some(Reverse(min)) = heap.peek() {
            if candidate.score > min.score {
                heap.pop();
                heap.push(Reverse(candidate));
            }
        }
    }

    let mut best: Vec<Candidate> = heap.into_iter().map(|Reverse(c)| c).collect();
    best.sort_by(|a, b| b.cmp(a));
    best.truncate(k);
    best.into_iter()
        .map(|c| {
            let u = &users[c.index];
            UserRef {
                login: u.login.clone(),
                avatar_url: u.avatar_url.clone(),
                score: c.score,
            }
        })
        .collect()
}

/// Rank `users[range]` against everyone; stops early once cancelled.
fn rank_range(
    users: &[Features],
    range: std::ops::Range<usize>,
    k: usize,
    cancel: &CancellationToken,
) -> Vec<(String, Vec<UserRef>)> {
    let mut out = Vec::with_capacity(range.len());
    for i in range {
        if cancel.is_cancelled() {
            break;
        }
        out.push((users[i].login.clone(), top_k(users, i, k)));
    }
    out
}

impl SyncPipeline {
    /// Rank every profiled account against the others and store the top
    /// `k_matches`. Work is sharded across `workers` blocking tasks; a
    /// cancelled run writes nothing.
    pub async fn rank_matches(&self, cancel: &CancellationToken) -> Result<MatchReport> {
        let accounts = self.store.accounts();
        let profiled = accounts
            .with_profiles()
            .await
            .context("loading profiled accounts")?;
        let users: Arc<Vec<Features>> = Arc::new(profiled.iter().map(Features::from).collect());
        let mut report = MatchReport {
            candidates: users.len(),
            ..Default::default()
        };

        let shard = users.len().div_ceil(self.config.workers.max(1)).max(1);
        let mut tasks = Vec::new();
        for range in partition(shard, users.len()) {
            let users = users.clone();
            let cancel = cancel.clone();
            let k = self.config.k_matches;
            tasks.push(tokio::task::spawn_blocking(move || {
                rank_range(&users, range, k, &cancel)
            }));
        }

        let mut matches: Vec<(String, Vec<UserRef>)> = Vec::with_capacity(users.len());
        for task in tasks {
            matches.extend(task.await.context("similarity shard panicked")?);
        }
        report.ranked = matches.len();

        if cancel.is_cancelled() {
            report.cancelled = true;
            info!(ranked = report.ranked, "match ranking cancelled; nothing written");
            return Ok(report);
        }

        match accounts
            .update_matches(&matches, self.clock.now(), self.config.per_bulk, cancel)
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
            Err(err) => return Err(err).context("writing matches"),
        }

        info!(
            candidates = report.candidates,
            written = report.written,
            "matches ranked"
        );
        Ok(report)
    }
}
