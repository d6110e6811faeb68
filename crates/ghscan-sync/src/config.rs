//! Runtime configuration read from the environment, and the stage catalog.

use std::time::Duration;

use ghscan_core::{StatType, K_KEYWORDS, K_LANGUAGES, K_MATCHES, PER_BULK};
use ghscan_github::{HttpClientConfig, DEFAULT_ENDPOINT};
use serde::Serialize;

/// A schedulable unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    FetchAccounts,
    FetchRepositories,
    Recompute(StatType),
    BuildProfiles,
    RankMatches,
}

impl Stage {
    pub fn all() -> Vec<Stage> {
        let mut stages = vec![Stage::FetchAccounts, Stage::FetchRepositories];
        stages.extend(StatType::ALL.into_iter().map(Stage::Recompute));
        stages.push(Stage::BuildProfiles);
        stages.push(Stage::RankMatches);
        stages
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::FetchAccounts => "fetch_accounts",
            Stage::FetchRepositories => "fetch_repositories",
            Stage::Recompute(stat) => stat.as_str(),
            Stage::BuildProfiles => "build_profiles",
            Stage::RankMatches => "rank_matches",
        }
    }

    /// Six-field crontab (seconds first) used when `CRON_<STAGE>` is unset.
    fn default_cron(&self) -> &'static str {
        match self {
            Stage::FetchAccounts => "0 */10 * * * *",
            Stage::FetchRepositories => "0 */5 * * * *",
            Stage::Recompute(_) => "0 0 * * * *",
            Stage::BuildProfiles => "0 30 */6 * * *",
            Stage::RankMatches => "0 45 */6 * * *",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSchedule {
    pub stage: Stage,
    pub cron: String,
    /// Run once right away in addition to the crontab.
    pub trigger: bool,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub graphql_url: String,
    pub token: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_pool_idle: usize,
    pub location: String,
    pub months_window: u32,
    pub user_page_size: usize,
    pub repo_page_size: usize,
    pub per_bulk: usize,
    pub k_matches: usize,
    pub k_keywords: usize,
    pub k_languages: usize,
    pub stats_limit: usize,
    pub company_min_users: usize,
    pub workers: usize,
    pub stage_timeout_secs: Option<u64>,
    pub schedules: Vec<StageSchedule>,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn truthy(v: &str) -> bool {
    matches!(v, "1" | "true" | "TRUE" | "True" | "yes")
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparseable values fall back to
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str, default: usize| {
            lookup(key)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(default)
        };

        let schedules = Stage::all()
            .into_iter()
            .map(|stage| {
                let key = stage.name().to_ascii_uppercase();
                StageSchedule {
                    stage,
                    cron: string(&format!("CRON_{key}"), stage.default_cron()),
                    trigger: lookup(&format!("TRIGGER_{key}"))
                        .map(|v| truthy(&v))
                        .unwrap_or(false),
                }
            })
            .collect();

        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            graphql_url: string("GITHUB_GRAPHQL_URL", DEFAULT_ENDPOINT),
            token: string("GITHUB_TOKEN", ""),
            user_agent: string("GHSCAN_USER_AGENT", "ghscan/0.1"),
            http_timeout_secs: number("GHSCAN_HTTP_TIMEOUT_SECS", 5) as u64,
            http_pool_idle: number("GHSCAN_HTTP_POOL_IDLE", 4),
            location: string("GHSCAN_LOCATION", "Malaysia"),
            months_window: number("GHSCAN_MONTHS_WINDOW", 6) as u32,
            user_page_size: number("GHSCAN_USER_PAGE_SIZE", 30).max(1),
            repo_page_size: number("GHSCAN_REPO_PAGE_SIZE", 30).max(1),
            per_bulk: number("GHSCAN_PER_BULK", PER_BULK).max(1),
            k_matches: number("GHSCAN_K_MATCHES", K_MATCHES),
            k_keywords: number("GHSCAN_K_KEYWORDS", K_KEYWORDS),
            k_languages: number("GHSCAN_K_LANGUAGES", K_LANGUAGES),
            stats_limit: number("GHSCAN_STATS_LIMIT", 20),
            company_min_users: number("GHSCAN_COMPANY_MIN_USERS", 2),
            workers: number("GHSCAN_WORKERS", 4).max(1),
            stage_timeout_secs: lookup("GHSCAN_STAGE_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .filter(|secs| *secs > 0),
            schedules,
            web_port: lookup("GHSCAN_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            endpoint: self.graphql_url.clone(),
            token: self.token.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            pool_idle_per_host: self.http_pool_idle,
            ..Default::default()
        }
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.database_url, None);
        assert_eq!(config.graphql_url, "https://api.github.com/graphql");
        assert_eq!(config.location, "Malaysia");
        assert_eq!(config.months_window, 6);
        assert_eq!(config.per_bulk, 500);
        assert_eq!(config.k_matches, 20);
        assert_eq!(config.http_timeout_secs, 5);
        assert_eq!(config.stage_timeout(), None);
        assert_eq!(config.schedules.len(), Stage::all().len());
        assert!(config.schedules.iter().all(|s| !s.trigger));
    }

    #[test]
    fn overrides_and_bad_values() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/ghscan"),
            ("GHSCAN_MONTHS_WINDOW", "3"),
            ("GHSCAN_WORKERS", "0"),
            ("GHSCAN_PER_BULK", "lots"),
            ("GHSCAN_STAGE_TIMEOUT_SECS", "90"),
            ("CRON_USER_COUNT", "0 */1 * * * *"),
            ("TRIGGER_FETCH_ACCOUNTS", "true"),
        ]));
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/ghscan"));
        assert_eq!(config.months_window, 3);
        assert_eq!(config.workers, 1);
        assert_eq!(config.per_bulk, 500);
        assert_eq!(config.stage_timeout(), Some(Duration::from_secs(90)));

        let user_count = config
            .schedules
            .iter()
            .find(|s| s.stage == Stage::Recompute(StatType::UserCount))
            .unwrap();
        assert_eq!(user_count.cron, "0 */1 * * * *");
        let fetch = config
            .schedules
            .iter()
            .find(|s| s.stage == Stage::FetchAccounts)
            .unwrap();
        assert!(fetch.trigger);
    }
}
