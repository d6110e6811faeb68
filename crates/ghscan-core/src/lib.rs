//! Core domain model for ghscan: accounts, repositories, precomputed stats and
//! the small pure helpers (clock, partitioner) every stage shares.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ghscan-core";

/// Public launch date of the platform; lower bound of every date window.
pub const DEFAULT_START_DATE: &str = "2008-04-01";
pub const PER_BULK: usize = 500;
pub const K_MATCHES: usize = 20;
pub const K_KEYWORDS: usize = 20;
pub const K_LANGUAGES: usize = 20;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Upstream account. Natural key: `login`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub login: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub website_url: String,
    #[serde(default)]
    pub repositories: i64,
    #[serde(default)]
    pub gists: i64,
    #[serde(default)]
    pub followers: i64,
    #[serde(default)]
    pub following: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
}

impl Account {
    pub fn has_profile(&self) -> bool {
        self.profile.as_ref().is_some_and(|p| !p.is_empty())
    }
}

/// Upstream repository. Natural key: `nameWithOwner`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    #[serde(default)]
    pub name: String,
    pub name_with_owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: String,
    /// Distinct language names in upstream order.
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub homepage_url: String,
    #[serde(default)]
    pub forks: i64,
    #[serde(default)]
    pub is_fork: bool,
    /// Owner login.
    #[serde(default)]
    pub login: String,
    /// Owner avatar.
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub stargazers: i64,
    #[serde(default)]
    pub watchers: i64,
    #[serde(default)]
    pub url: String,
}

/// Per-account aggregates embedded on the account record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default)]
    pub watchers: i64,
    #[serde(default)]
    pub stargazers: i64,
    #[serde(default)]
    pub forks: i64,
    #[serde(default)]
    pub languages: Vec<LanguageCount>,
    #[serde(default)]
    pub keywords: Vec<Keyword>,
    #[serde(default)]
    pub matches: Vec<UserRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Profile {
    /// A profile with nothing to compare on does not take part in ranking.
    pub fn is_empty(&self) -> bool {
        self.watchers == 0
            && self.stargazers == 0
            && self.forks == 0
            && self.languages.is_empty()
            && self.keywords.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LanguageCount {
    pub name: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCount {
    /// Login of the counted user.
    pub name: String,
    pub count: i64,
    #[serde(default)]
    pub avatar_url: String,
}

/// Description keyword with its occurrence count.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Keyword {
    pub id: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub login: String,
    #[serde(default)]
    pub avatar_url: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageRepos {
    pub language: String,
    pub repos: Vec<Repository>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageUsers {
    pub language: String,
    pub users: Vec<UserCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyUsers {
    pub company: String,
    pub count: i64,
    pub users: Vec<CompanyMember>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyMember {
    pub login: String,
    #[serde(default)]
    pub avatar_url: String,
}

/// Identifier of a precomputed analytics record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatType {
    UserCount,
    RepoCount,
    ReposMostRecent,
    RepoCountByUser,
    ReposMostStars,
    ReposMostForks,
    LanguagesMostPopular,
    ReposMostRecentByLanguage,
    ReposByLanguage,
    CompanyCount,
    UsersByCompany,
}

impl StatType {
    pub const ALL: [StatType; 11] = [
        StatType::UserCount,
        StatType::RepoCount,
        StatType::ReposMostRecent,
        StatType::RepoCountByUser,
        StatType::ReposMostStars,
        StatType::ReposMostForks,
        StatType::LanguagesMostPopular,
        StatType::ReposMostRecentByLanguage,
        StatType::ReposByLanguage,
        StatType::CompanyCount,
        StatType::UsersByCompany,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatType::UserCount => "user_count",
            StatType::RepoCount => "repo_count",
            StatType::ReposMostRecent => "repos_most_recent",
            StatType::RepoCountByUser => "repo_count_by_user",
            StatType::ReposMostStars => "repos_most_stars",
            StatType::ReposMostForks => "repos_most_forks",
            StatType::LanguagesMostPopular => "languages_most_popular",
            StatType::ReposMostRecentByLanguage => "repos_most_recent_by_language",
            StatType::ReposByLanguage => "repos_by_language",
            StatType::CompanyCount => "company_count",
            StatType::UsersByCompany => "users_by_company",
        }
    }
}

impl fmt::Display for StatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown stat type: {0}")]
pub struct UnknownStatType(pub String);

impl FromStr for StatType {
    type Err = UnknownStatType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StatType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownStatType(s.to_string()))
    }
}

/// Payload shapes of the stat records. Serialized flat next to `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatPayload {
    Count { count: i64 },
    Repos { repos: Vec<Repository> },
    Users { users: Vec<UserCount> },
    Languages { languages: Vec<LanguageCount> },
    ReposByLanguage { repos: Vec<LanguageRepos> },
    UsersByLanguage { users: Vec<LanguageUsers> },
    UsersByCompany { users: Vec<CompanyUsers> },
}

impl StatPayload {
    /// Empty payloads never overwrite a stored record.
    pub fn is_empty(&self) -> bool {
        match self {
            StatPayload::Count { count } => *count == 0,
            StatPayload::Repos { repos } => repos.is_empty(),
            StatPayload::Users { users } => users.is_empty(),
            StatPayload::Languages { languages } => languages.is_empty(),
            StatPayload::ReposByLanguage { repos } => repos.is_empty(),
            StatPayload::UsersByLanguage { users } => users.is_empty(),
            StatPayload::UsersByCompany { users } => users.is_empty(),
        }
    }
}

/// Source of wall-clock time, injected so stages are deterministic under test.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).ok()
}

/// RFC3339 at second precision so stored timestamps sort lexicographically.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// End of a `months`-long window (30-day months) starting at `start`, clamped
/// to `today`. An unparseable start, or an end past the calendar's range,
/// yields `today`.
pub fn window_end(start: &str, months: u32, today: NaiveDate) -> NaiveDate {
    let Some(start) = parse_date(start) else {
        return today;
    };
    start
        .checked_add_signed(Duration::days(i64::from(months) * 30))
        .map_or(today, |end| end.min(today))
}

/// Split `0..n` into contiguous ranges of at most `per` items.
pub fn partition(per: usize, n: usize) -> Vec<Range<usize>> {
    let per = per.max(1);
    (0..n)
        .step_by(per)
        .map(|start| start..(start + per).min(n))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn partition_covers_input_exactly_once() {
        for (per, n) in [(500, 1337), (3, 9), (4, 1), (10, 0), (1, 5), (7, 7)] {
            let chunks = partition(per, n);
            if n == 0 {
                assert!(chunks.is_empty());
                continue;
            }
            assert_eq!(chunks.first().unwrap().start, 0);
            assert_eq!(chunks.last().unwrap().end, n);
            for pair in chunks.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
            assert!(chunks.iter().all(|c| c.len() <= per && !c.is_empty()));
        }
    }

    #[test]
    fn partition_of_1337_by_500() {
        let sizes: Vec<usize> = partition(PER_BULK, 1337).iter().map(|r| r.len()).collect();
        assert_eq!(sizes, vec![500, 500, 337]);
    }

    #[test]
    fn window_end_adds_thirty_day_months() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert_eq!(format_date(window_end("2020-06-01", 3, today)), "2020-08-30");
    }

    #[test]
    fn window_end_clamps_to_today_and_handles_garbage() {
        let today = NaiveDate::from_ymd_opt(2020, 7, 4).unwrap();
        assert_eq!(window_end("2020-06-01", 3, today), today);
        assert_eq!(window_end("not-a-date", 3, today), today);
    }

    #[test]
    fn window_end_survives_huge_month_counts() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert_eq!(window_end("2020-06-01", 4_000_000, today), today);
        assert_eq!(window_end("2020-06-01", u32::MAX, today), today);
    }

    #[test]
    fn stat_type_names_round_trip() {
        for t in StatType::ALL {
            assert_eq!(t.as_str().parse::<StatType>(), Ok(t));
            assert_eq!(serde_json::to_value(t).unwrap(), serde_json::json!(t.as_str()));
        }
        assert!("nope".parse::<StatType>().is_err());
    }

    #[test]
    fn account_without_profile_omits_it_when_serialized() {
        let account = Account {
            login: "alice".into(),
            created_at: Some(Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        };
        let value = serde_json::to_value(&account).unwrap();
        assert!(value.get("profile").is_none());
        assert!(value.get("fetchedAt").is_none());
        assert_eq!(value["createdAt"], "2020-06-01T00:00:00Z");
    }

    #[test]
    fn timestamp_is_second_precision_utc() {
        let at = Utc.with_ymd_and_hms(2021, 2, 3, 4, 5, 6).unwrap();
        assert_eq!(timestamp(at), "2021-02-03T04:05:06Z");
    }

    #[test]
    fn stat_payload_serializes_flat() {
        let payload = StatPayload::Count { count: 3 };
        assert_eq!(serde_json::to_value(&payload).unwrap(), serde_json::json!({"count": 3}));
        assert!(StatPayload::Repos { repos: vec![] }.is_empty());
    }
}
