//! Search query builders and the response projections they decode into.

use chrono::{DateTime, Utc};
use ghscan_core::{Account, Repository};
use serde::Deserialize;

/// Languages requested per repository node.
pub const LANGUAGES_PER_REPO: usize = 20;

const USER_FIELDS: &str = r#"... on User {
          login
          name
          createdAt
          updatedAt
          bio
          location
          email
          company
          avatarUrl
          websiteUrl
          repositories { totalCount }
          gists { totalCount }
          followers { totalCount }
          following { totalCount }
        }"#;

fn repo_fields() -> String {
    format!(
        r#"... on Repository {{
          name
          nameWithOwner
          createdAt
          updatedAt
          description
          languages(first: {LANGUAGES_PER_REPO}) {{ edges {{ node {{ name }} }} }}
          homepageUrl
          forkCount
          isFork
          owner {{ login avatarUrl }}
          stargazers {{ totalCount }}
          watchers {{ totalCount }}
          url
        }}"#
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchType {
    User,
    Repository,
}

impl SearchType {
    fn as_str(&self) -> &'static str {
        match self {
            SearchType::User => "USER",
            SearchType::Repository => "REPOSITORY",
        }
    }
}

/// One page of a `search` connection. String arguments are JSON-escaped.
pub fn search_query(
    kind: SearchType,
    filter: &str,
    page_size: usize,
    after: Option<&str>,
) -> String {
    let search = serde_json::Value::from(filter).to_string();
    let after = match after {
        Some(cursor) => serde_json::Value::from(cursor).to_string(),
        None => "null".to_string(),
    };
    let fields = match kind {
        SearchType::User => USER_FIELDS.to_string(),
        SearchType::Repository => repo_fields(),
    };
    format!(
        r#"query {{
  search(query: {search}, type: {kind}, first: {first}, after: {after}) {{
    pageInfo {{ hasNextPage endCursor }}
    edges {{
      node {{
        {fields}
      }}
    }}
  }}
}}"#,
        kind = kind.as_str(),
        first = page_size.max(1),
    )
}

pub fn accounts_filter(location: &str, start: &str, end: &str) -> String {
    format!("location:{location} created:{start}..{end}")
}

pub fn repositories_filter(login: &str, start: &str, end: &str) -> String {
    format!("user:{login} created:{start}..{end}")
}

#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<N> {
    pub data: Option<SearchData<N>>,
    #[serde(default)]
    pub errors: Vec<ErrorMessage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorMessage {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchData<N> {
    pub search: Search<N>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Search<N> {
    pub page_info: PageInfo,
    #[serde(default = "Vec::new")]
    pub edges: Vec<Edge<N>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PageInfo {
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Edge<N> {
    pub node: N,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TotalCount {
    #[serde(default)]
    total_count: i64,
}

#[derive(Debug, Default, Deserialize)]
struct NamedNode {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct LanguageEdge {
    node: NamedNode,
}

#[derive(Debug, Default, Deserialize)]
struct LanguageConnection {
    #[serde(default)]
    edges: Vec<LanguageEdge>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Owner {
    #[serde(default)]
    login: String,
    avatar_url: Option<String>,
}

/// `... on User` projection. Non-user search hits decode to an empty node.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserNode {
    login: String,
    name: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    bio: Option<String>,
    location: Option<String>,
    email: Option<String>,
    company: Option<String>,
    avatar_url: Option<String>,
    website_url: Option<String>,
    repositories: Option<TotalCount>,
    gists: Option<TotalCount>,
    followers: Option<TotalCount>,
    following: Option<TotalCount>,
}

fn total(c: Option<TotalCount>) -> i64 {
    c.map(|c| c.total_count).unwrap_or(0)
}

impl From<UserNode> for Account {
    fn from(n: UserNode) -> Self {
        Account {
            login: n.login,
            name: n.name.unwrap_or_default(),
            created_at: n.created_at,
            updated_at: n.updated_at,
            fetched_at: None,
            bio: n.bio.unwrap_or_default(),
            location: n.location.unwrap_or_default(),
            email: n.email.unwrap_or_default(),
            company: n.company.unwrap_or_default(),
            avatar_url: n.avatar_url.unwrap_or_default(),
            website_url: n.website_url.unwrap_or_default(),
            repositories: total(n.repositories),
            gists: total(n.gists),
            followers: total(n.followers),
            following: total(n.following),
            profile: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepositoryNode {
    name: String,
    name_with_owner: String,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    description: Option<String>,
    languages: Option<LanguageConnection>,
    homepage_url: Option<String>,
    fork_count: i64,
    is_fork: bool,
    owner: Option<Owner>,
    stargazers: Option<TotalCount>,
    watchers: Option<TotalCount>,
    url: Option<String>,
}

impl From<RepositoryNode> for Repository {
    fn from(n: RepositoryNode) -> Self {
        let mut languages: Vec<String> = Vec::new();
        for edge in n.languages.map(|c| c.edges).unwrap_or_default() {
            if !edge.node.name.is_empty() && !languages.contains(&edge.node.name) {
                languages.push(edge.node.name);
            }
        }
        let owner = n.owner.unwrap_or_default();
        Repository {
            name: n.name,
            name_with_owner: n.name_with_owner,
            created_at: n.created_at,
            updated_at: n.updated_at,
            description: n.description.unwrap_or_default(),
            languages,
            homepage_url: n.homepage_url.unwrap_or_default(),
            forks: n.fork_count,
            is_fork: n.is_fork,
            login: owner.login,
            avatar_url: owner.avatar_url.unwrap_or_default(),
            stargazers: total(n.stargazers),
            watchers: total(n.watchers),
            url: n.url.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn account_search_query_shape() {
        let q = search_query(
            SearchType::User,
            &accounts_filter("Malaysia", "2020-06-01", "2020-08-30"),
            30,
            None,
        );
        assert!(q.contains(r#"search(query: "location:Malaysia created:2020-06-01..2020-08-30", type: USER, first: 30, after: null)"#));
        assert!(q.contains("pageInfo { hasNextPage endCursor }"));
        assert!(q.contains("followers { totalCount }"));
    }

    #[test]
    fn repository_query_escapes_cursor() {
        let q = search_query(
            SearchType::Repository,
            &repositories_filter("alice", "2008-04-01", "2024-01-01"),
            50,
            Some("Y3Vy\"c29y"),
        );
        assert!(q.contains(r#"type: REPOSITORY, first: 50, after: "Y3Vy\"c29y")"#));
        assert!(q.contains("user:alice created:2008-04-01..2024-01-01"));
        assert!(q.contains("forkCount"));
    }

    #[test]
    fn user_node_maps_nulls_to_defaults() {
        let node: UserNode = serde_json::from_value(json!({
            "login": "alice",
            "name": null,
            "createdAt": "2020-06-01T10:00:00Z",
            "company": "acme",
            "followers": {"totalCount": 12}
        }))
        .unwrap();
        let account = Account::from(node);
        assert_eq!(account.login, "alice");
        assert_eq!(account.name, "");
        assert_eq!(account.company, "acme");
        assert_eq!(account.followers, 12);
        assert_eq!(account.gists, 0);
        assert!(account.created_at.is_some());
    }

    #[test]
    fn repository_node_dedupes_languages_in_order() {
        let node: RepositoryNode = serde_json::from_value(json!({
            "name": "cli",
            "nameWithOwner": "alice/cli",
            "languages": {"edges": [
                {"node": {"name": "Rust"}},
                {"node": {"name": "Shell"}},
                {"node": {"name": "Rust"}}
            ]},
            "forkCount": 3,
            "isFork": true,
            "owner": {"login": "alice", "avatarUrl": "https://a"},
            "stargazers": {"totalCount": 7},
            "watchers": {"totalCount": 2}
        }))
        .unwrap();
        let repo = Repository::from(node);
        assert_eq!(repo.languages, vec!["Rust", "Shell"]);
        assert_eq!(repo.forks, 3);
        assert!(repo.is_fork);
        assert_eq!(repo.login, "alice");
        assert_eq!(repo.stargazers, 7);
        assert_eq!(repo.watchers, 2);
    }

    #[test]
    fn non_user_hits_decode_to_empty_nodes() {
        let node: UserNode = serde_json::from_value(json!({})).unwrap();
        assert_eq!(Account::from(node).login, "");
    }

    #[test]
    fn search_without_edges_decodes_as_empty_page() {
        let envelope: Envelope<UserNode> = serde_json::from_value(json!({
            "data": { "search": { "pageInfo": { "hasNextPage": false, "endCursor": null } } }
        }))
        .unwrap();
        let search = envelope.data.unwrap().search;
        assert!(search.edges.is_empty());
        assert!(!search.page_info.has_next_page);
    }
}
