//! GraphQL client for the upstream code-hosting platform: transport, search
//! queries and cursor-paged account/repository listings.

pub mod paginate;
pub mod query;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ghscan_core::{Account, Repository};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use paginate::{walk, CursorWalk, WalkEnd};
pub use query::{search_query, SearchType};

pub const CRATE_NAME: &str = "ghscan-github";

pub const DEFAULT_ENDPOINT: &str = "https://api.github.com/graphql";

#[derive(Debug, Error)]
pub enum GithubError {
    #[error("start date is required")]
    StartFieldRequired,
    #[error("end date is required")]
    EndFieldRequired,
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("graphql error: {0}")]
    Graphql(String),
    #[error("client has been shut down")]
    Closed,
}

/// Executes one GraphQL document and returns the raw response body.
#[async_trait]
pub trait GraphqlTransport: Send + Sync {
    async fn execute(&self, query: &str) -> Result<Vec<u8>, GithubError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub endpoint: String,
    pub token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub pool_idle_per_host: usize,
    pub concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            token: String::new(),
            timeout: Duration::from_secs(5),
            user_agent: None,
            pool_idle_per_host: 4,
            concurrency: 4,
        }
    }
}

/// `reqwest`-backed transport: bearer auth, bounded timeout, small idle pool.
/// No retries; a failed request fails the page.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    limit: Arc<Semaphore>,
}

impl HttpTransport {
    pub fn new(config: HttpClientConfig) -> Result<Self, GithubError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.pool_idle_per_host);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            endpoint: config.endpoint,
            token: config.token,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
        })
    }
}

#[async_trait]
impl GraphqlTransport for HttpTransport {
    async fn execute(&self, query: &str) -> Result<Vec<u8>, GithubError> {
        let _permit = self.limit.acquire().await.map_err(|_| GithubError::Closed)?;

        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "query": query }));
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GithubError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let body = resp.bytes().await?.to_vec();
        debug!(bytes = body.len(), "graphql response");
        Ok(body)
    }
}

fn require_window(start: &str, end: &str) -> Result<(), GithubError> {
    if start.trim().is_empty() {
        return Err(GithubError::StartFieldRequired);
    }
    if end.trim().is_empty() {
        return Err(GithubError::EndFieldRequired);
    }
    Ok(())
}

/// High-level listings over any [`GraphqlTransport`]. Cheap to clone.
#[derive(Clone)]
pub struct GithubClient {
    transport: Arc<dyn GraphqlTransport>,
}

impl GithubClient {
    pub fn new(transport: Arc<dyn GraphqlTransport>) -> Self {
        Self { transport }
    }

    pub fn from_config(config: HttpClientConfig) -> Result<Self, GithubError> {
        Ok(Self::new(Arc::new(HttpTransport::new(config)?)))
    }

    /// Accounts located in `location` created within `start..end`
    /// (`YYYY-MM-DD`). Missing dates fail before any request is made.
    pub async fn list_accounts(
        &self,
        location: &str,
        start: &str,
        end: &str,
        page_size: usize,
        cancel: &CancellationToken,
    ) -> Result<CursorWalk<Account>, GithubError> {
        require_window(start, end)?;
        let filter = query::accounts_filter(location, start, end);
        let out = walk(
            self.transport.as_ref(),
            |after| search_query(SearchType::User, &filter, page_size, after),
            |node: query::UserNode| Account::from(node),
            cancel,
        )
        .await;
        info!(location, start, end, pages = out.pages, accounts = out.items.len(), "account walk finished");
        Ok(out)
    }

    /// Repositories owned by `login` created within `start..end`.
    pub async fn list_repositories(
        &self,
        login: &str,
        start: &str,
        end: &str,
        page_size: usize,
        cancel: &CancellationToken,
    ) -> Result<CursorWalk<Repository>, GithubError> {
        require_window(start, end)?;
        let filter = query::repositories_filter(login, start, end);
        let out = walk(
            self.transport.as_ref(),
            |after| search_query(SearchType::Repository, &filter, page_size, after),
            |node: query::RepositoryNode| Repository::from(node),
            cancel,
        )
        .await;
        info!(login, start, end, pages = out.pages, repos = out.items.len(), "repository walk finished");
        Ok(out)
    }
}

/// Scripted transport for tests in this and downstream crates.
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use crate::{GithubError, GraphqlTransport};

    /// Replays queued responses in order and records every query it receives.
    /// An exhausted script answers with an empty last page.
    #[derive(Default)]
    pub struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<Vec<u8>, GithubError>>>,
        queries: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_page(&self, nodes: Vec<Value>, next_cursor: Option<&str>) -> &Self {
            let body = page(nodes, next_cursor);
            self.push_raw(Ok(body.to_string().into_bytes()))
        }

        pub fn push_raw(&self, response: Result<Vec<u8>, GithubError>) -> &Self {
            if let Ok(mut q) = self.responses.lock() {
                q.push_back(response);
            }
            self
        }

        pub fn queries(&self) -> Vec<String> {
            self.queries.lock().map(|q| q.clone()).unwrap_or_default()
        }
    }

    /// A `search` response body; `next_cursor = None` marks the last page.
    pub fn page(nodes: Vec<Value>, next_cursor: Option<&str>) -> Value {
        let edges: Vec<Value> = nodes.into_iter().map(|n| json!({ "node": n })).collect();
        json!({
            "data": {
                "search": {
                    "pageInfo": {
                        "hasNextPage": next_cursor.is_some(),
                        "endCursor": next_cursor,
                    },
                    "edges": edges,
                }
            }
        })
    }

    #[async_trait]
    impl GraphqlTransport for ScriptedTransport {
        async fn execute(&self, query: &str) -> Result<Vec<u8>, GithubError> {
            if let Ok(mut q) = self.queries.lock() {
                q.push(query.to_string());
            }
            let next = self.responses.lock().ok().and_then(|mut q| q.pop_front());
            next.unwrap_or_else(|| Ok(page(Vec::new(), None).to_string().into_bytes()))
        }
    }
}
