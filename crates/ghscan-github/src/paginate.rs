//! Cursor walks over `search` connections.

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::query::Envelope;
use crate::{GithubError, GraphqlTransport};

/// How a cursor walk ended.
#[derive(Debug)]
pub enum WalkEnd {
    /// The source reported `hasNextPage = false`.
    Exhausted,
    /// Cancelled at a page boundary.
    Cancelled,
    /// A transport, status or decode fault ended the walk, or a page asked
    /// for a successor without giving its cursor.
    Failed(GithubError),
}

/// Everything a walk emitted, in source order, plus how it ended. Only whole
/// pages are ever included.
#[derive(Debug)]
pub struct CursorWalk<T> {
    pub items: Vec<T>,
    pub pages: usize,
    pub end: WalkEnd,
}

impl<T> CursorWalk<T> {
    pub fn is_exhausted(&self) -> bool {
        matches!(self.end, WalkEnd::Exhausted)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.end, WalkEnd::Cancelled)
    }

    /// Split into the accumulated prefix and the fault, if one ended the walk.
    pub fn into_parts(self) -> (Vec<T>, Option<GithubError>) {
        match self.end {
            WalkEnd::Failed(err) => (self.items, Some(err)),
            _ => (self.items, None),
        }
    }
}

pub(crate) fn decode_page<N: DeserializeOwned>(
    body: &[u8],
) -> Result<(Vec<N>, bool, Option<String>), GithubError> {
    let envelope: Envelope<N> = serde_json::from_slice(body)?;
    if !envelope.errors.is_empty() {
        let messages: Vec<String> = envelope.errors.into_iter().map(|e| e.message).collect();
        return Err(GithubError::Graphql(messages.join("; ")));
    }
    let search = envelope
        .data
        .ok_or_else(|| GithubError::Graphql("response carried no data".to_string()))?
        .search;
    let nodes = search.edges.into_iter().map(|e| e.node).collect();
    Ok((nodes, search.page_info.has_next_page, search.page_info.end_cursor))
}

/// Follow `endCursor` until the source reports no further page.
///
/// `build` renders the query for a cursor (`None` for the first page). Each
/// page is requested only after the previous one was decoded; nothing is
/// retried.
pub async fn walk<N, T, B, M>(
    transport: &dyn GraphqlTransport,
    build: B,
    map: M,
    cancel: &CancellationToken,
) -> CursorWalk<T>
where
    N: DeserializeOwned,
    B: Fn(Option<&str>) -> String,
    M: Fn(N) -> T,
{
    let mut items = Vec::new();
    let mut pages = 0usize;
    let mut cursor: Option<String> = None;
    let mut has_next = true;

    while has_next {
        if cancel.is_cancelled() {
            return CursorWalk { items, pages, end: WalkEnd::Cancelled };
        }
        let query = build(cursor.as_deref());
        let span = info_span!("graphql", page = pages + 1);
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return CursorWalk { items, pages, end: WalkEnd::Cancelled };
            }
            res = transport.execute(&query).instrument(span) => res,
        };
        let (nodes, next, end_cursor) = match body.and_then(|b| decode_page::<N>(&b)) {
            Ok(page) => page,
            Err(err) => return CursorWalk { items, pages, end: WalkEnd::Failed(err) },
        };

        pages += 1;
        debug!(page = pages, edges = nodes.len(), has_next = next, "page decoded");
        items.extend(nodes.into_iter().map(&map));

        if next && end_cursor.is_none() {
            let err = GithubError::Graphql(format!(
                "page {pages} reported hasNextPage without an endCursor"
            ));
            return CursorWalk { items, pages, end: WalkEnd::Failed(err) };
        }
        has_next = next;
        cursor = end_cursor;
    }

    CursorWalk { items, pages, end: WalkEnd::Exhausted }
}
