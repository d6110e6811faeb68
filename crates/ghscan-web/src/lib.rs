//! Read-only JSON surface over the stored accounts, repositories and stats.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use ghscan_core::StatType;
use ghscan_storage::{Store, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "ghscan-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[derive(Debug, Deserialize, Default)]
struct StatsQuery {
    #[serde(rename = "type")]
    stat_type: Option<String>,
}

/// Discovery index returned when `/stats` is called without a usable type.
#[derive(Debug, Serialize)]
struct StatsIndex {
    paths: Vec<String>,
}

fn stats_index() -> StatsIndex {
    StatsIndex {
        paths: StatType::ALL
            .iter()
            .map(|t| format!("/stats?type={}", t.as_str()))
            .collect(),
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/users", get(user_count_handler))
        .route("/users/{login}", get(user_handler))
        .route("/repos/count", get(repo_count_handler))
        .route("/stats", get(stats_handler))
        .route("/profiles/{login}", get(profile_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(store: Store, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "read surface listening");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::NotFound { .. } => error_body(StatusCode::NOT_FOUND, err.to_string()),
        other => {
            warn!(error = %other, "store read failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

async fn user_handler(
    State(state): State<Arc<AppState>>,
    Path(login): Path<String>,
) -> Response {
    match state.store.accounts().find(&login).await {
        Ok(account) => Json(account).into_response(),
        Err(err) => store_error(err),
    }
}

async fn user_count_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.accounts().count().await {
        Ok(count) => Json(json!({ "count": count })).into_response(),
        Err(err) => store_error(err),
    }
}

async fn repo_count_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.repositories().count().await {
        Ok(count) => Json(json!({ "count": count })).into_response(),
        Err(err) => store_error(err),
    }
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let Some(raw) = query.stat_type.filter(|t| !t.is_empty()) else {
        return Json(stats_index()).into_response();
    };
    let Ok(stat) = raw.parse::<StatType>() else {
        return (StatusCode::BAD_REQUEST, Json(stats_index())).into_response();
    };
    match state.store.stat_records().find(stat).await {
        Ok(record) => Json(record).into_response(),
        // A stat that was never computed is reported as a bad request.
        Err(err) if err.is_not_found() => error_body(StatusCode::BAD_REQUEST, err.to_string()),
        Err(err) => store_error(err),
    }
}

async fn profile_handler(
    State(state): State<Arc<AppState>>,
    Path(login): Path<String>,
) -> Response {
    match state.store.accounts().find(&login).await {
        Ok(account) => match account.profile {
            Some(profile) => Json(profile).into_response(),
            None => error_body(StatusCode::NOT_FOUND, format!("{login} has no profile yet")),
        },
        Err(err) => store_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::{TimeZone, Utc};
    use ghscan_core::{Account, Profile, Repository, StatPayload};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    async fn seeded() -> Store {
        let store = Store::memory();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let cancel = CancellationToken::new();
        let accounts = store.accounts();
        accounts
            .bulk_upsert(
                &[
                    Account {
                        login: "alice".into(),
                        location: "Malaysia".into(),
                        ..Default::default()
                    },
                    Account {
                        login: "bob".into(),
                        ..Default::default()
                    },
                ],
                now,
                500,
                &cancel,
            )
            .await
            .unwrap();
        accounts
            .update_profiles(
                &[(
                    "alice".to_string(),
                    Profile {
                        stargazers: 7,
                        ..Default::default()
                    },
                )],
                now,
                500,
                &cancel,
            )
            .await
            .unwrap();
        store
            .repositories()
            .bulk_upsert(
                &[Repository {
                    name_with_owner: "alice/cli".into(),
                    login: "alice".into(),
                    ..Default::default()
                }],
                now,
                500,
                &cancel,
            )
            .await
            .unwrap();
        store
            .stat_records()
            .upsert(StatType::UserCount, &StatPayload::Count { count: 2 }, now)
            .await
            .unwrap();
        store
    }

    async fn get_json(store: Store, uri: &str) -> (StatusCode, Value) {
        let resp = app(AppState::new(store))
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn user_lookup_and_counts() {
        let store = seeded().await;
        let (status, body) = get_json(store.clone(), "/users/alice").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["location"], "Malaysia");

        let (status, _) = get_json(store.clone(), "/users/nobody").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, users) = get_json(store.clone(), "/users").await;
        assert_eq!(users["count"], 2);
        let (_, repos) = get_json(store, "/repos/count").await;
        assert_eq!(repos["count"], 1);
    }

    #[tokio::test]
    async fn stats_by_type() {
        let store = seeded().await;
        let (status, body) = get_json(store.clone(), "/stats?type=user_count").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "user_count");
        assert_eq!(body["count"], 2);

        let (status, body) = get_json(store.clone(), "/stats?type=repos_most_stars").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn stats_without_a_known_type_lists_paths() {
        let store = seeded().await;
        let (status, body) = get_json(store.clone(), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["paths"].as_array().unwrap().len(), StatType::ALL.len());
        assert_eq!(body["paths"][0], "/stats?type=user_count");

        let (status, body) = get_json(store, "/stats?type=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["paths"].is_array());
    }

    #[tokio::test]
    async fn profiles() {
        let store = seeded().await;
        let (status, body) = get_json(store.clone(), "/profiles/alice").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stargazers"], 7);

        let (status, _) = get_json(store, "/profiles/bob").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
