use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::db::models::{PollTarget, ScoreboardEntry, TargetKey};
use crate::db::{Database, SnapshotStore};
use crate::scoreboard::PollScheduler;

const DEFAULT_DELTA_LIMIT: i64 = 50;
const MAX_DELTA_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub scheduler: Arc<PollScheduler>,
}

/// Build the Axum router for the admin API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/targets", get(list_targets_handler).put(upsert_target_handler))
        .route("/api/targets/:owner_id/:target_id", delete(delete_target_handler))
        .route("/api/targets/:owner_id/:target_id/snapshot", get(snapshot_handler))
        .route("/api/deltas", get(deltas_handler))
        .route("/api/poll", post(poll_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

type ApiError = (StatusCode, String);

fn internal(e: anyhow::Error) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
}

/// Target as shown by the API; the auth token is never echoed back.
#[derive(Debug, Serialize)]
struct TargetView {
    owner_id: i64,
    target_id: i64,
    kind: String,
    base_url: String,
    has_auth_token: bool,
    tracked_name: Option<String>,
    ends_at: Option<DateTime<Utc>>,
    label: Option<String>,
}

impl From<PollTarget> for TargetView {
    fn from(t: PollTarget) -> Self {
        TargetView {
            owner_id: t.owner_id,
            target_id: t.target_id,
            kind: t.kind,
            base_url: t.base_url,
            has_auth_token: t.auth_token.is_some(),
            tracked_name: t.tracked_name,
            ends_at: t.ends_at,
            label: t.label,
        }
    }
}

#[derive(Debug, Serialize)]
struct SnapshotView {
    hash: String,
    captured_at: DateTime<Utc>,
    entries: Vec<ScoreboardEntry>,
}

#[derive(Debug, Deserialize)]
struct DeltaQuery {
    limit: Option<i64>,
}

/// GET /api/health
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /api/targets
async fn list_targets_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .list_targets()
        .map(|targets| Json(targets.into_iter().map(TargetView::from).collect::<Vec<_>>()))
        .map_err(internal)
}

/// PUT /api/targets
async fn upsert_target_handler(
    State(state): State<Arc<AppState>>,
    Json(mut target): Json<PollTarget>,
) -> Result<impl IntoResponse, ApiError> {
    target.base_url = target.base_url.trim().to_string();
    url::Url::parse(&target.base_url)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid base_url: {}", e)))?;
    target.auth_token = target.auth_token.filter(|t| !t.trim().is_empty());
    target.tracked_name = target.tracked_name.filter(|n| !n.trim().is_empty());

    state.db.upsert_target(&target).map_err(internal)?;
    info!("[{}] Target saved ({} {})", target.key(), target.kind, target.base_url);
    Ok(Json(TargetView::from(target)))
}

/// DELETE /api/targets/:owner_id/:target_id
async fn delete_target_handler(
    State(state): State<Arc<AppState>>,
    Path((owner_id, target_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = TargetKey::new(owner_id, target_id);
    if state.db.delete_target(key).map_err(internal)? {
        info!("[{}] Target removed", key);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, format!("no target {}", key)))
    }
}

/// GET /api/targets/:owner_id/:target_id/snapshot
async fn snapshot_handler(
    State(state): State<Arc<AppState>>,
    Path((owner_id, target_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = TargetKey::new(owner_id, target_id);
    let snapshot = state
        .db
        .get_snapshot(key)
        .map_err(internal)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no snapshot for {}", key)))?;
    let entries = snapshot
        .entries()
        .map_err(|e| internal(anyhow::anyhow!("stored snapshot unreadable: {}", e)))?;
    Ok(Json(SnapshotView {
        hash: snapshot.hash,
        captured_at: snapshot.captured_at,
        entries,
    }))
}

/// GET /api/deltas?limit=50
async fn deltas_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeltaQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DELTA_LIMIT)
        .clamp(1, MAX_DELTA_LIMIT);
    state
        .db
        .list_recent_delta_events(limit)
        .map(Json)
        .map_err(internal)
}

/// POST /api/poll
///
/// Runs one cycle, waiting for any cycle already in flight.
async fn poll_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    state.scheduler.run_cycle().await.map(Json).map_err(internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{DeltaEvent, Snapshot};
    use crate::notify::DatabaseSink;
    use crate::scoreboard::error::ScoreboardError;
    use crate::scoreboard::provider::ScoreboardSource;
    use crate::scoreboard::{DiffEngine, SchedulerConfig, SourceFetcher};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Fixed;

    #[async_trait]
    impl ScoreboardSource for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn fetch_entries(
            &self,
            _target: &PollTarget,
        ) -> Result<Vec<ScoreboardEntry>, ScoreboardError> {
            Ok(vec![ScoreboardEntry {
                rank: 1,
                name: "A".into(),
                score: 42.0,
            }])
        }
    }

    fn app() -> (Router, Database) {
        let db = Database::open(":memory:").unwrap();
        let scheduler = PollScheduler::new(
            Arc::new(db.clone()),
            SourceFetcher::new(Arc::new(Fixed), Arc::new(Fixed)),
            DiffEngine::new(10, 5),
            Arc::new(DatabaseSink::new(db.clone())),
            SchedulerConfig {
                interval: Duration::from_secs(30),
                workers: 2,
                target_timeout: Duration::from_secs(5),
                default_tracked_name: None,
            },
        );
        let state = AppState {
            db: db.clone(),
            scheduler: Arc::new(scheduler),
        };
        (router(state), db)
    }

    fn target() -> PollTarget {
        PollTarget {
            owner_id: 7,
            target_id: 1,
            kind: "api".into(),
            base_url: "https://ctf.example.com".into(),
            auth_token: Some("secret".into()),
            tracked_name: None,
            ends_at: None,
            label: Some("Quals".into()),
        }
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _db) = app();
        let (status, body) = send(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_put_and_list_targets_hides_token() {
        let (app, db) = app();
        let payload = serde_json::to_value(target()).unwrap();
        let (status, _) = send(&app, "PUT", "/api/targets", Some(payload)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            db.get_target(TargetKey::new(7, 1)).unwrap().unwrap().auth_token.as_deref(),
            Some("secret")
        );

        let (status, body) = send(&app, "GET", "/api/targets", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["has_auth_token"], true);
        assert!(body[0].get("auth_token").is_none());
    }

    #[tokio::test]
    async fn test_put_rejects_invalid_base_url() {
        let (app, _db) = app();
        let mut bad = target();
        bad.base_url = "not a url".into();
        let (status, _) = send(&app, "PUT", "/api/targets", Some(serde_json::to_value(bad).unwrap())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_target() {
        let (app, db) = app();
        db.upsert_target(&target()).unwrap();

        let (status, _) = send(&app, "DELETE", "/api/targets/7/1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "DELETE", "/api/targets/7/1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_snapshot_view() {
        let (app, db) = app();
        let (status, _) = send(&app, "GET", "/api/targets/7/1/snapshot", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        db.put_snapshot(
            TargetKey::new(7, 1),
            &Snapshot {
                hash: "abc".into(),
                payload: r#"[{"rank":1,"name":"A","score":5.0}]"#.into(),
                captured_at: Utc::now(),
            },
        )
        .unwrap();
        let (status, body) = send(&app, "GET", "/api/targets/7/1/snapshot", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hash"], "abc");
        assert_eq!(body["entries"][0]["name"], "A");
    }

    #[tokio::test]
    async fn test_poll_now_reports_and_records_delta() {
        let (app, db) = app();
        db.upsert_target(&target()).unwrap();

        let (status, body) = send(&app, "POST", "/api/poll", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["targets"][0]["outcome"]["status"], "changed");

        let (status, body) = send(&app, "GET", "/api/deltas?limit=5", None).await;
        assert_eq!(status, StatusCode::OK);
        let events: Vec<DeltaEvent> = serde_json::from_value(body).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].label.as_deref(), Some("Quals"));

        let (_, body) = send(&app, "POST", "/api/poll", None).await;
        assert_eq!(body["targets"][0]["outcome"]["status"], "unchanged");
    }
}
