//! In-process mock of the remote capsule service
//!
//! Spawns an axum server on `127.0.0.1:0` whose replies are scripted per
//! test through [`MockServer`]. Every endpoint counts its hits under a key
//! such as `"download-status:7"` so tests can assert how often the client
//! called it.

#![allow(dead_code)]

use axum::extract::{Path, Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use capsule_common::config::TomlConfig;
use capsule_common::events::CapsuleEvent;
use capsule_sync::SyncCore;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

pub const ACCESS_TOKEN: &str = "access-1";
pub const REFRESH_TOKEN: &str = "refresh-1";

#[derive(Default)]
pub struct MockInner {
    pub asset_statuses: HashMap<i64, Value>,
    pub fail_asset_status: bool,
    /// Download status replies, consumed front to back; the last one repeats
    pub download_scripts: HashMap<i64, VecDeque<Value>>,
    pub start_download_reply: Option<Value>,
    pub start_download_delay: Duration,
    pub control_reply: Option<Value>,
    pub control_calls: Vec<(i64, String)>,
    pub lightweight_reply: Option<(u16, Value)>,
    pub lightweight_delay: Duration,
    pub lightweight_bodies: Vec<Value>,
    pub upload_progress: HashMap<i64, VecDeque<Value>>,
    pub download_only_reply: Option<(u16, Value)>,
    pub download_only_delay: Duration,
    pub sync_status_reply: Option<Value>,
    pub sync_tags_reply: Option<(u16, Value)>,
    pub sync_tags_delay: Duration,
    pub open_calls: Vec<(i64, bool)>,
    /// When set, every non-refresh request must carry this bearer token
    pub required_token: Option<String>,
    pub valid_refresh_token: Option<String>,
    pub issued_token: String,
    pub refresh_delay: Duration,
    pub hits: HashMap<String, usize>,
}

#[derive(Clone, Default)]
pub struct MockServer {
    inner: Arc<Mutex<MockInner>>,
}

impl MockServer {
    pub fn inner(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap()
    }

    fn hit(&self, key: String) {
        *self.inner().hits.entry(key).or_insert(0) += 1;
    }

    pub fn hits(&self, key: &str) -> usize {
        self.inner().hits.get(key).copied().unwrap_or(0)
    }

    pub fn set_asset_status(&self, id: i64, asset_status: &str, cloud_status: &str) {
        self.inner().asset_statuses.insert(
            id,
            json!({
                "capsule_id": id,
                "asset_status": asset_status,
                "cloud_status": cloud_status,
                "download_progress": 0,
                "local_wav_size": null,
                "is_cache_pinned": false
            }),
        );
    }

    pub fn asset_status_of(&self, id: i64) -> Option<String> {
        self.inner()
            .asset_statuses
            .get(&id)
            .and_then(|v| v["asset_status"].as_str().map(str::to_string))
    }

    pub fn script_download(&self, id: i64, replies: Vec<Value>) {
        self.inner().download_scripts.insert(id, replies.into());
    }

    pub fn script_upload_progress(&self, id: i64, replies: Vec<Value>) {
        self.inner().upload_progress.insert(id, replies.into());
    }

    pub fn require_token(&self, access: &str, refresh: &str, issued: &str) {
        let mut inner = self.inner();
        inner.required_token = Some(access.to_string());
        inner.valid_refresh_token = Some(refresh.to_string());
        inner.issued_token = issued.to_string();
    }
}

/// Download status body with the given state and progress
pub fn download_body(status: &str, progress: f64) -> Value {
    json!({
        "status": status,
        "progress": progress,
        "downloaded_bytes": (progress * 1000.0) as u64,
        "total_bytes": 100_000,
        "speed": 2048,
        "eta_seconds": 3
    })
}

pub async fn spawn_mock() -> (String, MockServer) {
    let server = MockServer::default();
    let app = router(server.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), server)
}

/// Config pointing at the mock with millisecond poll intervals
pub fn test_config(base_url: &str) -> TomlConfig {
    let mut config = TomlConfig {
        api_base_url: base_url.to_string(),
        request_timeout_secs: 5,
        ..Default::default()
    };
    config.polling.download_interval_ms = 20;
    config.polling.upload_interval_ms = 20;
    config.boot.skip_after_secs = 0;
    config.auto_sync.delay_secs = 0;
    config.auth.access_token = Some(ACCESS_TOKEN.to_string());
    config.auth.refresh_token = Some(REFRESH_TOKEN.to_string());
    config
}

pub async fn spawn_core() -> (SyncCore, MockServer) {
    let (base_url, server) = spawn_mock().await;
    let core = SyncCore::from_config(test_config(&base_url)).unwrap();
    (core, server)
}

/// Wait for the first event matching `pred`, failing the test after 5 s
pub async fn next_event<F>(rx: &mut broadcast::Receiver<CapsuleEvent>, mut pred: F) -> CapsuleEvent
where
    F: FnMut(&CapsuleEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Drain every event already queued on `rx`
pub fn drain(rx: &mut broadcast::Receiver<CapsuleEvent>) -> Vec<CapsuleEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

/// Poll `cond` every 10 ms until true, failing after 5 s
pub async fn wait_until<F: FnMut() -> bool>(mut cond: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn router(server: MockServer) -> Router {
    let protected = Router::new()
        .route("/api/capsules/:id/asset-status", get(asset_status))
        .route("/api/capsules/:id/download-assets", post(start_download))
        .route("/api/downloads/status/:id", get(download_status))
        .route("/api/capsules/:id/pause-download", post(pause_download))
        .route("/api/capsules/:id/resume-download", post(resume_download))
        .route("/api/capsules/:id/cancel-download", post(cancel_download))
        .route("/api/capsules/:id/open", post(open_capsule))
        .route("/api/sync/lightweight", post(lightweight))
        .route("/api/sync/upload-progress", get(upload_progress))
        .route("/api/sync/download-only", post(download_only))
        .route("/api/sync/status", get(sync_status))
        .route("/api/sync/sync-tags", post(sync_tags))
        .route_layer(middleware::from_fn_with_state(server.clone(), check_token));

    Router::new()
        .route("/api/auth/refresh", post(refresh))
        .merge(protected)
        .with_state(server)
}

fn reply(status: u16, body: Value) -> Response {
    (StatusCode::from_u16(status).unwrap(), Json(body)).into_response()
}

async fn check_token(State(server): State<MockServer>, request: Request, next: Next) -> Response {
    let required = server.inner().required_token.clone();
    if let Some(expected) = required {
        let presented = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if presented != Some(format!("Bearer {}", expected)) {
            server.hit("unauthorized".to_string());
            return reply(401, json!({ "success": false, "error": "token expired" }));
        }
    }
    next.run(request).await
}

async fn refresh(State(server): State<MockServer>, Json(body): Json<Value>) -> Response {
    server.hit("refresh".to_string());
    let delay = server.inner().refresh_delay;
    tokio::time::sleep(delay).await;

    let mut inner = server.inner();
    let presented = body["refresh_token"].as_str().map(str::to_string);
    if presented.is_some() && presented == inner.valid_refresh_token {
        let issued = inner.issued_token.clone();
        inner.required_token = Some(issued.clone());
        reply(200, json!({ "success": true, "data": { "access_token": issued, "expires_in": 3600 } }))
    } else {
        reply(401, json!({ "success": false, "error": "invalid refresh token" }))
    }
}

async fn asset_status(State(server): State<MockServer>, Path(id): Path<i64>) -> Response {
    server.hit(format!("asset-status:{}", id));
    let inner = server.inner();
    if inner.fail_asset_status {
        return reply(500, json!({ "error": "database locked" }));
    }
    match inner.asset_statuses.get(&id) {
        Some(body) => reply(200, body.clone()),
        None => reply(404, json!({ "error": "capsule not found" })),
    }
}

async fn start_download(
    State(server): State<MockServer>,
    Path(id): Path<i64>,
    Json(_body): Json<Value>,
) -> Response {
    server.hit(format!("start-download:{}", id));
    let delay = server.inner().start_download_delay;
    tokio::time::sleep(delay).await;
    let body = server
        .inner()
        .start_download_reply
        .clone()
        .unwrap_or_else(|| json!({ "success": true, "task_id": id, "status": "pending" }));
    reply(200, body)
}

async fn download_status(State(server): State<MockServer>, Path(id): Path<i64>) -> Response {
    server.hit(format!("download-status:{}", id));
    let mut inner = server.inner();
    let body = match inner.download_scripts.get_mut(&id) {
        Some(script) if script.len() > 1 => script.pop_front().unwrap(),
        Some(script) => script.front().cloned().unwrap_or_else(|| download_body("not_started", 0.0)),
        None => download_body("not_started", 0.0),
    };
    // Completing a download makes the files local
    if body["status"] == "completed" {
        if let Some(entry) = inner.asset_statuses.get_mut(&id) {
            entry["asset_status"] = json!("full");
        }
    }
    reply(200, body)
}

async fn control(server: &MockServer, id: i64, action: &str) -> Response {
    server.hit(format!("{}:{}", action, id));
    let mut inner = server.inner();
    inner.control_calls.push((id, action.to_string()));
    let body = inner
        .control_reply
        .clone()
        .unwrap_or_else(|| json!({ "success": true }));
    reply(200, body)
}

async fn pause_download(State(server): State<MockServer>, Path(id): Path<i64>) -> Response {
    control(&server, id, "pause").await
}

async fn resume_download(State(server): State<MockServer>, Path(id): Path<i64>) -> Response {
    control(&server, id, "resume").await
}

async fn cancel_download(State(server): State<MockServer>, Path(id): Path<i64>) -> Response {
    control(&server, id, "cancel").await
}

async fn open_capsule(
    State(server): State<MockServer>,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> Response {
    server.hit(format!("open:{}", id));
    let offline = body["skip_wav_check"].as_bool().unwrap_or(false);
    server.inner().open_calls.push((id, offline));
    reply(200, json!({ "success": true }))
}

async fn lightweight(State(server): State<MockServer>, Json(body): Json<Value>) -> Response {
    server.hit("lightweight".to_string());
    let delay = {
        let mut inner = server.inner();
        inner.lightweight_bodies.push(body);
        inner.lightweight_delay
    };
    tokio::time::sleep(delay).await;

    let (status, body) = server.inner().lightweight_reply.clone().unwrap_or_else(|| {
        (
            200,
            json!({
                "success": true,
                "data": { "synced_count": 1, "preview_downloaded": 1, "duration_seconds": 0.2, "errors": [] }
            }),
        )
    });
    reply(status, body)
}

async fn upload_progress(
    State(server): State<MockServer>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let id: i64 = query
        .get("capsule_id")
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    server.hit(format!("upload-progress:{}", id));
    let mut inner = server.inner();
    let data = match inner.upload_progress.get_mut(&id) {
        Some(script) if script.len() > 1 => script.pop_front().unwrap_or(Value::Null),
        Some(script) => script.front().cloned().unwrap_or(Value::Null),
        None => Value::Null,
    };
    reply(200, json!({ "success": true, "data": data }))
}

async fn download_only(State(server): State<MockServer>, Json(_body): Json<Value>) -> Response {
    server.hit("download-only".to_string());
    let delay = server.inner().download_only_delay;
    tokio::time::sleep(delay).await;

    let (status, body) = server.inner().download_only_reply.clone().unwrap_or_else(|| {
        (
            200,
            json!({
                "success": true,
                "data": { "downloaded_count": 4, "preview_downloaded": 2, "duration_seconds": 0.5, "errors": [] }
            }),
        )
    });
    reply(status, body)
}

async fn sync_status(State(server): State<MockServer>) -> Response {
    server.hit("sync-status".to_string());
    let body = server.inner().sync_status_reply.clone().unwrap_or_else(|| {
        json!({
            "success": true,
            "data": {
                "last_sync_at": "2026-10-01T08:30:00",
                "synced_count": 12,
                "pending_count": 2,
                "conflict_count": 0,
                "remote_pending": 1
            }
        })
    });
    reply(200, body)
}

async fn sync_tags(State(server): State<MockServer>, Json(_body): Json<Value>) -> Response {
    server.hit("sync-tags".to_string());
    let delay = server.inner().sync_tags_delay;
    tokio::time::sleep(delay).await;

    let (status, body) = server
        .inner()
        .sync_tags_reply
        .clone()
        .unwrap_or_else(|| (200, json!({ "success": true, "data": { "uploaded": 3, "downloaded": 1 } })));
    reply(status, body)
}
