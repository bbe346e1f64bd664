//! Remote capsule service client
//!
//! [`CapsuleApi`] is the seam between the sync core and HTTP. The core only
//! ever talks to the trait, so tests can substitute an in-process server or a
//! hand-written fake.

use crate::auth::TokenStore;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use capsule_common::api::{
    ActionResponse, AssetStatusReport, CapsuleId, DownloadOnlyData, DownloadOnlyRequest,
    DownloadPoll, DownloadStatusBody, LightweightSyncData, LightweightSyncRequest, OpenRequest,
    RefreshData, RefreshRequest, StartDownloadRequest, StartDownloadResponse, SyncEnvelope,
    SyncStatusData, TagSyncData, UploadProgressBody, UploadProgressEvent,
};
use capsule_common::config::TomlConfig;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!("capsule-sync/", env!("CARGO_PKG_VERSION"));

/// HTTP 207 Multi-Status: the operation partly succeeded
pub const MULTI_STATUS: u16 = 207;

/// Sync endpoint response: HTTP status plus the `{success, error, data}` envelope
#[derive(Debug, Clone)]
pub struct SyncResponse<T> {
    pub status: u16,
    pub envelope: SyncEnvelope<T>,
}

impl<T> SyncResponse<T> {
    pub fn is_partial(&self) -> bool {
        self.status == MULTI_STATUS
    }

    pub fn error_text(&self) -> Option<&str> {
        self.envelope.error.as_deref().filter(|e| !e.is_empty())
    }
}

/// Operations the sync core needs from the remote service
#[async_trait]
pub trait CapsuleApi: Send + Sync {
    /// `GET /api/capsules/{id}/asset-status`
    async fn asset_status(&self, id: CapsuleId) -> SyncResult<AssetStatusReport>;

    /// `POST /api/capsules/{id}/download-assets`
    async fn start_download(&self, id: CapsuleId, force: bool) -> SyncResult<StartDownloadResponse>;

    /// `GET /api/downloads/status/{id}`
    async fn download_status(&self, id: CapsuleId) -> SyncResult<DownloadPoll>;

    async fn pause_download(&self, id: CapsuleId) -> SyncResult<ActionResponse>;

    async fn resume_download(&self, id: CapsuleId) -> SyncResult<ActionResponse>;

    async fn cancel_download(&self, id: CapsuleId) -> SyncResult<ActionResponse>;

    /// `POST /api/sync/lightweight`; a 207 answer is returned, not raised
    async fn lightweight_sync(
        &self,
        request: &LightweightSyncRequest,
    ) -> SyncResult<SyncResponse<LightweightSyncData>>;

    /// `GET /api/sync/upload-progress?capsule_id=`; `None` while nothing is reported
    async fn upload_progress(&self, id: CapsuleId) -> SyncResult<Option<UploadProgressEvent>>;

    /// `POST /api/sync/download-only`
    async fn download_only(&self, include_previews: bool)
        -> SyncResult<SyncResponse<DownloadOnlyData>>;

    /// `GET /api/sync/status`
    async fn sync_status(&self) -> SyncResult<SyncStatusData>;

    /// `POST /api/sync/sync-tags`
    async fn sync_tags(&self) -> SyncResult<SyncResponse<TagSyncData>>;

    /// `POST /api/capsules/{id}/open`
    async fn open_capsule(&self, id: CapsuleId, skip_wav_check: bool) -> SyncResult<()>;

    /// Whether an access token is available
    async fn is_authenticated(&self) -> bool;
}

/// reqwest-backed [`CapsuleApi`]
pub struct HttpCapsuleApi {
    http_client: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenStore>,
}

impl HttpCapsuleApi {
    pub fn new(config: &TomlConfig, tokens: Arc<TokenStore>) -> SyncResult<Self> {
        let base_url = config.api_base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(SyncError::NotConfigured("api_base_url".to_string()));
        }

        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SyncError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url,
            tokens,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> SyncResult<reqwest::Response> {
        let mut request = self.http_client.request(method.clone(), self.url(path));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Send a request, refreshing the access token once on 401
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> SyncResult<reqwest::Response> {
        let token = self.tokens.access_token().await;
        debug!(method = %method, path = %path, "Remote request");

        let response = self
            .send_once(&method, path, body, token.as_deref())
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let fresh = self.refresh_access_token(token).await?;
        let retried = self
            .send_once(&method, path, body, Some(fresh.as_str()))
            .await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            return Err(SyncError::Unauthorized);
        }
        Ok(retried)
    }

    /// Obtain a usable access token after `stale` was rejected
    ///
    /// Concurrent callers holding the same stale token share one refresh.
    async fn refresh_access_token(&self, stale: Option<String>) -> SyncResult<String> {
        let _guard = self.tokens.lock_refresh().await;

        if let Some(current) = self.tokens.access_token().await {
            if Some(&current) != stale.as_ref() {
                debug!("Access token already refreshed by another request");
                return Ok(current);
            }
        }

        let Some(refresh_token) = self.tokens.refresh_token().await else {
            return Err(SyncError::Unauthorized);
        };

        match self.request_refresh(refresh_token).await {
            Ok(access_token) => {
                info!("Access token refreshed");
                self.tokens.set_access_token(access_token.clone()).await;
                Ok(access_token)
            }
            Err(err) => {
                warn!(error = %err, "Token refresh failed");
                self.tokens.clear().await;
                Err(SyncError::Unauthorized)
            }
        }
    }

    async fn request_refresh(&self, refresh_token: String) -> SyncResult<String> {
        let body = serde_json::to_value(RefreshRequest { refresh_token })?;
        let response = self
            .send_once(&Method::POST, "/auth/refresh", Some(&body), None)
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(api_error(status, response).await);
        }

        let envelope: SyncEnvelope<RefreshData> = response.json().await?;
        match envelope.data {
            Some(data) if envelope.success && !data.access_token.is_empty() => Ok(data.access_token),
            _ => Err(SyncError::Remote(
                envelope
                    .error
                    .unwrap_or_else(|| "Token refresh rejected".to_string()),
            )),
        }
    }

    async fn get_value(&self, path: &str) -> SyncResult<(StatusCode, Value)> {
        let response = self.send(Method::GET, path, None).await?;
        read_json(response).await
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str, body: &Value) -> SyncResult<T> {
        let response = self.send(Method::POST, path, Some(body)).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(api_error(status, response).await);
        }
        Ok(response.json().await?)
    }

    /// POST to a sync endpoint: any 2xx (including 207) yields the envelope
    async fn post_envelope<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> SyncResult<SyncResponse<T>> {
        let response = self.send(Method::POST, path, Some(body)).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(api_error(status, response).await);
        }
        if status.as_u16() == MULTI_STATUS {
            warn!(path = %path, "Remote reported partial success (207)");
        }
        let envelope: SyncEnvelope<T> = response.json().await?;
        Ok(SyncResponse {
            status: status.as_u16(),
            envelope,
        })
    }

    async fn control(&self, id: CapsuleId, action: &str) -> SyncResult<ActionResponse> {
        self.post_json(&format!("/capsules/{}/{}-download", id, action), &json!({}))
            .await
    }
}

#[async_trait]
impl CapsuleApi for HttpCapsuleApi {
    async fn asset_status(&self, id: CapsuleId) -> SyncResult<AssetStatusReport> {
        let (status, mut value) = self.get_value(&format!("/capsules/{}/asset-status", id)).await?;
        if !status.is_success() {
            return Err(SyncError::Api {
                status: status.as_u16(),
                message: error_message(&value).unwrap_or_default(),
            });
        }

        // Tolerate an enveloped body and a body without the id
        if let Some(data) = value.get("data").filter(|d| d.is_object()).cloned() {
            value = data;
        }
        if let Value::Object(map) = &mut value {
            map.entry("capsule_id").or_insert(json!(id.0));
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn start_download(&self, id: CapsuleId, force: bool) -> SyncResult<StartDownloadResponse> {
        let body = serde_json::to_value(StartDownloadRequest {
            force,
            ..Default::default()
        })?;
        self.post_json(&format!("/capsules/{}/download-assets", id), &body)
            .await
    }

    async fn download_status(&self, id: CapsuleId) -> SyncResult<DownloadPoll> {
        let (status, value) = self.get_value(&format!("/downloads/status/{}", id)).await?;
        if !status.is_success() {
            return Err(SyncError::Api {
                status: status.as_u16(),
                message: error_message(&value).unwrap_or_default(),
            });
        }
        let body: DownloadStatusBody = serde_json::from_value(value)?;
        Ok(body.into_poll(id))
    }

    async fn pause_download(&self, id: CapsuleId) -> SyncResult<ActionResponse> {
        self.control(id, "pause").await
    }

    async fn resume_download(&self, id: CapsuleId) -> SyncResult<ActionResponse> {
        self.control(id, "resume").await
    }

    async fn cancel_download(&self, id: CapsuleId) -> SyncResult<ActionResponse> {
        self.control(id, "cancel").await
    }

    async fn lightweight_sync(
        &self,
        request: &LightweightSyncRequest,
    ) -> SyncResult<SyncResponse<LightweightSyncData>> {
        let body = serde_json::to_value(request)?;
        self.post_envelope("/sync/lightweight", &body).await
    }

    async fn upload_progress(&self, id: CapsuleId) -> SyncResult<Option<UploadProgressEvent>> {
        let (status, value) = self
            .get_value(&format!("/sync/upload-progress?capsule_id={}", id))
            .await?;
        if !status.is_success() {
            return Err(SyncError::Api {
                status: status.as_u16(),
                message: error_message(&value).unwrap_or_default(),
            });
        }
        let envelope: SyncEnvelope<UploadProgressBody> = serde_json::from_value(value)?;
        Ok(envelope
            .data
            .map(|body| UploadProgressEvent::from_body(id, body)))
    }

    async fn download_only(
        &self,
        include_previews: bool,
    ) -> SyncResult<SyncResponse<DownloadOnlyData>> {
        let body = serde_json::to_value(DownloadOnlyRequest { include_previews })?;
        self.post_envelope("/sync/download-only", &body).await
    }

    async fn sync_status(&self) -> SyncResult<SyncStatusData> {
        let (status, value) = self.get_value("/sync/status").await?;
        if !status.is_success() {
            return Err(SyncError::Api {
                status: status.as_u16(),
                message: error_message(&value).unwrap_or_default(),
            });
        }
        let envelope: SyncEnvelope<SyncStatusData> = serde_json::from_value(value)?;
        if !envelope.success {
            return Err(SyncError::Remote(
                envelope
                    .error
                    .unwrap_or_else(|| "Sync status unavailable".to_string()),
            ));
        }
        Ok(envelope.data.unwrap_or_default())
    }

    async fn sync_tags(&self) -> SyncResult<SyncResponse<TagSyncData>> {
        self.post_envelope("/sync/sync-tags", &json!({})).await
    }

    async fn open_capsule(&self, id: CapsuleId, skip_wav_check: bool) -> SyncResult<()> {
        let body = serde_json::to_value(OpenRequest { skip_wav_check })?;
        let response: ActionResponse = self
            .post_json(&format!("/capsules/{}/open", id), &body)
            .await?;
        if response.success {
            Ok(())
        } else {
            Err(SyncError::Remote(
                response
                    .error
                    .unwrap_or_else(|| format!("Could not open capsule {}", id)),
            ))
        }
    }

    async fn is_authenticated(&self) -> bool {
        self.tokens.is_authenticated().await
    }
}

/// Read a JSON body regardless of status; empty or non-JSON bodies become `null`
async fn read_json(response: reqwest::Response) -> SyncResult<(StatusCode, Value)> {
    let status = response.status();
    let text = response.text().await?;
    let value = if text.trim().is_empty() {
        Value::Null
    } else {
        match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(err) if status.is_success() => return Err(err.into()),
            Err(_) => Value::String(text),
        }
    };
    Ok((status, value))
}

async fn api_error(status: StatusCode, response: reqwest::Response) -> SyncError {
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|value| error_message(&value))
        .unwrap_or(text);
    SyncError::Api {
        status: status.as_u16(),
        message,
    }
}

/// Pull a human-readable message out of an error body
///
/// Accepts `{"error": "..."}`, `{"error": {"message": "..."}}`,
/// `{"message": "..."}` and `{"detail": "..."}`.
fn error_message(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => match map.get("error") {
            Some(Value::String(s)) => Some(s.as_str()),
            Some(Value::Object(inner)) => inner.get("message").and_then(Value::as_str),
            _ => map
                .get("message")
                .or_else(|| map.get("detail"))
                .and_then(Value::as_str),
        },
        _ => None,
    };
    text.filter(|t| !t.is_empty()).map(str::to_string)
}
