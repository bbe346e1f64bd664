//! Bearer token storage shared by every API call
//!
//! Refreshes are coalesced: callers that saw the same stale access token queue
//! behind one async mutex, and only the first one actually hits the refresh
//! endpoint. The others find a new token already installed and retry with it.

use capsule_common::events::{CapsuleEvent, EventBus};
use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::warn;

/// Access/refresh token pair
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl Credentials {
    pub fn new(access_token: Option<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.filter(|t| !t.is_empty()),
            refresh_token: refresh_token.filter(|t| !t.is_empty()),
        }
    }
}

pub struct TokenStore {
    credentials: RwLock<Credentials>,
    refresh_lock: Mutex<()>,
    bus: EventBus,
}

impl TokenStore {
    pub fn new(credentials: Credentials, bus: EventBus) -> Self {
        Self {
            credentials: RwLock::new(credentials),
            refresh_lock: Mutex::new(()),
            bus,
        }
    }

    pub async fn access_token(&self) -> Option<String> {
        self.credentials.read().await.access_token.clone()
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.credentials.read().await.refresh_token.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.credentials.read().await.access_token.is_some()
    }

    pub async fn snapshot(&self) -> Credentials {
        self.credentials.read().await.clone()
    }

    /// Install a freshly issued access token, keeping the refresh token
    pub async fn set_access_token(&self, token: String) {
        self.credentials.write().await.access_token = Some(token);
    }

    pub async fn set_credentials(&self, credentials: Credentials) {
        *self.credentials.write().await = credentials;
    }

    /// Drop both tokens after a failed refresh and announce it
    pub async fn clear(&self) {
        *self.credentials.write().await = Credentials::default();
        warn!("Stored credentials cleared after failed token refresh");
        self.bus.emit_lossy(CapsuleEvent::AuthFailed {
            timestamp: Utc::now(),
        });
    }

    /// Serialize refresh attempts
    pub(crate) async fn lock_refresh(&self) -> MutexGuard<'_, ()> {
        self.refresh_lock.lock().await
    }
}
