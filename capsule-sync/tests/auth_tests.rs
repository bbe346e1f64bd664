//! Token refresh behaviour of the HTTP client
//!
//! The mock rejects the configured access token, so the first request of
//! each test has to go through `/api/auth/refresh`.

mod helpers;

use capsule_common::api::{AssetStatus, CapsuleId};
use capsule_common::events::CapsuleEvent;
use capsule_sync::boot::{BootOutcome, SkipReason};
use helpers::*;
use std::time::Duration;

#[tokio::test]
async fn test_expired_token_is_refreshed_and_request_retried() {
    let (core, server) = spawn_core().await;
    server.set_asset_status(1, "full", "synced");
    server.require_token("access-2", REFRESH_TOKEN, "access-2");

    let status = core.resolver.status(CapsuleId(1)).await;

    assert_eq!(status, AssetStatus::Full);
    assert_eq!(server.hits("refresh"), 1);
    assert_eq!(server.hits("asset-status:1"), 1);
    let tokens = core.tokens.as_ref().unwrap();
    assert_eq!(tokens.access_token().await.as_deref(), Some("access-2"));
    assert_eq!(tokens.refresh_token().await.as_deref(), Some(REFRESH_TOKEN));
}

#[tokio::test]
async fn test_concurrent_rejections_share_one_refresh() {
    let (core, server) = spawn_core().await;
    for id in 1..=5 {
        server.set_asset_status(id, "cloud_only", "synced");
    }
    server.require_token("access-2", REFRESH_TOKEN, "access-2");
    server.inner().refresh_delay = Duration::from_millis(100);

    let mut tasks = Vec::new();
    for id in 1..=5 {
        let resolver = core.resolver.clone();
        tasks.push(tokio::spawn(async move {
            resolver.status(CapsuleId(id)).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), AssetStatus::CloudOnly);
    }

    assert_eq!(server.hits("refresh"), 1);
    for id in 1..=5 {
        assert_eq!(server.hits(&format!("asset-status:{}", id)), 1);
    }
}

#[tokio::test]
async fn test_failed_refresh_clears_credentials() {
    let (core, server) = spawn_core().await;
    server.set_asset_status(1, "full", "synced");
    server.require_token("access-2", "some-other-refresh", "access-2");
    let mut rx = core.bus.subscribe();

    // The resolver degrades to its fallback instead of failing
    let report = core.resolver.get_status(CapsuleId(1)).await;
    assert_eq!(report.asset_status, AssetStatus::Local);
    assert!(core.resolver.cached(CapsuleId(1)).await.is_none());

    next_event(&mut rx, |e| matches!(e, CapsuleEvent::AuthFailed { .. })).await;
    let tokens = core.tokens.as_ref().unwrap();
    assert!(!tokens.is_authenticated().await);
    assert!(tokens.refresh_token().await.is_none());

    // Signed out now, so boot sync does not even try
    assert_eq!(
        core.boot.run().await,
        BootOutcome::Skipped(SkipReason::NotAuthenticated)
    );
}

#[tokio::test]
async fn test_valid_token_needs_no_refresh() {
    let (core, server) = spawn_core().await;
    server.set_asset_status(1, "local", "local");
    server.require_token(ACCESS_TOKEN, REFRESH_TOKEN, "unused");

    core.resolver.get_status(CapsuleId(1)).await;

    assert_eq!(server.hits("refresh"), 0);
    assert_eq!(server.hits("unauthorized"), 0);
}
