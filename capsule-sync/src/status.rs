//! Asset status resolver
//!
//! One addressable cache of [`AssetStatusReport`]s for the whole client.
//! Entries never expire on their own: whoever performs a mutating action
//! (download, upload, re-upload) invalidates the affected capsule.

use crate::client::CapsuleApi;
use capsule_common::api::{AssetStatus, AssetStatusReport, CapsuleId};
use capsule_common::events::{CapsuleEvent, EventBus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Default)]
struct StatusCache {
    entries: HashMap<CapsuleId, AssetStatusReport>,
    /// Bumped by `invalidate(id)`
    generations: HashMap<CapsuleId, u64>,
    /// Bumped by `invalidate_all()`
    epoch: u64,
}

impl StatusCache {
    fn stamp(&self, id: CapsuleId) -> (u64, u64) {
        (self.epoch, self.generations.get(&id).copied().unwrap_or(0))
    }
}

pub struct AssetStatusResolver {
    api: Arc<dyn CapsuleApi>,
    bus: EventBus,
    cache: RwLock<StatusCache>,
}

impl AssetStatusResolver {
    pub fn new(api: Arc<dyn CapsuleApi>, bus: EventBus) -> Self {
        Self {
            api,
            bus,
            cache: RwLock::new(StatusCache::default()),
        }
    }

    /// Resolve a capsule's status, from cache when possible
    ///
    /// Never fails: if the remote cannot be asked, a conservative `local`
    /// report is returned and NOT cached, so the next call asks again. A
    /// fetch that overlaps an invalidation of the same capsule is returned
    /// but not cached.
    pub async fn get_status(&self, id: CapsuleId) -> AssetStatusReport {
        let stamp = {
            let cache = self.cache.read().await;
            if let Some(report) = cache.entries.get(&id) {
                return report.clone();
            }
            cache.stamp(id)
        };

        match self.api.asset_status(id).await {
            Ok(report) => {
                debug!(capsule_id = %id, status = %report.asset_status, "Asset status fetched");
                let mut cache = self.cache.write().await;
                if cache.stamp(id) == stamp {
                    cache.entries.insert(id, report.clone());
                } else {
                    debug!(capsule_id = %id, "Invalidated during fetch, not caching");
                }
                report
            }
            Err(err) => {
                warn!(capsule_id = %id, error = %err, "Asset status lookup failed, using fallback");
                AssetStatusReport::fallback(id)
            }
        }
    }

    pub async fn status(&self, id: CapsuleId) -> AssetStatus {
        self.get_status(id).await.asset_status
    }

    /// True unless the capsule's files are already on disk
    pub async fn needs_download(&self, id: CapsuleId) -> bool {
        !self.status(id).await.is_openable()
    }

    pub async fn cached(&self, id: CapsuleId) -> Option<AssetStatusReport> {
        self.cache.read().await.entries.get(&id).cloned()
    }

    /// Seed the cache with a report obtained elsewhere (e.g. a list response)
    pub async fn prime(&self, report: AssetStatusReport) {
        self.cache
            .write()
            .await
            .entries
            .insert(report.capsule_id, report);
    }

    pub async fn invalidate(&self, id: CapsuleId) {
        let removed = {
            let mut cache = self.cache.write().await;
            *cache.generations.entry(id).or_insert(0) += 1;
            cache.entries.remove(&id).is_some()
        };
        debug!(capsule_id = %id, removed, "Asset status invalidated");
        self.bus.emit_lossy(CapsuleEvent::AssetStatusInvalidated {
            capsule_id: Some(id),
            timestamp: Utc::now(),
        });
    }

    pub async fn invalidate_many(&self, ids: &[CapsuleId]) {
        for id in ids {
            self.invalidate(*id).await;
        }
    }

    pub async fn invalidate_all(&self) {
        {
            let mut cache = self.cache.write().await;
            cache.entries.clear();
            cache.generations.clear();
            cache.epoch += 1;
        }
        self.bus.emit_lossy(CapsuleEvent::AssetStatusInvalidated {
            capsule_id: None,
            timestamp: Utc::now(),
        });
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SyncResponse;
    use crate::error::{SyncError, SyncResult};
    use async_trait::async_trait;
    use capsule_common::api::{
        ActionResponse, DownloadOnlyData, DownloadPoll, LightweightSyncData,
        LightweightSyncRequest, StartDownloadResponse, SyncStatusData, TagSyncData,
        UploadProgressEvent,
    };
    use std::time::Duration;

    /// Answers status lookups slowly with whatever `current` holds at answer time
    struct SlowStatusApi {
        current: std::sync::Mutex<AssetStatus>,
        delay: Duration,
    }

    impl SlowStatusApi {
        fn new(initial: AssetStatus) -> Arc<Self> {
            Arc::new(Self {
                current: std::sync::Mutex::new(initial),
                delay: Duration::from_millis(100),
            })
        }

        fn set(&self, status: AssetStatus) {
            *self.current.lock().unwrap() = status;
        }
    }

    fn unused<T>() -> SyncResult<T> {
        Err(SyncError::Remote("unused".to_string()))
    }

    #[async_trait]
    impl CapsuleApi for SlowStatusApi {
        async fn asset_status(&self, id: CapsuleId) -> SyncResult<AssetStatusReport> {
            // Read before sleeping: the answer reflects the state at request time
            let status = *self.current.lock().unwrap();
            tokio::time::sleep(self.delay).await;
            let mut report = AssetStatusReport::fallback(id);
            report.asset_status = status;
            Ok(report)
        }
        async fn start_download(&self, _: CapsuleId, _: bool) -> SyncResult<StartDownloadResponse> {
            unused()
        }
        async fn download_status(&self, _: CapsuleId) -> SyncResult<DownloadPoll> {
            unused()
        }
        async fn pause_download(&self, _: CapsuleId) -> SyncResult<ActionResponse> {
            unused()
        }
        async fn resume_download(&self, _: CapsuleId) -> SyncResult<ActionResponse> {
            unused()
        }
        async fn cancel_download(&self, _: CapsuleId) -> SyncResult<ActionResponse> {
            unused()
        }
        async fn lightweight_sync(
            &self,
            _: &LightweightSyncRequest,
        ) -> SyncResult<SyncResponse<LightweightSyncData>> {
            unused()
        }
        async fn upload_progress(&self, _: CapsuleId) -> SyncResult<Option<UploadProgressEvent>> {
            unused()
        }
        async fn download_only(&self, _: bool) -> SyncResult<SyncResponse<DownloadOnlyData>> {
            unused()
        }
        async fn sync_status(&self) -> SyncResult<SyncStatusData> {
            unused()
        }
        async fn sync_tags(&self) -> SyncResult<SyncResponse<TagSyncData>> {
            unused()
        }
        async fn open_capsule(&self, _: CapsuleId, _: bool) -> SyncResult<()> {
            unused()
        }
        async fn is_authenticated(&self) -> bool {
            true
        }
    }

    fn resolver(api: Arc<SlowStatusApi>) -> Arc<AssetStatusResolver> {
        Arc::new(AssetStatusResolver::new(api, EventBus::new(16)))
    }

    #[tokio::test]
    async fn test_invalidate_during_fetch_drops_stale_answer() {
        let api = SlowStatusApi::new(AssetStatus::CloudOnly);
        let resolver = resolver(Arc::clone(&api));

        // Given: a lookup is in flight with the old state
        let pending = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.get_status(CapsuleId(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // When: the download finishes and the capsule is invalidated
        api.set(AssetStatus::Full);
        resolver.invalidate(CapsuleId(1)).await;
        let stale = pending.await.unwrap();

        // Then: the caller gets its answer but the cache does not keep it
        assert_eq!(stale.asset_status, AssetStatus::CloudOnly);
        assert!(resolver.cached(CapsuleId(1)).await.is_none());
        assert_eq!(resolver.status(CapsuleId(1)).await, AssetStatus::Full);
        assert_eq!(
            resolver.cached(CapsuleId(1)).await.map(|r| r.asset_status),
            Some(AssetStatus::Full)
        );
    }

    #[tokio::test]
    async fn test_invalidate_all_during_fetch_drops_stale_answer() {
        let api = SlowStatusApi::new(AssetStatus::CloudOnly);
        let resolver = resolver(Arc::clone(&api));

        let pending = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.get_status(CapsuleId(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        api.set(AssetStatus::Synced);
        resolver.invalidate_all().await;
        pending.await.unwrap();

        assert!(resolver.is_empty().await);
        assert_eq!(resolver.status(CapsuleId(2)).await, AssetStatus::Synced);
    }

    #[tokio::test]
    async fn test_invalidating_another_capsule_keeps_fetch() {
        let api = SlowStatusApi::new(AssetStatus::Local);
        let resolver = resolver(Arc::clone(&api));

        let pending = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.get_status(CapsuleId(3)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        resolver.invalidate(CapsuleId(4)).await;
        pending.await.unwrap();

        assert_eq!(
            resolver.cached(CapsuleId(3)).await.map(|r| r.asset_status),
            Some(AssetStatus::Local)
        );
    }
}
