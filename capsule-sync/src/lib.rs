//! capsule-sync library interface
//!
//! Client-side sync core for Sound Capsules: asset status resolution, JIT
//! downloads, lightweight uploads, progress polling and the boot-time
//! reconciliation run. Everything talks to the remote service through
//! [`client::CapsuleApi`] and reports to the user through the shared
//! [`EventBus`].

pub mod auth;
pub mod boot;
pub mod client;
pub mod download;
pub mod error;
pub mod jit;
pub mod scheduler;
pub mod status;
pub mod sync_status;
pub mod upload;

pub use crate::error::{SyncError, SyncResult};

use crate::auth::{Credentials, TokenStore};
use crate::boot::BootSync;
use crate::client::{CapsuleApi, HttpCapsuleApi};
use crate::download::DownloadTracker;
use crate::jit::{CapsuleOpener, JitGate, RemoteOpener};
use crate::scheduler::PollScheduler;
use crate::status::AssetStatusResolver;
use crate::sync_status::SyncMonitor;
use crate::upload::UploadOrchestrator;
use capsule_common::config::TomlConfig;
use capsule_common::events::EventBus;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default event bus capacity
pub const EVENT_BUS_CAPACITY: usize = 256;

/// All sync components wired to one API client, bus and scheduler
#[derive(Clone)]
pub struct SyncCore {
    pub config: TomlConfig,
    pub bus: EventBus,
    pub api: Arc<dyn CapsuleApi>,
    /// Present when built from configuration with the HTTP client
    pub tokens: Option<Arc<TokenStore>>,
    pub scheduler: Arc<PollScheduler>,
    pub resolver: Arc<AssetStatusResolver>,
    pub downloads: Arc<DownloadTracker>,
    pub uploads: Arc<UploadOrchestrator>,
    pub monitor: Arc<SyncMonitor>,
    pub boot: Arc<BootSync>,
    pub shutdown: CancellationToken,
}

impl SyncCore {
    /// Build the core around the HTTP client described by `config`
    pub fn from_config(config: TomlConfig) -> SyncResult<Self> {
        config.validate()?;
        let bus = EventBus::new(EVENT_BUS_CAPACITY);
        let tokens = Arc::new(TokenStore::new(
            Credentials::new(
                config.auth.access_token.clone(),
                config.auth.refresh_token.clone(),
            ),
            bus.clone(),
        ));
        let api: Arc<dyn CapsuleApi> = Arc::new(HttpCapsuleApi::new(&config, Arc::clone(&tokens))?);

        let mut core = Self::with_api(config, api, bus);
        core.tokens = Some(tokens);
        Ok(core)
    }

    /// Build the core around any [`CapsuleApi`] implementation
    pub fn with_api(config: TomlConfig, api: Arc<dyn CapsuleApi>, bus: EventBus) -> Self {
        let scheduler = Arc::new(PollScheduler::new());
        let resolver = Arc::new(AssetStatusResolver::new(Arc::clone(&api), bus.clone()));
        let downloads = Arc::new(DownloadTracker::new(
            Arc::clone(&api),
            Arc::clone(&resolver),
            Arc::clone(&scheduler),
            bus.clone(),
            config.download_poll_interval(),
        ));
        let uploads = Arc::new(UploadOrchestrator::new(
            Arc::clone(&api),
            Arc::clone(&resolver),
            Arc::clone(&scheduler),
            bus.clone(),
            config.upload_poll_interval(),
            config.include_previews,
        ));
        let monitor = Arc::new(SyncMonitor::new(Arc::clone(&api), bus.clone()));
        let boot = Arc::new(BootSync::new(
            Arc::clone(&api),
            Arc::clone(&monitor),
            Arc::clone(&resolver),
            bus.clone(),
            config.include_previews,
            config.boot_skip_after(),
        ));

        Self {
            config,
            bus,
            api,
            tokens: None,
            scheduler,
            resolver,
            downloads,
            uploads,
            monitor,
            boot,
            shutdown: CancellationToken::new(),
        }
    }

    /// JIT gate that opens capsules through the remote open endpoint
    pub fn jit_gate(&self) -> JitGate {
        self.jit_gate_with(Arc::new(RemoteOpener::new(Arc::clone(&self.api))))
    }

    pub fn jit_gate_with(&self, opener: Arc<dyn CapsuleOpener>) -> JitGate {
        JitGate::new(
            Arc::clone(&self.resolver),
            Arc::clone(&self.downloads),
            opener,
            self.bus.clone(),
        )
    }

    /// Start the debounced auto-sync listener if enabled
    pub fn spawn_auto_sync(&self) -> Option<JoinHandle<()>> {
        if !self.config.auto_sync.enabled {
            return None;
        }
        Some(
            self.monitor
                .spawn_auto_sync(self.config.auto_sync_delay(), self.shutdown.child_token()),
        )
    }

    /// Stop background listeners and every poll loop
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.downloads.shutdown().await;
        self.scheduler.cancel_all();
    }
}
