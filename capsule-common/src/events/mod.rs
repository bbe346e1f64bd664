//! Event types for the capsule event system
//!
//! Provides the shared event definitions and the EventBus used for
//! cross-component notification (sync finished, cache invalidated, progress,
//! user-visible notices).

mod notice_types;

pub use notice_types::NoticeLevel;

use crate::api::types::{CapsuleId, DownloadState, DownloadTask, UploadProgressEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capsule client event types
///
/// Events are broadcast via EventBus and can be serialized for logging or
/// forwarding to a UI process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CapsuleEvent {
    /// A sync run made forward progress; capsule lists should be refreshed
    ///
    /// Emitted on full success and on partial success (HTTP 207).
    SyncCompleted { timestamp: DateTime<Utc> },

    /// A sync run failed without making progress
    SyncFailed {
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Local data was edited; triggers the debounced auto-sync
    DataChanged { timestamp: DateTime<Utc> },

    /// Cached asset status was evicted
    AssetStatusInvalidated {
        /// `None` when the whole cache was cleared
        capsule_id: Option<CapsuleId>,
        timestamp: DateTime<Utc>,
    },

    /// Download progress observed by a poll tick
    DownloadProgress {
        task: DownloadTask,
        timestamp: DateTime<Utc>,
    },

    /// Download reached a terminal state
    DownloadFinished {
        capsule_id: CapsuleId,
        state: DownloadState,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Upload progress observed by a poll tick
    UploadProgress {
        progress: UploadProgressEvent,
        /// Rendered status line ("stage · file NN%")
        text: String,
        timestamp: DateTime<Utc>,
    },

    /// Upload request finished
    UploadFinished {
        capsule_ids: Vec<CapsuleId>,
        level: NoticeLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Boot-time reconciliation progress
    BootSyncProgress {
        phase: String,
        percentage: u8,
        timestamp: DateTime<Utc>,
    },

    /// User-visible message
    Notice {
        level: NoticeLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Token refresh failed; stored credentials were cleared
    AuthFailed { timestamp: DateTime<Utc> },
}

impl CapsuleEvent {
    pub fn notice(level: NoticeLevel, message: impl Into<String>) -> Self {
        CapsuleEvent::Notice {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn sync_completed() -> Self {
        CapsuleEvent::SyncCompleted {
            timestamp: Utc::now(),
        }
    }

    pub fn sync_failed(error: impl Into<String>) -> Self {
        CapsuleEvent::SyncFailed {
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn data_changed() -> Self {
        CapsuleEvent::DataChanged {
            timestamp: Utc::now(),
        }
    }

    /// Event type name (matches the serde tag)
    pub fn event_type(&self) -> &'static str {
        match self {
            CapsuleEvent::SyncCompleted { .. } => "SyncCompleted",
            CapsuleEvent::SyncFailed { .. } => "SyncFailed",
            CapsuleEvent::DataChanged { .. } => "DataChanged",
            CapsuleEvent::AssetStatusInvalidated { .. } => "AssetStatusInvalidated",
            CapsuleEvent::DownloadProgress { .. } => "DownloadProgress",
            CapsuleEvent::DownloadFinished { .. } => "DownloadFinished",
            CapsuleEvent::UploadProgress { .. } => "UploadProgress",
            CapsuleEvent::UploadFinished { .. } => "UploadFinished",
            CapsuleEvent::BootSyncProgress { .. } => "BootSyncProgress",
            CapsuleEvent::Notice { .. } => "Notice",
            CapsuleEvent::AuthFailed { .. } => "AuthFailed",
        }
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus for client-wide events
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
///
/// Delivery is at-most-once with no replay: a subscriber only sees events
/// emitted after it subscribed, and a subscriber that falls more than
/// `capacity` events behind loses the oldest ones (`RecvError::Lagged`).
///
/// # Examples
///
/// ```
/// use capsule_common::events::{CapsuleEvent, EventBus};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(CapsuleEvent::sync_completed());
/// assert!(matches!(rx.try_recv(), Ok(CapsuleEvent::SyncCompleted { .. })));
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CapsuleEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before dropping old events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Returns a receiver that will receive all events emitted after subscription.
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<CapsuleEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: CapsuleEvent,
    ) -> Result<usize, broadcast::error::SendError<CapsuleEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    ///
    /// Used for progress and notices, where it's acceptable if no component
    /// is currently listening.
    pub fn emit_lossy(&self, event: CapsuleEvent) {
        if let Err(err) = self.tx.send(event) {
            tracing::trace!(event_type = err.0.event_type(), "No subscribers for event");
        }
    }

    /// Emit a user-visible notice
    pub fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        self.emit_lossy(CapsuleEvent::notice(level, message));
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
