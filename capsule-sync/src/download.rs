//! Download task tracker
//!
//! Starts just-in-time asset downloads and follows them with a `Download`
//! poll session until the remote reports a terminal state. Each tracked
//! download publishes its latest [`DownloadTask`] on a `watch` channel, so any
//! number of [`TaskHandle`]s can observe it.

use crate::client::CapsuleApi;
use crate::error::{SyncError, SyncResult};
use crate::scheduler::{PollKey, PollScheduler};
use crate::status::AssetStatusResolver;
use capsule_common::api::{ActionResponse, CapsuleId, DownloadPoll, DownloadState, DownloadTask};
use capsule_common::events::{CapsuleEvent, EventBus, NoticeLevel};
use chrono::Utc;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Observer of one download
#[derive(Clone)]
pub struct TaskHandle {
    capsule_id: CapsuleId,
    rx: watch::Receiver<DownloadTask>,
}

impl TaskHandle {
    pub fn capsule_id(&self) -> CapsuleId {
        self.capsule_id
    }

    pub fn latest(&self) -> DownloadTask {
        self.rx.borrow().clone()
    }

    /// Wait until the download reaches `completed`, `failed` or `cancelled`
    ///
    /// Returns [`SyncError::Cancelled`] if tracking stopped before a terminal
    /// state was seen (e.g. the tracker was shut down).
    pub async fn wait(&mut self) -> SyncResult<DownloadTask> {
        loop {
            {
                let task = self.rx.borrow_and_update();
                if task.state.is_terminal() {
                    return Ok(task.clone());
                }
            }
            if self.rx.changed().await.is_err() {
                let task = self.rx.borrow().clone();
                return if task.state.is_terminal() {
                    Ok(task)
                } else {
                    Err(SyncError::Cancelled)
                };
            }
        }
    }

    /// Wait for the next published update
    pub async fn changed(&mut self) -> Option<DownloadTask> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

fn failed_task(id: CapsuleId, message: &str) -> DownloadTask {
    DownloadTask {
        state: DownloadState::Failed,
        error_message: Some(message.to_string()),
        ..DownloadTask::pending(id)
    }
}

struct TrackerShared {
    api: Arc<dyn CapsuleApi>,
    resolver: Arc<AssetStatusResolver>,
    scheduler: Arc<PollScheduler>,
    bus: EventBus,
    interval: Duration,
    tasks: Mutex<HashMap<CapsuleId, watch::Sender<DownloadTask>>>,
}

impl TrackerShared {
    /// One poll tick for `id`
    async fn poll_tick(&self, id: CapsuleId) -> ControlFlow<()> {
        match self.api.download_status(id).await {
            Ok(DownloadPoll::NotStarted) => {
                debug!(capsule_id = %id, "Download not started yet");
                ControlFlow::Continue(())
            }
            Ok(DownloadPoll::Task(task)) => {
                debug!(
                    capsule_id = %id,
                    state = %task.state,
                    progress = task.progress,
                    "Download progress"
                );
                self.publish(task.clone()).await;
                self.bus.emit_lossy(CapsuleEvent::DownloadProgress {
                    task: task.clone(),
                    timestamp: Utc::now(),
                });

                if task.state.is_terminal() {
                    self.finish(task).await;
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
            Err(err) => {
                warn!(capsule_id = %id, error = %err, "Download status poll failed, retrying");
                ControlFlow::Continue(())
            }
        }
    }

    async fn publish(&self, task: DownloadTask) {
        if let Some(tx) = self.tasks.lock().await.get(&task.capsule_id) {
            tx.send_replace(task);
        }
    }

    /// Record a terminal state: cache eviction, events, stop tracking
    async fn finish(&self, task: DownloadTask) {
        let id = task.capsule_id;
        if let Some(tx) = self.tasks.lock().await.remove(&id) {
            tx.send_replace(task.clone());
        }

        self.resolver.invalidate(id).await;
        self.bus.emit_lossy(CapsuleEvent::DownloadFinished {
            capsule_id: id,
            state: task.state,
            error: task.error_message.clone(),
            timestamp: Utc::now(),
        });

        match task.state {
            DownloadState::Completed => {
                info!(capsule_id = %id, "Download completed");
                self.bus
                    .notify(NoticeLevel::Success, format!("Capsule {} downloaded", id));
            }
            DownloadState::Failed => {
                let message = task
                    .error_message
                    .clone()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "Download failed".to_string());
                error!(capsule_id = %id, error = %message, "Download failed");
                self.bus.notify(
                    NoticeLevel::Error,
                    format!("Download of capsule {} failed: {}", id, message),
                );
            }
            _ => info!(capsule_id = %id, state = %task.state, "Download ended"),
        }
    }

    /// Stop tracking `id` without polling, publishing `task` to any observers
    async fn release(&self, id: CapsuleId, task: DownloadTask) {
        if let Some(tx) = self.tasks.lock().await.remove(&id) {
            tx.send_replace(task);
        }
    }

    /// Optimistically move the tracked task to `state`
    async fn set_state(&self, id: CapsuleId, state: DownloadState) {
        if let Some(tx) = self.tasks.lock().await.get(&id) {
            tx.send_modify(|task| task.state = state);
        }
    }
}

pub struct DownloadTracker {
    shared: Arc<TrackerShared>,
}

impl DownloadTracker {
    pub fn new(
        api: Arc<dyn CapsuleApi>,
        resolver: Arc<AssetStatusResolver>,
        scheduler: Arc<PollScheduler>,
        bus: EventBus,
        interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(TrackerShared {
                api,
                resolver,
                scheduler,
                bus,
                interval,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start downloading a capsule's assets and begin polling its progress
    ///
    /// If a download for `id` is already tracked, a handle to it is returned
    /// instead of starting another one.
    pub async fn start_download(&self, id: CapsuleId) -> SyncResult<TaskHandle> {
        let shared = &self.shared;

        // Claim the id before asking the remote so concurrent callers attach
        let rx = {
            let mut tasks = shared.tasks.lock().await;
            if let Some(tx) = tasks.get(&id) {
                debug!(capsule_id = %id, "Download already tracked, attaching");
                return Ok(TaskHandle {
                    capsule_id: id,
                    rx: tx.subscribe(),
                });
            }
            let (tx, rx) = watch::channel(DownloadTask::pending(id));
            tasks.insert(id, tx);
            rx
        };

        let response = match shared.api.start_download(id, false).await {
            Ok(response) => response,
            Err(err) => {
                let message = err.user_message();
                shared.release(id, failed_task(id, &message)).await;
                shared.bus.notify(
                    NoticeLevel::Error,
                    format!("Could not start download of capsule {}: {}", id, message),
                );
                return Err(err);
            }
        };

        if !response.success {
            let message = response
                .error
                .or(response.message)
                .unwrap_or_else(|| "Download request rejected".to_string());
            shared.release(id, failed_task(id, &message)).await;
            shared.bus.notify(
                NoticeLevel::Error,
                format!("Could not start download of capsule {}: {}", id, message),
            );
            return Err(SyncError::Remote(message));
        }

        if response.already_downloaded {
            info!(capsule_id = %id, "Assets already downloaded");
            shared.release(id, DownloadTask::completed(id)).await;
            shared.resolver.invalidate(id).await;
            shared.bus.emit_lossy(CapsuleEvent::DownloadFinished {
                capsule_id: id,
                state: DownloadState::Completed,
                error: None,
                timestamp: Utc::now(),
            });
            return Ok(TaskHandle { capsule_id: id, rx });
        }

        info!(capsule_id = %id, task_id = ?response.task_id, "Download started");

        let poll_shared = Arc::clone(shared);
        let started = shared
            .scheduler
            .start(PollKey::download(id), shared.interval, move || {
                let shared = Arc::clone(&poll_shared);
                async move { shared.poll_tick(id).await }
            });

        match started {
            // The session owns its own lifetime; the watch channel reports progress
            Ok(_handle) => {}
            Err(SyncError::Busy(_)) => {
                debug!(capsule_id = %id, "Download poll session already live");
            }
            Err(err) => {
                shared
                    .release(id, failed_task(id, &err.user_message()))
                    .await;
                return Err(err);
            }
        }

        Ok(TaskHandle { capsule_id: id, rx })
    }

    /// One-shot status read, independent of any tracked task
    pub async fn poll_status(&self, id: CapsuleId) -> SyncResult<DownloadPoll> {
        self.shared.api.download_status(id).await
    }

    /// Handle to a download currently being tracked
    pub async fn handle(&self, id: CapsuleId) -> Option<TaskHandle> {
        self.shared.tasks.lock().await.get(&id).map(|tx| TaskHandle {
            capsule_id: id,
            rx: tx.subscribe(),
        })
    }

    pub async fn is_tracking(&self, id: CapsuleId) -> bool {
        self.shared.tasks.lock().await.contains_key(&id)
    }

    pub async fn pause(&self, id: CapsuleId) -> SyncResult<()> {
        let response = self.shared.api.pause_download(id).await;
        self.apply_control(id, "pause", response).await?;
        self.shared.set_state(id, DownloadState::Paused).await;
        Ok(())
    }

    pub async fn resume(&self, id: CapsuleId) -> SyncResult<()> {
        let response = self.shared.api.resume_download(id).await;
        self.apply_control(id, "resume", response).await?;
        self.shared.set_state(id, DownloadState::Downloading).await;
        Ok(())
    }

    /// Cancel the remote task and stop polling it
    pub async fn cancel(&self, id: CapsuleId) -> SyncResult<()> {
        let response = self.shared.api.cancel_download(id).await;
        self.apply_control(id, "cancel", response).await?;

        self.shared.scheduler.cancel(PollKey::download(id));
        let mut task = self
            .handle(id)
            .await
            .map(|h| h.latest())
            .unwrap_or_else(|| DownloadTask::pending(id));
        task.state = DownloadState::Cancelled;
        self.shared.finish(task).await;
        Ok(())
    }

    async fn apply_control(
        &self,
        id: CapsuleId,
        action: &str,
        response: SyncResult<ActionResponse>,
    ) -> SyncResult<()> {
        let err = match response {
            Ok(ActionResponse { success: true, .. }) => {
                info!(capsule_id = %id, action, "Download control accepted");
                return Ok(());
            }
            Ok(ActionResponse { error, .. }) => {
                SyncError::Remote(error.unwrap_or_else(|| format!("{} rejected", action)))
            }
            Err(err) => err,
        };

        warn!(capsule_id = %id, action, error = %err, "Download control failed");
        self.shared.bus.notify(
            NoticeLevel::Error,
            format!("Could not {} download of capsule {}: {}", action, id, err.user_message()),
        );
        Err(err)
    }

    /// Stop every download poll loop
    pub async fn shutdown(&self) {
        let ids: Vec<CapsuleId> = self.shared.tasks.lock().await.drain().map(|(id, _)| id).collect();
        for id in ids {
            self.shared.scheduler.cancel(PollKey::download(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_released_handle_resolves_with_last_task() {
        let (tx, rx) = watch::channel(DownloadTask::pending(CapsuleId(5)));
        let mut handle = TaskHandle {
            capsule_id: CapsuleId(5),
            rx,
        };
        tx.send_replace(DownloadTask::completed(CapsuleId(5)));
        drop(tx);
        let task = handle.wait().await.unwrap();
        assert_eq!(task.state, DownloadState::Completed);
        assert_eq!(task.progress, 100.0);
    }

    #[tokio::test]
    async fn test_dropped_sender_without_terminal_state_is_cancelled() {
        let (tx, rx) = watch::channel(DownloadTask::pending(CapsuleId(6)));
        let mut handle = TaskHandle {
            capsule_id: CapsuleId(6),
            rx,
        };
        drop(tx);
        assert!(matches!(handle.wait().await, Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn test_wait_sees_terminal_update() {
        let (tx, rx) = watch::channel(DownloadTask::pending(CapsuleId(7)));
        let mut handle = TaskHandle {
            capsule_id: CapsuleId(7),
            rx,
        };

        tokio::spawn(async move {
            let mut task = DownloadTask::pending(CapsuleId(7));
            task.state = DownloadState::Downloading;
            tx.send_replace(task.clone());
            task.state = DownloadState::Failed;
            task.error_message = Some("gone".into());
            tx.send_replace(task);
        });

        let task = handle.wait().await.unwrap();
        assert_eq!(task.state, DownloadState::Failed);
        assert_eq!(task.error_message.as_deref(), Some("gone"));
    }
}
