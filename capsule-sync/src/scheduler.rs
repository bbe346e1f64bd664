//! Polling scheduler
//!
//! Every poll loop in the client runs here, keyed by `(capsule, kind)`. At
//! most one live session exists per key; asking for a second one is refused
//! rather than silently creating a duplicate loop.

use crate::error::{SyncError, SyncResult};
use capsule_common::api::CapsuleId;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// What a poll session watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollKind {
    Download,
    Upload,
}

impl fmt::Display for PollKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollKind::Download => f.write_str("download"),
            PollKind::Upload => f.write_str("upload"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollKey {
    pub capsule_id: CapsuleId,
    pub kind: PollKind,
}

impl PollKey {
    pub fn download(capsule_id: CapsuleId) -> Self {
        Self {
            capsule_id,
            kind: PollKind::Download,
        }
    }

    pub fn upload(capsule_id: CapsuleId) -> Self {
        Self {
            capsule_id,
            kind: PollKind::Upload,
        }
    }
}

impl fmt::Display for PollKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.capsule_id)
    }
}

struct Session {
    id: Uuid,
    token: CancellationToken,
}

type SessionMap = Arc<Mutex<HashMap<PollKey, Session>>>;

fn lock(sessions: &SessionMap) -> MutexGuard<'_, HashMap<PollKey, Session>> {
    // A panicking poll fn cannot leave the map half-updated
    sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Remove `key` only while it still belongs to `session_id`
fn release(sessions: &SessionMap, key: PollKey, session_id: Uuid) {
    let mut sessions = lock(sessions);
    if sessions.get(&key).map(|s| s.id) == Some(session_id) {
        sessions.remove(&key);
    }
}

/// Handle to one running poll loop
pub struct PollHandle {
    key: PollKey,
    session_id: Uuid,
    sessions: SessionMap,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl PollHandle {
    pub fn key(&self) -> PollKey {
        self.key
    }

    /// Stop this loop (no further ticks start)
    ///
    /// The key is free as soon as this returns, even if the loop task has
    /// not observed the cancellation yet.
    pub fn cancel(&self) {
        release(&self.sessions, self.key, self.session_id);
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the loop to end, either by a terminal tick or by cancellation
    pub async fn finished(self) {
        if let Err(err) = self.join.await {
            if err.is_panic() {
                tracing::error!(key = %self.key, "Poll session panicked");
            }
        }
    }
}

#[derive(Default)]
pub struct PollScheduler {
    sessions: SessionMap,
}

impl PollScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a poll loop for `key`, ticking every `interval`
    ///
    /// The first tick fires immediately. `poll_fn` returns
    /// `ControlFlow::Break(())` once it has observed a terminal state; the
    /// loop then ends and the key becomes free again. Returns
    /// [`SyncError::Busy`] if a session for `key` is still live.
    pub fn start<F, Fut>(
        &self,
        key: PollKey,
        interval: Duration,
        mut poll_fn: F,
    ) -> SyncResult<PollHandle>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let session_id = Uuid::new_v4();
        let token = CancellationToken::new();

        {
            let mut sessions = lock(&self.sessions);
            if sessions.contains_key(&key) {
                return Err(SyncError::Busy(format!("{} poll already running", key)));
            }
            sessions.insert(
                key,
                Session {
                    id: session_id,
                    token: token.clone(),
                },
            );
        }

        let loop_sessions = Arc::clone(&self.sessions);
        let loop_token = token.clone();
        let join = tokio::spawn(async move {
            debug!(key = %key, ?interval, "Poll session started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let flow = tokio::select! {
                    biased;
                    _ = loop_token.cancelled() => break,
                    flow = poll_fn() => flow,
                };

                if flow.is_break() {
                    debug!(key = %key, "Poll session reached terminal state");
                    break;
                }
            }

            release(&loop_sessions, key, session_id);
            debug!(key = %key, "Poll session ended");
        });

        Ok(PollHandle {
            key,
            session_id,
            sessions: Arc::clone(&self.sessions),
            token,
            join,
        })
    }

    /// Cancel the session for `key`; returns whether one was live
    pub fn cancel(&self, key: PollKey) -> bool {
        match lock(&self.sessions).remove(&key) {
            Some(session) => {
                session.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let drained: Vec<Session> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Cancelling all poll sessions");
        }
        for session in drained {
            session.token.cancel();
        }
    }

    pub fn is_active(&self, key: PollKey) -> bool {
        lock(&self.sessions).contains_key(&key)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.sessions).len()
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TICK: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn test_terminal_tick_ends_session_and_frees_key() {
        let scheduler = PollScheduler::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = PollKey::download(CapsuleId(1));

        let counter = Arc::clone(&calls);
        let handle = scheduler
            .start(key, TICK, move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                }
            })
            .unwrap();

        handle.finished().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!scheduler.is_active(key));

        // No further polls after the terminal one
        tokio::time::sleep(TICK * 5).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_duplicate_key_is_rejected() {
        let scheduler = PollScheduler::new();
        let key = PollKey::upload(CapsuleId(2));

        let _first = scheduler
            .start(key, TICK, || async { ControlFlow::Continue(()) })
            .unwrap();
        let second = scheduler.start(key, TICK, || async { ControlFlow::Continue(()) });
        assert!(matches!(second, Err(SyncError::Busy(_))));

        // Same capsule, other kind is independent
        let other = scheduler.start(PollKey::download(CapsuleId(2)), TICK, || async {
            ControlFlow::Continue(())
        });
        assert!(other.is_ok());
        assert_eq!(scheduler.active_count(), 2);

        scheduler.cancel_all();
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_ticks() {
        let scheduler = PollScheduler::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = PollKey::download(CapsuleId(3));

        let counter = Arc::clone(&calls);
        let handle = scheduler
            .start(key, TICK, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { ControlFlow::Continue(()) }
            })
            .unwrap();

        tokio::time::sleep(TICK * 3).await;
        assert!(scheduler.cancel(key));
        handle.finished().await;

        let seen = calls.load(Ordering::SeqCst);
        tokio::time::sleep(TICK * 5).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
        assert!(!scheduler.cancel(key));
    }

    #[tokio::test]
    async fn test_stale_session_does_not_remove_newer_one() {
        let scheduler = PollScheduler::new();
        let key = PollKey::download(CapsuleId(4));

        let old = scheduler
            .start(key, TICK, || async { ControlFlow::Continue(()) })
            .unwrap();
        scheduler.cancel(key);

        let _new = scheduler
            .start(key, TICK, || async { ControlFlow::Continue(()) })
            .unwrap();
        old.finished().await;

        assert!(scheduler.is_active(key));
    }

    #[tokio::test]
    async fn test_handle_cancel_frees_key_at_once() {
        let scheduler = PollScheduler::new();
        let key = PollKey::upload(CapsuleId(5));

        let handle = scheduler
            .start(key, TICK, || async { ControlFlow::Continue(()) })
            .unwrap();
        handle.cancel();

        // No yield between cancel and restart
        assert!(!scheduler.is_active(key));
        let again = scheduler.start(key, TICK, || async { ControlFlow::Continue(()) });
        assert!(again.is_ok());

        // The old loop winding down must not evict the new session
        handle.finished().await;
        assert!(scheduler.is_active(key));
        scheduler.cancel_all();
    }
}
