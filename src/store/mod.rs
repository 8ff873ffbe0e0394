//! Presence store and signaling channel adapters.
//!
//! Both are traits so the coordinator never knows which backend is behind
//! them. `memory://` gives a process-local store, `redis://` a shared one.

pub mod memory;
pub mod redis;
pub mod retry;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{SessionError, SessionResult};
use crate::model::{Participant, ParticipantPatch, SignalingMessage};

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use self::retry::{RetryPolicy, Retrying};

/// Receives the full participant set after every change, or the error that
/// ended the subscription.
pub type PresenceCallback = Arc<dyn Fn(SessionResult<Vec<Participant>>) + Send + Sync>;

/// Receives each signaling message in arrival order, or the error that ended
/// the subscription.
pub type SignalCallback = Arc<dyn Fn(SessionResult<SignalingMessage>) + Send + Sync>;

/// Messages kept per author. Older ones are trimmed on every append.
pub const SIGNAL_LOG_LIMIT: usize = 256;

/// An author's log expires this long after its last append.
pub const SIGNAL_LOG_TTL_SECS: i64 = 3600;

// ─── Traits ─────────────────────────────────────────────────────────────────

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Upsert the caller's record.
    async fn join(&self, meeting_id: &str, participant: &Participant) -> SessionResult<()>;

    /// Remove a record. Removing an absent record succeeds.
    async fn leave(&self, meeting_id: &str, participant_id: &str) -> SessionResult<()>;

    /// Patch the caller's own control fields.
    async fn update_self(
        &self,
        meeting_id: &str,
        participant_id: &str,
        patch: &ParticipantPatch,
    ) -> SessionResult<()>;

    /// Deliver the current participant set immediately, then again after
    /// every change.
    async fn subscribe(
        &self,
        meeting_id: &str,
        on_change: PresenceCallback,
    ) -> SessionResult<Subscription>;
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Append a message. No delivery acknowledgement. Each author's log is
    /// capped at [`SIGNAL_LOG_LIMIT`] messages.
    async fn send(&self, meeting_id: &str, message: &SignalingMessage) -> SessionResult<()>;

    /// Deliver every message appended after this call.
    async fn subscribe(
        &self,
        meeting_id: &str,
        on_message: SignalCallback,
    ) -> SessionResult<Subscription>;

    /// Delete every message authored by `participant_id`.
    async fn purge_mine(&self, meeting_id: &str, participant_id: &str) -> SessionResult<()>;
}

// ─── Subscription ───────────────────────────────────────────────────────────

/// Handle to a running listener task. Dropping it unsubscribes.
pub struct Subscription {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stop delivering. The callback is not invoked after this returns,
    /// except for a call already in progress on another thread.
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

// ─── Backend selection ──────────────────────────────────────────────────────

/// Presence and signaling adapters backed by the same store.
#[derive(Clone)]
pub struct StoreHandles {
    pub presence: Arc<dyn PresenceStore>,
    pub signaling: Arc<dyn SignalingChannel>,
}

/// Open the backend named by `url`, wrapped in the retry policy.
///
/// `memory://` is process-local; anything starting with `redis://` or
/// `rediss://` connects to Redis.
pub async fn open(url: &str, policy: RetryPolicy) -> SessionResult<StoreHandles> {
    if url.starts_with("memory://") {
        info!("using in-process presence store");
        let store = Retrying::new(MemoryStore::new(), policy);
        let store = Arc::new(store);
        return Ok(StoreHandles {
            presence: store.clone(),
            signaling: store,
        });
    }

    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let store = retry::with_retry(&policy, "connect", || RedisStore::connect(url, policy.clone()))
            .await?;
        let store = Arc::new(Retrying::new(store, policy));
        return Ok(StoreHandles {
            presence: store.clone(),
            signaling: store,
        });
    }

    Err(SessionError::Config(format!(
        "unsupported store url '{url}' (expected memory:// or redis://)"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_scheme_is_config_error() {
        let err = open("postgres://localhost", RetryPolicy::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "config_error");
    }

    #[tokio::test]
    async fn memory_url_shares_one_store() {
        let handles = open("memory://", RetryPolicy::default()).await.unwrap();
        let identity = crate::model::Identity {
            id: "u1".into(),
            display_name: None,
            photo_ref: None,
        };
        handles
            .presence
            .join("m1", &Participant::new(&identity, false, false))
            .await
            .unwrap();
        handles.signaling.purge_mine("m1", "u1").await.unwrap();
    }

    #[tokio::test]
    async fn dropping_subscription_stops_task() {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let task = tokio::spawn(async move { child.cancelled().await });
        let sub = Subscription::new(cancel.clone(), task);
        assert!(sub.is_active());
        drop(sub);
        assert!(cancel.is_cancelled());
    }
}
