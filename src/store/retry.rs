use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{PresenceCallback, PresenceStore, SignalCallback, SignalingChannel, Subscription};
use crate::error::SessionResult;
use crate::model::{Participant, ParticipantPatch, SignalingMessage};

/// Exponential backoff for store calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Compute the delay for attempt `n` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay * 2u32.saturating_pow(attempt);
        delay.min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are used up.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: &'static str, mut f: F) -> SessionResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SessionResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    op,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "store call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

// ─── Retrying decorator ─────────────────────────────────────────────────────

/// Wraps a backend so every adapter call is retried with backoff.
pub struct Retrying<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> Retrying<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<S: PresenceStore> PresenceStore for Retrying<S> {
    async fn join(&self, meeting_id: &str, participant: &Participant) -> SessionResult<()> {
        with_retry(&self.policy, "presence.join", || {
            self.inner.join(meeting_id, participant)
        })
        .await
    }

    async fn leave(&self, meeting_id: &str, participant_id: &str) -> SessionResult<()> {
        with_retry(&self.policy, "presence.leave", || {
            self.inner.leave(meeting_id, participant_id)
        })
        .await
    }

    async fn update_self(
        &self,
        meeting_id: &str,
        participant_id: &str,
        patch: &ParticipantPatch,
    ) -> SessionResult<()> {
        with_retry(&self.policy, "presence.update_self", || {
            self.inner.update_self(meeting_id, participant_id, patch)
        })
        .await
    }

    async fn subscribe(
        &self,
        meeting_id: &str,
        on_change: PresenceCallback,
    ) -> SessionResult<Subscription> {
        with_retry(&self.policy, "presence.subscribe", || {
            PresenceStore::subscribe(&self.inner, meeting_id, on_change.clone())
        })
        .await
    }
}

#[async_trait]
impl<S: SignalingChannel> SignalingChannel for Retrying<S> {
    async fn send(&self, meeting_id: &str, message: &SignalingMessage) -> SessionResult<()> {
        with_retry(&self.policy, "signaling.send", || {
            self.inner.send(meeting_id, message)
        })
        .await
    }

    async fn subscribe(
        &self,
        meeting_id: &str,
        on_message: SignalCallback,
    ) -> SessionResult<Subscription> {
        with_retry(&self.policy, "signaling.subscribe", || {
            SignalingChannel::subscribe(&self.inner, meeting_id, on_message.clone())
        })
        .await
    }

    async fn purge_mine(&self, meeting_id: &str, participant_id: &str) -> SessionResult<()> {
        with_retry(&self.policy, "signaling.purge_mine", || {
            self.inner.purge_mine(meeting_id, participant_id)
        })
        .await
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn retry_policy_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(5), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SessionError::StoreUnavailable("flaky".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: SessionResult<()> = with_retry(&fast_policy(3), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SessionError::StoreUnavailable("down".into()))
        })
        .await;

        assert!(matches!(result, Err(SessionError::StoreUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: SessionResult<()> = with_retry(&fast_policy(5), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SessionError::InvalidSignal("bad".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn decorator_recovers_when_backend_returns() {
        let backend = MemoryStore::new();
        backend.set_available(false);
        let store = Retrying::new(backend.clone(), fast_policy(50));

        let restore = backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            restore.set_available(true);
        });

        store.leave("m1", "u1").await.unwrap();
    }
}
