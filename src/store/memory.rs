use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    PresenceCallback, PresenceStore, SignalCallback, SignalingChannel, Subscription,
    SIGNAL_LOG_LIMIT,
};
use crate::error::{SessionError, SessionResult};
use crate::model::{Participant, ParticipantPatch, SignalingMessage};

const CHANNEL_CAPACITY: usize = 256;

/// Process-local presence store and signaling channel.
///
/// Clones share state, so several sessions in one process (or one test) see
/// each other exactly as they would through a shared backend.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    meetings: RwLock<HashMap<String, Meeting>>,
    available: AtomicBool,
}

struct Meeting {
    participants: BTreeMap<String, Participant>,
    /// Signals per author, in append order.
    signals: HashMap<String, Vec<SignalingMessage>>,
    presence_tx: broadcast::Sender<Vec<Participant>>,
    signal_tx: broadcast::Sender<SignalingMessage>,
}

impl Meeting {
    fn new() -> Self {
        let (presence_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (signal_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            participants: BTreeMap::new(),
            signals: HashMap::new(),
            presence_tx,
            signal_tx,
        }
    }

    fn snapshot(&self) -> Vec<Participant> {
        self.participants.values().cloned().collect()
    }

    fn publish(&self) {
        // No receivers is fine.
        let _ = self.presence_tx.send(self.snapshot());
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                meetings: RwLock::new(HashMap::new()),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate losing (or regaining) the store. While unavailable every
    /// call fails with `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Current participant set, for assertions.
    pub async fn participants(&self, meeting_id: &str) -> Vec<Participant> {
        let meetings = self.inner.meetings.read().await;
        meetings
            .get(meeting_id)
            .map(Meeting::snapshot)
            .unwrap_or_default()
    }

    /// Signals authored by `participant_id` that are still stored.
    pub async fn signals_from(&self, meeting_id: &str, participant_id: &str) -> Vec<SignalingMessage> {
        let meetings = self.inner.meetings.read().await;
        meetings
            .get(meeting_id)
            .and_then(|m| m.signals.get(participant_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Drop every active subscription for a meeting, as if the backend
    /// connection went away.
    pub async fn sever_subscriptions(&self, meeting_id: &str) {
        let mut meetings = self.inner.meetings.write().await;
        if let Some(meeting) = meetings.get_mut(meeting_id) {
            let (presence_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
            let (signal_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
            meeting.presence_tx = presence_tx;
            meeting.signal_tx = signal_tx;
        }
    }

    fn check(&self) -> SessionResult<()> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SessionError::StoreUnavailable("memory store offline".into()))
        }
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn join(&self, meeting_id: &str, participant: &Participant) -> SessionResult<()> {
        self.check()?;
        let mut meetings = self.inner.meetings.write().await;
        let meeting = meetings
            .entry(meeting_id.to_string())
            .or_insert_with(Meeting::new);
        meeting
            .participants
            .insert(participant.id.clone(), participant.clone());
        meeting.publish();
        debug!(meeting_id, participant_id = %participant.id, "presence joined");
        Ok(())
    }

    async fn leave(&self, meeting_id: &str, participant_id: &str) -> SessionResult<()> {
        self.check()?;
        let mut meetings = self.inner.meetings.write().await;
        if let Some(meeting) = meetings.get_mut(meeting_id) {
            if meeting.participants.remove(participant_id).is_some() {
                meeting.publish();
                debug!(meeting_id, participant_id, "presence left");
            }
        }
        Ok(())
    }

    async fn update_self(
        &self,
        meeting_id: &str,
        participant_id: &str,
        patch: &ParticipantPatch,
    ) -> SessionResult<()> {
        self.check()?;
        let mut meetings = self.inner.meetings.write().await;
        let Some(meeting) = meetings.get_mut(meeting_id) else {
            return Ok(());
        };
        let Some(record) = meeting.participants.get_mut(participant_id) else {
            warn!(meeting_id, participant_id, "update for absent presence record ignored");
            return Ok(());
        };
        record.apply(patch);
        meeting.publish();
        Ok(())
    }

    async fn subscribe(
        &self,
        meeting_id: &str,
        on_change: PresenceCallback,
    ) -> SessionResult<Subscription> {
        self.check()?;
        let (initial, mut rx) = {
            let mut meetings = self.inner.meetings.write().await;
            let meeting = meetings
                .entry(meeting_id.to_string())
                .or_insert_with(Meeting::new);
            (meeting.snapshot(), meeting.presence_tx.subscribe())
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let store = self.clone();
        let meeting_id = meeting_id.to_string();
        let task = tokio::spawn(async move {
            on_change(Ok(initial));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(snapshot) => on_change(Ok(snapshot)),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(meeting_id = %meeting_id, skipped = n, "presence subscriber lagged");
                            on_change(Ok(store.participants(&meeting_id).await));
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            on_change(Err(SessionError::StoreUnavailable(
                                "presence subscription closed".into(),
                            )));
                            break;
                        }
                    },
                }
            }
        });

        Ok(Subscription::new(cancel, task))
    }
}

#[async_trait]
impl SignalingChannel for MemoryStore {
    async fn send(&self, meeting_id: &str, message: &SignalingMessage) -> SessionResult<()> {
        self.check()?;
        let mut meetings = self.inner.meetings.write().await;
        let meeting = meetings
            .entry(meeting_id.to_string())
            .or_insert_with(Meeting::new);
        let log = meeting.signals.entry(message.from.clone()).or_default();
        log.push(message.clone());
        if log.len() > SIGNAL_LOG_LIMIT {
            let excess = log.len() - SIGNAL_LOG_LIMIT;
            log.drain(..excess);
        }
        let _ = meeting.signal_tx.send(message.clone());
        Ok(())
    }

    async fn subscribe(
        &self,
        meeting_id: &str,
        on_message: SignalCallback,
    ) -> SessionResult<Subscription> {
        self.check()?;
        let mut rx = {
            let mut meetings = self.inner.meetings.write().await;
            meetings
                .entry(meeting_id.to_string())
                .or_insert_with(Meeting::new)
                .signal_tx
                .subscribe()
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let meeting_id = meeting_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(message) => on_message(Ok(message)),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(meeting_id = %meeting_id, skipped = n, "signaling subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            on_message(Err(SessionError::StoreUnavailable(
                                "signaling subscription closed".into(),
                            )));
                            break;
                        }
                    },
                }
            }
        });

        Ok(Subscription::new(cancel, task))
    }

    async fn purge_mine(&self, meeting_id: &str, participant_id: &str) -> SessionResult<()> {
        self.check()?;
        let mut meetings = self.inner.meetings.write().await;
        if let Some(meeting) = meetings.get_mut(meeting_id) {
            meeting.signals.remove(participant_id);
        }
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
