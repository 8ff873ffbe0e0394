//! Redis backend.
//!
//! Layout per meeting:
//! - `meetmesh:{meeting}:participants`: hash of participant id to JSON record
//! - `meetmesh:{meeting}:presence`: pub/sub channel, one message per change
//! - `meetmesh:{meeting}:signals:{from}`: list of signals authored by `from`
//! - `meetmesh:{meeting}:signals`: pub/sub channel carrying every signal

use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::{with_retry, RetryPolicy};
use super::{
    PresenceCallback, PresenceStore, SignalCallback, SignalingChannel, Subscription,
    SIGNAL_LOG_LIMIT, SIGNAL_LOG_TTL_SECS,
};
use crate::error::{SessionError, SessionResult};
use crate::model::{Participant, ParticipantPatch, SignalingMessage};

fn participants_key(meeting_id: &str) -> String {
    format!("meetmesh:{meeting_id}:participants")
}

fn presence_channel(meeting_id: &str) -> String {
    format!("meetmesh:{meeting_id}:presence")
}

fn signals_key(meeting_id: &str, from: &str) -> String {
    format!("meetmesh:{meeting_id}:signals:{from}")
}

fn signal_channel(meeting_id: &str) -> String {
    format!("meetmesh:{meeting_id}:signals")
}

#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    /// Governs re-subscription after the pub/sub connection drops.
    resubscribe: RetryPolicy,
}

impl RedisStore {
    pub async fn connect(url: &str, resubscribe: RetryPolicy) -> SessionResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        info!(url = %url, "connected to Redis");
        Ok(Self {
            client,
            conn,
            resubscribe,
        })
    }

    async fn snapshot(&self, meeting_id: &str) -> SessionResult<Vec<Participant>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(participants_key(meeting_id)).await?;
        let mut participants: Vec<Participant> = raw
            .into_iter()
            .filter_map(|(id, json)| match serde_json::from_str(&json) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(meeting_id, participant_id = %id, error = %e, "skipping unreadable presence record");
                    None
                }
            })
            .collect();
        participants.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(participants)
    }

    async fn notify_presence(&self, meeting_id: &str) -> SessionResult<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(presence_channel(meeting_id), "changed")
            .await?;
        Ok(())
    }

    /// Spawn a listener on `channel`. `on_payload` runs for every message;
    /// `on_connected` runs each time the subscription is (re)established.
    /// When the pub/sub connection cannot be re-established within the
    /// retry policy, `on_lost` runs once and the listener ends.
    fn listen<P, C, L>(
        &self,
        channel: String,
        mut on_connected: C,
        mut on_payload: P,
        on_lost: L,
    ) -> Subscription
    where
        C: FnMut() -> BoxFuture<'static, ()> + Send + 'static,
        P: FnMut(String) -> BoxFuture<'static, ()> + Send + 'static,
        L: FnOnce(SessionError) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let client = self.client.clone();
        let policy = self.resubscribe.clone();

        let task = tokio::spawn(async move {
            let mut attempt = 0u32;
            let last_error = loop {
                let pubsub = async {
                    let conn = client.get_async_connection().await?;
                    let mut pubsub = conn.into_pubsub();
                    pubsub.subscribe(&channel).await?;
                    Ok::<_, redis::RedisError>(pubsub)
                };
                let pubsub = tokio::select! {
                    _ = token.cancelled() => return,
                    r = pubsub => r,
                };

                match pubsub {
                    Ok(pubsub) => {
                        attempt = 0;
                        debug!(channel = %channel, "pub/sub subscribed");
                        on_connected().await;
                        let mut stream = pubsub.into_on_message();
                        loop {
                            let msg = tokio::select! {
                                _ = token.cancelled() => return,
                                msg = stream.next() => msg,
                            };
                            let Some(msg) = msg else { break };
                            match msg.get_payload::<String>() {
                                Ok(payload) => on_payload(payload).await,
                                Err(e) => warn!(channel = %channel, error = %e, "unreadable pub/sub payload"),
                            }
                        }
                        warn!(channel = %channel, "pub/sub stream ended");
                    }
                    Err(e) => {
                        if attempt + 1 >= policy.max_attempts {
                            break SessionError::from(e);
                        }
                        let delay = policy.delay_for(attempt);
                        warn!(channel = %channel, attempt = attempt + 1, error = %e, "pub/sub connect failed, retrying");
                        attempt += 1;
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            };
            on_lost(last_error);
        });

        Subscription::new(cancel, task)
    }
}

#[async_trait]
impl PresenceStore for RedisStore {
    async fn join(&self, meeting_id: &str, participant: &Participant) -> SessionResult<()> {
        let json = serde_json::to_string(participant)
            .map_err(|e| SessionError::StoreUnavailable(e.to_string()))?;
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(participants_key(meeting_id), &participant.id, json)
            .await?;
        self.notify_presence(meeting_id).await
    }

    async fn leave(&self, meeting_id: &str, participant_id: &str) -> SessionResult<()> {
        let mut conn = self.conn.clone();
        let removed: u32 = conn
            .hdel(participants_key(meeting_id), participant_id)
            .await?;
        if removed > 0 {
            self.notify_presence(meeting_id).await?;
        }
        Ok(())
    }

    async fn update_self(
        &self,
        meeting_id: &str,
        participant_id: &str,
        patch: &ParticipantPatch,
    ) -> SessionResult<()> {
        // Only the owner writes its record, so read-modify-write cannot race.
        let key = participants_key(meeting_id);
        let mut conn = self.conn.clone();
        let current: Option<String> = conn.hget(&key, participant_id).await?;
        let Some(current) = current else {
            warn!(meeting_id, participant_id, "update for absent presence record ignored");
            return Ok(());
        };
        let mut record: Participant = serde_json::from_str(&current)
            .map_err(|e| SessionError::StoreUnavailable(e.to_string()))?;
        record.apply(patch);
        let json = serde_json::to_string(&record)
            .map_err(|e| SessionError::StoreUnavailable(e.to_string()))?;
        conn.hset::<_, _, _, ()>(&key, participant_id, json).await?;
        self.notify_presence(meeting_id).await
    }

    async fn subscribe(
        &self,
        meeting_id: &str,
        on_change: PresenceCallback,
    ) -> SessionResult<Subscription> {
        // Fail fast if the store is unreachable right now.
        self.snapshot(meeting_id).await?;

        let deliver = {
            let store = self.clone();
            let meeting = meeting_id.to_string();
            let on_change = on_change.clone();
            move || -> BoxFuture<'static, ()> {
                let store = store.clone();
                let meeting = meeting.clone();
                let on_change = on_change.clone();
                Box::pin(async move {
                    let snapshot = with_retry(&store.resubscribe, "presence.snapshot", || {
                        store.snapshot(&meeting)
                    })
                    .await;
                    on_change(snapshot)
                })
            }
        };
        let on_payload = {
            let deliver = deliver.clone();
            move |_payload: String| deliver()
        };

        Ok(self.listen(
            presence_channel(meeting_id),
            deliver,
            on_payload,
            move |err| on_change(Err(err)),
        ))
    }
}

#[async_trait]
impl SignalingChannel for RedisStore {
    async fn send(&self, meeting_id: &str, message: &SignalingMessage) -> SessionResult<()> {
        let json = serde_json::to_string(message)
            .map_err(|e| SessionError::StoreUnavailable(e.to_string()))?;
        let key = signals_key(meeting_id, &message.from);
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .rpush(&key, &json)
            .ignore()
            .ltrim(&key, -(SIGNAL_LOG_LIMIT as isize), -1)
            .ignore()
            .expire(&key, SIGNAL_LOG_TTL_SECS)
            .ignore()
            .publish(signal_channel(meeting_id), &json)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        meeting_id: &str,
        on_message: SignalCallback,
    ) -> SessionResult<Subscription> {
        let meeting = meeting_id.to_string();
        let deliver = on_message.clone();
        let lost = on_message;

        Ok(self.listen(
            signal_channel(meeting_id),
            || -> BoxFuture<'static, ()> { Box::pin(async {}) },
            move |payload: String| -> BoxFuture<'static, ()> {
                let deliver = deliver.clone();
                let meeting = meeting.clone();
                Box::pin(async move {
                    match serde_json::from_str::<SignalingMessage>(&payload) {
                        Ok(message) => deliver(Ok(message)),
                        Err(e) => warn!(meeting_id = %meeting, error = %e, "dropping unreadable signal"),
                    }
                })
            },
            move |err| lost(Err(err)),
        ))
    }

    async fn purge_mine(&self, meeting_id: &str, participant_id: &str) -> SessionResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(signals_key(meeting_id, participant_id))
            .await?;
        Ok(())
    }
}
