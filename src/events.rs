// src/events.rs
//
// Lifecycle notifications of one meeting session.
//
// The coordinator emits a `MeetingEvent` whenever something a UI would
// announce happens: a participant arrives or leaves, a peer connection comes
// up or is dropped, local screen sharing starts or stops, or the session
// fails. A single `EventBus` backed by a `tokio::sync::broadcast` channel
// fans each event out to every consumer (the SSE stream, log sinks, tests).
//
// ────────────────────────────────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

// ─── Event types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "participant.joined")]
    ParticipantJoined,
    #[serde(rename = "participant.left")]
    ParticipantLeft,
    #[serde(rename = "peer.connected")]
    PeerConnected,
    #[serde(rename = "peer.dropped")]
    PeerDropped,
    #[serde(rename = "screenshare.started")]
    ScreenShareStarted,
    #[serde(rename = "screenshare.stopped")]
    ScreenShareStopped,
    #[serde(rename = "session.failed")]
    SessionFailed,
}

impl EventType {
    /// Stable string used in SSE `event:` fields and filter expressions.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParticipantJoined => "participant.joined",
            Self::ParticipantLeft => "participant.left",
            Self::PeerConnected => "peer.connected",
            Self::PeerDropped => "peer.dropped",
            Self::ScreenShareStarted => "screenshare.started",
            Self::ScreenShareStopped => "screenshare.stopped",
            Self::SessionFailed => "session.failed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Event payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantPayload {
    pub meeting_id: String,
    pub participant_id: String,
    pub display_name: Option<String>,
}

/// A dropped peer carries the reason, so a UI can tell an unreachable peer
/// apart from one that merely turned its camera off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerPayload {
    pub meeting_id: String,
    pub peer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenSharePayload {
    pub meeting_id: String,
    pub participant_id: String,
    /// `true` when the capture ended from outside (OS "stop sharing").
    pub ended_by_source: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePayload {
    pub meeting_id: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Participant(ParticipantPayload),
    Peer(PeerPayload),
    ScreenShare(ScreenSharePayload),
    Failure(FailurePayload),
}

// ─── The event envelope ─────────────────────────────────────────────────────

/// ```json
/// {
///   "id":         "evt_a1b2c3d4",
///   "type":       "peer.dropped",
///   "created_at": "2025-06-15T14:22:33.123Z",
///   "data": { "meeting_id": "standup", "peer_id": "u2", "reason": "..." }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingEvent {
    /// Format: `evt_<uuid-v4>`.
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: EventType,

    pub created_at: DateTime<Utc>,

    pub data: EventPayload,
}

impl MeetingEvent {
    pub fn participant_joined(meeting_id: &str, participant_id: &str, display_name: Option<&str>) -> Self {
        Self::new(
            EventType::ParticipantJoined,
            EventPayload::Participant(ParticipantPayload {
                meeting_id: meeting_id.to_string(),
                participant_id: participant_id.to_string(),
                display_name: display_name.map(str::to_string),
            }),
        )
    }

    pub fn participant_left(meeting_id: &str, participant_id: &str, display_name: Option<&str>) -> Self {
        Self::new(
            EventType::ParticipantLeft,
            EventPayload::Participant(ParticipantPayload {
                meeting_id: meeting_id.to_string(),
                participant_id: participant_id.to_string(),
                display_name: display_name.map(str::to_string),
            }),
        )
    }

    pub fn peer_connected(meeting_id: &str, peer_id: &str) -> Self {
        Self::new(
            EventType::PeerConnected,
            EventPayload::Peer(PeerPayload {
                meeting_id: meeting_id.to_string(),
                peer_id: peer_id.to_string(),
                reason: None,
            }),
        )
    }

    pub fn peer_dropped(meeting_id: &str, peer_id: &str, reason: &str) -> Self {
        Self::new(
            EventType::PeerDropped,
            EventPayload::Peer(PeerPayload {
                meeting_id: meeting_id.to_string(),
                peer_id: peer_id.to_string(),
                reason: Some(reason.to_string()),
            }),
        )
    }

    pub fn screenshare_started(meeting_id: &str, participant_id: &str) -> Self {
        Self::new(
            EventType::ScreenShareStarted,
            EventPayload::ScreenShare(ScreenSharePayload {
                meeting_id: meeting_id.to_string(),
                participant_id: participant_id.to_string(),
                ended_by_source: false,
            }),
        )
    }

    pub fn screenshare_stopped(meeting_id: &str, participant_id: &str, ended_by_source: bool) -> Self {
        Self::new(
            EventType::ScreenShareStopped,
            EventPayload::ScreenShare(ScreenSharePayload {
                meeting_id: meeting_id.to_string(),
                participant_id: participant_id.to_string(),
                ended_by_source,
            }),
        )
    }

    pub fn session_failed(meeting_id: &str, code: &str, message: &str) -> Self {
        Self::new(
            EventType::SessionFailed,
            EventPayload::Failure(FailurePayload {
                meeting_id: meeting_id.to_string(),
                code: code.to_string(),
                message: message.to_string(),
            }),
        )
    }

    fn new(event_type: EventType, data: EventPayload) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4()),
            event_type,
            created_at: Utc::now(),
            data,
        }
    }

    /// Participant or peer the event is about, if any.
    pub fn subject(&self) -> Option<&str> {
        match &self.data {
            EventPayload::Participant(p) => Some(&p.participant_id),
            EventPayload::Peer(p) => Some(&p.peer_id),
            EventPayload::ScreenShare(p) => Some(&p.participant_id),
            EventPayload::Failure(_) => None,
        }
    }
}

// ─── EventBus ───────────────────────────────────────────────────────────────

/// Broadcast-based fan-out channel for `MeetingEvent`.
///
/// Subscribers that lag more than the capacity skip events
/// (`broadcast::RecvError::Lagged`). Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MeetingEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(cap: usize) -> Self {
        let (tx, _) = broadcast::channel(cap);
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers that will receive
    /// it; zero subscribers is not an error.
    pub fn emit(&self, event: MeetingEvent) -> usize {
        debug!(event_type = %event.event_type, event_id = %event.id, "event emitted");
        self.tx.send(event).unwrap_or(0)
    }

    /// Each receiver gets every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<MeetingEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
