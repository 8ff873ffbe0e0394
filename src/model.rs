//! Wire records shared through the presence store and the signaling channel.
//!
//! All records serialize as camelCase JSON, the format peers exchange.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};

// ─── Identity ───────────────────────────────────────────────────────────────

/// Who the local participant is. Supplied by the embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub display_name: Option<String>,
    pub photo_ref: Option<String>,
}

// ─── Participant ────────────────────────────────────────────────────────────

/// Presence record. At most one per (meeting, id); only its owner writes the
/// mutable control fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub photo_ref: Option<String>,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub is_mic_on: bool,
    #[serde(default)]
    pub is_video_on: bool,
    #[serde(default)]
    pub is_screen_sharing: bool,
}

impl Participant {
    pub fn new(identity: &Identity, is_mic_on: bool, is_video_on: bool) -> Self {
        Self {
            id: identity.id.clone(),
            display_name: identity.display_name.clone(),
            photo_ref: identity.photo_ref.clone(),
            joined_at: Utc::now(),
            is_mic_on,
            is_video_on,
            is_screen_sharing: false,
        }
    }

    pub fn apply(&mut self, patch: &ParticipantPatch) {
        if let Some(on) = patch.is_mic_on {
            self.is_mic_on = on;
        }
        if let Some(on) = patch.is_video_on {
            self.is_video_on = on;
        }
        if let Some(on) = patch.is_screen_sharing {
            self.is_screen_sharing = on;
        }
    }
}

/// Partial update of the caller's own control state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_mic_on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_video_on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_screen_sharing: Option<bool>,
}

impl ParticipantPatch {
    pub fn mic(on: bool) -> Self {
        Self {
            is_mic_on: Some(on),
            ..Default::default()
        }
    }

    pub fn video(on: bool) -> Self {
        Self {
            is_video_on: Some(on),
            ..Default::default()
        }
    }

    pub fn screen(on: bool) -> Self {
        Self {
            is_screen_sharing: Some(on),
            ..Default::default()
        }
    }
}

// ─── Negotiation payloads ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// `{type, sdp}` payload of offer/answer messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// `{candidate, sdpMid, sdpMLineIndex, usernameFragment}` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

// ─── SignalingMessage ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
        }
    }
}

/// One append-only negotiation record addressed from one participant to
/// another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub kind: SignalKind,
    pub from: String,
    pub to: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl SignalingMessage {
    pub fn description(from: &str, to: &str, desc: &SessionDescription) -> Self {
        let kind = match desc.sdp_type {
            SdpType::Offer => SignalKind::Offer,
            SdpType::Answer => SignalKind::Answer,
        };
        Self::new(kind, from, to, serde_json::json!(desc))
    }

    pub fn candidate(from: &str, to: &str, candidate: &IceCandidate) -> Self {
        Self::new(SignalKind::Candidate, from, to, serde_json::json!(candidate))
    }

    fn new(kind: SignalKind, from: &str, to: &str, payload: serde_json::Value) -> Self {
        Self {
            kind,
            from: from.to_string(),
            to: to.to_string(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Decode an offer/answer payload, checking it matches `kind`.
    pub fn session_description(&self) -> SessionResult<SessionDescription> {
        let desc: SessionDescription = serde_json::from_value(self.payload.clone())?;
        let expected = match self.kind {
            SignalKind::Offer => SdpType::Offer,
            SignalKind::Answer => SdpType::Answer,
            SignalKind::Candidate => {
                return Err(SessionError::InvalidSignal(
                    "candidate message carries no session description".into(),
                ))
            }
        };
        if desc.sdp_type != expected {
            return Err(SessionError::InvalidSignal(format!(
                "{} message carries a {:?} description",
                self.kind.as_str(),
                desc.sdp_type
            )));
        }
        Ok(desc)
    }

    pub fn ice_candidate(&self) -> SessionResult<IceCandidate> {
        if self.kind != SignalKind::Candidate {
            return Err(SessionError::InvalidSignal(format!(
                "{} message carries no ICE candidate",
                self.kind.as_str()
            )));
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_wire_format_is_camel_case() {
        let identity = Identity {
            id: "u1".into(),
            display_name: Some("Ada".into()),
            photo_ref: None,
        };
        let json = serde_json::to_value(Participant::new(&identity, true, false)).unwrap();

        assert_eq!(json["id"], "u1");
        assert_eq!(json["displayName"], "Ada");
        assert!(json["photoRef"].is_null());
        assert_eq!(json["isMicOn"], true);
        assert_eq!(json["isVideoOn"], false);
        assert_eq!(json["isScreenSharing"], false);
        assert!(json["joinedAt"].is_string());
    }

    #[test]
    fn patch_touches_only_named_fields() {
        let identity = Identity {
            id: "u1".into(),
            display_name: None,
            photo_ref: None,
        };
        let mut p = Participant::new(&identity, true, true);
        p.apply(&ParticipantPatch::screen(true));

        assert!(p.is_mic_on);
        assert!(p.is_video_on);
        assert!(p.is_screen_sharing);

        let json = serde_json::to_string(&ParticipantPatch::mic(false)).unwrap();
        assert_eq!(json, r#"{"isMicOn":false}"#);
    }

    #[test]
    fn candidate_payload_uses_browser_field_names() {
        let c = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let msg = SignalingMessage::candidate("u2", "u1", &c);

        assert_eq!(msg.payload["sdpMLineIndex"], 0);
        assert_eq!(msg.payload["sdpMid"], "0");
        assert_eq!(msg.ice_candidate().unwrap(), c);

        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["kind"], "candidate");
        assert!(wire["createdAt"].is_string());
    }

    #[test]
    fn description_kind_must_match_payload() {
        let offer = SignalingMessage::description("u2", "u1", &SessionDescription::offer("v=0"));
        assert_eq!(offer.kind, SignalKind::Offer);
        assert_eq!(offer.session_description().unwrap().sdp, "v=0");

        let mut forged = offer.clone();
        forged.kind = SignalKind::Answer;
        assert!(matches!(
            forged.session_description(),
            Err(SessionError::InvalidSignal(_))
        ));
        assert!(offer.ice_candidate().is_err());
    }

    #[test]
    fn garbage_payload_is_invalid_signal() {
        let mut msg = SignalingMessage::description("u2", "u1", &SessionDescription::answer("v=0"));
        msg.payload = serde_json::json!({"nope": true});
        assert!(matches!(
            msg.session_description(),
            Err(SessionError::InvalidSignal(_))
        ));
    }
}
