//! The seam between negotiation logic and the media transport.
//!
//! `peer` drives a [`PeerTransport`] through offer/answer; the transport
//! reports candidates, connection state and remote tracks back through a
//! [`TransportEventSink`].

pub mod rtc;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use webrtc::track::track_remote::TrackRemote;

use crate::error::SessionResult;
use crate::media::{LocalTrack, MediaKind, OutgoingTracks};
use crate::model::{IceCandidate, SessionDescription};

pub use self::rtc::WebrtcTransportFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A remote media track surfaced by a transport.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    /// The live RTP source, absent for transports without real media.
    #[serde(skip)]
    pub handle: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl PartialEq for RemoteTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.stream_id == other.stream_id && self.kind == other.kind
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local ICE candidate to trickle to the remote peer.
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    RemoteTrack(RemoteTrack),
}

pub type TransportEventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// One connection to one remote participant.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> SessionResult<SessionDescription>;

    /// Apply a remote offer, then create and install the answer.
    async fn accept_offer(&self, offer: SessionDescription) -> SessionResult<SessionDescription>;

    /// Apply the remote answer to our offer.
    async fn accept_answer(&self, answer: SessionDescription) -> SessionResult<()>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> SessionResult<()>;

    /// Swap the outgoing video in place, without renegotiation.
    async fn replace_video_track(&self, track: Option<LocalTrack>) -> SessionResult<()>;

    async fn close(&self) -> SessionResult<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Build a transport to `peer_id` with `outgoing` attached.
    async fn create(
        &self,
        peer_id: &str,
        outgoing: &OutgoingTracks,
        events: TransportEventSink,
    ) -> SessionResult<Arc<dyn PeerTransport>>;
}
