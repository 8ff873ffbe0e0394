use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use super::{
    PeerTransport, RemoteTrack, TransportEvent, TransportEventSink, TransportFactory,
    TransportState,
};
use crate::config::IceServerConfig;
use crate::error::{SessionError, SessionResult};
use crate::media::{LocalTrack, MediaKind, OutgoingTracks};
use crate::model::{IceCandidate, SessionDescription};

// ─── Factory ────────────────────────────────────────────────────────────────

/// Builds webrtc-rs peer connections. One media engine and interceptor
/// registry is shared by every connection.
pub struct WebrtcTransportFactory {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
}

impl WebrtcTransportFactory {
    pub fn new(ice_servers: &[IceServerConfig]) -> SessionResult<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| SessionError::Config(format!("codec registration failed: {e}")))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| SessionError::Config(format!("interceptor registration failed: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                ..Default::default()
            })
            .collect();

        Ok(Self {
            api: Arc::new(api),
            ice_servers,
        })
    }
}

#[async_trait]
impl TransportFactory for WebrtcTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        outgoing: &OutgoingTracks,
        events: TransportEventSink,
    ) -> SessionResult<Arc<dyn PeerTransport>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(|e| SessionError::negotiation(peer_id, e))?;
        let pc = Arc::new(pc);

        // Audio: send the microphone if we have one, otherwise only receive.
        match &outgoing.audio {
            Some(track) => {
                let sender = pc
                    .add_track(track.rtp_track())
                    .await
                    .map_err(|e| SessionError::negotiation(peer_id, format!("add_track(audio): {e}")))?;
                drain_rtcp(sender);
            }
            None => {
                pc.add_transceiver_from_kind(
                    RTPCodecType::Audio,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| SessionError::negotiation(peer_id, format!("audio transceiver: {e}")))?;
            }
        }

        // Video always gets a send-capable sender so a later screen share
        // can be substituted in place.
        let video_sender = match &outgoing.video {
            Some(track) => pc
                .add_track(track.rtp_track())
                .await
                .map_err(|e| SessionError::negotiation(peer_id, format!("add_track(video): {e}")))?,
            None => {
                let transceiver = pc
                    .add_transceiver_from_kind(
                        RTPCodecType::Video,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Sendrecv,
                            send_encodings: vec![],
                        }),
                    )
                    .await
                    .map_err(|e| SessionError::negotiation(peer_id, format!("video transceiver: {e}")))?;
                transceiver.sender().await
            }
        };
        drain_rtcp(video_sender.clone());

        wire_callbacks(&pc, peer_id, events);

        info!(peer_id, "peer connection created");
        Ok(Arc::new(WebrtcTransport {
            peer_id: peer_id.to_string(),
            pc,
            video_sender,
        }))
    }
}

/// Senders must be read for RTCP so interceptors (NACK, reports) run.
fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });
}

fn wire_callbacks(pc: &Arc<RTCPeerConnection>, peer_id: &str, events: TransportEventSink) {
    {
        let sink = events.clone();
        let pid = peer_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            let pid = pid.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => sink(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!(peer_id = %pid, "could not serialize local candidate: {e}"),
                }
            })
        }));
    }

    {
        let sink = events.clone();
        let pid = peer_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = sink.clone();
            let pid = pid.clone();
            Box::pin(async move {
                debug!(peer_id = %pid, %state, "peer connection state");
                sink(TransportEvent::StateChanged(map_state(state)));
            })
        }));
    }

    {
        let sink = events;
        let pid = peer_id.to_string();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sink = sink.clone();
            let pid = pid.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    _ => MediaKind::Video,
                };
                info!(peer_id = %pid, ?kind, ssrc = track.ssrc(), "remote track received");
                sink(TransportEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                    handle: Some(track),
                }));
            })
        }));
    }
}

fn map_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

// ─── Transport ──────────────────────────────────────────────────────────────

struct WebrtcTransport {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    video_sender: Arc<RTCRtpSender>,
}

impl WebrtcTransport {
    fn fail(&self, step: &str, err: impl std::fmt::Display) -> SessionError {
        warn!(peer_id = %self.peer_id, "{step} failed: {err}");
        SessionError::negotiation(&self.peer_id, format!("{step}: {err}"))
    }
}

#[async_trait]
impl PeerTransport for WebrtcTransport {
    async fn create_offer(&self) -> SessionResult<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| self.fail("create_offer", e))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| self.fail("set_local_description", e))?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> SessionResult<SessionDescription> {
        let remote = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| SessionError::InvalidSignal(format!("offer sdp: {e}")))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| self.fail("set_remote_description", e))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| self.fail("create_answer", e))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| self.fail("set_local_description", e))?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> SessionResult<()> {
        let remote = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| SessionError::InvalidSignal(format!("answer sdp: {e}")))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| self.fail("set_remote_description", e))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> SessionResult<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| self.fail("add_ice_candidate", e))
    }

    async fn replace_video_track(&self, track: Option<LocalTrack>) -> SessionResult<()> {
        self.video_sender
            .replace_track(track.map(|t| t.rtp_track()))
            .await
            .map_err(|e| self.fail("replace_track", e))
    }

    async fn close(&self) -> SessionResult<()> {
        self.pc.close().await.map_err(|e| self.fail("close", e))?;
        debug!(peer_id = %self.peer_id, "peer connection closed");
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
