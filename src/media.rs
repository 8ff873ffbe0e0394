//! Local media: device acquisition, track enable flags and the single
//! outgoing-video substitution point used for screen sharing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::error::{SessionError, SessionResult};

// ---------------------------------------------------------------------------
// Track kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Where a local track comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Microphone => MediaKind::Audio,
            Self::Camera | Self::Screen => MediaKind::Video,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Microphone => "mic",
            Self::Camera => "camera",
            Self::Screen => "screen",
        }
    }
}

// ---------------------------------------------------------------------------
// LocalTrack
// ---------------------------------------------------------------------------

/// A local capture track. Clones share the same underlying track.
///
/// The RTP track is what gets attached to peer connections; a capture
/// pipeline feeds it through [`LocalTrack::write_rtp`], which drops packets
/// while the track is disabled or stopped.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

struct TrackInner {
    id: String,
    source: TrackSource,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    rtp: Arc<TrackLocalStaticRTP>,
}

/// Plain description of a track, as published in the session view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub id: String,
    pub source: TrackSource,
    pub kind: MediaKind,
    pub enabled: bool,
}

impl LocalTrack {
    pub fn new(source: TrackSource, stream_id: &str) -> Self {
        let codec = match source.kind() {
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90_000,
                ..Default::default()
            },
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
        };
        let id = format!("{}-{}", source.as_str(), uuid::Uuid::new_v4());
        let rtp = Arc::new(TrackLocalStaticRTP::new(
            codec,
            id.clone(),
            stream_id.to_string(),
        ));
        let (ended, _) = watch::channel(false);

        Self {
            inner: Arc::new(TrackInner {
                id,
                source,
                enabled: AtomicBool::new(true),
                ended,
                rtp,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.source.kind()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Release the track. Returns `false` if it was already stopped.
    pub fn stop(&self) -> bool {
        let stopped = self.inner.ended.send_if_modified(|ended| {
            if *ended {
                false
            } else {
                *ended = true;
                true
            }
        });
        if stopped {
            debug!(track_id = %self.inner.id, source = self.inner.source.as_str(), "local track stopped");
        }
        stopped
    }

    /// Resolves once the track has been stopped, by us or by its source.
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    /// The track to attach to a peer connection sender.
    pub fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.inner.rtp.clone()
    }

    /// Forward one packet from the capture pipeline. Returns `false` when
    /// the packet was dropped because the track is disabled or stopped.
    pub async fn write_rtp(&self, packet: &webrtc::rtp::packet::Packet) -> bool {
        if !self.is_enabled() || self.is_ended() {
            return false;
        }
        self.inner.rtp.write_rtp(packet).await.is_ok()
    }

    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn info(&self) -> TrackInfo {
        TrackInfo {
            id: self.inner.id.clone(),
            source: self.inner.source,
            kind: self.kind(),
            enabled: self.is_enabled(),
        }
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

pub struct UserMedia {
    pub camera: LocalTrack,
    pub microphone: LocalTrack,
}

/// Capture devices of the host.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Camera and microphone together. Fails with `DeviceUnavailable`.
    async fn user_media(&self) -> SessionResult<UserMedia>;

    /// A display capture video track (no audio). Fails with
    /// `ScreenCaptureDenied` when the user or the platform refuses.
    async fn display_media(&self) -> SessionResult<LocalTrack>;
}

/// Devices that hand out RTP tracks for an external capture pipeline.
///
/// Every issued track is remembered so the pipeline (or a test) can reach it.
pub struct SyntheticDevices {
    stream_id: String,
    camera: bool,
    screen: bool,
    issued: Mutex<Vec<LocalTrack>>,
}

impl SyntheticDevices {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            camera: true,
            screen: true,
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Fail camera/microphone acquisition.
    pub fn without_camera(mut self) -> Self {
        self.camera = false;
        self
    }

    /// Refuse every display capture request.
    pub fn denying_screen_capture(mut self) -> Self {
        self.screen = false;
        self
    }

    pub fn issued_tracks(&self) -> Vec<LocalTrack> {
        match self.issued.lock() {
            Ok(issued) => issued.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn issue(&self, source: TrackSource) -> LocalTrack {
        let track = LocalTrack::new(source, &self.stream_id);
        match self.issued.lock() {
            Ok(mut issued) => issued.push(track.clone()),
            Err(poisoned) => poisoned.into_inner().push(track.clone()),
        }
        track
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn user_media(&self) -> SessionResult<UserMedia> {
        if !self.camera {
            return Err(SessionError::DeviceUnavailable(
                "no camera or microphone present".into(),
            ));
        }
        Ok(UserMedia {
            camera: self.issue(TrackSource::Camera),
            microphone: self.issue(TrackSource::Microphone),
        })
    }

    async fn display_media(&self) -> SessionResult<LocalTrack> {
        if !self.screen {
            return Err(SessionError::ScreenCaptureDenied(
                "display capture refused".into(),
            ));
        }
        Ok(self.issue(TrackSource::Screen))
    }
}

// ---------------------------------------------------------------------------
// MediaController
// ---------------------------------------------------------------------------

/// Tracks offered to a new peer connection.
#[derive(Debug, Clone, Default)]
pub struct OutgoingTracks {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalStreamView {
    pub audio: Option<TrackInfo>,
    pub video: Option<TrackInfo>,
}

/// Owns the local tracks. The camera stays acquired while a screen share is
/// the active outgoing video.
pub struct MediaController {
    devices: Arc<dyn MediaDevices>,
    camera: Option<LocalTrack>,
    microphone: Option<LocalTrack>,
    screen: Option<LocalTrack>,
}

impl MediaController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            camera: None,
            microphone: None,
            screen: None,
        }
    }

    pub fn devices(&self) -> Arc<dyn MediaDevices> {
        self.devices.clone()
    }

    /// Acquire camera and microphone with the lobby's initial state. On
    /// `DeviceUnavailable` the controller stays empty and reports muted and
    /// camera-off.
    pub async fn acquire_local_media(&mut self, mic_on: bool, video_on: bool) -> SessionResult<()> {
        let media = self.devices.user_media().await?;
        media.microphone.set_enabled(mic_on);
        media.camera.set_enabled(video_on);
        info!(
            camera = %media.camera.id(),
            microphone = %media.microphone.id(),
            mic_on,
            video_on,
            "local media acquired"
        );
        self.camera = Some(media.camera);
        self.microphone = Some(media.microphone);
        Ok(())
    }

    pub fn is_mic_on(&self) -> bool {
        self.microphone.as_ref().is_some_and(LocalTrack::is_enabled)
    }

    pub fn is_video_on(&self) -> bool {
        self.camera.as_ref().is_some_and(LocalTrack::is_enabled)
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    /// Returns `true` if the flag changed. Without a microphone the flag
    /// stays off.
    pub fn set_mic_enabled(&mut self, on: bool) -> bool {
        match &self.microphone {
            Some(track) if track.is_enabled() != on => {
                track.set_enabled(on);
                true
            }
            _ => false,
        }
    }

    /// Toggles the camera track only. While sharing, peers keep seeing the
    /// screen either way.
    pub fn set_video_enabled(&mut self, on: bool) -> bool {
        match &self.camera {
            Some(track) if track.is_enabled() != on => {
                track.set_enabled(on);
                true
            }
            _ => false,
        }
    }

    /// The one track every peer sends as video.
    pub fn active_video(&self) -> Option<&LocalTrack> {
        self.screen.as_ref().or(self.camera.as_ref())
    }

    pub fn screen_track(&self) -> Option<&LocalTrack> {
        self.screen.as_ref()
    }

    pub fn outgoing(&self) -> OutgoingTracks {
        OutgoingTracks {
            audio: self.microphone.clone(),
            video: self.active_video().cloned(),
        }
    }

    /// Make an acquired display capture the active video. Capture itself
    /// runs off the coordinator loop through [`MediaDevices::display_media`].
    pub fn install_screen_share(&mut self, track: LocalTrack) {
        info!(track_id = %track.id(), "screen share active");
        if let Some(previous) = self.screen.replace(track) {
            previous.stop();
        }
    }

    /// Stop sharing and fall back to the camera. Returns `false` when no
    /// share was active.
    pub fn stop_screen_share(&mut self) -> bool {
        match self.screen.take() {
            Some(screen) => {
                screen.stop();
                info!(track_id = %screen.id(), "screen share stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every track. Safe to call repeatedly.
    pub fn stop_all(&mut self) {
        for track in [self.screen.take(), self.camera.take(), self.microphone.take()]
            .into_iter()
            .flatten()
        {
            track.stop();
        }
    }

    pub fn local_stream(&self) -> LocalStreamView {
        LocalStreamView {
            audio: self.microphone.as_ref().map(LocalTrack::info),
            video: self.active_video().map(LocalTrack::info),
        }
    }
}

impl Drop for MediaController {
    fn drop(&mut self) {
        self.stop_all();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
