//! Session coordinator.
//!
//! One task owns all session state: the presence roster, the peer arena and
//! the local tracks. Store callbacks, peer workers and media tasks post
//! [`SessionEvent`]s into a single queue; user actions arrive as
//! [`Command`]s from [`SessionHandle`]s. After every step the coordinator
//! publishes a fresh [`SessionView`] on a watch channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{SessionError, SessionResult};
use crate::events::{EventBus, MeetingEvent};
use crate::media::{LocalStreamView, LocalTrack, MediaController, MediaDevices};
use crate::model::{Identity, Participant, ParticipantPatch, SignalingMessage};
use crate::peer::{
    should_initiate, PeerEvent, PeerEventSink, PeerManager, PeerNotice, PeerState, RemoteStream,
};
use crate::store::{PresenceStore, SignalingChannel, Subscription};
use crate::transport::TransportFactory;

/// Upper bound on the best-effort store cleanup when leaving.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(3);

const COMMAND_QUEUE: usize = 32;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub meeting_id: String,
    pub identity: Identity,
    pub start_mic_on: bool,
    pub start_video_on: bool,
    pub peer_retry_budget: u32,
    /// An unanswered offer fails the connection after this long.
    pub answer_timeout: Duration,
}

/// Everything a session talks to.
#[derive(Clone)]
pub struct SessionDeps {
    pub presence: Arc<dyn PresenceStore>,
    pub signaling: Arc<dyn SignalingChannel>,
    pub devices: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
    pub events: EventBus,
}

// ─── Events and commands ────────────────────────────────────────────────────

pub type Reply = oneshot::Sender<SessionResult<SessionView>>;

/// Inputs of the coordinator's event queue.
pub enum SessionEvent {
    Presence(SessionResult<Vec<Participant>>),
    Signal(SessionResult<SignalingMessage>),
    Peer(PeerEvent),
    /// A display capture request finished.
    ScreenCaptured {
        result: SessionResult<LocalTrack>,
        reply: Option<Reply>,
    },
    /// A screen track ended, possibly from outside the application.
    ScreenCaptureEnded { track_id: String },
}

pub enum Command {
    ToggleMic(Reply),
    ToggleVideo(Reply),
    ToggleScreenShare(Reply),
    Leave(oneshot::Sender<()>),
}

// ─── View ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl From<&SessionError> for ErrorInfo {
    fn from(err: &SessionError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Everything a UI renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub meeting_id: String,
    pub local_participant_id: String,
    /// Ordered by join time.
    pub participants: Vec<Participant>,
    pub local_stream: LocalStreamView,
    pub remote_streams: BTreeMap<String, RemoteStream>,
    pub is_mic_on: bool,
    pub is_video_on: bool,
    pub is_screen_sharing: bool,
    pub peer_states: BTreeMap<String, PeerState>,
    pub fatal_error: Option<ErrorInfo>,
    pub closed: bool,
}

impl SessionView {
    fn empty(config: &SessionConfig) -> Self {
        Self {
            meeting_id: config.meeting_id.clone(),
            local_participant_id: config.identity.id.clone(),
            participants: Vec::new(),
            local_stream: LocalStreamView::default(),
            remote_streams: BTreeMap::new(),
            is_mic_on: false,
            is_video_on: false,
            is_screen_sharing: false,
            peer_states: BTreeMap::new(),
            fatal_error: None,
            closed: false,
        }
    }
}

// ─── Presence writer ────────────────────────────────────────────────────────

/// Writes of the local presence record, applied in order by one task.
enum PresenceWrite {
    Patch(ParticipantPatch),
    Rejoin(Participant),
}

fn spawn_presence_writer(
    presence: Arc<dyn PresenceStore>,
    meeting_id: String,
    participant_id: String,
) -> (mpsc::UnboundedSender<PresenceWrite>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        while let Some(write) = rx.recv().await {
            let result = match &write {
                PresenceWrite::Patch(patch) => {
                    presence.update_self(&meeting_id, &participant_id, patch).await
                }
                PresenceWrite::Rejoin(record) => presence.join(&meeting_id, record).await,
            };
            if let Err(e) = result {
                warn!(meeting_id = %meeting_id, error = %e, "presence write failed");
            }
        }
    });
    (tx, task)
}

// ─── Coordinator ────────────────────────────────────────────────────────────

pub struct SessionCoordinator {
    config: SessionConfig,
    presence: Arc<dyn PresenceStore>,
    signaling: Arc<dyn SignalingChannel>,
    events: EventBus,
    media: MediaController,
    peers: PeerManager,
    /// Last presence snapshot, keyed by id, including ourselves.
    participants: BTreeMap<String, Participant>,
    joined_at: DateTime<Utc>,
    queue: mpsc::UnboundedSender<SessionEvent>,
    view_tx: watch::Sender<SessionView>,
    presence_sub: Option<Subscription>,
    signal_sub: Option<Subscription>,
    writes: Option<mpsc::UnboundedSender<PresenceWrite>>,
    writer: Option<JoinHandle<()>>,
    screen_pending: bool,
    fatal: Option<SessionError>,
    closed: bool,
}

impl SessionCoordinator {
    pub fn new(
        config: SessionConfig,
        deps: SessionDeps,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (queue, rx) = mpsc::unbounded_channel();

        let peer_queue = queue.clone();
        let sink: PeerEventSink = Arc::new(move |event| {
            let _ = peer_queue.send(SessionEvent::Peer(event));
        });
        let peers = PeerManager::new(
            &config.meeting_id,
            &config.identity.id,
            deps.transports,
            deps.signaling.clone(),
            sink,
            config.peer_retry_budget,
        )
        .with_answer_timeout(config.answer_timeout);
        let (view_tx, _) = watch::channel(SessionView::empty(&config));

        let coordinator = Self {
            presence: deps.presence,
            signaling: deps.signaling,
            events: deps.events,
            media: MediaController::new(deps.devices),
            peers,
            participants: BTreeMap::new(),
            joined_at: Utc::now(),
            queue,
            view_tx,
            presence_sub: None,
            signal_sub: None,
            writes: None,
            writer: None,
            screen_pending: false,
            fatal: None,
            closed: false,
            config,
        };
        (coordinator, rx)
    }

    fn meeting_id(&self) -> &str {
        &self.config.meeting_id
    }

    fn local_id(&self) -> &str {
        &self.config.identity.id
    }

    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.view_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ── Startup ─────────────────────────────────────────────────────────

    /// Acquire media, start listening to signaling, publish our presence
    /// record and subscribe to the roster, in that order. Signals are
    /// subscribed first so no offer addressed to us is missed.
    pub async fn start(&mut self) -> SessionResult<()> {
        let result = self.try_start().await;
        if let Err(e) = &result {
            error!(meeting_id = %self.meeting_id(), error = %e, "could not join meeting");
            self.media.stop_all();
            self.presence_sub.take();
            self.signal_sub.take();
            self.writes.take();
        }
        result
    }

    async fn try_start(&mut self) -> SessionResult<()> {
        let (mic_on, video_on) = (self.config.start_mic_on, self.config.start_video_on);
        match self.media.acquire_local_media(mic_on, video_on).await {
            Ok(()) => {}
            Err(e @ SessionError::DeviceUnavailable(_)) => {
                warn!(error = %e, "joining without camera and microphone");
            }
            Err(e) => return Err(e),
        }

        let meeting_id = self.config.meeting_id.clone();
        let queue = self.queue.clone();
        self.signal_sub = Some(
            self.signaling
                .subscribe(
                    &meeting_id,
                    Arc::new(move |message| {
                        let _ = queue.send(SessionEvent::Signal(message));
                    }),
                )
                .await?,
        );

        let record = self.local_record();
        self.presence.join(&meeting_id, &record).await?;

        let queue = self.queue.clone();
        let subscribed = self
            .presence
            .subscribe(
                &meeting_id,
                Arc::new(move |snapshot| {
                    let _ = queue.send(SessionEvent::Presence(snapshot));
                }),
            )
            .await;
        match subscribed {
            Ok(sub) => self.presence_sub = Some(sub),
            Err(e) => {
                let _ = self.presence.leave(&meeting_id, self.local_id()).await;
                return Err(e);
            }
        }

        let (writes, writer) = spawn_presence_writer(
            self.presence.clone(),
            meeting_id.clone(),
            self.local_id().to_string(),
        );
        self.writes = Some(writes);
        self.writer = Some(writer);

        info!(
            meeting_id = %meeting_id,
            participant_id = %self.local_id(),
            mic_on = self.media.is_mic_on(),
            video_on = self.media.is_video_on(),
            "joined meeting"
        );
        self.publish();
        Ok(())
    }

    /// Our own presence record as it should currently read.
    fn local_record(&self) -> Participant {
        let mut record = Participant::new(
            &self.config.identity,
            self.media.is_mic_on(),
            self.media.is_video_on(),
        );
        record.joined_at = self.joined_at;
        record.is_screen_sharing = self.media.is_screen_sharing();
        record
    }

    // ── Event loop ──────────────────────────────────────────────────────

    /// Drive the session until it closes: by `Leave`, by every handle being
    /// dropped, or by a fatal store failure.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        while !self.closed {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        info!(meeting_id = %self.meeting_id(), "all session handles dropped");
                        self.shutdown().await;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }
        debug!(meeting_id = %self.meeting_id(), "coordinator finished");
    }

    pub async fn handle_event(&mut self, event: SessionEvent) {
        if self.closed {
            if let SessionEvent::ScreenCaptured { result, reply } = event {
                if let Ok(track) = result {
                    track.stop();
                }
                if let Some(reply) = reply {
                    let _ = reply.send(Err(SessionError::SessionClosed));
                }
            }
            return;
        }

        match event {
            SessionEvent::Presence(Ok(snapshot)) => self.reconcile(snapshot),
            SessionEvent::Presence(Err(e)) | SessionEvent::Signal(Err(e)) => {
                if e.is_session_fatal() {
                    self.fail(e).await;
                    return;
                }
                warn!(error = %e, "store subscription error");
            }
            SessionEvent::Signal(Ok(message)) => self.route_signal(message),
            SessionEvent::Peer(event) => {
                let outgoing = self.media.outgoing();
                if let Some(notice) = self.peers.handle_peer_event(event, &outgoing) {
                    self.announce(notice);
                }
            }
            SessionEvent::ScreenCaptured { result, reply } => {
                self.screen_captured(result, reply);
                return;
            }
            SessionEvent::ScreenCaptureEnded { track_id } => {
                let active = self.media.screen_track().is_some_and(|t| t.id() == track_id);
                if active {
                    info!(track_id = %track_id, "screen capture ended by source");
                    self.stop_screen_share(true);
                }
            }
        }
        self.publish();
    }

    pub async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Leave(done) => {
                self.shutdown().await;
                let _ = done.send(());
            }
            _ if self.closed => reply_closed(command),
            Command::ToggleMic(reply) => {
                let on = !self.media.is_mic_on();
                if self.media.set_mic_enabled(on) {
                    info!(mic_on = on, "microphone toggled");
                    self.write_presence(PresenceWrite::Patch(ParticipantPatch::mic(on)));
                } else {
                    debug!("no microphone to toggle");
                }
                self.publish();
                let _ = reply.send(Ok(self.view()));
            }
            Command::ToggleVideo(reply) => {
                let on = !self.media.is_video_on();
                if self.media.set_video_enabled(on) {
                    info!(video_on = on, "camera toggled");
                    self.write_presence(PresenceWrite::Patch(ParticipantPatch::video(on)));
                } else {
                    debug!("no camera to toggle");
                }
                self.publish();
                let _ = reply.send(Ok(self.view()));
            }
            Command::ToggleScreenShare(reply) => {
                if self.media.is_screen_sharing() {
                    self.stop_screen_share(false);
                    self.publish();
                    let _ = reply.send(Ok(self.view()));
                } else if self.screen_pending {
                    debug!("screen capture already requested");
                    let _ = reply.send(Ok(self.view()));
                } else {
                    self.request_screen_capture(reply);
                }
            }
        }
    }

    // ── Presence ────────────────────────────────────────────────────────

    /// Diff a presence snapshot against the known roster. Replaying the
    /// same snapshot changes nothing.
    fn reconcile(&mut self, snapshot: Vec<Participant>) {
        let next: BTreeMap<String, Participant> =
            snapshot.into_iter().map(|p| (p.id.clone(), p)).collect();
        let outgoing = self.media.outgoing();
        let local_id = self.local_id().to_string();

        for (id, gone) in &self.participants {
            if *id == local_id || next.contains_key(id) {
                continue;
            }
            info!(peer_id = %id, "participant left");
            self.peers.remove_remote(id);
            self.events.emit(MeetingEvent::participant_left(
                &self.config.meeting_id,
                id,
                gone.display_name.as_deref(),
            ));
        }

        for (id, participant) in &next {
            if *id == local_id {
                continue;
            }
            match self.participants.get(id) {
                None => {
                    info!(peer_id = %id, initiator = should_initiate(&local_id, id), "participant joined");
                    self.peers.add_remote(id, &outgoing);
                    self.events.emit(MeetingEvent::participant_joined(
                        &self.config.meeting_id,
                        id,
                        participant.display_name.as_deref(),
                    ));
                }
                Some(known) if known.joined_at != participant.joined_at => {
                    // A reloaded client: the responder waits for the fresh offer.
                    if should_initiate(&local_id, id) {
                        info!(peer_id = %id, "participant rejoined, reconnecting");
                        self.peers.remove_remote(id);
                        self.peers.add_remote(id, &outgoing);
                    }
                }
                Some(_) => {}
            }
        }

        if !next.contains_key(&local_id) {
            warn!(participant_id = %local_id, "own presence record missing, re-publishing");
            let record = self.local_record();
            self.write_presence(PresenceWrite::Rejoin(record));
        }

        self.participants = next;
    }

    fn write_presence(&self, write: PresenceWrite) {
        if let Some(writes) = &self.writes {
            let _ = writes.send(write);
        }
    }

    // ── Signaling ───────────────────────────────────────────────────────

    fn route_signal(&mut self, message: SignalingMessage) {
        let outgoing = self.media.outgoing();
        let (kind, from) = (message.kind, message.from.clone());
        match self.peers.handle_signal(message, &outgoing) {
            Ok(()) => {}
            Err(e @ (SessionError::StaleSignal { .. } | SessionError::InvalidSignal(_))) => {
                debug!(peer_id = %from, kind = kind.as_str(), error = %e, "signal discarded");
            }
            Err(e) => warn!(peer_id = %from, kind = kind.as_str(), error = %e, "signal failed"),
        }
    }

    fn announce(&self, notice: PeerNotice) {
        let event = match &notice {
            PeerNotice::Connected { peer_id } => {
                MeetingEvent::peer_connected(self.meeting_id(), peer_id)
            }
            PeerNotice::Dropped { peer_id, reason } => {
                MeetingEvent::peer_dropped(self.meeting_id(), peer_id, reason)
            }
        };
        self.events.emit(event);
    }

    // ── Screen share ────────────────────────────────────────────────────

    fn request_screen_capture(&mut self, reply: Reply) {
        self.screen_pending = true;
        let devices = self.media.devices();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let result = devices.display_media().await;
            let _ = queue.send(SessionEvent::ScreenCaptured {
                result,
                reply: Some(reply),
            });
        });
    }

    fn screen_captured(&mut self, result: SessionResult<LocalTrack>, reply: Option<Reply>) {
        self.screen_pending = false;
        let result = match result {
            Ok(track) => {
                self.media.install_screen_share(track.clone());
                self.peers.replace_outgoing_video(Some(&track));
                self.watch_screen_end(&track);
                self.write_presence(PresenceWrite::Patch(ParticipantPatch::screen(true)));
                self.events.emit(MeetingEvent::screenshare_started(
                    self.meeting_id(),
                    self.local_id(),
                ));
                self.publish();
                Ok(self.view())
            }
            Err(e) => {
                warn!(error = %e, "screen capture not started");
                Err(e)
            }
        };
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    fn watch_screen_end(&self, track: &LocalTrack) {
        let track = track.clone();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            track.ended().await;
            let _ = queue.send(SessionEvent::ScreenCaptureEnded {
                track_id: track.id().to_string(),
            });
        });
    }

    /// Revert every peer to the camera, or to no video if there is none.
    fn stop_screen_share(&mut self, ended_by_source: bool) {
        if !self.media.stop_screen_share() {
            return;
        }
        let camera = self.media.active_video().cloned();
        self.peers.replace_outgoing_video(camera.as_ref());
        self.write_presence(PresenceWrite::Patch(ParticipantPatch::screen(false)));
        self.events.emit(MeetingEvent::screenshare_stopped(
            self.meeting_id(),
            self.local_id(),
            ended_by_source,
        ));
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    async fn fail(&mut self, err: SessionError) {
        error!(meeting_id = %self.meeting_id(), error = %err, "session failed");
        self.events.emit(MeetingEvent::session_failed(
            self.meeting_id(),
            err.code(),
            &err.to_string(),
        ));
        self.fatal = Some(err);
        self.shutdown().await;
    }

    /// Leave the meeting. Devices are released and transports closed before
    /// this returns; store cleanup is best effort. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!(meeting_id = %self.meeting_id(), "leaving meeting");

        self.media.stop_all();
        if let Some(sub) = self.presence_sub.take() {
            sub.unsubscribe();
        }
        if let Some(sub) = self.signal_sub.take() {
            sub.unsubscribe();
        }
        self.peers.close_all().await;

        // Let queued control writes land before the record goes away.
        self.writes.take();
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(CLEANUP_TIMEOUT, writer).await.is_err() {
                warn!("pending presence writes abandoned");
            }
        }

        if self.fatal.is_none() {
            let meeting_id = self.config.meeting_id.clone();
            let local_id = self.config.identity.id.clone();
            let cleanup = async {
                if let Err(e) = self.presence.leave(&meeting_id, &local_id).await {
                    warn!(error = %e, "could not remove presence record");
                }
                if let Err(e) = self.signaling.purge_mine(&meeting_id, &local_id).await {
                    warn!(error = %e, "could not purge signaling messages");
                }
            };
            if tokio::time::timeout(CLEANUP_TIMEOUT, cleanup).await.is_err() {
                warn!("store cleanup timed out");
            }
        }

        self.participants.clear();
        self.publish();
        info!(meeting_id = %self.meeting_id(), "left meeting");
    }

    // ── View ────────────────────────────────────────────────────────────

    pub fn view(&self) -> SessionView {
        let mut participants: Vec<Participant> = self.participants.values().cloned().collect();
        participants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        SessionView {
            meeting_id: self.config.meeting_id.clone(),
            local_participant_id: self.config.identity.id.clone(),
            participants,
            local_stream: self.media.local_stream(),
            remote_streams: self.peers.remote_streams(),
            is_mic_on: self.media.is_mic_on(),
            is_video_on: self.media.is_video_on(),
            is_screen_sharing: self.media.is_screen_sharing(),
            peer_states: self.peers.peer_states(),
            fatal_error: self.fatal.as_ref().map(ErrorInfo::from),
            closed: self.closed,
        }
    }

    fn publish(&self) {
        let next = self.view();
        self.view_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn peers(&self) -> &PeerManager {
        &self.peers
    }
}

fn reply_closed(command: Command) {
    match command {
        Command::ToggleMic(reply) | Command::ToggleVideo(reply) | Command::ToggleScreenShare(reply) => {
            let _ = reply.send(Err(SessionError::SessionClosed));
        }
        Command::Leave(done) => {
            let _ = done.send(());
        }
    }
}

// ─── Handle ─────────────────────────────────────────────────────────────────

/// Join `config.meeting_id` and spawn the coordinator.
pub async fn join(config: SessionConfig, deps: SessionDeps) -> SessionResult<SessionHandle> {
    let (mut coordinator, events) = SessionCoordinator::new(config, deps);
    coordinator.start().await?;
    let view = coordinator.watch();
    let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
    tokio::spawn(coordinator.run(events, rx));
    Ok(SessionHandle { commands, view })
}

/// Cheap to clone. When the last handle is dropped the session leaves.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<SessionView>,
}

impl SessionHandle {
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub async fn toggle_mic(&self) -> SessionResult<SessionView> {
        self.request(Command::ToggleMic).await
    }

    pub async fn toggle_video(&self) -> SessionResult<SessionView> {
        self.request(Command::ToggleVideo).await
    }

    /// Start sharing (waits for the capture prompt) or stop sharing.
    pub async fn toggle_screen_share(&self) -> SessionResult<SessionView> {
        self.request(Command::ToggleScreenShare).await
    }

    /// Resolves once devices are released and transports closed. Leaving a
    /// closed session succeeds.
    pub async fn leave_meeting(&self) -> SessionResult<()> {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Leave(done)).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> SessionResult<SessionView> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
