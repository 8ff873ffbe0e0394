//! Test doubles shared by the unit tests: a recording transport factory and
//! a harness that drives one coordinator step by step.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::{SessionError, SessionResult};
use crate::events::EventBus;
use crate::media::{LocalTrack, MediaKind, OutgoingTracks, SyntheticDevices};
use crate::model::{Identity, IceCandidate, Participant, SessionDescription, SignalingMessage};
use crate::peer::PeerState;
use crate::session::{Command, Reply, SessionConfig, SessionCoordinator, SessionDeps, SessionEvent, SessionView};
use crate::store::{MemoryStore, PresenceStore, SignalingChannel};
use crate::transport::{
    PeerTransport, RemoteTrack, TransportEvent, TransportEventSink, TransportFactory,
    TransportState,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Candidate signal whose candidate line is just `line`.
pub fn candidate(from: &str, to: &str, line: &str) -> SignalingMessage {
    SignalingMessage::candidate(
        from,
        to,
        &IceCandidate {
            candidate: line.to_string(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        },
    )
}

// ─── FakeTransport ──────────────────────────────────────────────────────────

/// Records every call. Connects once it has a remote description and at
/// least one remote candidate, exposing one remote video track first.
/// Closing reports `Closed` through the event sink.
pub struct FakeTransport {
    peer_id: String,
    events: TransportEventSink,
    log: Mutex<Vec<String>>,
    remote_set: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl FakeTransport {
    pub fn log(&self) -> Vec<String> {
        lock(&self.log).clone()
    }

    /// Calls that applied remote state, in order.
    pub fn remote_ops(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|op| op.starts_with("accept_") || op.starts_with("candidate:"))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.events)(event);
    }

    fn record(&self, op: impl Into<String>) {
        lock(&self.log).push(op.into());
    }

    fn local_candidate(&self) {
        self.emit(TransportEvent::LocalCandidate(IceCandidate {
            candidate: format!("host-candidate-for-{}", self.peer_id),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
    }

    fn check_open(&self) -> SessionResult<()> {
        if self.is_closed() {
            Err(SessionError::negotiation(&self.peer_id, "transport closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> SessionResult<SessionDescription> {
        self.check_open()?;
        self.record("create_offer");
        self.local_candidate();
        Ok(SessionDescription::offer(format!("fake-offer-to-{}", self.peer_id)))
    }

    async fn accept_offer(&self, _offer: SessionDescription) -> SessionResult<SessionDescription> {
        self.check_open()?;
        self.record("accept_offer");
        self.remote_set.store(true, Ordering::SeqCst);
        self.local_candidate();
        Ok(SessionDescription::answer(format!("fake-answer-to-{}", self.peer_id)))
    }

    async fn accept_answer(&self, _answer: SessionDescription) -> SessionResult<()> {
        self.check_open()?;
        self.record("accept_answer");
        self.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> SessionResult<()> {
        self.check_open()?;
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(SessionError::negotiation(
                &self.peer_id,
                "candidate before remote description",
            ));
        }
        self.record(format!("candidate:{}", candidate.candidate));
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.emit(TransportEvent::RemoteTrack(RemoteTrack {
                id: format!("{}-video", self.peer_id),
                stream_id: self.peer_id.clone(),
                kind: MediaKind::Video,
                handle: None,
            }));
            self.emit(TransportEvent::StateChanged(TransportState::Connected));
        }
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<LocalTrack>) -> SessionResult<()> {
        self.check_open()?;
        let id = track.as_ref().map(LocalTrack::id).unwrap_or("none");
        self.record(format!("replace_video:{id}"));
        Ok(())
    }

    async fn close(&self) -> SessionResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.record("close");
            self.emit(TransportEvent::StateChanged(TransportState::Closed));
        }
        Ok(())
    }
}

// ─── FakeTransportFactory ───────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeTransportFactory {
    created: Mutex<HashMap<String, Vec<Arc<FakeTransport>>>>,
    failures: AtomicUsize,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` `create` calls fail.
    pub fn fail_next_creations(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn transports_for(&self, peer_id: &str) -> Vec<Arc<FakeTransport>> {
        lock(&self.created).get(peer_id).cloned().unwrap_or_default()
    }

    pub fn latest(&self, peer_id: &str) -> Option<Arc<FakeTransport>> {
        self.transports_for(peer_id).pop()
    }

    /// Inject an event from the newest transport to `peer_id`.
    pub fn emit(&self, peer_id: &str, event: TransportEvent) {
        if let Some(transport) = self.latest(peer_id) {
            transport.emit(event);
        }
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        _outgoing: &OutgoingTracks,
        events: TransportEventSink,
    ) -> SessionResult<Arc<dyn PeerTransport>> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SessionError::negotiation(peer_id, "injected creation failure"));
        }

        let transport = Arc::new(FakeTransport {
            peer_id: peer_id.to_string(),
            events,
            log: Mutex::new(Vec::new()),
            remote_set: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        lock(&self.created)
            .entry(peer_id.to_string())
            .or_default()
            .push(transport.clone());
        Ok(transport)
    }
}

// ─── Harness ────────────────────────────────────────────────────────────────

/// One coordinator in meeting `m1`, driven by hand.
pub struct Harness {
    pub coordinator: SessionCoordinator,
    pub queue: mpsc::UnboundedReceiver<SessionEvent>,
    pub store: MemoryStore,
    pub factory: Arc<FakeTransportFactory>,
    pub devices: Arc<SyntheticDevices>,
    pub events: EventBus,
}

impl Harness {
    pub async fn new(local_id: &str) -> Self {
        Self::build(local_id, SyntheticDevices::new(local_id), 1).await
    }

    pub async fn with_devices(local_id: &str, devices: SyntheticDevices) -> Self {
        Self::build(local_id, devices, 1).await
    }

    pub async fn with_budget(local_id: &str, budget: u32) -> Self {
        Self::build(local_id, SyntheticDevices::new(local_id), budget).await
    }

    async fn build(local_id: &str, devices: SyntheticDevices, budget: u32) -> Self {
        let store = MemoryStore::new();
        let factory = Arc::new(FakeTransportFactory::new());
        let devices = Arc::new(devices);
        let events = EventBus::new();
        let deps = SessionDeps {
            presence: Arc::new(store.clone()),
            signaling: Arc::new(store.clone()),
            devices: devices.clone(),
            transports: factory.clone(),
            events: events.clone(),
        };
        let mut config = Self::config(local_id);
        config.peer_retry_budget = budget;

        let (mut coordinator, queue) = SessionCoordinator::new(config, deps);
        if let Err(e) = coordinator.start().await {
            panic!("harness session failed to start: {e}");
        }
        Self {
            coordinator,
            queue,
            store,
            factory,
            devices,
            events,
        }
    }

    pub fn config(local_id: &str) -> SessionConfig {
        SessionConfig {
            meeting_id: "m1".into(),
            identity: Identity {
                id: local_id.into(),
                display_name: Some(format!("User {local_id}")),
                photo_ref: None,
            },
            start_mic_on: true,
            start_video_on: true,
            peer_retry_budget: 1,
            answer_timeout: crate::peer::DEFAULT_ANSWER_TIMEOUT,
        }
    }

    pub fn deps(store: &MemoryStore, devices: Arc<SyntheticDevices>) -> SessionDeps {
        SessionDeps {
            presence: Arc::new(store.clone()),
            signaling: Arc::new(store.clone()),
            devices,
            transports: Arc::new(FakeTransportFactory::new()),
            events: EventBus::new(),
        }
    }

    pub fn deps_with(
        store: &MemoryStore,
        stream_id: &str,
        factory: Arc<FakeTransportFactory>,
    ) -> SessionDeps {
        SessionDeps {
            presence: Arc::new(store.clone()),
            signaling: Arc::new(store.clone()),
            devices: Arc::new(SyntheticDevices::new(stream_id)),
            transports: factory,
            events: EventBus::new(),
        }
    }

    /// Feed queued events to the coordinator until 50 ms pass without one.
    pub async fn settle(&mut self) {
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), self.queue.recv()).await
        {
            self.coordinator.handle_event(event).await;
        }
    }

    pub fn view(&self) -> SessionView {
        self.coordinator.view()
    }

    pub fn peer_state(&self, peer_id: &str) -> Option<PeerState> {
        self.coordinator.peers().state_of(peer_id)
    }

    /// Run a command to completion, settling in between.
    pub async fn command(&mut self, make: fn(Reply) -> Command) -> SessionResult<SessionView> {
        let (reply, rx) = oneshot::channel();
        self.coordinator.handle_command(make(reply)).await;
        self.settle().await;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    /// Publish (or re-publish) a remote presence record.
    pub async fn add_remote(&self, id: &str) {
        let identity = Identity {
            id: id.into(),
            display_name: Some(format!("User {id}")),
            photo_ref: None,
        };
        let result = self.store.join("m1", &Participant::new(&identity, true, true)).await;
        assert!(result.is_ok(), "remote join failed");
    }

    pub async fn remove_remote(&self, id: &str) {
        let result = self.store.leave("m1", id).await;
        assert!(result.is_ok(), "remote leave failed");
    }

    /// Send a signal as if a remote participant wrote it.
    pub async fn deliver(&self, message: SignalingMessage) {
        let result = self.store.send("m1", &message).await;
        assert!(result.is_ok(), "signal send failed");
    }
}
