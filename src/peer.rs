//! Peer connection manager.
//!
//! One [`PeerEntry`] per remote participant, kept in an arena keyed by
//! participant id and owned by the session coordinator. Every entry with a
//! transport has a dedicated worker task that runs its negotiation steps in
//! order; results come back as [`PeerEvent`]s tagged with the entry's
//! generation so events from a superseded transport are discarded.
//!
//! ```text
//! NEW ──initiator──▶ OFFERING ──answer──▶ CONNECTING ──▶ CONNECTED
//!  └───offer──────▶ ANSWERING ──sent───▶ CONNECTING
//! CONNECTING/CONNECTED ──failure──▶ DISCONNECTED ──retry──▶ CONNECTING
//! * ──leave / budget exhausted──▶ CLOSED
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SessionError, SessionResult};
use crate::media::{LocalTrack, OutgoingTracks};
use crate::model::{IceCandidate, SessionDescription, SignalKind, SignalingMessage};
use crate::store::SignalingChannel;
use crate::transport::{
    PeerTransport, RemoteTrack, TransportEvent, TransportEventSink, TransportFactory,
    TransportState,
};

/// Signals held per not-yet-present sender.
const EARLY_SIGNAL_LIMIT: usize = 128;

/// Departed ids remembered for stale-signal detection.
const DEPARTED_LIMIT: usize = 1024;
const DEPARTED_TTL: Duration = Duration::from_secs(300);

/// How long an offer may go unanswered before it counts as a failure.
pub const DEFAULT_ANSWER_TIMEOUT: Duration = Duration::from_secs(15);

/// Glare rule: the participant whose id sorts greater (byte-wise) sends the
/// offer. Exactly one side of any pair of distinct ids returns `true`.
pub fn should_initiate(local_id: &str, remote_id: &str) -> bool {
    local_id.as_bytes() > remote_id.as_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerState {
    New,
    Offering,
    Answering,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// What a peer worker reports back.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Transport(TransportEvent),
    OfferSent,
    AnswerSent,
    AnswerTimedOut,
    Failed(SessionError),
}

#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub peer_id: String,
    pub generation: u64,
    pub event: WorkerEvent,
}

pub type PeerEventSink = Arc<dyn Fn(PeerEvent) + Send + Sync>;

/// Lifecycle outcomes the coordinator announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerNotice {
    Connected { peer_id: String },
    Dropped { peer_id: String, reason: String },
}

/// Counters of negotiation work started. Replaying presence must not move
/// them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NegotiationStats {
    pub offers: u64,
    pub answers: u64,
    pub transports: u64,
}

/// Media received from one remote participant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStream {
    pub peer_id: String,
    pub tracks: Vec<RemoteTrack>,
}

// ─── Worker ─────────────────────────────────────────────────────────────────

enum PeerOp {
    Offer,
    Answer(SessionDescription),
    ApplyAnswer(SessionDescription),
    AddCandidate(IceCandidate),
    SendCandidate(IceCandidate),
    ReplaceVideo(Option<LocalTrack>),
}

type TransportSlot = Arc<Mutex<Option<Arc<dyn PeerTransport>>>>;

fn take_slot(slot: &TransportSlot) -> Option<Arc<dyn PeerTransport>> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

fn fill_slot(slot: &TransportSlot, transport: Arc<dyn PeerTransport>) {
    match slot.lock() {
        Ok(mut guard) => *guard = Some(transport),
        Err(poisoned) => *poisoned.into_inner() = Some(transport),
    }
}

struct Worker {
    ops: mpsc::UnboundedSender<PeerOp>,
    cancel: CancellationToken,
    slot: TransportSlot,
}

impl Worker {
    fn spawn(ctx: WorkerContext) -> Self {
        let (ops, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let slot: TransportSlot = Arc::new(Mutex::new(None));
        tokio::spawn(run_worker(ctx, slot.clone(), rx, cancel.clone()));
        Self { ops, cancel, slot }
    }

    fn send(&self, op: PeerOp) {
        // A finished worker has already reported why.
        let _ = self.ops.send(op);
    }

    /// Stop the worker and hand back its transport for closing. A worker
    /// still building its transport closes it itself.
    fn shutdown(self) -> Option<Arc<dyn PeerTransport>> {
        self.cancel.cancel();
        take_slot(&self.slot)
    }

    /// Report `AnswerTimedOut` after `timeout` unless the worker stops first.
    fn arm_answer_timer(&self, peer_id: &str, generation: u64, timeout: Duration, sink: PeerEventSink) {
        let cancel = self.cancel.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => sink(PeerEvent {
                    peer_id,
                    generation,
                    event: WorkerEvent::AnswerTimedOut,
                }),
            }
        });
    }

    /// Shut down and close in the background.
    fn retire(self, peer_id: &str) {
        if let Some(transport) = self.shutdown() {
            let peer_id = peer_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = transport.close().await {
                    debug!(peer_id = %peer_id, error = %e, "closing retired transport");
                }
            });
        }
    }
}

struct WorkerContext {
    meeting_id: String,
    local_id: String,
    peer_id: String,
    generation: u64,
    outgoing: OutgoingTracks,
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingChannel>,
    sink: PeerEventSink,
}

impl WorkerContext {
    fn report(&self, event: WorkerEvent) {
        (self.sink)(PeerEvent {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            event,
        });
    }

    fn transport_sink(&self) -> TransportEventSink {
        let sink = self.sink.clone();
        let peer_id = self.peer_id.clone();
        let generation = self.generation;
        Arc::new(move |event| {
            sink(PeerEvent {
                peer_id: peer_id.clone(),
                generation,
                event: WorkerEvent::Transport(event),
            })
        })
    }

    async fn signal(&self, message: SignalingMessage) -> SessionResult<()> {
        self.signaling.send(&self.meeting_id, &message).await
    }

    async fn execute(&self, transport: &dyn PeerTransport, op: PeerOp) -> SessionResult<()> {
        match op {
            PeerOp::Offer => {
                let offer = transport.create_offer().await?;
                self.signal(SignalingMessage::description(&self.local_id, &self.peer_id, &offer))
                    .await?;
                self.report(WorkerEvent::OfferSent);
            }
            PeerOp::Answer(offer) => {
                let answer = transport.accept_offer(offer).await?;
                self.signal(SignalingMessage::description(&self.local_id, &self.peer_id, &answer))
                    .await?;
                self.report(WorkerEvent::AnswerSent);
            }
            PeerOp::ApplyAnswer(answer) => transport.accept_answer(answer).await?,
            PeerOp::AddCandidate(candidate) => {
                // A candidate the agent rejects does not sink the connection.
                if let Err(e) = transport.add_remote_candidate(candidate).await {
                    warn!(peer_id = %self.peer_id, error = %e, "remote candidate rejected");
                }
            }
            PeerOp::SendCandidate(candidate) => {
                let message = SignalingMessage::candidate(&self.local_id, &self.peer_id, &candidate);
                if let Err(e) = self.signal(message).await {
                    warn!(peer_id = %self.peer_id, error = %e, "could not publish local candidate");
                }
            }
            PeerOp::ReplaceVideo(track) => {
                if let Err(e) = transport.replace_video_track(track).await {
                    warn!(peer_id = %self.peer_id, error = %e, "outgoing video substitution failed");
                }
            }
        }
        Ok(())
    }
}

async fn run_worker(
    ctx: WorkerContext,
    slot: TransportSlot,
    mut ops: mpsc::UnboundedReceiver<PeerOp>,
    cancel: CancellationToken,
) {
    let created = tokio::select! {
        _ = cancel.cancelled() => return,
        r = ctx.factory.create(&ctx.peer_id, &ctx.outgoing, ctx.transport_sink()) => r,
    };
    let transport = match created {
        Ok(transport) => transport,
        Err(e) => {
            ctx.report(WorkerEvent::Failed(e));
            return;
        }
    };

    fill_slot(&slot, transport.clone());
    if cancel.is_cancelled() {
        if let Some(transport) = take_slot(&slot) {
            let _ = transport.close().await;
        }
        return;
    }

    loop {
        let op = tokio::select! {
            _ = cancel.cancelled() => return,
            op = ops.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };
        let step = tokio::select! {
            _ = cancel.cancelled() => return,
            r = ctx.execute(transport.as_ref(), op) => r,
        };
        if let Err(e) = step {
            ctx.report(WorkerEvent::Failed(e));
        }
    }

    // The entry went away without shutting the worker down.
    if let Some(transport) = take_slot(&slot) {
        let _ = transport.close().await;
    }
}

// ─── Entries ────────────────────────────────────────────────────────────────

struct PeerEntry {
    generation: u64,
    state: PeerState,
    initiator: bool,
    remote_description_set: bool,
    awaiting_answer: bool,
    pending_candidates: Vec<IceCandidate>,
    retries_left: u32,
    remote_tracks: Vec<RemoteTrack>,
    media_visible: bool,
    worker: Option<Worker>,
}

impl PeerEntry {
    fn send(&self, op: PeerOp) {
        if let Some(worker) = &self.worker {
            worker.send(op);
        }
    }

    fn flush_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.send(PeerOp::AddCandidate(candidate));
        }
    }
}

fn transition(peer_id: &str, entry: &mut PeerEntry, to: PeerState) {
    if entry.state != to {
        info!(peer_id, from = ?entry.state, to = ?to, generation = entry.generation, "peer state");
        entry.state = to;
    }
}

// ─── PeerManager ────────────────────────────────────────────────────────────

pub struct PeerManager {
    meeting_id: String,
    local_id: String,
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingChannel>,
    sink: PeerEventSink,
    retry_budget: u32,
    answer_timeout: Duration,
    entries: HashMap<String, PeerEntry>,
    /// Remote ids currently in the presence snapshot.
    present: HashSet<String>,
    /// Remote ids that were present and left: when, and in which order.
    departed: HashMap<String, (Instant, u64)>,
    departures: u64,
    /// Signals from senders not yet seen in presence.
    early: HashMap<String, Vec<SignalingMessage>>,
    next_generation: u64,
    stats: NegotiationStats,
}

impl PeerManager {
    pub fn new(
        meeting_id: &str,
        local_id: &str,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingChannel>,
        sink: PeerEventSink,
        retry_budget: u32,
    ) -> Self {
        Self {
            meeting_id: meeting_id.to_string(),
            local_id: local_id.to_string(),
            factory,
            signaling,
            sink,
            retry_budget,
            answer_timeout: DEFAULT_ANSWER_TIMEOUT,
            entries: HashMap::new(),
            present: HashSet::new(),
            departed: HashMap::new(),
            departures: 0,
            early: HashMap::new(),
            next_generation: 1,
            stats: NegotiationStats::default(),
        }
    }

    pub fn with_answer_timeout(mut self, timeout: Duration) -> Self {
        self.answer_timeout = timeout;
        self
    }

    pub fn state_of(&self, peer_id: &str) -> Option<PeerState> {
        self.entries.get(peer_id).map(|e| e.state)
    }

    pub fn peer_states(&self) -> BTreeMap<String, PeerState> {
        self.entries
            .iter()
            .map(|(id, e)| (id.clone(), e.state))
            .collect()
    }

    pub fn stats(&self) -> NegotiationStats {
        self.stats
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Streams to render. A disconnected peer's media is hidden until the
    /// connection recovers.
    pub fn remote_streams(&self) -> BTreeMap<String, RemoteStream> {
        self.entries
            .iter()
            .filter(|(_, e)| e.media_visible && !e.remote_tracks.is_empty())
            .map(|(id, e)| {
                (
                    id.clone(),
                    RemoteStream {
                        peer_id: id.clone(),
                        tracks: e.remote_tracks.clone(),
                    },
                )
            })
            .collect()
    }

    // ── Presence-driven ─────────────────────────────────────────────────

    /// A participant appeared. Starts an offer if we are the initiator,
    /// otherwise waits in `NEW`. Known ids are left alone.
    pub fn add_remote(&mut self, peer_id: &str, outgoing: &OutgoingTracks) {
        if peer_id == self.local_id || self.entries.contains_key(peer_id) {
            return;
        }
        self.departed.remove(peer_id);
        self.present.insert(peer_id.to_string());

        let initiator = should_initiate(&self.local_id, peer_id);
        self.insert_entry(peer_id, initiator);
        if initiator {
            self.start_offer(peer_id, outgoing);
        }

        if let Some(early) = self.early.remove(peer_id) {
            debug!(peer_id, count = early.len(), "replaying early signals");
            for message in early {
                if let Err(e) = self.handle_signal(message, outgoing) {
                    debug!(peer_id, error = %e, "early signal discarded");
                }
            }
        }
    }

    /// A participant left. Returns `true` if a connection entry existed.
    pub fn remove_remote(&mut self, peer_id: &str) -> bool {
        self.present.remove(peer_id);
        self.remember_departed(peer_id);
        self.early.remove(peer_id);
        match self.entries.remove(peer_id) {
            Some(mut entry) => {
                transition(peer_id, &mut entry, PeerState::Closed);
                if let Some(worker) = entry.worker.take() {
                    worker.retire(peer_id);
                }
                true
            }
            None => false,
        }
    }

    // ── Signaling-driven ────────────────────────────────────────────────

    /// Route one signaling message. Messages for other participants are
    /// ignored; `StaleSignal` and `InvalidSignal` mean it was discarded.
    pub fn handle_signal(
        &mut self,
        message: SignalingMessage,
        outgoing: &OutgoingTracks,
    ) -> SessionResult<()> {
        if message.to != self.local_id || message.from == self.local_id {
            return Ok(());
        }
        let from = message.from.clone();

        if !self.entries.contains_key(&from) {
            if self.present.contains(&from) {
                // The entry was dropped; a fresh offer revives it.
                if message.kind == SignalKind::Offer && !should_initiate(&self.local_id, &from) {
                    info!(peer_id = %from, "new offer from dropped peer");
                    self.insert_entry(&from, false);
                } else {
                    return Err(SessionError::StaleSignal { peer_id: from });
                }
            } else if self.departed.contains_key(&from) {
                // A rejoining participant can offer before its new presence
                // record reaches us. Its later signals are held behind it.
                if message.kind == SignalKind::Offer && !should_initiate(&self.local_id, &from) {
                    debug!(peer_id = %from, "offer from departed peer, holding until it reappears");
                    self.departed.remove(&from);
                    self.hold_early(message);
                    return Ok(());
                }
                return Err(SessionError::StaleSignal { peer_id: from });
            } else {
                self.hold_early(message);
                return Ok(());
            }
        }

        match message.kind {
            SignalKind::Offer => {
                let offer = message.session_description()?;
                self.on_offer(&from, offer, outgoing);
            }
            SignalKind::Answer => {
                let answer = message.session_description()?;
                self.on_answer(&from, answer);
            }
            SignalKind::Candidate => {
                let candidate = message.ice_candidate()?;
                self.on_remote_candidate(&from, candidate);
            }
        }
        Ok(())
    }

    fn on_offer(&mut self, peer_id: &str, offer: SessionDescription, outgoing: &OutgoingTracks) {
        let Some(entry) = self.entries.get(peer_id) else {
            return;
        };
        if entry.initiator {
            warn!(peer_id, state = ?entry.state, "offer from a peer we initiate towards, ignoring");
            return;
        }
        if entry.state == PeerState::Answering {
            debug!(peer_id, "duplicate offer while answering, ignoring");
            return;
        }

        // NEW, or the remote's retry/renegotiation: always a fresh transport.
        self.reset_worker(peer_id, outgoing);
        self.stats.answers += 1;
        if let Some(entry) = self.entries.get_mut(peer_id) {
            entry.send(PeerOp::Answer(offer));
            entry.remote_description_set = true;
            entry.flush_candidates();
            transition(peer_id, entry, PeerState::Answering);
        }
    }

    fn on_answer(&mut self, peer_id: &str, answer: SessionDescription) {
        let Some(entry) = self.entries.get_mut(peer_id) else {
            return;
        };
        if !entry.awaiting_answer {
            debug!(peer_id, state = ?entry.state, "unexpected answer, ignoring");
            return;
        }
        entry.send(PeerOp::ApplyAnswer(answer));
        entry.awaiting_answer = false;
        entry.remote_description_set = true;
        entry.flush_candidates();
        transition(peer_id, entry, PeerState::Connecting);
    }

    fn on_remote_candidate(&mut self, peer_id: &str, candidate: IceCandidate) {
        let Some(entry) = self.entries.get_mut(peer_id) else {
            return;
        };
        if entry.remote_description_set {
            entry.send(PeerOp::AddCandidate(candidate));
        } else {
            entry.pending_candidates.push(candidate);
        }
    }

    // ── Worker/transport-driven ─────────────────────────────────────────

    pub fn handle_peer_event(
        &mut self,
        event: PeerEvent,
        outgoing: &OutgoingTracks,
    ) -> Option<PeerNotice> {
        let PeerEvent {
            peer_id,
            generation,
            event,
        } = event;
        let entry = self.entries.get_mut(&peer_id)?;
        if entry.generation != generation {
            debug!(peer_id = %peer_id, generation, current = entry.generation, "event from superseded transport");
            return None;
        }

        match event {
            WorkerEvent::Transport(TransportEvent::LocalCandidate(candidate)) => {
                entry.send(PeerOp::SendCandidate(candidate));
                None
            }
            WorkerEvent::Transport(TransportEvent::RemoteTrack(track)) => {
                debug!(peer_id = %peer_id, track_id = %track.id, "remote track exposed");
                entry.remote_tracks.retain(|t| t.id != track.id);
                entry.remote_tracks.push(track);
                entry.media_visible = true;
                None
            }
            WorkerEvent::Transport(TransportEvent::StateChanged(state)) => {
                self.on_transport_state(&peer_id, state, outgoing)
            }
            WorkerEvent::OfferSent => {
                debug!(peer_id = %peer_id, "offer published");
                None
            }
            WorkerEvent::AnswerSent => {
                if entry.state == PeerState::Answering {
                    transition(&peer_id, entry, PeerState::Connecting);
                }
                None
            }
            WorkerEvent::AnswerTimedOut => {
                if !entry.awaiting_answer {
                    return None;
                }
                warn!(peer_id = %peer_id, timeout = ?self.answer_timeout, "offer unanswered");
                self.on_failure(&peer_id, "no answer to offer".into(), outgoing)
            }
            WorkerEvent::Failed(err) => {
                warn!(peer_id = %peer_id, error = %err, "negotiation step failed");
                self.on_failure(&peer_id, err.to_string(), outgoing)
            }
        }
    }

    fn on_transport_state(
        &mut self,
        peer_id: &str,
        state: TransportState,
        outgoing: &OutgoingTracks,
    ) -> Option<PeerNotice> {
        let entry = self.entries.get_mut(peer_id)?;
        match state {
            TransportState::Connected => {
                if entry.state == PeerState::Connected {
                    return None;
                }
                transition(peer_id, entry, PeerState::Connected);
                entry.media_visible = true;
                Some(PeerNotice::Connected {
                    peer_id: peer_id.to_string(),
                })
            }
            TransportState::Disconnected => {
                if matches!(entry.state, PeerState::Connecting | PeerState::Connected) {
                    transition(peer_id, entry, PeerState::Disconnected);
                    entry.media_visible = false;
                }
                None
            }
            TransportState::Failed => self.on_failure(peer_id, "transport failed".into(), outgoing),
            TransportState::Closed => {
                Some(self.drop_peer(peer_id, "transport closed unexpectedly".into()))
            }
            TransportState::New | TransportState::Connecting => None,
        }
    }

    /// One failure of the current connection: retry if budget remains,
    /// otherwise drop the peer.
    fn on_failure(
        &mut self,
        peer_id: &str,
        reason: String,
        outgoing: &OutgoingTracks,
    ) -> Option<PeerNotice> {
        let entry = self.entries.get_mut(peer_id)?;
        if entry.retries_left == 0 {
            return Some(self.drop_peer(peer_id, reason));
        }
        entry.retries_left -= 1;
        entry.media_visible = false;
        entry.remote_description_set = false;
        entry.pending_candidates.clear();
        transition(peer_id, entry, PeerState::Disconnected);

        if entry.initiator {
            info!(peer_id, retries_left = entry.retries_left, "re-offering after failure");
            self.reset_worker(peer_id, outgoing);
            self.send_offer(peer_id);
            if let Some(entry) = self.entries.get_mut(peer_id) {
                transition(peer_id, entry, PeerState::Connecting);
            }
        } else {
            info!(peer_id, "waiting for the initiator to re-offer");
            // The closing transport reports `Closed`; a new generation makes
            // that report stale.
            entry.generation = self.next_generation;
            self.next_generation += 1;
            if let Some(worker) = entry.worker.take() {
                worker.retire(peer_id);
            }
        }
        None
    }

    fn drop_peer(&mut self, peer_id: &str, reason: String) -> PeerNotice {
        if let Some(mut entry) = self.entries.remove(peer_id) {
            warn!(peer_id, reason = %reason, "dropping peer");
            transition(peer_id, &mut entry, PeerState::Closed);
            if let Some(worker) = entry.worker.take() {
                worker.retire(peer_id);
            }
        }
        PeerNotice::Dropped {
            peer_id: peer_id.to_string(),
            reason,
        }
    }

    // ── Media-driven ────────────────────────────────────────────────────

    /// Substitute the outgoing video on every connection at once.
    pub fn replace_outgoing_video(&mut self, track: Option<&LocalTrack>) {
        for (peer_id, entry) in &self.entries {
            if entry.worker.is_some() {
                debug!(peer_id = %peer_id, track = track.map(LocalTrack::id), "substituting outgoing video");
                entry.send(PeerOp::ReplaceVideo(track.cloned()));
            }
        }
    }

    /// Close every connection and wait for the transports to shut down.
    pub async fn close_all(&mut self) {
        let mut transports = Vec::new();
        for (peer_id, mut entry) in self.entries.drain() {
            transition(&peer_id, &mut entry, PeerState::Closed);
            if let Some(transport) = entry.worker.take().and_then(Worker::shutdown) {
                transports.push((peer_id, transport));
            }
        }
        self.present.clear();
        self.early.clear();

        futures::future::join_all(transports.into_iter().map(|(peer_id, transport)| async move {
            if let Err(e) = transport.close().await {
                warn!(peer_id = %peer_id, error = %e, "transport close failed");
            }
        }))
        .await;
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn insert_entry(&mut self, peer_id: &str, initiator: bool) {
        debug!(peer_id, initiator, "peer entry created");
        self.entries.insert(
            peer_id.to_string(),
            PeerEntry {
                generation: 0,
                state: PeerState::New,
                initiator,
                remote_description_set: false,
                awaiting_answer: false,
                pending_candidates: Vec::new(),
                retries_left: self.retry_budget,
                remote_tracks: Vec::new(),
                media_visible: false,
                worker: None,
            },
        );
    }

    fn start_offer(&mut self, peer_id: &str, outgoing: &OutgoingTracks) {
        self.reset_worker(peer_id, outgoing);
        self.send_offer(peer_id);
        if let Some(entry) = self.entries.get_mut(peer_id) {
            transition(peer_id, entry, PeerState::Offering);
        }
    }

    /// Queue an offer on the current worker and start its answer timer.
    fn send_offer(&mut self, peer_id: &str) {
        self.stats.offers += 1;
        let timeout = self.answer_timeout;
        let sink = self.sink.clone();
        if let Some(entry) = self.entries.get_mut(peer_id) {
            entry.send(PeerOp::Offer);
            entry.awaiting_answer = true;
            if let Some(worker) = &entry.worker {
                worker.arm_answer_timer(peer_id, entry.generation, timeout, sink);
            }
        }
    }

    fn hold_early(&mut self, message: SignalingMessage) {
        let held = self.early.entry(message.from.clone()).or_default();
        if held.len() >= EARLY_SIGNAL_LIMIT {
            warn!(peer_id = %message.from, "early signal buffer full, dropping oldest");
            held.remove(0);
        }
        held.push(message);
    }

    fn remember_departed(&mut self, peer_id: &str) {
        self.departed
            .retain(|_, (left, _)| left.elapsed() < DEPARTED_TTL);
        if self.departed.len() >= DEPARTED_LIMIT {
            let oldest = self
                .departed
                .iter()
                .min_by_key(|(_, (_, seq))| *seq)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                self.departed.remove(&oldest);
            }
        }
        self.departures += 1;
        self.departed
            .insert(peer_id.to_string(), (Instant::now(), self.departures));
    }

    /// Replace the entry's worker with a fresh one under a new generation.
    /// Buffered candidates are kept.
    fn reset_worker(&mut self, peer_id: &str, outgoing: &OutgoingTracks) {
        let generation = self.next_generation;
        self.next_generation += 1;

        let worker = Worker::spawn(WorkerContext {
            meeting_id: self.meeting_id.clone(),
            local_id: self.local_id.clone(),
            peer_id: peer_id.to_string(),
            generation,
            outgoing: outgoing.clone(),
            factory: self.factory.clone(),
            signaling: self.signaling.clone(),
            sink: self.sink.clone(),
        });
        self.stats.transports += 1;

        if let Some(entry) = self.entries.get_mut(peer_id) {
            if let Some(old) = entry.worker.replace(worker) {
                old.retire(peer_id);
            }
            entry.generation = generation;
            entry.remote_description_set = false;
            entry.awaiting_answer = false;
            entry.remote_tracks.clear();
            entry.media_visible = false;
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionDescription;
    use crate::store::MemoryStore;
    use crate::testing::{candidate, FakeTransportFactory};
    use std::time::Duration;

    struct Rig {
        peers: PeerManager,
        events: mpsc::UnboundedReceiver<PeerEvent>,
        factory: Arc<FakeTransportFactory>,
        store: MemoryStore,
    }

    impl Rig {
        fn new(local_id: &str, budget: u32) -> Self {
            Self::with_answer_timeout(local_id, budget, DEFAULT_ANSWER_TIMEOUT)
        }

        fn with_answer_timeout(local_id: &str, budget: u32, timeout: Duration) -> Self {
            let (tx, events) = mpsc::unbounded_channel();
            let factory = Arc::new(FakeTransportFactory::new());
            let store = MemoryStore::new();
            let sink: PeerEventSink = Arc::new(move |e| {
                let _ = tx.send(e);
            });
            let peers = PeerManager::new(
                "m1",
                local_id,
                factory.clone(),
                Arc::new(store.clone()),
                sink,
                budget,
            )
            .with_answer_timeout(timeout);
            Self {
                peers,
                events,
                factory,
                store,
            }
        }

        async fn pump(&mut self) -> Vec<PeerNotice> {
            let mut notices = Vec::new();
            while let Ok(Some(event)) =
                tokio::time::timeout(Duration::from_millis(50), self.events.recv()).await
            {
                if let Some(n) = self.peers.handle_peer_event(event, &OutgoingTracks::default()) {
                    notices.push(n);
                }
            }
            notices
        }

        fn signal(&mut self, message: SignalingMessage) -> SessionResult<()> {
            self.peers.handle_signal(message, &OutgoingTracks::default())
        }
    }

    fn offer_from(from: &str, to: &str) -> SignalingMessage {
        SignalingMessage::description(from, to, &SessionDescription::offer(format!("offer-from-{from}")))
    }

    #[test]
    fn glare_rule_picks_exactly_one_side() {
        let ids = ["a", "b", "u1", "u2", "U2", "zed", "user-10", "user-9", ""];
        for a in ids {
            for b in ids {
                if a == b {
                    assert!(!should_initiate(a, b));
                    continue;
                }
                assert_ne!(should_initiate(a, b), should_initiate(b, a), "{a} vs {b}");
            }
        }
        assert!(should_initiate("u2", "u1"));
        assert!(!should_initiate("u1", "u2"));
    }

    #[tokio::test]
    async fn initiator_offers_and_responder_waits() {
        let mut high = Rig::new("u2", 1);
        high.peers.add_remote("u1", &OutgoingTracks::default());
        assert_eq!(high.peers.state_of("u1"), Some(PeerState::Offering));

        let mut low = Rig::new("u1", 1);
        low.peers.add_remote("u2", &OutgoingTracks::default());
        assert_eq!(low.peers.state_of("u2"), Some(PeerState::New));
        assert_eq!(low.peers.stats().transports, 0);

        high.pump().await;
        let sent = high.store.signals_from("m1", "u2").await;
        assert_eq!(sent[0].kind, SignalKind::Offer);
        assert_eq!(sent[0].to, "u1");
    }

    #[tokio::test]
    async fn responder_reaches_connected() {
        let mut rig = Rig::new("u1", 1);
        rig.peers.add_remote("u2", &OutgoingTracks::default());

        rig.signal(offer_from("u2", "u1")).unwrap();
        assert_eq!(rig.peers.state_of("u2"), Some(PeerState::Answering));
        rig.pump().await;
        assert_eq!(rig.peers.state_of("u2"), Some(PeerState::Connecting));

        rig.signal(candidate("u2", "u1", "c1")).unwrap();
        let notices = rig.pump().await;

        assert_eq!(rig.peers.state_of("u2"), Some(PeerState::Connected));
        assert_eq!(
            notices,
            vec![PeerNotice::Connected {
                peer_id: "u2".into()
            }]
        );
        assert!(rig.peers.remote_streams().contains_key("u2"));

        let answers = rig.store.signals_from("m1", "u1").await;
        assert_eq!(answers[0].kind, SignalKind::Answer);
        assert!(answers.iter().any(|m| m.kind == SignalKind::Candidate));
    }

    #[tokio::test]
    async fn early_candidates_apply_after_remote_description() {
        let mut early = Rig::new("u1", 1);
        early.peers.add_remote("u2", &OutgoingTracks::default());
        early.signal(candidate("u2", "u1", "c1")).unwrap();
        early.signal(candidate("u2", "u1", "c2")).unwrap();
        early.signal(offer_from("u2", "u1")).unwrap();
        early.pump().await;

        let mut late = Rig::new("u1", 1);
        late.peers.add_remote("u2", &OutgoingTracks::default());
        late.signal(offer_from("u2", "u1")).unwrap();
        late.signal(candidate("u2", "u1", "c1")).unwrap();
        late.signal(candidate("u2", "u1", "c2")).unwrap();
        late.pump().await;

        let early_log = early.factory.latest("u2").unwrap().remote_ops();
        let late_log = late.factory.latest("u2").unwrap().remote_ops();
        assert_eq!(
            early_log,
            vec!["accept_offer", "candidate:c1", "candidate:c2"]
        );
        assert_eq!(early_log, late_log);
        assert_eq!(early.peers.state_of("u2"), Some(PeerState::Connected));
        assert_eq!(late.peers.state_of("u2"), Some(PeerState::Connected));
    }

    #[tokio::test]
    async fn signals_before_presence_are_replayed() {
        let mut rig = Rig::new("u1", 1);
        rig.signal(offer_from("u2", "u1")).unwrap();
        rig.signal(candidate("u2", "u1", "c1")).unwrap();
        assert!(rig.peers.is_empty());

        rig.peers.add_remote("u2", &OutgoingTracks::default());
        rig.pump().await;
        assert_eq!(rig.peers.state_of("u2"), Some(PeerState::Connected));
    }

    #[tokio::test]
    async fn signals_after_departure_are_stale() {
        let mut rig = Rig::new("u1", 1);
        rig.peers.add_remote("u2", &OutgoingTracks::default());
        assert!(rig.peers.remove_remote("u2"));

        let err = rig.signal(candidate("u2", "u1", "late")).unwrap_err();
        assert!(matches!(err, SessionError::StaleSignal { .. }));
        assert!(rig.peers.is_empty());
    }

    #[tokio::test]
    async fn messages_for_others_are_ignored() {
        let mut rig = Rig::new("u1", 1);
        rig.peers.add_remote("u3", &OutgoingTracks::default());
        rig.signal(offer_from("u3", "u2")).unwrap();
        assert_eq!(rig.peers.state_of("u3"), Some(PeerState::New));
    }

    #[tokio::test]
    async fn offer_against_glare_rule_is_ignored() {
        let mut rig = Rig::new("u2", 1);
        rig.peers.add_remote("u1", &OutgoingTracks::default());
        rig.signal(offer_from("u1", "u2")).unwrap();
        rig.pump().await;

        assert_eq!(rig.peers.stats().answers, 0);
        assert_eq!(rig.peers.state_of("u1"), Some(PeerState::Offering));
    }

    #[tokio::test]
    async fn initiator_retries_once_then_drops() {
        let mut rig = Rig::new("u2", 1);
        rig.peers.add_remote("u1", &OutgoingTracks::default());
        rig.pump().await;

        rig.factory
            .emit("u1", TransportEvent::StateChanged(TransportState::Failed));
        rig.pump().await;
        assert_eq!(rig.peers.state_of("u1"), Some(PeerState::Connecting));
        assert_eq!(rig.peers.stats().offers, 2);
        assert!(rig.factory.transports_for("u1")[0].is_closed());

        rig.factory
            .emit("u1", TransportEvent::StateChanged(TransportState::Failed));
        let notices = rig.pump().await;
        assert!(matches!(&notices[..], [PeerNotice::Dropped { peer_id, .. }] if peer_id == "u1"));
        assert_eq!(rig.peers.state_of("u1"), None);
    }

    #[tokio::test]
    async fn retry_answer_reaches_connected() {
        let mut rig = Rig::new("u2", 1);
        rig.peers.add_remote("u1", &OutgoingTracks::default());
        rig.pump().await;
        rig.factory
            .emit("u1", TransportEvent::StateChanged(TransportState::Failed));
        rig.pump().await;

        let answer = SignalingMessage::description("u1", "u2", &SessionDescription::answer("a2"));
        rig.signal(answer).unwrap();
        rig.signal(candidate("u1", "u2", "c9")).unwrap();
        rig.pump().await;
        assert_eq!(rig.peers.state_of("u1"), Some(PeerState::Connected));
    }

    #[tokio::test]
    async fn events_from_old_generation_are_discarded() {
        let mut rig = Rig::new("u2", 1);
        rig.peers.add_remote("u1", &OutgoingTracks::default());
        rig.pump().await;
        rig.factory
            .emit("u1", TransportEvent::StateChanged(TransportState::Failed));
        rig.pump().await;

        rig.factory.transports_for("u1")[0]
            .emit(TransportEvent::StateChanged(TransportState::Connected));
        rig.pump().await;
        assert_eq!(rig.peers.state_of("u1"), Some(PeerState::Connecting));
    }

    #[tokio::test]
    async fn transient_disconnect_hides_and_restores_media() {
        let mut rig = Rig::new("u1", 1);
        rig.peers.add_remote("u2", &OutgoingTracks::default());
        rig.signal(offer_from("u2", "u1")).unwrap();
        rig.signal(candidate("u2", "u1", "c1")).unwrap();
        rig.pump().await;
        assert!(rig.peers.remote_streams().contains_key("u2"));

        rig.factory
            .emit("u2", TransportEvent::StateChanged(TransportState::Disconnected));
        rig.pump().await;
        assert_eq!(rig.peers.state_of("u2"), Some(PeerState::Disconnected));
        assert!(rig.peers.remote_streams().is_empty());

        rig.factory
            .emit("u2", TransportEvent::StateChanged(TransportState::Connected));
        rig.pump().await;
        assert_eq!(rig.peers.state_of("u2"), Some(PeerState::Connected));
        assert!(rig.peers.remote_streams().contains_key("u2"));
    }

    #[tokio::test]
    async fn responder_accepts_reoffer_after_failure() {
        let mut rig = Rig::new("u1", 1);
        rig.peers.add_remote("u2", &OutgoingTracks::default());
        rig.signal(offer_from("u2", "u1")).unwrap();
        rig.signal(candidate("u2", "u1", "c1")).unwrap();
        rig.pump().await;

        rig.factory
            .emit("u2", TransportEvent::StateChanged(TransportState::Failed));
        let notices = rig.pump().await;
        assert!(notices.is_empty(), "{notices:?}");
        assert_eq!(rig.peers.state_of("u2"), Some(PeerState::Disconnected));
        assert!(rig.factory.transports_for("u2")[0].is_closed());

        rig.signal(offer_from("u2", "u1")).unwrap();
        rig.signal(candidate("u2", "u1", "c2")).unwrap();
        rig.pump().await;
        assert_eq!(rig.peers.state_of("u2"), Some(PeerState::Connected));
        assert_eq!(rig.factory.transports_for("u2").len(), 2);
    }

    #[tokio::test]
    async fn retired_transport_reporting_closed_keeps_the_peer() {
        let mut rig = Rig::new("u1", 1);
        rig.peers.add_remote("u2", &OutgoingTracks::default());
        rig.signal(offer_from("u2", "u1")).unwrap();
        rig.signal(candidate("u2", "u1", "c1")).unwrap();
        rig.pump().await;

        let first = rig.factory.latest("u2").unwrap();
        first.emit(TransportEvent::StateChanged(TransportState::Failed));
        let notices = rig.pump().await;

        assert!(first.log().contains(&"close".to_string()));
        assert!(notices.is_empty(), "{notices:?}");
        assert_eq!(rig.peers.state_of("u2"), Some(PeerState::Disconnected));

        // A late report from the closed transport changes nothing either.
        first.emit(TransportEvent::StateChanged(TransportState::Closed));
        assert!(rig.pump().await.is_empty());
        assert_eq!(rig.peers.state_of("u2"), Some(PeerState::Disconnected));
    }

    #[tokio::test]
    async fn rejoin_offer_ahead_of_presence_is_held() {
        let mut rig = Rig::new("u1", 1);
        rig.peers.add_remote("u2", &OutgoingTracks::default());
        assert!(rig.peers.remove_remote("u2"));

        // u2 reloads; its offer beats the presence snapshot that re-adds it.
        rig.signal(offer_from("u2", "u1")).unwrap();
        rig.signal(candidate("u2", "u1", "c1")).unwrap();
        assert!(rig.peers.is_empty());

        rig.peers.add_remote("u2", &OutgoingTracks::default());
        rig.pump().await;
        assert_eq!(rig.peers.state_of("u2"), Some(PeerState::Connected));
        assert_eq!(
            rig.factory.latest("u2").unwrap().remote_ops(),
            vec!["accept_offer", "candidate:c1"]
        );
    }

    #[tokio::test]
    async fn departed_initiator_candidates_stay_stale() {
        let mut rig = Rig::new("u1", 1);
        rig.peers.add_remote("u2", &OutgoingTracks::default());
        rig.peers.remove_remote("u2");

        let err = rig.signal(candidate("u2", "u1", "late")).unwrap_err();
        assert!(matches!(err, SessionError::StaleSignal { .. }));

        // We initiate towards u0, so an offer from it is never held.
        rig.peers.add_remote("u0", &OutgoingTracks::default());
        rig.peers.remove_remote("u0");
        let err = rig.signal(offer_from("u0", "u1")).unwrap_err();
        assert!(matches!(err, SessionError::StaleSignal { .. }));
    }

    #[tokio::test]
    async fn unanswered_offer_retries_then_drops() {
        let timeout = Duration::from_millis(200);
        let mut rig = Rig::with_answer_timeout("u2", 1, timeout);
        rig.peers.add_remote("u1", &OutgoingTracks::default());
        rig.pump().await;
        assert_eq!(rig.peers.state_of("u1"), Some(PeerState::Offering));

        tokio::time::sleep(timeout + Duration::from_millis(100)).await;
        let notices = rig.pump().await;
        assert!(notices.is_empty(), "{notices:?}");
        assert_eq!(rig.peers.state_of("u1"), Some(PeerState::Connecting));
        assert_eq!(rig.peers.stats().offers, 2);
        assert_eq!(rig.factory.transports_for("u1").len(), 2);

        tokio::time::sleep(timeout + Duration::from_millis(100)).await;
        let notices = rig.pump().await;
        assert!(matches!(&notices[..], [PeerNotice::Dropped { peer_id, .. }] if peer_id == "u1"));
        assert_eq!(rig.peers.state_of("u1"), None);
    }

    #[tokio::test]
    async fn answered_offer_does_not_time_out() {
        let timeout = Duration::from_millis(200);
        let mut rig = Rig::with_answer_timeout("u2", 1, timeout);
        rig.peers.add_remote("u1", &OutgoingTracks::default());
        rig.pump().await;

        let answer = SignalingMessage::description("u1", "u2", &SessionDescription::answer("a1"));
        rig.signal(answer).unwrap();
        rig.signal(candidate("u1", "u2", "c1")).unwrap();
        rig.pump().await;
        assert_eq!(rig.peers.state_of("u1"), Some(PeerState::Connected));

        tokio::time::sleep(timeout + Duration::from_millis(100)).await;
        assert!(rig.pump().await.is_empty());
        assert_eq!(rig.peers.state_of("u1"), Some(PeerState::Connected));
        assert_eq!(rig.peers.stats().offers, 1);
    }

    #[tokio::test]
    async fn departed_ids_are_forgotten_past_the_limit() {
        let mut rig = Rig::new("u1", 1);
        for i in 0..=DEPARTED_LIMIT {
            rig.peers.remove_remote(&format!("gone-{i}"));
        }

        // The oldest departure was evicted: its signal is held, not stale.
        assert!(rig.signal(candidate("gone-0", "u1", "c")).is_ok());
        let err = rig.signal(candidate("gone-1", "u1", "c")).unwrap_err();
        assert!(matches!(err, SessionError::StaleSignal { .. }));
    }

    #[tokio::test]
    async fn substitution_reaches_every_connection() {
        let mut rig = Rig::new("u5", 1);
        for id in ["u1", "u2", "u3"] {
            rig.peers.add_remote(id, &OutgoingTracks::default());
        }
        rig.pump().await;

        let screen = LocalTrack::new(crate::media::TrackSource::Screen, "u5");
        rig.peers.replace_outgoing_video(Some(&screen));
        rig.pump().await;

        for id in ["u1", "u2", "u3"] {
            let log = rig.factory.latest(id).unwrap().log();
            assert!(log.contains(&format!("replace_video:{}", screen.id())), "{id}: {log:?}");
        }
    }

    #[tokio::test]
    async fn close_all_closes_every_transport() {
        let mut rig = Rig::new("u5", 1);
        for id in ["u1", "u2"] {
            rig.peers.add_remote(id, &OutgoingTracks::default());
        }
        rig.pump().await;

        rig.peers.close_all().await;
        assert!(rig.peers.is_empty());
        for id in ["u1", "u2"] {
            assert!(rig.factory.latest(id).unwrap().is_closed());
        }
    }

    #[tokio::test]
    async fn failed_creation_without_budget_drops_peer() {
        let mut rig = Rig::new("u2", 0);
        rig.factory.fail_next_creations(1);
        rig.peers.add_remote("u1", &OutgoingTracks::default());
        let notices = rig.pump().await;
        assert!(matches!(&notices[..], [PeerNotice::Dropped { .. }]));
    }
}
