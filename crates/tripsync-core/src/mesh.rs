//! Full-mesh peer coordination for group calls.
//!
//! One [`PeerConnection`] per remote participant; the session is only a
//! signaling relay for offers, answers and ICE candidates. All inputs
//! (signaling frames, presence changes, call commands) are funnelled into
//! a single actor task and handled one at a time in arrival order.
//!
//! Initiator selection: of two participants, the one with the smaller id
//! sends the offer. The other side waits for it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::errors::RealtimeError;
use crate::events::{CallState, EventEmitter, TrackInfo, TrackKind, TripEvent};
use crate::media::{LocalMedia, MediaConstraints, MediaDevices, MediaSink, RemoteTrack};
use crate::presence::{Presence, PresenceChange};
use crate::protocol::{
    inbound, outbound, CallSignal, IceCandidate, IceSignal, RoomMember, SdpType, SessionDescription,
};
use crate::session::{Session, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    AnswerPending,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Initiator,
    Responder,
}

/// Point-to-point media connection backend (e.g. a WebRTC peer connection).
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_tracks(&self, media: &LocalMedia) -> Result<(), RealtimeError>;

    /// Create an offer and apply it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, RealtimeError>;

    /// Create an answer and apply it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, RealtimeError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), RealtimeError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RealtimeError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection to `participant_id`. The backend reports local
    /// ICE candidates and remote tracks through `observer`.
    async fn create(
        &self,
        participant_id: &str,
        observer: PeerObserver,
    ) -> Result<Arc<dyn PeerConnection>, RealtimeError>;
}

/// True when the local side sends the offer to `remote_id`.
pub fn should_initiate(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}

/// Local candidates are held back until the link's offer or answer is on
/// the wire, so the remote side never sees a candidate first.
enum Outbox {
    Unsignaled(Vec<IceCandidate>),
    Signaled,
}

struct Shared {
    local_id: String,
    live_links: Mutex<HashMap<u64, Outbox>>,
    relay: Mutex<Option<Session>>,
    remote_tracks: Mutex<HashMap<String, Vec<TrackInfo>>>,
    sink: Arc<dyn MediaSink>,
    presence: Option<Presence>,
    emitter: EventEmitter,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn relay<T: Serialize>(&self, event: &str, payload: &T) {
        let session = lock(&self.relay).clone();
        match session {
            Some(session) => session.emit(event, payload),
            None => tracing::warn!("dropping '{event}': mesh has no session"),
        }
    }

    fn is_live(&self, link_id: u64) -> bool {
        lock(&self.live_links).contains_key(&link_id)
    }

    fn send_candidate(&self, participant_id: &str, candidate: IceCandidate) {
        self.relay(
            outbound::ICE_CANDIDATE,
            &IceSignal {
                from: self.local_id.clone(),
                to: participant_id.to_string(),
                candidate,
            },
        );
    }

    /// The local description for `link_id` has been relayed; release any
    /// candidates gathered before that.
    fn mark_signaled(&self, link_id: u64, participant_id: &str) {
        let held = match lock(&self.live_links).get_mut(&link_id) {
            Some(outbox) => match std::mem::replace(outbox, Outbox::Signaled) {
                Outbox::Unsignaled(held) => held,
                Outbox::Signaled => Vec::new(),
            },
            None => Vec::new(),
        };
        for candidate in held {
            self.send_candidate(participant_id, candidate);
        }
    }

    fn clear_remote_tracks(&self, participant_id: &str) {
        let had_tracks = lock(&self.remote_tracks).remove(participant_id).is_some();
        self.sink.detach(participant_id);
        if had_tracks {
            self.emitter
                .emit(TripEvent::RemoteTracksDetached(participant_id.to_string()));
            if let Some(presence) = &self.presence {
                presence.set_tracks(participant_id, Vec::new());
            }
        }
    }
}

/// Callback handle given to a [`PeerConnection`] backend. Events for a
/// link that has since been torn down are dropped.
#[derive(Clone)]
pub struct PeerObserver {
    participant_id: String,
    link_id: u64,
    shared: Arc<Shared>,
}

impl PeerObserver {
    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn is_live(&self) -> bool {
        self.shared.is_live(self.link_id)
    }

    /// An observer for a link no mesh knows about; every event is dropped.
    #[cfg(test)]
    pub(crate) fn unbound(participant_id: &str) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            link_id: 0,
            shared: Arc::new(Shared {
                local_id: String::new(),
                live_links: Mutex::new(HashMap::new()),
                relay: Mutex::new(None),
                remote_tracks: Mutex::new(HashMap::new()),
                sink: Arc::new(crate::media::NullSink),
                presence: None,
                emitter: EventEmitter::new(),
            }),
        }
    }

    pub fn on_local_candidate(&self, candidate: IceCandidate) {
        {
            let mut links = lock(&self.shared.live_links);
            match links.get_mut(&self.link_id) {
                None => {
                    tracing::debug!(participant = %self.participant_id, "stale local candidate dropped");
                    return;
                }
                Some(Outbox::Unsignaled(held)) => {
                    held.push(candidate);
                    return;
                }
                Some(Outbox::Signaled) => {}
            }
        }
        self.shared.send_candidate(&self.participant_id, candidate);
    }

    pub fn on_remote_track(&self, track: RemoteTrack) {
        if !self.is_live() {
            tracing::debug!(participant = %self.participant_id, "stale remote track dropped");
            return;
        }
        let tracks = {
            let mut all = lock(&self.shared.remote_tracks);
            let tracks = all.entry(self.participant_id.clone()).or_default();
            if !tracks.iter().any(|t| t.id == track.info.id) {
                tracks.push(track.info.clone());
            }
            tracks.clone()
        };
        self.shared
            .emitter
            .emit(TripEvent::RemoteTrackAttached {
                participant_id: self.participant_id.clone(),
                track: track.info.clone(),
            });
        if let Some(presence) = &self.shared.presence {
            presence.set_tracks(&self.participant_id, tracks);
        }
        self.shared.sink.attach(&self.participant_id, track);
    }
}

/// Public view of a peer link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLinkInfo {
    pub participant_id: String,
    pub link_id: u64,
    pub role: NegotiationRole,
    pub state: NegotiationState,
    pub remote_description_set: bool,
    pub queued_candidates: usize,
}

enum MeshInput {
    Presence(PresenceChange),
    Offer(CallSignal),
    Answer(CallSignal),
    Candidate(IceSignal),
    RemoteHangup(String),
    BeginCall {
        reply: oneshot::Sender<Option<u64>>,
    },
    MediaReady {
        generation: u64,
        result: Result<LocalMedia, RealtimeError>,
        reply: oneshot::Sender<Result<(), RealtimeError>>,
    },
    EndCall {
        reply: oneshot::Sender<usize>,
    },
    SetTrackEnabled {
        kind: TrackKind,
        enabled: bool,
        reply: oneshot::Sender<Result<(), RealtimeError>>,
    },
    ResetLinks {
        reply: oneshot::Sender<()>,
    },
    CallState {
        reply: oneshot::Sender<CallState>,
    },
    Links {
        reply: oneshot::Sender<Vec<PeerLinkInfo>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the mesh actor. Clones share the same actor.
#[derive(Clone)]
pub struct MeshCoordinator {
    tx: mpsc::UnboundedSender<MeshInput>,
    shared: Arc<Shared>,
    devices: Arc<dyn MediaDevices>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MeshCoordinator {
    pub fn spawn(
        local_id: impl Into<String>,
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        sink: Arc<dyn MediaSink>,
        presence: Option<Presence>,
        emitter: EventEmitter,
    ) -> Self {
        let shared = Arc::new(Shared {
            local_id: local_id.into(),
            live_links: Mutex::new(HashMap::new()),
            relay: Mutex::new(None),
            remote_tracks: Mutex::new(HashMap::new()),
            sink,
            presence,
            emitter,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = MeshActor {
            shared: shared.clone(),
            factory,
            call: Call::Idle,
            generation: 0,
            links: BTreeMap::new(),
            known: Vec::new(),
            held: HashMap::new(),
            next_link_id: 1,
        };
        let task = tokio::spawn(actor.run(rx));
        Self {
            tx,
            shared,
            devices,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Use `session` as the signaling relay and subscribe to call signaling.
    pub fn attach(&self, session: &Session) -> Vec<Subscription> {
        *lock(&self.shared.relay) = Some(session.clone());
        let local = self.shared.local_id.clone();

        let offers = self.tx.clone();
        let offer_local = local.clone();
        let answers = self.tx.clone();
        let answer_local = local.clone();
        let candidates = self.tx.clone();
        let candidate_local = local.clone();
        let hangups = self.tx.clone();
        vec![
            session.subscribe_typed(inbound::CALL_OFFER, move |signal: CallSignal| {
                if signal.to == offer_local && signal.from != offer_local {
                    let _ = offers.send(MeshInput::Offer(signal));
                }
            }),
            session.subscribe_typed(inbound::CALL_ANSWER, move |signal: CallSignal| {
                if signal.to == answer_local && signal.from != answer_local {
                    let _ = answers.send(MeshInput::Answer(signal));
                }
            }),
            session.subscribe_typed(inbound::ICE_CANDIDATE, move |signal: IceSignal| {
                if signal.to == candidate_local && signal.from != candidate_local {
                    let _ = candidates.send(MeshInput::Candidate(signal));
                }
            }),
            session.subscribe_typed(inbound::DISCONNECT_CALL, move |member: RoomMember| {
                if member.participant_id != local {
                    let _ = hangups.send(MeshInput::RemoteHangup(member.participant_id));
                }
            }),
        ]
    }

    pub fn on_presence_change(&self, change: &PresenceChange) {
        let _ = self.tx.send(MeshInput::Presence(change.clone()));
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> MeshInput,
    ) -> Result<T, RealtimeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| RealtimeError::Room("mesh stopped".into()))?;
        rx.await.map_err(|_| RealtimeError::Room("mesh stopped".into()))
    }

    /// Acquire local media and join the mesh. A no-op if a call is already
    /// active or starting. Media failures leave the call idle and can be
    /// retried.
    pub async fn start_call(&self, constraints: MediaConstraints) -> Result<(), RealtimeError> {
        let Some(generation) = self.request(|reply| MeshInput::BeginCall { reply }).await? else {
            return Ok(());
        };
        let result = self.devices.acquire(constraints).await;
        self.request(|reply| MeshInput::MediaReady {
            generation,
            result,
            reply,
        })
        .await?
    }

    /// Close every peer link and stop local media. Returns the number of
    /// links closed.
    pub async fn end_call(&self) -> Result<usize, RealtimeError> {
        self.request(|reply| MeshInput::EndCall { reply }).await
    }

    pub async fn set_microphone_enabled(&self, enabled: bool) -> Result<(), RealtimeError> {
        self.request(|reply| MeshInput::SetTrackEnabled {
            kind: TrackKind::Audio,
            enabled,
            reply,
        })
        .await?
    }

    pub async fn set_camera_enabled(&self, enabled: bool) -> Result<(), RealtimeError> {
        self.request(|reply| MeshInput::SetTrackEnabled {
            kind: TrackKind::Video,
            enabled,
            reply,
        })
        .await?
    }

    /// Drop all links but keep the call and its media, e.g. after the
    /// signaling connection was replaced.
    pub async fn reset_links(&self) -> Result<(), RealtimeError> {
        self.request(|reply| MeshInput::ResetLinks { reply }).await
    }

    pub async fn call_state(&self) -> CallState {
        self.request(|reply| MeshInput::CallState { reply })
            .await
            .unwrap_or(CallState::Idle)
    }

    pub async fn links(&self) -> Vec<PeerLinkInfo> {
        self.request(|reply| MeshInput::Links { reply })
            .await
            .unwrap_or_default()
    }

    /// End the call and stop the actor. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.request(|reply| MeshInput::Shutdown { reply }).await.is_err() {
            tracing::debug!("mesh already stopped");
        }
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

enum Call {
    Idle,
    Acquiring,
    Active(LocalMedia),
}

impl Call {
    fn state(&self) -> CallState {
        match self {
            Call::Idle => CallState::Idle,
            Call::Acquiring => CallState::Acquiring,
            Call::Active(_) => CallState::Active,
        }
    }

    fn media(&self) -> Option<&LocalMedia> {
        match self {
            Call::Active(media) => Some(media),
            _ => None,
        }
    }
}

struct PeerLink {
    link_id: u64,
    role: NegotiationRole,
    state: NegotiationState,
    connection: Arc<dyn PeerConnection>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
}

/// An offer received while no local call was active.
struct HeldOffer {
    description: SessionDescription,
    candidates: Vec<IceCandidate>,
}

struct MeshActor {
    shared: Arc<Shared>,
    factory: Arc<dyn PeerConnectionFactory>,
    call: Call,
    generation: u64,
    links: BTreeMap<String, PeerLink>,
    /// Remote participants currently present, in discovery order.
    known: Vec<String>,
    held: HashMap<String, HeldOffer>,
    next_link_id: u64,
}

impl MeshActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<MeshInput>) {
        while let Some(input) = rx.recv().await {
            if let MeshInput::Shutdown { reply } = input {
                self.end_call().await;
                let _ = reply.send(());
                break;
            }
            self.handle(input).await;
        }
        // Every handle dropped without a shutdown still releases media.
        self.end_call().await;
        tracing::debug!("mesh actor stopped");
    }

    async fn handle(&mut self, input: MeshInput) {
        match input {
            MeshInput::Presence(change) => self.on_presence(change).await,
            MeshInput::Offer(signal) => self.on_offer(signal).await,
            MeshInput::Answer(signal) => self.on_answer(signal).await,
            MeshInput::Candidate(signal) => self.on_candidate(signal).await,
            MeshInput::RemoteHangup(participant_id) => self.on_remote_hangup(&participant_id).await,
            MeshInput::BeginCall { reply } => {
                let generation = match self.call {
                    Call::Idle => {
                        self.generation += 1;
                        self.set_call(Call::Acquiring);
                        Some(self.generation)
                    }
                    _ => None,
                };
                let _ = reply.send(generation);
            }
            MeshInput::MediaReady {
                generation,
                result,
                reply,
            } => {
                let outcome = self.on_media_ready(generation, result).await;
                let _ = reply.send(outcome);
            }
            MeshInput::EndCall { reply } => {
                let closed = self.end_call().await;
                let _ = reply.send(closed);
            }
            MeshInput::SetTrackEnabled {
                kind,
                enabled,
                reply,
            } => {
                let outcome = match self.call.media() {
                    Some(media) if media.set_enabled(kind, enabled) => {
                        tracing::info!("{kind:?} enabled: {enabled}");
                        Ok(())
                    }
                    Some(_) => Err(RealtimeError::MediaAcquisition(format!("no local {kind:?} track"))),
                    None => Err(RealtimeError::Room("no active call".into())),
                };
                let _ = reply.send(outcome);
            }
            MeshInput::ResetLinks { reply } => {
                self.close_all_links().await;
                self.known.clear();
                self.held.clear();
                let _ = reply.send(());
            }
            MeshInput::CallState { reply } => {
                let _ = reply.send(self.call.state());
            }
            MeshInput::Links { reply } => {
                let _ = reply.send(self.link_infos());
            }
            MeshInput::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn set_call(&mut self, call: Call) {
        let changed = self.call.state() != call.state();
        self.call = call;
        if changed {
            tracing::info!("call state: {:?}", self.call.state());
            self.shared
                .emitter
                .emit(TripEvent::CallStateChanged(self.call.state()));
        }
    }

    fn link_infos(&self) -> Vec<PeerLinkInfo> {
        self.links
            .iter()
            .map(|(id, link)| PeerLinkInfo {
                participant_id: id.clone(),
                link_id: link.link_id,
                role: link.role,
                state: link.state,
                remote_description_set: link.remote_description_set,
                queued_candidates: link.pending_candidates.len(),
            })
            .collect()
    }

    async fn on_media_ready(
        &mut self,
        generation: u64,
        result: Result<LocalMedia, RealtimeError>,
    ) -> Result<(), RealtimeError> {
        if generation != self.generation || !matches!(self.call, Call::Acquiring) {
            // The call ended while the devices were being acquired.
            if let Ok(media) = result {
                let stopped = media.stop_all();
                tracing::debug!("stale media acquisition released {stopped} track(s)");
            }
            return Ok(());
        }

        let media = match result {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!("cannot start call: {e}");
                self.set_call(Call::Idle);
                self.shared.emitter.emit(TripEvent::MediaError(e.to_string()));
                return Err(e);
            }
        };
        self.set_call(Call::Active(media));

        let held: Vec<(String, HeldOffer)> = self.held.drain().collect();
        for (participant_id, offer) in held {
            self.respond(&participant_id, offer.description, offer.candidates)
                .await;
        }
        for participant_id in self.known.clone() {
            self.discover(&participant_id).await;
        }
        Ok(())
    }

    async fn on_presence(&mut self, change: PresenceChange) {
        for participant_id in &change.left {
            self.known.retain(|id| id != participant_id);
            self.held.remove(participant_id);
            self.remove_link(participant_id, "participant left").await;
        }
        for participant in &change.joined {
            let id = &participant.participant_id;
            if !self.known.contains(id) {
                self.known.push(id.clone());
            }
            if matches!(self.call, Call::Active(_)) {
                self.discover(id).await;
            }
        }
    }

    /// The remote side of any link or held offer is gone. The initiator
    /// offers again right away; the other side holds that offer until it
    /// rejoins the call.
    async fn on_remote_hangup(&mut self, participant_id: &str) {
        if self.held.remove(participant_id).is_some() {
            tracing::debug!(participant = participant_id, "held offer dropped: caller hung up");
        }
        self.remove_link(participant_id, "remote hung up").await;
        if matches!(self.call, Call::Active(_)) && self.known.iter().any(|id| id == participant_id) {
            self.discover(participant_id).await;
        }
    }

    /// A participant is present while the local call is active.
    async fn discover(&mut self, participant_id: &str) {
        if self.links.contains_key(participant_id) {
            tracing::debug!(participant = participant_id, "already linked, discovery ignored");
            return;
        }
        if !should_initiate(&self.shared.local_id, participant_id) {
            tracing::debug!(participant = participant_id, "waiting for remote offer");
            return;
        }
        self.initiate(participant_id).await;
    }

    async fn open_link(
        &mut self,
        participant_id: &str,
        role: NegotiationRole,
    ) -> Option<Arc<dyn PeerConnection>> {
        let media = self.call.media()?.clone();
        let link_id = self.next_link_id;
        self.next_link_id += 1;
        lock(&self.shared.live_links).insert(link_id, Outbox::Unsignaled(Vec::new()));

        let observer = PeerObserver {
            participant_id: participant_id.to_string(),
            link_id,
            shared: self.shared.clone(),
        };
        let connection = match self.factory.create(participant_id, observer).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(participant = participant_id, "cannot create peer connection: {e}");
                lock(&self.shared.live_links).remove(&link_id);
                return None;
            }
        };
        self.links.insert(
            participant_id.to_string(),
            PeerLink {
                link_id,
                role,
                state: NegotiationState::Idle,
                connection: connection.clone(),
                remote_description_set: false,
                pending_candidates: Vec::new(),
            },
        );
        if let Err(e) = connection.add_local_tracks(&media).await {
            self.fail(participant_id, e).await;
            return None;
        }
        Some(connection)
    }

    async fn initiate(&mut self, participant_id: &str) {
        let Some(connection) = self.open_link(participant_id, NegotiationRole::Initiator).await else {
            return;
        };
        match connection.create_offer().await {
            Ok(offer) => {
                self.shared.relay(
                    outbound::CALL_OFFER,
                    &CallSignal {
                        from: self.shared.local_id.clone(),
                        to: participant_id.to_string(),
                        description: offer,
                    },
                );
                self.signaled(participant_id);
                self.set_link_state(participant_id, NegotiationState::OfferSent);
            }
            Err(e) => self.fail(participant_id, e).await,
        }
    }

    async fn on_offer(&mut self, signal: CallSignal) {
        let from = signal.from;
        if signal.description.kind != SdpType::Offer {
            tracing::warn!(participant = %from, "call-offer without an offer description dropped");
            return;
        }
        if !matches!(self.call, Call::Active(_)) {
            tracing::debug!(participant = %from, "holding offer until the local call starts");
            self.held.insert(
                from,
                HeldOffer {
                    description: signal.description,
                    candidates: Vec::new(),
                },
            );
            return;
        }
        match self.links.get(&from).map(|link| link.state) {
            None => self.respond(&from, signal.description, Vec::new()).await,
            Some(NegotiationState::Stable) => self.renegotiate(&from, signal.description).await,
            Some(state) => {
                let e = RealtimeError::Negotiation(format!("offer received in state {state:?}"));
                self.fail(&from, e).await;
            }
        }
    }

    /// Answer an offer from a participant with no link yet.
    async fn respond(
        &mut self,
        participant_id: &str,
        offer: SessionDescription,
        queued: Vec<IceCandidate>,
    ) {
        if self.open_link(participant_id, NegotiationRole::Responder).await.is_none() {
            return;
        }
        if let Some(link) = self.links.get_mut(participant_id) {
            link.pending_candidates = queued;
        }
        self.set_link_state(participant_id, NegotiationState::AnswerPending);
        self.answer(participant_id, offer).await;
    }

    async fn renegotiate(&mut self, participant_id: &str, offer: SessionDescription) {
        tracing::debug!(participant = participant_id, "renegotiating");
        self.set_link_state(participant_id, NegotiationState::AnswerPending);
        self.answer(participant_id, offer).await;
    }

    async fn answer(&mut self, participant_id: &str, offer: SessionDescription) {
        let Some(connection) = self.apply_remote(participant_id, offer).await else {
            return;
        };
        match connection.create_answer().await {
            Ok(answer) => {
                self.shared.relay(
                    outbound::CALL_ANSWER,
                    &CallSignal {
                        from: self.shared.local_id.clone(),
                        to: participant_id.to_string(),
                        description: answer,
                    },
                );
                self.signaled(participant_id);
                self.set_link_state(participant_id, NegotiationState::Stable);
            }
            Err(e) => self.fail(participant_id, e).await,
        }
    }

    async fn on_answer(&mut self, signal: CallSignal) {
        let from = signal.from;
        match self.links.get(&from).map(|link| link.state) {
            Some(NegotiationState::OfferSent) if signal.description.kind == SdpType::Answer => {
                if self.apply_remote(&from, signal.description).await.is_some() {
                    self.set_link_state(&from, NegotiationState::Stable);
                }
            }
            Some(state) => {
                let e = RealtimeError::Negotiation(format!("answer received in state {state:?}"));
                self.fail(&from, e).await;
            }
            None => tracing::debug!(participant = %from, "answer without a peer link dropped"),
        }
    }

    /// Set the remote description, then flush queued candidates in arrival order.
    async fn apply_remote(
        &mut self,
        participant_id: &str,
        description: SessionDescription,
    ) -> Option<Arc<dyn PeerConnection>> {
        let connection = self.links.get(participant_id)?.connection.clone();
        if let Err(e) = connection.set_remote_description(description).await {
            self.fail(participant_id, e).await;
            return None;
        }
        let queued = {
            let link = self.links.get_mut(participant_id)?;
            link.remote_description_set = true;
            std::mem::take(&mut link.pending_candidates)
        };
        for candidate in queued {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                tracing::warn!(participant = participant_id, "queued candidate rejected: {e}");
            }
        }
        Some(connection)
    }

    async fn on_candidate(&mut self, signal: IceSignal) {
        let from = signal.from;
        if let Some(link) = self.links.get_mut(&from) {
            if !link.remote_description_set {
                link.pending_candidates.push(signal.candidate);
                return;
            }
            let connection = link.connection.clone();
            if let Err(e) = connection.add_ice_candidate(signal.candidate).await {
                tracing::warn!(participant = %from, "candidate rejected: {e}");
            }
        } else if let Some(held) = self.held.get_mut(&from) {
            held.candidates.push(signal.candidate);
        } else {
            tracing::debug!(participant = %from, "candidate without a peer link dropped");
        }
    }

    fn signaled(&self, participant_id: &str) {
        if let Some(link) = self.links.get(participant_id) {
            self.shared.mark_signaled(link.link_id, participant_id);
        }
    }

    fn set_link_state(&mut self, participant_id: &str, state: NegotiationState) {
        if let Some(link) = self.links.get_mut(participant_id) {
            link.state = state;
            tracing::debug!(participant = participant_id, "peer link {state:?}");
            self.shared.emitter.emit(TripEvent::PeerLinkStateChanged {
                participant_id: participant_id.to_string(),
                state,
            });
        }
    }

    /// Negotiation failed: discard the link so a later discovery can retry.
    async fn fail(&mut self, participant_id: &str, error: RealtimeError) {
        tracing::warn!(participant = participant_id, "{error}; discarding peer link");
        self.remove_link(participant_id, "negotiation failed").await;
    }

    async fn remove_link(&mut self, participant_id: &str, reason: &str) -> bool {
        let Some(link) = self.links.remove(participant_id) else {
            return false;
        };
        self.teardown_link(participant_id, link).await;
        tracing::info!(participant = participant_id, "peer link closed: {reason}");
        if matches!(self.call, Call::Active(_)) && self.links.is_empty() {
            self.shared.emitter.emit(TripEvent::MeshEmpty);
        }
        true
    }

    async fn teardown_link(&self, participant_id: &str, link: PeerLink) {
        lock(&self.shared.live_links).remove(&link.link_id);
        link.connection.close().await;
        self.shared.clear_remote_tracks(participant_id);
        self.shared
            .emitter
            .emit(TripEvent::PeerLinkClosed(participant_id.to_string()));
    }

    async fn close_all_links(&mut self) -> usize {
        let links = std::mem::take(&mut self.links);
        let closed = links.len();
        for (participant_id, link) in links {
            self.teardown_link(&participant_id, link).await;
        }
        closed
    }

    async fn end_call(&mut self) -> usize {
        let closed = self.close_all_links().await;
        self.held.clear();
        // Invalidates any acquisition still in flight.
        self.generation += 1;
        let previous = std::mem::replace(&mut self.call, Call::Idle);
        if previous.state() == CallState::Idle {
            return closed;
        }
        if let Call::Active(media) = previous {
            let stopped = media.stop_all();
            tracing::info!("call ended: {closed} link(s) closed, {stopped} track(s) stopped");
            let room_id = lock(&self.shared.relay)
                .as_ref()
                .map(|session| session.room_id().to_string())
                .unwrap_or_default();
            self.shared.relay(
                outbound::DISCONNECT_CALL,
                &RoomMember {
                    room_id,
                    participant_id: self.shared.local_id.clone(),
                },
            );
        }
        self.shared
            .emitter
            .emit(TripEvent::CallStateChanged(CallState::Idle));
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Participant;
    use crate::media::LocalTrack;
    use crate::protocol::Envelope;
    use crate::testing::{FakeDevices, FakeFactory, RecordingListener, RecordingSink};
    use crate::transport::{ConnectRequest, MemoryConnector, MemoryServerEnd};
    use serde_json::json;
    use url::Url;

    struct Harness {
        mesh: MeshCoordinator,
        session: Session,
        server: MemoryServerEnd,
        factory: Arc<FakeFactory>,
        devices: Arc<FakeDevices>,
        sink: Arc<RecordingSink>,
        events: Arc<RecordingListener>,
    }

    async fn harness(local: &str) -> Harness {
        let emitter = EventEmitter::new();
        let events = Arc::new(RecordingListener::default());
        emitter.add_listener(events.clone());
        let connector = MemoryConnector::new();
        let request = ConnectRequest {
            url: Url::parse("ws://signal.test/socket").unwrap(),
            room_id: "trip-42".into(),
            participant_id: local.into(),
            bearer_token: None,
        };
        let session = Session::connect(&connector, request, None, emitter.clone())
            .await
            .unwrap();
        let mut server = connector.take_server_end().unwrap();
        server.drain();

        let factory = FakeFactory::new();
        let devices = FakeDevices::new();
        let sink = Arc::new(RecordingSink::default());
        let mesh = MeshCoordinator::spawn(
            local,
            factory.clone(),
            devices.clone(),
            sink.clone(),
            None,
            emitter,
        );
        mesh.attach(&session);
        Harness {
            mesh,
            session,
            server,
            factory,
            devices,
            sink,
            events,
        }
    }

    fn participant(id: &str) -> Participant {
        Participant {
            participant_id: id.into(),
            display_name: None,
            color_tag: "teal".into(),
            online: true,
            tracks: Vec::new(),
        }
    }

    fn joined(ids: &[&str]) -> PresenceChange {
        PresenceChange {
            joined: ids.iter().map(|id| participant(id)).collect(),
            ..PresenceChange::default()
        }
    }

    fn left(id: &str) -> PresenceChange {
        PresenceChange {
            left: vec![id.into()],
            ..PresenceChange::default()
        }
    }

    fn candidate(name: &str) -> IceCandidate {
        IceCandidate {
            candidate: name.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    impl Harness {
        fn local(&self) -> String {
            self.session.participant_id().to_string()
        }

        fn deliver(&self, event: &str, payload: serde_json::Value) {
            self.session.dispatch(&Envelope::new(event, payload));
        }

        fn offer_from(&self, from: &str, sdp: &str) {
            let signal = CallSignal {
                from: from.into(),
                to: self.local(),
                description: SessionDescription::offer(sdp),
            };
            self.deliver(inbound::CALL_OFFER, serde_json::to_value(signal).unwrap());
        }

        fn answer_from(&self, from: &str) {
            let signal = CallSignal {
                from: from.into(),
                to: self.local(),
                description: SessionDescription::answer(format!("answer-from-{from}")),
            };
            self.deliver(inbound::CALL_ANSWER, serde_json::to_value(signal).unwrap());
        }

        fn candidate_from(&self, from: &str, name: &str) {
            let signal = IceSignal {
                from: from.into(),
                to: self.local(),
                candidate: candidate(name),
            };
            self.deliver(inbound::ICE_CANDIDATE, serde_json::to_value(signal).unwrap());
        }

        fn sent_events(&mut self) -> Vec<String> {
            self.server.drain().into_iter().map(|e| e.event).collect()
        }

        async fn link(&self, participant_id: &str) -> Option<PeerLinkInfo> {
            self.mesh
                .links()
                .await
                .into_iter()
                .find(|l| l.participant_id == participant_id)
        }
    }

    #[tokio::test]
    async fn offer_answer_then_leave_empties_the_mesh() {
        let mut h = harness("alice").await;
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        assert_eq!(h.mesh.call_state().await, CallState::Active);

        h.mesh.on_presence_change(&joined(&["bob"]));
        let link = h.link("bob").await.unwrap();
        assert_eq!(link.role, NegotiationRole::Initiator);
        assert_eq!(link.state, NegotiationState::OfferSent);
        assert_eq!(
            h.sent_events(),
            vec![outbound::CALL_OFFER.to_string(), outbound::ICE_CANDIDATE.to_string()]
        );

        h.answer_from("bob");
        let link = h.link("bob").await.unwrap();
        assert_eq!(link.state, NegotiationState::Stable);
        assert_eq!(
            h.factory.latest("bob").log(),
            vec!["tracks:2", "offer", "remote:answer"]
        );

        h.mesh.on_presence_change(&left("bob"));
        assert!(h.mesh.links().await.is_empty());
        assert_eq!(h.factory.latest("bob").close_count(), 1);
        assert_eq!(h.mesh.call_state().await, CallState::Active);
        assert_eq!(h.events.count(|e| matches!(e, TripEvent::MeshEmpty)), 1);
        assert_eq!(
            h.events
                .count(|e| matches!(e, TripEvent::PeerLinkClosed(id) if id == "bob")),
            1
        );
        assert_eq!(h.sink.detached(), vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn candidates_before_answer_are_applied_in_order_once() {
        let h = harness("alice").await;
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        h.mesh.on_presence_change(&joined(&["bob"]));

        h.candidate_from("bob", "c1");
        h.candidate_from("bob", "c2");
        let link = h.link("bob").await.unwrap();
        assert_eq!(link.queued_candidates, 2);
        assert!(h.factory.latest("bob").applied_candidates().is_empty());

        h.answer_from("bob");
        h.candidate_from("bob", "c3");
        let link = h.link("bob").await.unwrap();
        assert_eq!(link.queued_candidates, 0);
        assert!(link.remote_description_set);

        let log = h.factory.latest("bob").log();
        let remote_at = log.iter().position(|l| l == "remote:answer").unwrap();
        let first_ice = log.iter().position(|l| l.starts_with("ice:")).unwrap();
        assert!(remote_at < first_ice);
        assert_eq!(h.factory.latest("bob").applied_candidates(), vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn rejected_candidate_does_not_break_the_link() {
        let h = harness("alice").await;
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        h.mesh.on_presence_change(&joined(&["bob"]));
        h.answer_from("bob");

        h.candidate_from("bob", "bad-candidate");
        h.candidate_from("bob", "good");
        let link = h.link("bob").await.unwrap();
        assert_eq!(link.state, NegotiationState::Stable);
        assert_eq!(h.factory.latest("bob").applied_candidates(), vec!["good"]);
    }

    #[tokio::test]
    async fn inbound_offer_is_answered_as_responder() {
        let mut h = harness("bob").await;
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        h.candidate_from("alice", "early");
        h.offer_from("alice", "offer-from-alice");
        h.candidate_from("alice", "late");

        let link = h.link("alice").await.unwrap();
        assert_eq!(link.role, NegotiationRole::Responder);
        assert_eq!(link.state, NegotiationState::Stable);
        assert_eq!(
            h.factory.latest("alice").log(),
            vec!["tracks:2", "remote:offer", "answer", "ice:late"]
        );

        let frames = h.server.drain();
        let answer = frames
            .iter()
            .find(|f| f.event == outbound::CALL_ANSWER)
            .unwrap();
        assert_eq!(answer.payload["from"], json!("bob"));
        assert_eq!(answer.payload["to"], json!("alice"));
        assert_eq!(answer.payload["description"]["type"], json!("answer"));
    }

    #[tokio::test]
    async fn larger_id_waits_for_the_offer() {
        let h = harness("bob").await;
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        h.mesh.on_presence_change(&joined(&["alice"]));
        assert!(h.mesh.links().await.is_empty());
        assert!(h.factory.created().is_empty());
    }

    #[tokio::test]
    async fn repeated_discovery_creates_one_link() {
        let h = harness("alice").await;
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        h.mesh.on_presence_change(&joined(&["bob"]));
        h.mesh.on_presence_change(&joined(&["bob"]));
        h.mesh.on_presence_change(&joined(&["bob", "carol"]));

        assert_eq!(h.mesh.links().await.len(), 2);
        assert_eq!(h.factory.connections_for("bob").len(), 1);
        assert_eq!(h.factory.connections_for("carol").len(), 1);
    }

    #[tokio::test]
    async fn starting_a_call_links_to_known_participants() {
        let h = harness("alice").await;
        h.mesh.on_presence_change(&joined(&["bob", "carol"]));
        assert!(h.mesh.links().await.is_empty());

        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        let ids: Vec<String> = h
            .mesh
            .links()
            .await
            .into_iter()
            .map(|l| l.participant_id)
            .collect();
        assert_eq!(ids, vec!["bob", "carol"]);
    }

    #[tokio::test]
    async fn end_call_closes_every_link_and_stops_tracks() {
        let mut h = harness("alice").await;
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        h.mesh.on_presence_change(&joined(&["bob", "carol", "dave"]));
        assert_eq!(h.mesh.links().await.len(), 3);
        h.server.drain();

        let closed = h.mesh.end_call().await.unwrap();
        assert_eq!(closed, 3);
        for connection in h.factory.created() {
            assert_eq!(connection.close_count(), 1);
        }
        assert_eq!(h.devices.live_tracks(), 0);
        assert!(h.devices.tracks().iter().all(|t| t.stop_count() == 1));
        assert_eq!(h.mesh.call_state().await, CallState::Idle);
        assert_eq!(h.sent_events(), vec![outbound::DISCONNECT_CALL.to_string()]);
        assert_eq!(h.events.count(|e| matches!(e, TripEvent::MeshEmpty)), 0);

        // A second end is a no-op.
        assert_eq!(h.mesh.end_call().await.unwrap(), 0);
        assert!(h.sent_events().is_empty());
    }

    #[tokio::test]
    async fn media_failure_leaves_call_idle_and_retryable() {
        let h = harness("alice").await;
        h.devices.fail_next(true);
        let err = h
            .mesh
            .start_call(MediaConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::MediaAcquisition(_)));
        assert_eq!(h.mesh.call_state().await, CallState::Idle);
        assert_eq!(h.events.count(|e| matches!(e, TripEvent::MediaError(_))), 1);

        h.devices.fail_next(false);
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        assert_eq!(h.mesh.call_state().await, CallState::Active);
    }

    #[tokio::test]
    async fn media_arriving_after_end_call_is_released() {
        let h = harness("alice").await;
        h.devices.gate();
        let mesh = h.mesh.clone();
        let starting =
            tokio::spawn(async move { mesh.start_call(MediaConstraints::default()).await });

        h.devices.started.notified().await;
        assert_eq!(h.mesh.call_state().await, CallState::Acquiring);
        h.mesh.end_call().await.unwrap();
        h.devices.release.notify_one();

        starting.await.unwrap().unwrap();
        assert_eq!(h.mesh.call_state().await, CallState::Idle);
        assert_eq!(h.devices.tracks().len(), 2);
        assert_eq!(h.devices.live_tracks(), 0);
    }

    #[tokio::test]
    async fn offer_before_call_is_held_until_start() {
        let h = harness("bob").await;
        h.offer_from("alice", "first");
        h.offer_from("alice", "second");
        h.candidate_from("alice", "c1");
        assert!(h.mesh.links().await.is_empty());

        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        let link = h.link("alice").await.unwrap();
        assert_eq!(link.state, NegotiationState::Stable);
        assert_eq!(
            h.factory.latest("alice").log(),
            vec!["tracks:2", "remote:offer", "ice:c1", "answer"]
        );
    }

    impl Harness {
        fn hangup_from(&self, from: &str) {
            self.deliver(
                inbound::DISCONNECT_CALL,
                json!({"roomId": "trip-42", "participantId": from}),
            );
        }
    }

    #[tokio::test]
    async fn held_offer_is_dropped_when_the_caller_hangs_up() {
        let h = harness("bob").await;
        h.offer_from("alice", "stale");
        h.candidate_from("alice", "c1");
        h.hangup_from("alice");

        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        assert!(h.link("alice").await.is_none());
        assert!(h.factory.connections_for("alice").is_empty());
    }

    #[tokio::test]
    async fn remote_hangup_replaces_the_link_with_a_fresh_offer() {
        let mut h = harness("alice").await;
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        h.mesh.on_presence_change(&joined(&["bob"]));
        h.answer_from("bob");
        let first = h.link("bob").await.unwrap();
        assert_eq!(first.state, NegotiationState::Stable);
        h.sent_events();

        h.hangup_from("bob");
        let second = h.link("bob").await.unwrap();
        assert_ne!(first.link_id, second.link_id);
        assert_eq!(second.state, NegotiationState::OfferSent);
        let connections = h.factory.connections_for("bob");
        assert_eq!(connections.len(), 2);
        assert_eq!(connections[0].close_count(), 1);
        assert!(h.sent_events().contains(&outbound::CALL_OFFER.to_string()));
    }

    #[tokio::test]
    async fn responder_answers_the_offer_after_a_hangup_on_a_new_link() {
        let h = harness("bob").await;
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        h.offer_from("alice", "first");
        let first = h.link("alice").await.unwrap();

        h.hangup_from("alice");
        assert!(h.link("alice").await.is_none());
        h.offer_from("alice", "second");
        let second = h.link("alice").await.unwrap();
        assert_ne!(first.link_id, second.link_id);
        assert_eq!(second.state, NegotiationState::Stable);
        assert_eq!(h.factory.connections_for("alice").len(), 2);
    }

    #[tokio::test]
    async fn own_hangup_echo_is_ignored() {
        let h = harness("alice").await;
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        h.mesh.on_presence_change(&joined(&["bob"]));
        h.hangup_from("alice");
        assert!(h.link("bob").await.is_some());
        assert_eq!(h.factory.connections_for("bob").len(), 1);
    }

    #[tokio::test]
    async fn offer_on_stable_link_renegotiates_in_place() {
        let h = harness("bob").await;
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        h.offer_from("alice", "v1");
        let before = h.link("alice").await.unwrap();

        h.offer_from("alice", "v2");
        let after = h.link("alice").await.unwrap();
        assert_eq!(after.link_id, before.link_id);
        assert_eq!(after.state, NegotiationState::Stable);
        assert_eq!(h.factory.created().len(), 1);
        assert_eq!(
            h.factory.latest("alice").log(),
            vec!["tracks:2", "remote:offer", "answer", "remote:offer", "answer"]
        );
    }

    #[tokio::test]
    async fn out_of_order_answers() {
        let h = harness("alice").await;
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();

        // No link at all: dropped.
        h.answer_from("zoe");
        assert!(h.mesh.links().await.is_empty());

        // A second answer on a stable link is a negotiation error.
        h.mesh.on_presence_change(&joined(&["bob"]));
        h.answer_from("bob");
        h.answer_from("bob");
        assert!(h.link("bob").await.is_none());
        assert_eq!(h.factory.latest("bob").close_count(), 1);
    }

    #[tokio::test]
    async fn rejoin_gets_a_fresh_link() {
        let h = harness("alice").await;
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        h.mesh.on_presence_change(&joined(&["bob"]));
        let first = h.link("bob").await.unwrap();

        h.mesh.on_presence_change(&left("bob"));
        h.mesh.on_presence_change(&joined(&["bob"]));
        let second = h.link("bob").await.unwrap();
        assert_ne!(first.link_id, second.link_id);
        assert_eq!(second.state, NegotiationState::OfferSent);
        assert_eq!(h.factory.connections_for("bob").len(), 2);
    }

    #[tokio::test]
    async fn callbacks_from_closed_links_are_ignored() {
        let mut h = harness("alice").await;
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        h.mesh.on_presence_change(&joined(&["bob"]));
        h.mesh.links().await;
        let stale = h.factory.latest("bob");
        assert!(stale.observer.is_live());

        h.mesh.on_presence_change(&left("bob"));
        h.mesh.links().await;
        h.server.drain();
        assert!(!stale.observer.is_live());

        stale.observer.on_local_candidate(candidate("late"));
        stale.observer.on_remote_track(RemoteTrack {
            info: TrackInfo {
                id: "bob-audio".into(),
                kind: TrackKind::Audio,
            },
            handle: Arc::new(()),
        });
        assert!(h.sent_events().is_empty());
        assert!(h.sink.attached().is_empty());
    }

    #[tokio::test]
    async fn remote_tracks_reach_the_sink() {
        let h = harness("alice").await;
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        h.mesh.on_presence_change(&joined(&["bob"]));
        h.mesh.links().await;

        let track = TrackInfo {
            id: "bob-video".into(),
            kind: TrackKind::Video,
        };
        h.factory.latest("bob").observer.on_remote_track(RemoteTrack {
            info: track.clone(),
            handle: Arc::new(()),
        });
        assert_eq!(h.sink.attached(), vec![("bob".to_string(), track)]);
        assert_eq!(
            h.events
                .count(|e| matches!(e, TripEvent::RemoteTrackAttached { participant_id, .. } if participant_id == "bob")),
            1
        );

        h.mesh.on_presence_change(&left("bob"));
        h.mesh.links().await;
        assert_eq!(
            h.events
                .count(|e| matches!(e, TripEvent::RemoteTracksDetached(id) if id == "bob")),
            1
        );
    }

    #[tokio::test]
    async fn offer_failure_discards_the_link() {
        let h = harness("alice").await;
        h.factory.fail_offers(true);
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        h.mesh.on_presence_change(&joined(&["bob"]));
        assert!(h.mesh.links().await.is_empty());
        assert_eq!(h.factory.latest("bob").close_count(), 1);
    }

    #[tokio::test]
    async fn microphone_toggle_requires_a_call() {
        let h = harness("alice").await;
        assert!(h.mesh.set_microphone_enabled(false).await.is_err());

        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        h.mesh.set_microphone_enabled(false).await.unwrap();
        h.mesh.set_camera_enabled(false).await.unwrap();
        let tracks = h.devices.tracks();
        assert!(tracks.iter().all(|t| !t.is_enabled()));
        assert!(tracks.iter().all(|t| t.is_live()));

        h.mesh.set_microphone_enabled(true).await.unwrap();
        assert!(tracks[0].is_enabled());
    }

    #[tokio::test]
    async fn signals_for_other_participants_are_ignored() {
        let h = harness("alice").await;
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        let signal = CallSignal {
            from: "bob".into(),
            to: "carol".into(),
            description: SessionDescription::offer("not-for-us"),
        };
        h.deliver(inbound::CALL_OFFER, serde_json::to_value(signal).unwrap());
        assert!(h.mesh.links().await.is_empty());
    }

    #[tokio::test]
    async fn reset_links_keeps_media() {
        let h = harness("alice").await;
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        h.mesh.on_presence_change(&joined(&["bob"]));
        h.mesh.links().await;

        h.mesh.reset_links().await.unwrap();
        assert!(h.mesh.links().await.is_empty());
        assert_eq!(h.mesh.call_state().await, CallState::Active);
        assert_eq!(h.devices.live_tracks(), 2);
    }

    #[tokio::test]
    async fn shutdown_releases_media() {
        let h = harness("alice").await;
        h.mesh.start_call(MediaConstraints::default()).await.unwrap();
        h.mesh.shutdown().await;
        h.mesh.shutdown().await;
        assert_eq!(h.devices.live_tracks(), 0);
        assert_eq!(h.mesh.call_state().await, CallState::Idle);
    }
}
