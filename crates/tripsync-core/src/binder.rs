//! Room lifecycle: entering a room wires every feature to one session,
//! leaving tears all of it down exactly once.
//!
//! Teardown order on exit is fixed: location timer, peer links, local
//! media, subscriptions, session.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;

use crate::api::RosterSource;
use crate::auth::{require_identity, AuthContext};
use crate::chat::ChatChannel;
use crate::config::{validate_room_id, ClientConfig, ReconnectPolicy};
use crate::errors::RealtimeError;
use crate::events::{ConnectionState, EventEmitter, TripEventListener};
use crate::location::LocationChannel;
use crate::media::{MediaDevices, MediaSink};
use crate::mesh::{MeshCoordinator, PeerConnectionFactory};
use crate::presence::Presence;
use crate::session::{Session, SessionRegistry, Subscription};
use crate::transport::ConnectRequest;

/// Collaborators a binder needs to enter rooms.
#[derive(Clone)]
pub struct RoomServices {
    pub registry: SessionRegistry,
    pub auth: Arc<dyn AuthContext>,
    pub roster: Arc<dyn RosterSource>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub sink: Arc<dyn MediaSink>,
}

#[derive(Clone)]
struct Features {
    presence: Presence,
    chat: ChatChannel,
    location: LocationChannel,
    mesh: MeshCoordinator,
}

impl Features {
    fn attach(&self, session: &Session) -> Vec<Subscription> {
        let mut subscriptions = self.presence.attach(session);
        subscriptions.extend(self.chat.attach(session));
        subscriptions.extend(self.location.attach(session));
        subscriptions.extend(self.mesh.attach(session));
        subscriptions
    }
}

/// The session currently backing a room and the handlers registered on it.
struct Attachment {
    session: Session,
    subscriptions: Vec<Subscription>,
}

impl Attachment {
    fn detach(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            self.session.unsubscribe(&subscription);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Access to the features of the room a binder is in.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: String,
    features: Features,
    attachment: Arc<Mutex<Attachment>>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// The current session; replaced after a reconnect.
    pub fn session(&self) -> Session {
        lock(&self.attachment).session.clone()
    }

    pub fn presence(&self) -> &Presence {
        &self.features.presence
    }

    pub fn chat(&self) -> &ChatChannel {
        &self.features.chat
    }

    pub fn location(&self) -> &LocationChannel {
        &self.features.location
    }

    pub fn mesh(&self) -> &MeshCoordinator {
        &self.features.mesh
    }
}

struct BoundRoom {
    handle: RoomHandle,
    supervisor: Option<JoinHandle<()>>,
}

impl BoundRoom {
    async fn teardown(mut self) {
        let room_id = self.handle.room_id.clone();
        let features = self.handle.features.clone();
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }

        features.location.stop_sharing();
        let closed = match features.mesh.end_call().await {
            Ok(closed) => closed,
            Err(e) => {
                tracing::warn!(room = %room_id, "mesh unavailable during exit: {e}");
                0
            }
        };
        features.mesh.shutdown().await;

        let session = {
            let mut attachment = lock(&self.handle.attachment);
            attachment.detach();
            attachment.session.clone()
        };
        features.chat.clear();
        features.location.clear();
        if !session.release() {
            tracing::debug!(room = %room_id, "session kept open for other binders");
        }
        tracing::info!(room = %room_id, "left room ({closed} peer link(s) closed)");
    }

    /// Best effort without a runtime: everything but the mesh actor.
    fn teardown_blocking(mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
        let features = &self.handle.features;
        features.location.stop_sharing();
        let session = {
            let mut attachment = lock(&self.handle.attachment);
            attachment.detach();
            attachment.session.clone()
        };
        session.release();
        tracing::warn!(room = %self.handle.room_id, "room dropped outside a runtime; media left to the mesh task");
    }
}

/// Binds one room at a time to the UI. Exiting, switching rooms and
/// dropping the binder all run the same teardown once.
pub struct RoomBinder {
    services: RoomServices,
    config: ClientConfig,
    emitter: EventEmitter,
    bound: tokio::sync::Mutex<Option<BoundRoom>>,
}

impl RoomBinder {
    pub fn new(services: RoomServices, config: ClientConfig) -> Self {
        Self {
            services,
            config,
            emitter: EventEmitter::new(),
            bound: tokio::sync::Mutex::new(None),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn TripEventListener>) {
        self.emitter.add_listener(listener);
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn room(&self) -> Option<RoomHandle> {
        self.bound.lock().await.as_ref().map(|b| b.handle.clone())
    }

    /// Enter `room_id`, leaving the current room first if it differs.
    /// Entering the room the binder is already live in is a no-op.
    pub async fn enter(&self, room_id: &str) -> Result<RoomHandle, RealtimeError> {
        let mut bound = self.bound.lock().await;
        if let Some(current) = bound.as_ref() {
            if current.handle.room_id == room_id && current.handle.session().state().is_live() {
                tracing::debug!(room = room_id, "already in room");
                return Ok(current.handle.clone());
            }
        }
        if let Some(previous) = bound.take() {
            previous.teardown().await;
        }

        let identity = require_identity(self.services.auth.as_ref())?;
        validate_room_id(room_id)?;

        let presence = Presence::new(&identity.participant_id, self.emitter.clone());
        let features = Features {
            mesh: MeshCoordinator::spawn(
                &identity.participant_id,
                self.services.peers.clone(),
                self.services.devices.clone(),
                self.services.sink.clone(),
                Some(presence.clone()),
                self.emitter.clone(),
            ),
            presence,
            chat: ChatChannel::new(self.emitter.clone()),
            location: LocationChannel::new(self.emitter.clone()),
        };
        self.seed(room_id, &features).await;
        let mesh = features.mesh.clone();
        features
            .presence
            .on_change(move |change| mesh.on_presence_change(change));

        let request = ConnectRequest {
            url: self.config.signaling_url.clone(),
            room_id: room_id.to_string(),
            participant_id: identity.participant_id.clone(),
            bearer_token: self.services.auth.bearer_token(),
        };
        let display_name = Some(identity.display_name.clone());
        let mut subscriptions = Vec::new();
        let opened = self
            .services
            .registry
            .open_with(request.clone(), display_name.clone(), self.emitter.clone(), |session| {
                subscriptions = features.attach(session);
            })
            .await;
        let session = match opened {
            Ok(session) => session,
            Err(e) => {
                features.mesh.shutdown().await;
                return Err(e);
            }
        };

        let handle = RoomHandle {
            room_id: room_id.to_string(),
            features,
            attachment: Arc::new(Mutex::new(Attachment {
                session,
                subscriptions,
            })),
        };
        let supervisor = self.config.reconnect.clone().map(|policy| {
            tokio::spawn(supervise(
                handle.clone(),
                self.services.registry.clone(),
                request,
                display_name,
                self.emitter.clone(),
                policy,
            ))
        });
        tracing::info!(room = room_id, participant = %identity.participant_id, "entered room");
        *bound = Some(BoundRoom {
            handle: handle.clone(),
            supervisor,
        });
        Ok(handle)
    }

    /// Trip members and chat history from the REST API. Failures only cost
    /// display metadata.
    async fn seed(&self, room_id: &str, features: &Features) {
        match self.services.roster.fetch_roster(room_id).await {
            Ok(entries) => features.presence.seed_directory(entries),
            Err(e) => tracing::warn!(room = room_id, "cannot load trip roster: {e}"),
        }
        match self.services.roster.fetch_chat_history(room_id).await {
            Ok(history) => features.chat.seed_history(history),
            Err(e) => tracing::warn!(room = room_id, "cannot load chat history: {e}"),
        }
    }

    /// Leave the current room. Returns false if there was none.
    pub async fn exit(&self) -> bool {
        let Some(bound) = self.bound.lock().await.take() else {
            return false;
        };
        bound.teardown().await;
        true
    }

    pub async fn switch_room(&self, room_id: &str) -> Result<RoomHandle, RealtimeError> {
        self.exit().await;
        self.enter(room_id).await
    }
}

impl Drop for RoomBinder {
    fn drop(&mut self) {
        let Some(bound) = self.bound.get_mut().take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!(room = %bound.handle.room_id, "binder dropped; tearing down");
                runtime.spawn(bound.teardown());
            }
            Err(_) => bound.teardown_blocking(),
        }
    }
}

/// Reopen the room's session after a transport failure and move every
/// feature onto the new one. Stops on a deliberate close.
async fn supervise(
    handle: RoomHandle,
    registry: SessionRegistry,
    request: ConnectRequest,
    display_name: Option<String>,
    emitter: EventEmitter,
    policy: ReconnectPolicy,
) {
    let room_id = handle.room_id.clone();
    loop {
        let mut state = handle.session().watch_state();
        let outcome = state.wait_for(|s| !s.is_live()).await.map(|s| s.clone());
        let reason = match outcome {
            Ok(ConnectionState::Errored { reason }) => reason,
            _ => return,
        };
        tracing::warn!(room = %room_id, "session lost ({reason}); reconnecting");

        lock(&handle.attachment).detach();
        handle.features.presence.reset();
        if handle.features.mesh.reset_links().await.is_err() {
            return;
        }

        let mut reconnected = None;
        for attempt in 1..=policy.max_attempts {
            tokio::time::sleep(policy.jittered_delay_for(attempt)).await;
            let mut subscriptions = Vec::new();
            let opened = registry
                .open_with(request.clone(), display_name.clone(), emitter.clone(), |session| {
                    subscriptions = handle.features.attach(session);
                })
                .await;
            match opened {
                Ok(session) => {
                    reconnected = Some(Attachment {
                        session,
                        subscriptions,
                    });
                    break;
                }
                Err(e) => tracing::warn!(room = %room_id, "reconnect attempt {attempt} failed: {e}"),
            }
        }
        let Some(attachment) = reconnected else {
            tracing::warn!(room = %room_id, "giving up after {} attempt(s)", policy.max_attempts);
            return;
        };
        let lost = std::mem::replace(&mut *lock(&handle.attachment), attachment);
        lost.session.release();
        tracing::info!(room = %room_id, "reconnected");
    }
}
