//! Transport session: one signaling connection per room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::errors::RealtimeError;
use crate::events::{ConnectionState, EventEmitter, TripEvent};
use crate::protocol::{outbound, Envelope, JoinRoom, RoomMember};
use crate::transport::{ConnectRequest, Connector, LinkEvent, LinkTasks};

pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Claim count once the session has been released for good.
const RELEASED: usize = usize::MAX;

/// Token returned by [`Session::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    event: String,
    id: u64,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }
}

struct Inner {
    room_id: String,
    participant_id: String,
    display_name: Option<String>,
    state: watch::Sender<ConnectionState>,
    handlers: Mutex<HashMap<String, Vec<(u64, Handler)>>>,
    next_subscription: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    link_tasks: Mutex<Option<LinkTasks>>,
    /// Binders holding the session through a [`SessionRegistry`].
    holders: AtomicUsize,
    emitter: EventEmitter,
}

/// Handle to a room's signaling connection. Cheap to clone; all clones
/// share the same connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("room_id", &self.inner.room_id)
            .field("participant_id", &self.inner.participant_id)
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    /// Open a connection and announce the local participant with `join-room`.
    ///
    /// On failure the returned error is also reflected as the `Errored`
    /// state on the emitter.
    pub async fn connect(
        connector: &dyn Connector,
        request: ConnectRequest,
        display_name: Option<String>,
        emitter: EventEmitter,
    ) -> Result<Self, RealtimeError> {
        Self::connect_with(connector, request, display_name, emitter, |_| {}).await
    }

    /// Like [`connect`](Self::connect), but runs `before_join` once the link
    /// is up and before `join-room` is sent, so handlers registered there
    /// see the backend's first reply.
    pub async fn connect_with<F>(
        connector: &dyn Connector,
        request: ConnectRequest,
        display_name: Option<String>,
        emitter: EventEmitter,
        before_join: F,
    ) -> Result<Self, RealtimeError>
    where
        F: FnOnce(&Session) + Send,
    {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let session = Self {
            inner: Arc::new(Inner {
                room_id: request.room_id.clone(),
                participant_id: request.participant_id.clone(),
                display_name,
                state,
                handlers: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                outbound: Mutex::new(None),
                reader: Mutex::new(None),
                link_tasks: Mutex::new(None),
                holders: AtomicUsize::new(0),
                emitter,
            }),
        };
        session
            .inner
            .emitter
            .emit(TripEvent::ConnectionStateChanged(ConnectionState::Connecting));

        let link = match connector.connect(&request).await {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(room = %request.room_id, "signaling connect failed: {e}");
                session.set_state(ConnectionState::Errored {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        let (outbound_tx, inbound_rx, tasks) = link.into_parts();
        *lock(&session.inner.outbound) = Some(outbound_tx);
        *lock(&session.inner.link_tasks) = Some(tasks);

        session.set_state(ConnectionState::Open);
        tracing::info!(room = %request.room_id, participant = %request.participant_id, "session open");
        before_join(&session);
        session.emit(
            outbound::JOIN_ROOM,
            &JoinRoom {
                room_id: session.inner.room_id.clone(),
                participant_id: session.inner.participant_id.clone(),
                display_name: session.inner.display_name.clone(),
            },
        );

        let reader = tokio::spawn(Self::read_loop(Arc::downgrade(&session.inner), inbound_rx));
        *lock(&session.inner.reader) = Some(reader);

        Ok(session)
    }

    async fn read_loop(inner: Weak<Inner>, mut inbound: mpsc::UnboundedReceiver<LinkEvent>) {
        let reason = loop {
            let Some(event) = inbound.recv().await else {
                break None;
            };
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let session = Session { inner };
            match event {
                LinkEvent::Frame(envelope) => session.dispatch(&envelope),
                LinkEvent::Closed { reason } => break reason,
            }
        };
        if let Some(inner) = inner.upgrade() {
            Session { inner }.transport_closed(reason);
        }
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    pub fn participant_id(&self) -> &str {
        &self.inner.participant_id
    }

    pub fn display_name(&self) -> Option<&str> {
        self.inner.display_name.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        *self.inner.state.borrow() == ConnectionState::Open
    }

    /// Observe state transitions, e.g. to layer a reconnect policy on top.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Whether both handles refer to the same underlying connection.
    pub fn same_connection(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Fire-and-forget outbound message. Dropped (and logged) unless the
    /// session is open.
    pub fn emit<T: Serialize + ?Sized>(&self, event: &str, payload: &T) {
        if !self.is_open() {
            tracing::warn!(room = %self.inner.room_id, "dropping '{event}': session is {:?}", self.state());
            return;
        }
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("cannot serialize '{event}' payload: {e}");
                return;
            }
        };
        let sent = lock(&self.inner.outbound)
            .as_ref()
            .is_some_and(|tx| tx.send(Envelope::new(event, payload)).is_ok());
        if !sent {
            tracing::warn!(room = %self.inner.room_id, "dropping '{event}': transport gone");
        }
    }

    /// Register a raw handler. Handlers for one event run in registration order.
    pub fn subscribe<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.handlers)
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            event: event.to_string(),
            id,
        }
    }

    /// Register a handler for a typed payload. Payloads that do not
    /// deserialize into `T` are logged and dropped.
    pub fn subscribe_typed<T, F>(&self, event: &str, handler: F) -> Subscription
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let name = event.to_string();
        self.subscribe(event, move |value| match T::deserialize(value) {
            Ok(payload) => handler(payload),
            Err(e) => tracing::warn!("dropping malformed '{name}' payload: {e}"),
        })
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut handlers = lock(&self.inner.handlers);
        let Some(list) = handlers.get_mut(&subscription.event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != subscription.id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&subscription.event);
        }
        removed
    }

    pub fn handler_count(&self, event: &str) -> usize {
        lock(&self.inner.handlers).get(event).map_or(0, Vec::len)
    }

    /// Deliver an inbound frame to the handlers registered for its event.
    pub(crate) fn dispatch(&self, envelope: &Envelope) {
        // Handlers may subscribe or unsubscribe re-entrantly.
        let handlers: Vec<Handler> = match lock(&self.inner.handlers).get(&envelope.event) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => {
                tracing::trace!("no handler for '{}'", envelope.event);
                return;
            }
        };
        for handler in handlers {
            handler(&envelope.payload);
        }
    }

    /// Add a claim. Fails once the session was released or closed.
    fn retain(&self) -> bool {
        self.inner
            .holders
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n != RELEASED).then(|| n + 1)
            })
            .is_ok()
    }

    /// Give up one claim taken through [`SessionRegistry::open`]. The last
    /// release closes the session; earlier ones leave it running for the
    /// remaining holders. Returns true if this call closed it.
    pub fn release(&self) -> bool {
        let previous = self
            .inner
            .holders
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                RELEASED => None,
                0 | 1 => Some(RELEASED),
                n => Some(n - 1),
            });
        match previous {
            Ok(0 | 1) => {
                self.close();
                true
            }
            Ok(n) => {
                tracing::debug!(room = %self.inner.room_id, "session still held by {} binder(s)", n - 1);
                false
            }
            Err(_) => false,
        }
    }

    /// Number of outstanding claims.
    pub fn holders(&self) -> usize {
        match self.inner.holders.load(Ordering::SeqCst) {
            RELEASED => 0,
            n => n,
        }
    }

    /// Leave the room and release the connection regardless of other
    /// holders. Safe to call repeatedly.
    pub fn close(&self) {
        self.inner.holders.store(RELEASED, Ordering::SeqCst);
        let previous = self.state();
        if previous == ConnectionState::Closed {
            return;
        }
        if previous == ConnectionState::Open {
            self.emit(
                outbound::LEAVE_ROOM,
                &RoomMember {
                    room_id: self.inner.room_id.clone(),
                    participant_id: self.inner.participant_id.clone(),
                },
            );
        }
        self.set_state(ConnectionState::Closed);
        lock(&self.inner.handlers).clear();
        // Dropping the sender lets the writer flush and send its close frame.
        lock(&self.inner.outbound).take();
        if let Some(tasks) = lock(&self.inner.link_tasks).take() {
            tasks.detach();
        }
        if let Some(reader) = lock(&self.inner.reader).take() {
            reader.abort();
        }
        tracing::info!(room = %self.inner.room_id, "session closed");
    }

    fn transport_closed(&self, reason: Option<String>) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        let reason = reason.unwrap_or_else(|| "connection lost".to_string());
        tracing::warn!(room = %self.inner.room_id, "signaling connection dropped: {reason}");
        lock(&self.inner.outbound).take();
        lock(&self.inner.link_tasks).take();
        self.set_state(ConnectionState::Errored { reason });
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.send_replace(state.clone());
        self.inner
            .emitter
            .emit(TripEvent::ConnectionStateChanged(state));
    }
}

/// Hands out at most one live session per room. Every successful open
/// takes a claim that the caller gives back with [`Session::release`].
#[derive(Clone)]
pub struct SessionRegistry {
    connector: Arc<dyn Connector>,
    sessions: Arc<tokio::sync::Mutex<HashMap<String, Session>>>,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            sessions: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Return the live session for the request's room, or open a new one.
    /// Either way the caller holds one claim on it.
    pub async fn open(
        &self,
        request: ConnectRequest,
        display_name: Option<String>,
        emitter: EventEmitter,
    ) -> Result<Session, RealtimeError> {
        self.open_with(request, display_name, emitter, |_| {}).await
    }

    /// [`open`](Self::open) with a hook that runs before `join-room` on a
    /// fresh session, or immediately on a reused one.
    pub async fn open_with<F>(
        &self,
        request: ConnectRequest,
        display_name: Option<String>,
        emitter: EventEmitter,
        before_join: F,
    ) -> Result<Session, RealtimeError>
    where
        F: FnOnce(&Session) + Send,
    {
        // Held across the connect so concurrent opens for a room cannot race.
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&request.room_id) {
            if existing.state().is_live() && existing.retain() {
                tracing::debug!(room = %request.room_id, holders = existing.holders(), "reusing open session");
                before_join(existing);
                return Ok(existing.clone());
            }
        }
        let room_id = request.room_id.clone();
        let session = Session::connect_with(
            self.connector.as_ref(),
            request,
            display_name,
            emitter,
            before_join,
        )
        .await?;
        session.retain();
        sessions.insert(room_id, session.clone());
        Ok(session)
    }

    pub async fn get(&self, room_id: &str) -> Option<Session> {
        self.sessions
            .lock()
            .await
            .get(room_id)
            .filter(|s| s.state().is_live())
            .cloned()
    }
}
