use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::mesh::NegotiationState;

/// Events emitted by the core to UI listeners.
#[derive(Debug, Clone)]
pub enum TripEvent {
    ConnectionStateChanged(ConnectionState),
    ParticipantsChanged(Vec<Participant>),
    ParticipantJoined(Participant),
    ParticipantLeft(String), // participant id
    ChatMessageReceived(ChatMessage),
    LocationReceived(LocationSample),
    LocationSharingChanged(bool),
    CallStateChanged(CallState),
    PeerLinkStateChanged { participant_id: String, state: NegotiationState },
    PeerLinkClosed(String), // participant id
    /// The call is active but no remote participant is linked any more.
    MeshEmpty,
    RemoteTrackAttached { participant_id: String, track: TrackInfo },
    RemoteTracksDetached(String), // participant id
    MediaError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Errored { reason: String },
}

impl ConnectionState {
    /// Whether the session still holds (or is acquiring) a transport.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Acquiring,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: String,
    pub kind: TrackKind,
}

/// A remote user visible in the room roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub participant_id: String,
    pub display_name: Option<String>,
    pub color_tag: String,
    pub online: bool,
    /// Last known remote media tracks while in a call.
    pub tracks: Vec<TrackInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub participant_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
    pub timestamp_ms: u64,
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait TripEventListener: Send + Sync {
    fn on_event(&self, event: TripEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn TripEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn TripEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn emit(&self, event: TripEvent) {
        // Snapshot so a listener may register another listener re-entrantly.
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}
