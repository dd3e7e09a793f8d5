//! Signaling wire format.
//!
//! Every frame on the signaling connection is a JSON object
//! `{"event": "<name>", "payload": <json>}`. Field names inside payloads
//! are camelCase to match the web clients sharing the same backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{ChatMessage, LocationSample};

/// Outbound event names.
pub mod outbound {
    pub const JOIN_ROOM: &str = "join-room";
    pub const LEAVE_ROOM: &str = "leave-room";
    pub const DISCONNECT_CALL: &str = "disconnect-call";
    pub const SEND_CHAT_MESSAGE: &str = "send-chat-message";
    pub const CALL_OFFER: &str = "call-offer";
    pub const CALL_ANSWER: &str = "call-answer";
    pub const ICE_CANDIDATE: &str = "ice-candidate";
    pub const LOCATION_UPDATE: &str = "location-update";
    pub const STOP_LOCATION_SHARING: &str = "stop-location-sharing";
}

/// Inbound event names.
pub mod inbound {
    pub const ONLINE_ROSTER: &str = "online-roster";
    pub const NEW_PARTICIPANT: &str = "new-participant";
    pub const PARTICIPANT_DISCONNECTED: &str = "participant-disconnected";
    pub const NEW_CHAT_MESSAGE: &str = "new-chat-message";
    pub const CALL_OFFER: &str = "call-offer";
    pub const CALL_ANSWER: &str = "call-answer";
    pub const ICE_CANDIDATE: &str = "ice-candidate";
    /// Relayed when another member hangs up.
    pub const DISCONNECT_CALL: &str = "disconnect-call";
    pub const INITIAL_LOCATIONS: &str = "initial-locations";
    pub const UPDATED_LOCATIONS: &str = "updated-locations";
}

/// A single named frame on the signaling connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub room_id: String,
    pub participant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Payload of `leave-room`, `disconnect-call` and `stop-location-sharing`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
    pub room_id: String,
    pub participant_id: String,
}

/// A participant as reported by the signaling backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    pub participant_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub color_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineRoster {
    #[serde(default)]
    pub participants: Vec<ParticipantRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantGone {
    pub participant_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendChatMessage {
    pub room_id: String,
    pub message: ChatMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Payload of `call-offer` and `call-answer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSignal {
    pub from: String,
    pub to: String,
    pub description: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceSignal {
    pub from: String,
    pub to: String,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub room_id: String,
    pub sample: LocationSample,
}

/// Payload of `initial-locations` and `updated-locations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationBatch {
    #[serde(default)]
    pub samples: Vec<LocationSample>,
}
