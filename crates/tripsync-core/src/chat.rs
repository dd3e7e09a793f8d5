use std::sync::{Arc, Mutex, PoisonError};

use crate::errors::RealtimeError;
use crate::events::{ChatMessage, EventEmitter, TripEvent};
use crate::protocol::{inbound, outbound, SendChatMessage};
use crate::session::{Session, Subscription};

/// Ordered chat log for the current room, shared with the session handler.
pub type MessageStore = Arc<Mutex<Vec<ChatMessage>>>;

/// Chat feature channel: `send-chat-message` out, `new-chat-message` in.
#[derive(Clone)]
pub struct ChatChannel {
    session: Arc<Mutex<Option<Session>>>,
    emitter: EventEmitter,
    messages: MessageStore,
}

impl ChatChannel {
    pub fn new(emitter: EventEmitter) -> Self {
        Self {
            session: Arc::new(Mutex::new(None)),
            emitter,
            messages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn store(&self) -> std::sync::MutexGuard<'_, Vec<ChatMessage>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn attach(&self, session: &Session) -> Vec<Subscription> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        let chat = self.clone();
        vec![session.subscribe_typed(inbound::NEW_CHAT_MESSAGE, move |msg: ChatMessage| {
            chat.handle_incoming(msg);
        })]
    }

    /// Send a message to the room. Blank input is ignored and yields `None`.
    pub fn send_message(&self, text: &str) -> Result<Option<ChatMessage>, RealtimeError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| RealtimeError::Room("not connected".into()))?;
        if !session.is_open() {
            return Err(RealtimeError::Connection(format!(
                "cannot send chat: session is {:?}",
                session.state()
            )));
        }

        let msg = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: session.participant_id().to_string(),
            sender_name: session
                .display_name()
                .unwrap_or(session.participant_id())
                .to_string(),
            text: text.to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis() as u64,
        };
        session.emit(
            outbound::SEND_CHAT_MESSAGE,
            &SendChatMessage {
                room_id: session.room_id().to_string(),
                message: msg.clone(),
            },
        );

        self.store().push(msg.clone());
        self.emitter.emit(TripEvent::ChatMessageReceived(msg.clone()));
        Ok(Some(msg))
    }

    /// Get all messages in the current session.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.store().clone()
    }

    /// Append an inbound message unless a message with the same id is
    /// already present (e.g. the server echoing our own send).
    pub fn handle_incoming(&self, msg: ChatMessage) -> bool {
        {
            let mut store = self.store();
            if store.iter().any(|m| m.id == msg.id) {
                tracing::debug!(id = %msg.id, "duplicate chat message ignored");
                return false;
            }
            store.push(msg.clone());
        }
        self.emitter.emit(TripEvent::ChatMessageReceived(msg));
        true
    }

    /// Put earlier messages, e.g. fetched over REST, ahead of the live log.
    pub fn seed_history(&self, history: Vec<ChatMessage>) {
        let mut store = self.store();
        let mut merged: Vec<ChatMessage> = history
            .into_iter()
            .filter(|m| !store.iter().any(|s| s.id == m.id))
            .collect();
        merged.dedup_by(|a, b| a.id == b.id);
        merged.append(&mut *store);
        *store = merged;
    }

    /// Clear all messages and forget the session (on exit).
    pub fn clear(&self) {
        self.store().clear();
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
