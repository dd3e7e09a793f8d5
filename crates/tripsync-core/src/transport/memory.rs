use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use super::{ConnectRequest, Connector, Link, LinkEvent};
use crate::errors::RealtimeError;
use crate::protocol::Envelope;

/// In-process connector. Each successful `connect` queues a
/// [`MemoryServerEnd`] that plays the signaling backend.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    pending: Arc<Mutex<VecDeque<MemoryServerEnd>>>,
    connects: Arc<AtomicUsize>,
    refuse: Arc<AtomicBool>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of links opened so far, including ones since closed.
    pub fn connection_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make subsequent `connect` calls fail with a connection error.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Take the oldest server end not yet claimed.
    pub fn take_server_end(&self) -> Option<MemoryServerEnd> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Link, RealtimeError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(RealtimeError::Connection("connection refused".into()));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(MemoryServerEnd {
                room_id: request.room_id.clone(),
                participant_id: request.participant_id.clone(),
                to_client: in_tx,
                from_client: out_rx,
            });
        Ok(Link::new(out_tx, in_rx))
    }
}

/// The backend side of an in-memory link.
pub struct MemoryServerEnd {
    pub room_id: String,
    pub participant_id: String,
    to_client: mpsc::UnboundedSender<LinkEvent>,
    from_client: mpsc::UnboundedReceiver<Envelope>,
}

impl MemoryServerEnd {
    /// Deliver a frame to the client. Returns false once the client is gone.
    pub fn send<T: Serialize>(&self, event: &str, payload: &T) -> bool {
        match serde_json::to_value(payload) {
            Ok(value) => self
                .to_client
                .send(LinkEvent::Frame(Envelope::new(event, value)))
                .is_ok(),
            Err(_) => false,
        }
    }

    /// Simulate the network dropping the connection.
    pub fn drop_connection(&self, reason: &str) {
        let _ = self.to_client.send(LinkEvent::Closed {
            reason: Some(reason.to_string()),
        });
    }

    /// Everything the client has emitted so far.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut frames = Vec::new();
        while let Ok(envelope) = self.from_client.try_recv() {
            frames.push(envelope);
        }
        frames
    }

    /// Wait for the next emitted frame; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.from_client.recv().await
    }
}
