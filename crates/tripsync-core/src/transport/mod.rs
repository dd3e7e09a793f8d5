//! Duplex signaling transports.
//!
//! A [`Connector`] opens one [`Link`] per session: a sender for outbound
//! frames and a receiver for inbound frames plus the final close
//! notification. Nothing else in the crate touches the network.

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::errors::RealtimeError;
use crate::protocol::Envelope;

pub use memory::{MemoryConnector, MemoryServerEnd};
pub use ws::WsConnector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: Url,
    pub room_id: String,
    pub participant_id: String,
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Frame(Envelope),
    /// The remote end or the network closed the connection.
    Closed { reason: Option<String> },
}

/// An established connection. Dropping it aborts its background tasks.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Envelope>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
    tasks: LinkTasks,
}

impl Link {
    pub fn new(
        outbound: mpsc::UnboundedSender<Envelope>,
        inbound: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            tasks: LinkTasks(Vec::new()),
        }
    }

    pub fn with_tasks(mut self, tasks: Vec<JoinHandle<()>>) -> Self {
        self.tasks = LinkTasks(tasks);
        self
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<Envelope>,
        mpsc::UnboundedReceiver<LinkEvent>,
        LinkTasks,
    ) {
        (self.outbound, self.inbound, self.tasks)
    }
}

/// Background I/O tasks of a link; aborted on drop.
pub(crate) struct LinkTasks(Vec<JoinHandle<()>>);

impl LinkTasks {
    /// Let the writer flush and exit on its own once the outbound sender is gone.
    pub(crate) fn detach(mut self) {
        self.0.clear();
    }
}

impl Drop for LinkTasks {
    fn drop(&mut self) {
        for task in self.0.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> Result<Link, RealtimeError>;
}
