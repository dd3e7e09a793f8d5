use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use super::{ConnectRequest, Connector, Link, LinkEvent};
use crate::errors::RealtimeError;
use crate::protocol::Envelope;

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);

/// WebSocket connector for the signaling backend.
///
/// Frames are JSON text messages. The room and participant ids travel as
/// query parameters on the upgrade request; the bearer token (if any) in
/// the `Authorization` header.
#[derive(Debug, Clone)]
pub struct WsConnector {
    ping_interval: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

impl WsConnector {
    pub fn new(ping_interval: Duration) -> Self {
        Self { ping_interval }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Link, RealtimeError> {
        let mut url = request.url.clone();
        url.query_pairs_mut()
            .append_pair("room", &request.room_id)
            .append_pair("participant", &request.participant_id);

        let mut ws_request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::Connection(e.to_string()))?;
        if let Some(token) = &request.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| RealtimeError::Auth(format!("invalid bearer token: {e}")))?;
            ws_request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws_stream, _) = connect_async(ws_request)
            .await
            .map_err(|e| RealtimeError::Connection(format!("websocket connect failed: {e}")))?;
        tracing::debug!(url = %request.url, room = %request.room_id, "signaling websocket connected");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();
        let ping_interval = self.ping_interval;

        let writer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => match outgoing {
                        Some(envelope) => match envelope.encode() {
                            Ok(text) => {
                                if ws_write.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!("cannot encode '{}': {e}", envelope.event),
                        },
                        None => {
                            let _ = ws_write.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        if ws_write.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("signaling writer ended");
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                let text = match ws_read.next().await {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::debug!("dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => break frame.map(|f| f.reason.to_string()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                };
                match Envelope::decode(&text) {
                    Ok(envelope) => {
                        if in_tx.send(LinkEvent::Frame(envelope)).is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::debug!("dropping malformed signaling frame: {e}"),
                }
            };
            let _ = in_tx.send(LinkEvent::Closed { reason });
        });

        Ok(Link::new(out_tx, in_rx).with_tasks(vec![writer, reader]))
    }
}
