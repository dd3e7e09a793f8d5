//! Client for the trip REST API.
//!
//! Only the two lookups the real-time core depends on are covered: the
//! roster of trip members with display metadata, and chat history.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::AuthContext;
use crate::errors::RealtimeError;
use crate::events::ChatMessage;

/// A trip member as listed by the REST API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub participant_id: String,
    pub display_name: String,
    #[serde(default)]
    pub color_tag: Option<String>,
}

#[async_trait]
pub trait RosterSource: Send + Sync {
    async fn fetch_roster(&self, room_id: &str) -> Result<Vec<RosterEntry>, RealtimeError>;

    async fn fetch_chat_history(&self, _room_id: &str) -> Result<Vec<ChatMessage>, RealtimeError> {
        Ok(Vec::new())
    }
}

/// In-memory roster, for shells without an API and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticRoster {
    pub entries: Vec<RosterEntry>,
    pub history: Vec<ChatMessage>,
}

#[async_trait]
impl RosterSource for StaticRoster {
    async fn fetch_roster(&self, _room_id: &str) -> Result<Vec<RosterEntry>, RealtimeError> {
        Ok(self.entries.clone())
    }

    async fn fetch_chat_history(&self, _room_id: &str) -> Result<Vec<ChatMessage>, RealtimeError> {
        Ok(self.history.clone())
    }
}

pub struct TripApi {
    base_url: Url,
    http: reqwest::Client,
    auth: Arc<dyn AuthContext>,
}

impl TripApi {
    pub fn new(base_url: Url, auth: Arc<dyn AuthContext>) -> Self {
        Self {
            base_url: with_trailing_slash(base_url),
            http: reqwest::Client::new(),
            auth,
        }
    }

    /// `{base}/trips/{room}/{leaf}` with the room id percent-encoded.
    fn endpoint(&self, room_id: &str, leaf: &str) -> Result<Url, RealtimeError> {
        let path = format!("trips/{}/{leaf}", urlencoding::encode(room_id));
        self.base_url
            .join(&path)
            .map_err(|e| RealtimeError::InvalidUrl(format!("{path}: {e}")))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, RealtimeError> {
        tracing::debug!("GET {url}");
        let mut request = self.http.get(url.clone());
        if let Some(token) = self.auth.bearer_token() {
            request = request.bearer_auth(token);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| RealtimeError::Http(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RealtimeError::Auth(format!("trip API returned status {status}")));
        }
        if !status.is_success() {
            return Err(RealtimeError::Http(format!("{url} returned status {status}")));
        }

        resp.json()
            .await
            .map_err(|e| RealtimeError::Http(format!("invalid response from {url}: {e}")))
    }
}

#[async_trait]
impl RosterSource for TripApi {
    async fn fetch_roster(&self, room_id: &str) -> Result<Vec<RosterEntry>, RealtimeError> {
        let url = self.endpoint(room_id, "participants")?;
        self.get_json(url).await
    }

    async fn fetch_chat_history(&self, room_id: &str) -> Result<Vec<ChatMessage>, RealtimeError> {
        let url = self.endpoint(room_id, "messages")?;
        self.get_json(url).await
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
