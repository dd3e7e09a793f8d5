use std::sync::LazyLock;
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use url::Url;

use crate::errors::RealtimeError;

pub const SIGNALING_URL_VAR: &str = "TRIPSYNC_SIGNALING_URL";
pub const API_URL_VAR: &str = "TRIPSYNC_API_URL";
pub const LOCATION_INTERVAL_VAR: &str = "TRIPSYNC_LOCATION_INTERVAL_MS";
pub const RECONNECT_ATTEMPTS_VAR: &str = "TRIPSYNC_RECONNECT_ATTEMPTS";
pub const RECONNECT_DELAY_VAR: &str = "TRIPSYNC_RECONNECT_DELAY_MS";
pub const ICE_SERVERS_VAR: &str = "TRIPSYNC_ICE_SERVERS";

/// STUN server used when none is configured.
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Default period between two published location samples.
pub const DEFAULT_LOCATION_INTERVAL: Duration = Duration::from_secs(10);

static ROOM_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("room id pattern"));

/// Reject room identifiers that cannot be used as a path segment.
pub fn validate_room_id(room_id: &str) -> Result<(), RealtimeError> {
    if ROOM_ID.is_match(room_id) {
        Ok(())
    } else {
        Err(RealtimeError::Room(format!("invalid room id: '{room_id}'")))
    }
}

/// Caller-side reconnect policy layered over the non-reconnecting session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Exponential backoff for the given 1-based attempt, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// `delay_for` plus up to 25% random jitter.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        let spread = delay.as_millis() as u64 / 4;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// WebSocket endpoint of the signaling backend (ws:// or wss://).
    pub signaling_url: Url,
    /// Base URL of the trip REST API.
    pub api_url: Url,
    pub location_interval: Duration,
    pub reconnect: Option<ReconnectPolicy>,
    /// STUN/TURN urls handed to the peer connection backend.
    pub ice_servers: Vec<String>,
}

impl ClientConfig {
    pub fn new(signaling_url: &str, api_url: &str) -> Result<Self, RealtimeError> {
        Ok(Self {
            signaling_url: Self::websocket_url(signaling_url)?,
            api_url: Url::parse(api_url)
                .map_err(|e| RealtimeError::InvalidUrl(format!("{api_url}: {e}")))?,
            location_interval: DEFAULT_LOCATION_INTERVAL,
            reconnect: None,
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
        })
    }

    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self, RealtimeError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RealtimeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let signaling = lookup(SIGNALING_URL_VAR)
            .ok_or_else(|| RealtimeError::Config(format!("{SIGNALING_URL_VAR} is not set")))?;
        let api = lookup(API_URL_VAR)
            .ok_or_else(|| RealtimeError::Config(format!("{API_URL_VAR} is not set")))?;
        let mut config = Self::new(&signaling, &api)?;

        if let Some(ms) = lookup(LOCATION_INTERVAL_VAR) {
            let ms = parse_millis(LOCATION_INTERVAL_VAR, &ms)?;
            if ms == 0 {
                return Err(RealtimeError::Config(format!(
                    "{LOCATION_INTERVAL_VAR} must be positive"
                )));
            }
            config.location_interval = Duration::from_millis(ms);
        }

        if let Some(attempts) = lookup(RECONNECT_ATTEMPTS_VAR) {
            let max_attempts: u32 = attempts.trim().parse().map_err(|_| {
                RealtimeError::Config(format!("{RECONNECT_ATTEMPTS_VAR}: not a number: {attempts}"))
            })?;
            if max_attempts > 0 {
                let mut policy = ReconnectPolicy {
                    max_attempts,
                    ..ReconnectPolicy::default()
                };
                if let Some(ms) = lookup(RECONNECT_DELAY_VAR) {
                    policy.base_delay = Duration::from_millis(parse_millis(RECONNECT_DELAY_VAR, &ms)?);
                }
                config.reconnect = Some(policy);
            }
        }

        if let Some(servers) = lookup(ICE_SERVERS_VAR) {
            config.ice_servers = parse_ice_servers(&servers)?;
        }

        Ok(config)
    }

    /// Accept http(s) or ws(s) input and return the WebSocket form.
    pub fn websocket_url(input: &str) -> Result<Url, RealtimeError> {
        let trimmed = input.trim();
        let rewritten = if let Some(rest) = trimmed.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = trimmed.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            trimmed.to_string()
        };
        let url = Url::parse(&rewritten)
            .map_err(|e| RealtimeError::InvalidUrl(format!("{input}: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(RealtimeError::InvalidUrl(format!(
                "unsupported signaling scheme '{other}'"
            ))),
        }
    }
}

fn parse_millis(var: &str, value: &str) -> Result<u64, RealtimeError> {
    value
        .trim()
        .parse()
        .map_err(|_| RealtimeError::Config(format!("{var}: not a number: {value}")))
}

/// Comma-separated `stun:`/`turn:`/`turns:` urls. An empty list disables
/// ICE servers (host candidates only).
fn parse_ice_servers(value: &str) -> Result<Vec<String>, RealtimeError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|server| {
            if ["stun:", "turn:", "turns:"].iter().any(|p| server.starts_with(p)) {
                Ok(server.to_string())
            } else {
                Err(RealtimeError::Config(format!(
                    "{ICE_SERVERS_VAR}: unsupported ice server '{server}'"
                )))
            }
        })
        .collect()
}
