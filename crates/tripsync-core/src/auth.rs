//! Identity capability injected into the session layer.
//!
//! Sign-in itself is handled by an external identity provider; the core
//! only needs to know who the local participant is and which bearer token
//! to present to the signaling endpoint and the trip API.

use crate::errors::RealtimeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub participant_id: String,
    pub display_name: String,
}

pub trait AuthContext: Send + Sync {
    fn identity(&self) -> Option<Identity>;

    fn bearer_token(&self) -> Option<String>;

    fn is_signed_in(&self) -> bool {
        self.identity().is_some()
    }
}

/// Fixed identity, for shells that resolve sign-in up front and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticAuth {
    identity: Option<Identity>,
    token: Option<String>,
}

impl StaticAuth {
    pub fn signed_in(
        participant_id: impl Into<String>,
        display_name: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            identity: Some(Identity {
                participant_id: participant_id.into(),
                display_name: display_name.into(),
            }),
            token,
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl AuthContext for StaticAuth {
    fn identity(&self) -> Option<Identity> {
        self.identity.clone()
    }

    fn bearer_token(&self) -> Option<String> {
        self.token.clone()
    }
}

/// Resolve the local identity or fail with [`RealtimeError::Auth`].
pub fn require_identity(auth: &dyn AuthContext) -> Result<Identity, RealtimeError> {
    auth.identity()
        .filter(|id| !id.participant_id.trim().is_empty())
        .ok_or_else(|| RealtimeError::Auth("not signed in".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_is_rejected() {
        let auth = StaticAuth::anonymous();
        assert!(!auth.is_signed_in());
        assert_eq!(
            require_identity(&auth),
            Err(RealtimeError::Auth("not signed in".into()))
        );
    }

    #[test]
    fn blank_participant_id_is_rejected() {
        let auth = StaticAuth::signed_in("  ", "Ghost", None);
        assert!(require_identity(&auth).is_err());
    }

    #[test]
    fn signed_in_identity_resolves() {
        let auth = StaticAuth::signed_in("alice", "Alice", Some("tok".into()));
        let id = require_identity(&auth).unwrap();
        assert_eq!(id.participant_id, "alice");
        assert_eq!(auth.bearer_token().as_deref(), Some("tok"));
    }
}
