//! Per-service IPC authentication tokens.
//!
//! The engine issues one bearer token per service at launch and hands it
//! over through the service's environment. A connection's first frame must
//! authenticate with a live token; revocation happens when the service is
//! stopped or replaced.

use std::collections::HashMap;
use std::sync::RwLock;

use base64::Engine as _;
use rand::RngCore;

/// Token length in random bytes before encoding.
const TOKEN_BYTES: usize = 32;

/// Issues and validates service auth tokens.
#[derive(Debug, Default)]
pub struct AuthTokenRegistry {
    by_token: RwLock<HashMap<String, String>>,
}

impl AuthTokenRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh token for `service`, revoking any previous one.
    #[must_use]
    pub fn issue(&self, service: &str) -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);

        if let Ok(mut tokens) = self.by_token.write() {
            tokens.retain(|_, owner| owner != service);
            tokens.insert(token.clone(), service.to_string());
        }
        tracing::debug!(service = %service, "issued IPC auth token");
        token
    }

    /// Resolves a token to its service name.
    #[must_use]
    pub fn validate(&self, token: &str) -> Option<String> {
        self.by_token
            .read()
            .ok()
            .and_then(|tokens| tokens.get(token).cloned())
    }

    /// Revokes the token of `service`, if one exists.
    pub fn revoke(&self, service: &str) {
        if let Ok(mut tokens) = self.by_token.write() {
            tokens.retain(|_, owner| owner != service);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_validate() {
        let registry = AuthTokenRegistry::new();
        let token = registry.issue("signal-hub");

        assert_eq!(registry.validate(&token), Some("signal-hub".to_string()));
        assert_eq!(registry.validate("bogus"), None);
    }

    #[test]
    fn test_reissue_revokes_previous_token() {
        let registry = AuthTokenRegistry::new();
        let first = registry.issue("signal-hub");
        let second = registry.issue("signal-hub");

        assert_eq!(registry.validate(&first), None);
        assert_eq!(registry.validate(&second), Some("signal-hub".to_string()));
    }

    #[test]
    fn test_revoke() {
        let registry = AuthTokenRegistry::new();
        let token = registry.issue("signal-hub");
        registry.revoke("signal-hub");
        assert_eq!(registry.validate(&token), None);
    }

    #[test]
    fn test_tokens_are_unique() {
        let registry = AuthTokenRegistry::new();
        let a = registry.issue("a");
        let b = registry.issue("b");
        assert_ne!(a, b);
    }
}
