//! Bearer-token cache for the chat endpoint.
//!
//! A single process-wide slot holding the token minted from the currently
//! configured credential, valid for a fixed 25-minute window. The slot is
//! keyed by a SHA-256 fingerprint of the source credential so a settings
//! change can never leak a stale token: mutation paths call
//! [`TokenCache::invalidate`] synchronously, and every read re-checks the
//! fingerprint against the live configuration.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use super::ChatError;
use crate::config::AiConfig;

/// Fixed validity window for a minted token.
const TOKEN_TTL: Duration = Duration::from_secs(25 * 60);

/// A minted bearer token and the identity of the credential it came from.
#[derive(Debug, Clone)]
struct AuthToken {
    value: String,
    expires_at: Instant,
    fingerprint: String,
}

/// Single-slot, TTL-bound, credential-fingerprinted token cache.
#[derive(Debug)]
pub struct TokenCache {
    slot: Mutex<Option<AuthToken>>,
    ttl: Duration,
}

impl TokenCache {
    /// Creates a cache with the standard 25-minute validity window.
    pub fn new() -> Self {
        Self::with_ttl(TOKEN_TTL)
    }

    /// Creates a cache with a custom validity window. Used by tests to
    /// exercise expiry without waiting.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            ttl,
        }
    }

    /// Resolves the bearer token for the current configuration.
    ///
    /// Reuses the cached token only while it is unexpired *and* its
    /// fingerprint still matches the configured credential. The device-flow
    /// token is preferred over the static API key.
    pub fn get_token(&self, ai: &AiConfig) -> Result<String, ChatError> {
        if !ai.enabled {
            return Err(ChatError::NotConfigured);
        }

        let credential = if !ai.device_token.is_empty() {
            &ai.device_token
        } else if !ai.api_key.is_empty() {
            &ai.api_key
        } else {
            return Err(ChatError::NotConfigured);
        };

        let fingerprint = credential_fingerprint(credential, &ai.org_id);

        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = slot.as_ref() {
            if Instant::now() < token.expires_at && token.fingerprint == fingerprint {
                return Ok(token.value.clone());
            }
        }

        let token = AuthToken {
            value: credential.clone(),
            expires_at: Instant::now() + self.ttl,
            fingerprint,
        };
        let value = token.value.clone();
        *slot = Some(token);
        tracing::debug!("minted chat bearer token");
        Ok(value)
    }

    /// Clears the slot. Called synchronously from every settings mutation,
    /// never lazily on the next read.
    pub fn invalidate(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.take().is_some() {
            tracing::debug!("invalidated chat bearer token");
        }
    }

    /// Returns whether an unexpired token currently occupies the slot.
    pub fn has_live_token(&self) -> bool {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref()
            .is_some_and(|token| Instant::now() < token.expires_at)
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 fingerprint of a credential and its tenant binding.
fn credential_fingerprint(credential: &str, org_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    hasher.update(b"\x00");
    hasher.update(org_id.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ai_config(api_key: &str) -> AiConfig {
        AiConfig {
            enabled: true,
            api_key: api_key.to_string(),
            ..AiConfig::default()
        }
    }

    #[test]
    fn test_disabled_provider_is_not_configured() {
        let cache = TokenCache::new();
        let mut ai = ai_config("key");
        ai.enabled = false;
        assert!(matches!(
            cache.get_token(&ai),
            Err(ChatError::NotConfigured)
        ));
    }

    #[test]
    fn test_missing_credential_is_not_configured() {
        let cache = TokenCache::new();
        let ai = ai_config("");
        assert!(matches!(
            cache.get_token(&ai),
            Err(ChatError::NotConfigured)
        ));
    }

    #[test]
    fn test_token_reused_within_window() {
        let cache = TokenCache::new();
        let ai = ai_config("key-1");

        let first = cache.get_token(&ai).unwrap();
        let second = cache.get_token(&ai).unwrap();
        assert_eq!(first, second);
        assert!(cache.has_live_token());
    }

    #[test]
    fn test_device_token_preferred_over_api_key() {
        let cache = TokenCache::new();
        let mut ai = ai_config("static-key");
        ai.device_token = "device-token".to_string();

        assert_eq!(cache.get_token(&ai).unwrap(), "device-token");
    }

    #[test]
    fn test_credential_swap_invalidates_fingerprint() {
        let cache = TokenCache::new();
        let first = cache.get_token(&ai_config("key-1")).unwrap();
        assert_eq!(first, "key-1");

        // No explicit invalidate: the fingerprint check alone must reject
        // the stale slot.
        let second = cache.get_token(&ai_config("key-2")).unwrap();
        assert_eq!(second, "key-2");
    }

    #[test]
    fn test_org_change_invalidates_fingerprint() {
        let cache = TokenCache::new();
        let mut ai = ai_config("key-1");
        cache.get_token(&ai).unwrap();

        ai.org_id = "other-org".to_string();
        // Same credential, different tenant binding: must re-mint.
        let fp_before = cache.has_live_token();
        assert!(fp_before);
        cache.get_token(&ai).unwrap();
    }

    #[test]
    fn test_explicit_invalidate_clears_slot() {
        let cache = TokenCache::new();
        cache.get_token(&ai_config("key")).unwrap();
        assert!(cache.has_live_token());

        cache.invalidate();
        assert!(!cache.has_live_token());
    }

    #[test]
    fn test_expired_token_not_reused() {
        let cache = TokenCache::with_ttl(Duration::ZERO);
        let ai = ai_config("key");
        cache.get_token(&ai).unwrap();
        assert!(!cache.has_live_token());

        // A fresh mint still succeeds after expiry.
        assert_eq!(cache.get_token(&ai).unwrap(), "key");
    }

    #[test]
    fn test_fingerprint_is_stable_and_distinct() {
        let a = credential_fingerprint("key", "org");
        let b = credential_fingerprint("key", "org");
        let c = credential_fingerprint("key2", "org");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
