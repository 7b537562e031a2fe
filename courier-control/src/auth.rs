//! Authentication for the admin API
//!
//! Provides token-based authentication using SHA-256 hashed bearer tokens.
//! Tokens are hashed before storage in configuration to prevent token leakage.

use hex::encode;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::ControlError;

/// Actor recorded for requests when authentication is disabled
pub const ANONYMOUS_ACTOR: &str = "anonymous";

/// A token hash and the operator it identifies
#[derive(Debug, Clone, Deserialize)]
pub struct TokenBinding {
    /// Name recorded in the audit trail for requests bearing this token
    pub actor: String,

    /// Lowercase hex SHA-256 of the plaintext token
    pub token_hash: String,
}

/// Authentication configuration for the admin API
///
/// # Security
///
/// - Tokens are stored as SHA-256 hashes, not plaintext
/// - Incoming tokens are hashed and compared against configured hashes
/// - Authentication failures are logged for audit purposes
///
/// # Example Configuration
///
/// ```ron
/// auth: (
///     enabled: true,
///     tokens: [
///         // SHA-256 hash of "test-token"
///         (actor: "ops", token_hash: "4c5dc9b7708905f77f5e5d16316b5dfb425e68cb326dcd55a860e90a7707031e"),
///     ],
/// )
/// ```
///
/// # Generating Token Hashes
///
/// ```bash
/// courierctl hash-token your-secret-token
/// # or
/// echo -n "your-secret-token" | sha256sum
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ControlAuthConfig {
    /// Enable or disable authentication
    ///
    /// Only disable this when the listener is reachable from trusted hosts
    /// alone; every request is then attributed to [`ANONYMOUS_ACTOR`].
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub tokens: Vec<TokenBinding>,
}

const fn default_enabled() -> bool {
    true
}

impl Default for ControlAuthConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tokens: Vec::new(),
        }
    }
}

/// SHA-256 of `token` as lowercase hex, the form stored in configuration
///
/// ```
/// # use courier_control::hash_token;
/// assert_eq!(
///     hash_token("test-token"),
///     "4c5dc9b7708905f77f5e5d16316b5dfb425e68cb326dcd55a860e90a7707031e"
/// );
/// ```
#[must_use]
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    encode(hasher.finalize())
}

impl ControlAuthConfig {
    #[must_use]
    pub const fn requires_auth(&self) -> bool {
        self.enabled
    }

    /// The actor bound to `token`, if any
    #[must_use]
    pub fn actor_for(&self, token: &str) -> Option<&str> {
        let hash = hash_token(token);
        self.tokens
            .iter()
            .find(|binding| binding.token_hash.eq_ignore_ascii_case(&hash))
            .map(|binding| binding.actor.as_str())
    }

    /// Resolve the actor for a request carrying an optional bearer token
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Authentication is enabled but no token provided
    /// - Authentication is enabled and token is invalid
    pub fn authenticate(&self, token: Option<&str>) -> Result<String, ControlError> {
        if !self.enabled {
            return Ok(ANONYMOUS_ACTOR.to_string());
        }

        let token = token.ok_or(ControlError::MissingToken)?;
        self.actor_for(token)
            .map(ToString::to_string)
            .ok_or(ControlError::InvalidToken)
    }
}
