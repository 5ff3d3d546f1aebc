//! Static API key matching.
//!
//! Two key sets, user and service. Comparison is constant-time so key
//! checking never leaks prefix information through timing.

use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

use crate::auth::{AuthContext, AuthKind};
use crate::config::AuthConfig;
use crate::error::AuthError;

fn matches_any(keys: &[SecretString], presented: &str) -> bool {
    keys.iter().any(|key| {
        key.expose_secret()
            .as_bytes()
            .ct_eq(presented.as_bytes())
            .into()
    })
}

/// Classify a presented key into a user or service identity.
pub fn classify(config: &AuthConfig, presented: &str) -> Result<AuthContext, AuthError> {
    if matches_any(&config.user_api_keys, presented) {
        return Ok(AuthContext {
            subject: "api-key-user".to_string(),
            kind: AuthKind::UserKey,
            scopes: Vec::new(),
            tenant: None,
        });
    }
    if matches_any(&config.service_api_keys, presented) {
        return Ok(AuthContext {
            subject: "api-key-service".to_string(),
            kind: AuthKind::ServiceKey,
            scopes: Vec::new(),
            tenant: None,
        });
    }
    Err(AuthError::InvalidCredentials)
}
