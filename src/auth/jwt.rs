//! JWT validation against an OIDC issuer.
//!
//! RS256 tokens are verified against a cached JWKS; an optional shared
//! HS256 secret covers development setups without an issuer. Issuer and
//! audience are always enforced.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::config::JwtConfig;
use crate::error::AuthError;

/// How long a fetched JWKS stays fresh.
const JWKS_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct TokenClaims {
    pub subject: String,
    pub scopes: Vec<String>,
    pub tenant: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kty: String,
    kid: Option<String>,
    #[serde(default)]
    n: String,
    #[serde(default)]
    e: String,
}

struct CachedKeys {
    by_kid: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

pub struct JwtValidator {
    config: JwtConfig,
    http: reqwest::Client,
    cache: RwLock<Option<CachedKeys>>,
}

impl JwtValidator {
    pub fn new(config: JwtConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            cache: RwLock::new(None),
        }
    }

    pub async fn validate(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::Token(e.to_string()))?;

        let (key, algorithm) = match (&self.config.hs256_secret, header.alg) {
            (Some(secret), Algorithm::HS256) => (
                DecodingKey::from_secret(secret.expose_secret().as_bytes()),
                Algorithm::HS256,
            ),
            _ => {
                let kid = header
                    .kid
                    .ok_or_else(|| AuthError::Token("token header has no kid".to_string()))?;
                (self.key_for(&kid).await?, Algorithm::RS256)
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);

        let data = decode::<serde_json::Value>(token, &key, &validation)
            .map_err(|e| AuthError::Token(e.to_string()))?;
        Ok(self.extract_claims(&data.claims))
    }

    fn extract_claims(&self, claims: &serde_json::Value) -> TokenClaims {
        let subject = claims["sub"].as_str().unwrap_or("unknown").to_string();

        // `scope` as a space-separated string (RFC 8693 style) or `scp`
        // as an array; either spelling is accepted.
        let mut scopes: Vec<String> = claims["scope"]
            .as_str()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        if let Some(array) = claims["scp"].as_array() {
            scopes.extend(array.iter().filter_map(|v| v.as_str()).map(str::to_string));
        }

        let tenant = claims[&self.config.tenant_claim]
            .as_str()
            .map(str::to_string);

        TokenClaims {
            subject,
            scopes,
            tenant,
        }
    }

    async fn key_for(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < JWKS_TTL {
                    if let Some(key) = cached.by_kid.get(kid) {
                        return Ok(key.clone());
                    }
                }
            }
        }

        // Miss or stale: refetch once, then look the kid up again.
        self.refresh_jwks().await?;
        let cache = self.cache.read().await;
        cache
            .as_ref()
            .and_then(|c| c.by_kid.get(kid))
            .cloned()
            .ok_or_else(|| AuthError::Token(format!("unknown signing key {kid}")))
    }

    async fn refresh_jwks(&self) -> Result<(), AuthError> {
        if self.config.jwks_url.is_empty() {
            return Err(AuthError::Jwks("JWT_JWKS_URL is not configured".to_string()));
        }

        let jwks: Jwks = self
            .http
            .get(&self.config.jwks_url)
            .send()
            .await
            .map_err(|e| AuthError::Jwks(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::Jwks(e.to_string()))?;

        let mut by_kid = HashMap::new();
        for jwk in jwks.keys {
            if jwk.kty != "RSA" {
                continue;
            }
            let Some(kid) = jwk.kid else { continue };
            match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                Ok(key) => {
                    by_kid.insert(kid, key);
                }
                Err(e) => {
                    tracing::warn!(kid = %kid, "skipping unusable JWKS key: {}", e);
                }
            }
        }

        tracing::debug!(keys = by_kid.len(), "JWKS refreshed");
        *self.cache.write().await = Some(CachedKeys {
            by_kid,
            fetched_at: Instant::now(),
        });
        Ok(())
    }
}
