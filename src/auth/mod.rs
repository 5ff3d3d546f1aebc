//! Authentication, contours and tenancy.
//!
//! Three modes: `none` (local development), `api_key` (two static key
//! sets, user and service), `jwt` (OIDC validation with issuer,
//! audience and JWKS). Endpoints are grouped into contours; presenting
//! the wrong class of credential on a contour is a deny, not a
//! downgrade.

mod api_key;
mod jwt;

pub use jwt::{JwtValidator, TokenClaims};

use axum::http::HeaderMap;

use crate::config::{AuthConfig, AuthMode};
use crate::error::AuthError;

/// What kind of credential authenticated the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    Anonymous,
    UserKey,
    ServiceKey,
    UserToken,
    ServiceToken,
}

impl AuthKind {
    pub fn is_service(&self) -> bool {
        matches!(self, AuthKind::ServiceKey | AuthKind::ServiceToken)
    }
}

impl std::fmt::Display for AuthKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anonymous => write!(f, "anonymous"),
            Self::UserKey => write!(f, "api_key_user"),
            Self::ServiceKey => write!(f, "api_key_service"),
            Self::UserToken => write!(f, "jwt_user"),
            Self::ServiceToken => write!(f, "jwt_service"),
        }
    }
}

/// Request-scoped identity, attached as an axum extension after the
/// auth middleware runs.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub subject: String,
    pub kind: AuthKind,
    pub scopes: Vec<String>,
    pub tenant: Option<String>,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self {
            subject: "anonymous".to_string(),
            kind: AuthKind::Anonymous,
            scopes: Vec::new(),
            tenant: None,
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Endpoint classes for contour checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contour {
    /// Meeting ingest and read endpoints, user credentials.
    User,
    /// Internal ingest endpoints, service credentials.
    Service,
    /// Admin reads, service credentials plus `admin.read` scope.
    AdminRead,
    /// Admin writes, service credentials plus `admin.write` scope.
    AdminWrite,
    /// The internal WebSocket, service credentials plus `ws.internal`.
    WsInternal,
}

impl std::fmt::Display for Contour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Service => write!(f, "service"),
            Self::AdminRead => write!(f, "admin_read"),
            Self::AdminWrite => write!(f, "admin_write"),
            Self::WsInternal => write!(f, "ws_internal"),
        }
    }
}

pub struct Authenticator {
    config: AuthConfig,
    jwt: Option<JwtValidator>,
}

impl Authenticator {
    pub fn new(config: AuthConfig) -> Self {
        let jwt = match config.mode {
            AuthMode::Jwt => Some(JwtValidator::new(config.jwt.clone())),
            _ => None,
        };
        Self { config, jwt }
    }

    pub fn mode(&self) -> AuthMode {
        self.config.mode
    }

    /// Establish who is calling.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, AuthError> {
        match self.config.mode {
            AuthMode::None => Ok(AuthContext::anonymous()),
            AuthMode::ApiKey => {
                let presented =
                    extract_key(headers).ok_or(AuthError::MissingCredentials)?;
                api_key::classify(&self.config, &presented)
            }
            AuthMode::Jwt => {
                if let Some(token) = extract_bearer(headers) {
                    let validator = self.jwt.as_ref().ok_or(AuthError::InvalidCredentials)?;
                    let claims = validator.validate(&token).await?;
                    Ok(self.context_from_claims(claims))
                } else if self.config.jwt.service_api_key_fallback {
                    // Service callers may keep using static keys outside
                    // production.
                    let presented =
                        extract_key(headers).ok_or(AuthError::MissingCredentials)?;
                    match api_key::classify(&self.config, &presented)? {
                        ctx if ctx.kind == AuthKind::ServiceKey => Ok(ctx),
                        _ => Err(AuthError::WrongContour),
                    }
                } else {
                    Err(AuthError::MissingCredentials)
                }
            }
        }
    }

    /// Check an authenticated caller against a contour.
    pub fn authorize(&self, ctx: &AuthContext, contour: Contour) -> Result<(), AuthError> {
        if ctx.kind == AuthKind::Anonymous {
            // Only reachable in auth mode `none`.
            return Ok(());
        }

        let jwt = &self.config.jwt;
        match contour {
            Contour::User => {
                if ctx.kind.is_service() {
                    return Err(AuthError::WrongContour);
                }
                if self.config.tenant_enforcement {
                    if ctx.kind == AuthKind::UserKey {
                        // Keys carry no tenant; with tenancy on they are
                        // not acceptable on user routes.
                        return Err(AuthError::WrongContour);
                    }
                    if ctx.tenant.is_none() {
                        return Err(AuthError::TenantRequired);
                    }
                }
                Ok(())
            }
            Contour::Service => {
                if !ctx.kind.is_service() {
                    return Err(AuthError::WrongContour);
                }
                Ok(())
            }
            Contour::AdminRead => self.service_with_scope(ctx, &jwt.scope_admin_read),
            Contour::AdminWrite => self.service_with_scope(ctx, &jwt.scope_admin_write),
            Contour::WsInternal => self.service_with_scope(ctx, &jwt.scope_ws_internal),
        }
    }

    fn service_with_scope(&self, ctx: &AuthContext, scope: &str) -> Result<(), AuthError> {
        if !ctx.kind.is_service() {
            return Err(AuthError::WrongContour);
        }
        // Static service keys are all-powerful by construction; scopes
        // only discriminate between service tokens.
        if ctx.kind == AuthKind::ServiceToken && !ctx.has_scope(scope) {
            return Err(AuthError::MissingScope(scope.to_string()));
        }
        Ok(())
    }

    fn context_from_claims(&self, claims: TokenClaims) -> AuthContext {
        let jwt = &self.config.jwt;
        let service = claims.scopes.iter().any(|s| {
            s == &jwt.scope_admin_read || s == &jwt.scope_admin_write || s == &jwt.scope_ws_internal
        });
        AuthContext {
            subject: claims.subject,
            kind: if service {
                AuthKind::ServiceToken
            } else {
                AuthKind::UserToken
            },
            scopes: claims.scopes,
            tenant: claims.tenant,
        }
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Credentials for key-based auth: `X-API-Key` or a bearer value.
fn extract_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| extract_bearer(headers))
}
