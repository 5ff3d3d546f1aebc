//! Request guards: trace propagation and contour enforcement.
//!
//! Applied as route layers via `axum::middleware::from_fn_with_state`.
//! Every auth decision, allow or deny, lands in the audit trail.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;

use crate::api::error::ApiError;
use crate::audit::{AuditDecision, AuditEvent};
use crate::auth::{AuthContext, Contour};
use crate::engine::AppContext;
use crate::trace::{TRACE_HEADER, TraceContext, is_valid_trace_id};

/// Accept and echo `X-Trace-Id`; start a fresh trace otherwise.
pub async fn trace_guard(mut request: Request, next: Next) -> Response {
    let trace = request
        .headers()
        .get(TRACE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| is_valid_trace_id(v))
        .map(TraceContext::from_trace_id)
        .unwrap_or_else(TraceContext::new_root);

    let trace_id = trace.trace_id.clone();
    request.extensions_mut().insert(trace);
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_HEADER, value);
    }
    response
}

/// Authenticate and enforce a fixed contour for a route group.
pub async fn contour_guard(
    State((ctx, contour)): State<(Arc<AppContext>, Contour)>,
    request: Request,
    next: Next,
) -> Response {
    enforce(ctx, contour, request, next).await
}

/// Admin routes: `admin.read` for reads, `admin.write` for writes.
pub async fn admin_guard(
    State(ctx): State<Arc<AppContext>>,
    request: Request,
    next: Next,
) -> Response {
    let contour = if request.method().is_safe() {
        Contour::AdminRead
    } else {
        Contour::AdminWrite
    };
    enforce(ctx, contour, request, next).await
}

async fn enforce(
    ctx: Arc<AppContext>,
    contour: Contour,
    mut request: Request,
    next: Next,
) -> Response {
    let endpoint = request.uri().path().to_string();
    let method = request.method().to_string();

    let auth_ctx = match ctx.auth.authenticate(request.headers()).await {
        Ok(auth_ctx) => auth_ctx,
        Err(e) => {
            audit_deny(&ctx, &endpoint, &method, "unknown", "none", &e.to_string()).await;
            return ApiError::from(e).into_response();
        }
    };

    if let Err(e) = ctx.auth.authorize(&auth_ctx, contour) {
        audit_deny(
            &ctx,
            &endpoint,
            &method,
            &auth_ctx.subject,
            &auth_ctx.kind.to_string(),
            &e.to_string(),
        )
        .await;
        return ApiError::from(e).into_response();
    }

    ctx.audit
        .emit(AuditEvent {
            ts: Utc::now(),
            endpoint,
            method,
            subject: auth_ctx.subject.clone(),
            auth_type: auth_ctx.kind.to_string(),
            decision: AuditDecision::Allow,
            reason: format!("contour {contour}"),
        })
        .await;

    request.extensions_mut().insert(auth_ctx);
    next.run(request).await
}

async fn audit_deny(
    ctx: &AppContext,
    endpoint: &str,
    method: &str,
    subject: &str,
    auth_type: &str,
    reason: &str,
) {
    ctx.audit
        .emit(AuditEvent {
            ts: Utc::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            subject: subject.to_string(),
            auth_type: auth_type.to_string(),
            decision: AuditDecision::Deny,
            reason: reason.to_string(),
        })
        .await;
}

/// Tenant fence for meeting access: with enforcement on, the caller's
/// tenant must match the meeting's.
pub fn ensure_tenant(
    ctx: &AppContext,
    auth: &AuthContext,
    meeting_tenant: Option<&str>,
) -> Result<(), ApiError> {
    if !ctx.settings.auth.tenant_enforcement {
        return Ok(());
    }
    if auth.kind.is_service() || auth.kind == crate::auth::AuthKind::Anonymous {
        return Ok(());
    }
    match (auth.tenant.as_deref(), meeting_tenant) {
        (Some(caller), Some(owner)) if caller == owner => Ok(()),
        _ => Err(crate::error::AuthError::TenantMismatch.into()),
    }
}
