//! HTTP and WebSocket surface.
//!
//! Routes are grouped by contour and composed into one axum server with
//! graceful shutdown. Each group carries its own guard layer; the trace
//! guard wraps everything so `X-Trace-Id` is honored on every route.

pub mod admin;
pub mod error;
pub mod guard;
pub mod meetings;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::Contour;
use crate::engine::AppContext;

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    let user_routes = Router::new()
        .route("/v1/meetings/start", post(meetings::start_meeting))
        .route("/v1/meetings/{id}/chunks", post(meetings::post_chunk))
        .route("/v1/meetings/{id}", get(meetings::get_meeting))
        .route("/v1/meetings/{id}/artifact", get(meetings::get_artifact))
        .route("/v1/meetings/{id}/finalize", post(meetings::finalize))
        .route("/v1/meetings/{id}/artifacts/rebuild", post(meetings::rebuild))
        .route("/v1/ws", get(ws::websocket))
        .route_layer(middleware::from_fn_with_state(
            (ctx.clone(), Contour::User),
            guard::contour_guard,
        ));

    let internal_routes = Router::new()
        .route("/v1/internal/meetings/{id}/chunks", post(meetings::post_chunk))
        .route_layer(middleware::from_fn_with_state(
            (ctx.clone(), Contour::Service),
            guard::contour_guard,
        ));

    let internal_ws = Router::new()
        .route("/v1/ws/internal", get(ws::websocket))
        .route_layer(middleware::from_fn_with_state(
            (ctx.clone(), Contour::WsInternal),
            guard::contour_guard,
        ));

    let admin_routes = Router::new()
        .route("/v1/admin/queues/health", get(admin::queues_health))
        .route("/v1/admin/queues/{queue}/dlq", get(admin::dlq_list))
        .route(
            "/v1/admin/queues/{queue}/dlq/{job_id}/replay",
            post(admin::dlq_replay),
        )
        .route("/v1/admin/storage/health", get(admin::storage_health))
        .route("/v1/admin/system/readiness", get(admin::readiness))
        .route("/v1/admin/audit", get(admin::audit_trail))
        .route(
            "/v1/admin/connectors/{provider}/sessions",
            get(admin::connector_sessions),
        )
        .route(
            "/v1/admin/connectors/{provider}/circuit-breaker",
            get(admin::breaker_state),
        )
        .route(
            "/v1/admin/connectors/{provider}/circuit-breaker/reset",
            post(admin::breaker_reset),
        )
        .route(
            "/v1/admin/connectors/{provider}/reconcile",
            post(admin::reconcile_now),
        )
        .route(
            "/v1/admin/connectors/{provider}/{id}/join",
            post(admin::connector_join),
        )
        .route(
            "/v1/admin/connectors/{provider}/{id}/leave",
            post(admin::connector_leave),
        )
        .route(
            "/v1/admin/connectors/{provider}/{id}/reconnect",
            post(admin::connector_reconnect),
        )
        .route(
            "/v1/admin/connectors/{provider}/{id}/status",
            get(admin::connector_status),
        )
        .route(
            "/v1/admin/connectors/{provider}/{id}/health",
            get(admin::connector_health),
        )
        .route(
            "/v1/admin/connectors/{provider}/{id}/live-pull",
            post(admin::connector_live_pull),
        )
        .route_layer(middleware::from_fn_with_state(
            ctx.clone(),
            guard::admin_guard,
        ));

    Router::new()
        .merge(user_routes)
        .merge(internal_routes)
        .merge(internal_ws)
        .merge(admin_routes)
        .route("/health", get(health))
        .layer(middleware::from_fn(guard::trace_guard))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// The HTTP server: bind, serve, shut down gracefully.
pub struct ApiServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ApiServer {
    /// Bind the listener and spawn the server task.
    pub async fn start(router: Router, addr: SocketAddr) -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("api server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("api server shutting down");
                })
                .await
            {
                tracing::error!("api server error: {}", e);
            }
        });

        Ok(Self {
            addr: local_addr,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal graceful shutdown and wait for the server task.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
