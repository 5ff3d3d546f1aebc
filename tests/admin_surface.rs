//! Admin surface behavior over the router: queue health, DLQ
//! inspection and replay, storage health, connector endpoints.

mod common;

use std::sync::Arc;

use axum::http::StatusCode;
use serde_json::json;

use common::{
    assert_status, body_json, connector_context, memory_context, send_empty, send_json,
    test_settings,
};
use meetscribe::api::build_router;
use meetscribe::queue::{Broker, JobEnvelope, PipelineStep};
use meetscribe::trace::TraceContext;

#[tokio::test]
async fn test_queue_health_reports_all_queues() {
    let ctx = memory_context(test_settings());
    let router = build_router(ctx.clone());

    let response = send_empty(&router, "GET", "/v1/admin/queues/health", &[]).await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    for queue in ["q:stt", "q:enhancer", "q:analytics", "q:delivery"] {
        assert_eq!(body["queues"][queue]["depth"], 0, "queue {queue}");
        assert_eq!(body["queues"][queue]["dlq"], 0, "queue {queue}");
    }
    assert!(body["metrics"]["stt"]["processed"].is_u64());
}

#[tokio::test]
async fn test_dlq_inspection_and_replay() {
    let ctx = memory_context(test_settings());
    let router = build_router(ctx.clone());

    // Park a job on the DLQ by exhausting its attempt budget.
    let job = JobEnvelope::new(
        "m-dlq",
        PipelineStep::Stt,
        json!({ "chunk_seq": 0 }),
        1,
        TraceContext::new_root(),
    );
    ctx.broker.enqueue(&job).await.expect("enqueue works");
    let reserved = ctx
        .broker
        .reserve("q:stt", "w", std::time::Duration::from_secs(5))
        .await
        .expect("reserve works")
        .expect("job available");
    ctx.broker
        .nack("q:stt", reserved.job_id, "stt exploded", std::time::Duration::ZERO)
        .await
        .expect("nack works");

    let response = send_empty(&router, "GET", "/v1/admin/queues/q:stt/dlq", &[]).await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    let entries = body["entries"].as_array().expect("entries array");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["reason"], "stt exploded");

    let path = format!("/v1/admin/queues/q:stt/dlq/{}/replay", job.job_id);
    let response = send_empty(&router, "POST", &path, &[]).await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["attempt"], 0);
    assert_eq!(body["trace_id"], job.trace.trace_id);

    // Replayed: DLQ is empty, the job is back on the main queue.
    let response = send_empty(&router, "GET", "/v1/admin/queues/health", &[]).await;
    let body = body_json(response).await;
    assert_eq!(body["queues"]["q:stt"]["dlq"], 0);
    assert_eq!(body["queues"]["q:stt"]["depth"], 1);

    // Replaying a job that is not in the DLQ is a 404.
    let response = send_empty(&router, "POST", &path, &[]).await;
    assert_status(&response, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_storage_health_and_readiness() {
    let ctx = memory_context(test_settings());
    let router = build_router(ctx.clone());

    let response = send_empty(&router, "GET", "/v1/admin/storage/health", &[]).await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["store"]["ok"], true);
    assert_eq!(body["blob"]["ok"], true);

    let response = send_empty(&router, "GET", "/v1/admin/system/readiness", &[]).await;
    assert_status(&response, StatusCode::OK);
    assert_eq!(body_json(response).await["ready"], true);
}

#[tokio::test]
async fn test_connector_endpoints_when_disabled() {
    let ctx = memory_context(test_settings());
    let router = build_router(ctx.clone());

    let response = send_empty(
        &router,
        "GET",
        "/v1/admin/connectors/meetbridge/sessions",
        &[],
    )
    .await;
    assert_status(&response, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["code"], "connector_disabled");
}

#[tokio::test]
async fn test_connector_admin_round_trip() {
    let provider = Arc::new(common::ScriptedConnector::new());
    let mut settings = test_settings();
    settings.connector.enabled = true;
    let ctx = connector_context(settings, provider.clone());
    let router = build_router(ctx.clone());

    send_json(
        &router,
        "POST",
        "/v1/meetings/start",
        json!({ "meeting_id": "m-admin", "mode": "realtime", "auto_join_connector": false }),
        &[],
    )
    .await;

    // Unknown provider segment is a 404.
    let response = send_empty(
        &router,
        "POST",
        "/v1/admin/connectors/otherbridge/m-admin/join",
        &[],
    )
    .await;
    assert_status(&response, StatusCode::NOT_FOUND);

    let response = send_empty(
        &router,
        "POST",
        "/v1/admin/connectors/meetbridge/m-admin/join",
        &[],
    )
    .await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["session"]["state"], "connected");
    assert_eq!(body["reused"], false);

    let response = send_empty(
        &router,
        "GET",
        "/v1/admin/connectors/meetbridge/m-admin/status",
        &[],
    )
    .await;
    assert_eq!(body_json(response).await["session"]["state"], "connected");

    let response = send_empty(
        &router,
        "GET",
        "/v1/admin/connectors/meetbridge/sessions",
        &[],
    )
    .await;
    let body = body_json(response).await;
    assert_eq!(body["sessions"].as_array().expect("sessions").len(), 1);

    let response = send_empty(
        &router,
        "GET",
        "/v1/admin/connectors/meetbridge/circuit-breaker",
        &[],
    )
    .await;
    assert_eq!(body_json(response).await["state"], "closed");

    let response = send_json(
        &router,
        "POST",
        "/v1/admin/connectors/meetbridge/circuit-breaker/reset",
        json!({ "reason": "ops drill" }),
        &[],
    )
    .await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    assert!(
        body["last_reset_reason"]
            .as_str()
            .expect("reset reason")
            .contains("ops drill")
    );

    let response = send_empty(
        &router,
        "POST",
        "/v1/admin/connectors/meetbridge/m-admin/live-pull",
        &[],
    )
    .await;
    assert_status(&response, StatusCode::OK);

    let response = send_empty(
        &router,
        "POST",
        "/v1/admin/connectors/meetbridge/reconcile",
        &[],
    )
    .await;
    assert_status(&response, StatusCode::OK);

    let response = send_empty(
        &router,
        "POST",
        "/v1/admin/connectors/meetbridge/m-admin/leave",
        &[],
    )
    .await;
    assert_status(&response, StatusCode::OK);
    let response = send_empty(
        &router,
        "GET",
        "/v1/admin/connectors/meetbridge/m-admin/status",
        &[],
    )
    .await;
    assert_eq!(body_json(response).await["session"], serde_json::Value::Null);
}
