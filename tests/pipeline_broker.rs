//! Pipeline behavior in broker mode: jobs flow through the queues and
//! a worker fleet, and artifacts come out the same as inline mode.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::watch;

use common::{memory_context, test_settings};
use meetscribe::config::QueueMode;
use meetscribe::engine::AppContext;
use meetscribe::ingest::{IngestPayload, StartMeeting};
use meetscribe::pipeline::{
    AnalyticsHandler, DeliveryHandler, EnhanceHandler, QueueDispatcher, SttHandler,
};
use meetscribe::queue::{Broker, JobHandler, PipelineStep, Worker};
use meetscribe::store::{ArtifactKind, MeetingMode, MeetingStatus, MeetingStore};
use meetscribe::trace::TraceContext;

fn broker_context() -> Arc<AppContext> {
    let mut settings = test_settings();
    settings.queue.mode = QueueMode::Broker;
    memory_context(settings)
}

/// Spawn the same worker fleet the engine would.
fn spawn_workers(ctx: &Arc<AppContext>) -> (watch::Sender<bool>, Vec<tokio::task::JoinHandle<()>>) {
    let (shutdown_tx, _) = watch::channel(false);
    let q = &ctx.settings.queue;
    let dispatcher = QueueDispatcher::new(ctx.broker.clone(), q.max_attempts);
    let handlers: Vec<(PipelineStep, Arc<dyn JobHandler>)> = vec![
        (
            PipelineStep::Stt,
            Arc::new(SttHandler::new(ctx.stages.clone(), dispatcher.clone())),
        ),
        (
            PipelineStep::Enhance,
            Arc::new(EnhanceHandler::new(ctx.stages.clone(), dispatcher.clone())),
        ),
        (
            PipelineStep::Analytics,
            Arc::new(AnalyticsHandler::new(ctx.stages.clone(), dispatcher.clone())),
        ),
        (
            PipelineStep::Delivery,
            Arc::new(DeliveryHandler::new(ctx.stages.clone())),
        ),
    ];

    let mut handles = Vec::new();
    for (step, handler) in handlers {
        let worker = Arc::new(Worker::new(
            step.queue_name(),
            handler,
            ctx.broker.clone(),
            ctx.metrics.clone(),
            q.workers_per_stage,
            q.visibility_timeout,
            q.base_backoff,
            q.drain_deadline,
        ));
        handles.push(tokio::spawn(worker.run(shutdown_tx.subscribe())));
    }
    (shutdown_tx, handles)
}

async fn wait_for_status(
    ctx: &Arc<AppContext>,
    meeting_id: &str,
    expected: MeetingStatus,
) -> bool {
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let meeting = ctx
            .store
            .get_meeting(meeting_id)
            .await
            .expect("store reads")
            .expect("meeting exists");
        if meeting.status == expected {
            return true;
        }
    }
    false
}

#[tokio::test]
async fn test_broker_mode_end_to_end() {
    let ctx = broker_context();
    let (shutdown_tx, handles) = spawn_workers(&ctx);

    ctx.ingest
        .start_meeting(StartMeeting {
            meeting_id: Some("m-broker".to_string()),
            mode: MeetingMode::Batch,
            tenant: None,
            delivery_recipient: None,
        })
        .await
        .expect("meeting starts");

    let trace = TraceContext::new_root();
    for text in ["first part", "second part", "third part"] {
        ctx.ingest
            .ingest_chunk(
                "m-broker",
                IngestPayload::Bytes(text.as_bytes().to_vec()),
                &trace,
            )
            .await
            .expect("chunk ingests");
    }
    ctx.ingest
        .finalize_meeting("m-broker", &trace)
        .await
        .expect("finalize accepted");

    assert!(
        wait_for_status(&ctx, "m-broker", MeetingStatus::Done).await,
        "pipeline should reach done"
    );

    let enhanced = ctx
        .store
        .get_artifact("m-broker", ArtifactKind::EnhancedTranscript)
        .await
        .expect("store reads")
        .expect("enhanced transcript exists");
    assert_eq!(
        enhanced.data["text"].as_str(),
        Some("First part second part third part.")
    );

    let report = ctx
        .store
        .get_artifact("m-broker", ArtifactKind::Report)
        .await
        .expect("store reads")
        .expect("report exists");
    assert_eq!(report.data["word_count"], 6);

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
}

#[tokio::test]
async fn test_broker_and_inline_artifacts_match() {
    // Inline run.
    let inline_ctx = memory_context(test_settings());
    inline_ctx
        .ingest
        .start_meeting(StartMeeting {
            meeting_id: Some("m-cmp".to_string()),
            mode: MeetingMode::Batch,
            tenant: None,
            delivery_recipient: None,
        })
        .await
        .expect("meeting starts");
    let trace = TraceContext::new_root();
    for text in ["one two", "three four"] {
        inline_ctx
            .ingest
            .ingest_chunk("m-cmp", IngestPayload::Bytes(text.as_bytes().to_vec()), &trace)
            .await
            .expect("chunk ingests");
    }
    inline_ctx
        .ingest
        .finalize_meeting("m-cmp", &trace)
        .await
        .expect("finalize runs");

    // Broker run over the same input.
    let broker_ctx = broker_context();
    let (shutdown_tx, handles) = spawn_workers(&broker_ctx);
    broker_ctx
        .ingest
        .start_meeting(StartMeeting {
            meeting_id: Some("m-cmp".to_string()),
            mode: MeetingMode::Batch,
            tenant: None,
            delivery_recipient: None,
        })
        .await
        .expect("meeting starts");
    for text in ["one two", "three four"] {
        broker_ctx
            .ingest
            .ingest_chunk("m-cmp", IngestPayload::Bytes(text.as_bytes().to_vec()), &trace)
            .await
            .expect("chunk ingests");
    }
    broker_ctx
        .ingest
        .finalize_meeting("m-cmp", &trace)
        .await
        .expect("finalize accepted");
    assert!(wait_for_status(&broker_ctx, "m-cmp", MeetingStatus::Done).await);

    for kind in [
        ArtifactKind::RawTranscript,
        ArtifactKind::EnhancedTranscript,
        ArtifactKind::Report,
        ArtifactKind::Scorecard,
    ] {
        let inline_artifact = inline_ctx
            .store
            .get_artifact("m-cmp", kind)
            .await
            .expect("store reads")
            .expect("inline artifact exists");
        let broker_artifact = broker_ctx
            .store
            .get_artifact("m-cmp", kind)
            .await
            .expect("store reads")
            .expect("broker artifact exists");
        assert_eq!(
            inline_artifact.data, broker_artifact.data,
            "artifact {kind} should be identical across modes"
        );
    }

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
}

#[tokio::test]
async fn test_crashed_worker_job_is_redelivered_and_idempotent() {
    // Simulate a worker that does the STT work but dies before acking:
    // the job must come back after its visibility lease expires, and the
    // re-run must not duplicate the transcript segment.
    let ctx = broker_context();
    let trace = TraceContext::new_root();

    ctx.ingest
        .start_meeting(StartMeeting {
            meeting_id: Some("m-crash".to_string()),
            mode: MeetingMode::Batch,
            tenant: None,
            delivery_recipient: None,
        })
        .await
        .expect("meeting starts");
    ctx.ingest
        .ingest_chunk("m-crash", IngestPayload::Bytes(b"crashy words".to_vec()), &trace)
        .await
        .expect("chunk ingests");
    ctx.ingest
        .finalize_meeting("m-crash", &trace)
        .await
        .expect("finalize accepted");

    // "Crash": reserve the job, perform the stage's side effects, never ack.
    let job = ctx
        .broker
        .reserve("q:stt", "doomed-worker", Duration::from_millis(50))
        .await
        .expect("reserve works")
        .expect("stt job queued");
    ctx.stages
        .run_stt("m-crash", job.payload["chunk_seq"].as_u64().expect("seq"))
        .await
        .expect("stt runs");
    tokio::time::sleep(Duration::from_millis(80)).await;

    // A healthy fleet picks the job back up and completes the pipeline.
    let (shutdown_tx, handles) = spawn_workers(&ctx);
    assert!(wait_for_status(&ctx, "m-crash", MeetingStatus::Done).await);

    let raw = ctx
        .store
        .get_artifact("m-crash", ArtifactKind::RawTranscript)
        .await
        .expect("store reads")
        .expect("raw transcript exists");
    assert_eq!(
        raw.data["segments"]
            .as_object()
            .expect("segments object")
            .len(),
        1
    );

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
}

#[tokio::test]
async fn test_chunk_after_finalize_still_completes_pipeline() {
    // Finalize before the workers have transcribed anything: the last
    // STT job must unlock the enhancer on its own.
    let ctx = broker_context();

    ctx.ingest
        .start_meeting(StartMeeting {
            meeting_id: Some("m-late".to_string()),
            mode: MeetingMode::Batch,
            tenant: None,
            delivery_recipient: None,
        })
        .await
        .expect("meeting starts");
    let trace = TraceContext::new_root();
    ctx.ingest
        .ingest_chunk("m-late", IngestPayload::Bytes(b"late words".to_vec()), &trace)
        .await
        .expect("chunk ingests");
    ctx.ingest
        .finalize_meeting("m-late", &trace)
        .await
        .expect("finalize accepted");

    // Workers start only after finalize.
    let (shutdown_tx, handles) = spawn_workers(&ctx);
    assert!(wait_for_status(&ctx, "m-late", MeetingStatus::Done).await);

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
}
