//! Process wiring.
//!
//! [`AppContext`] is the startup-built context: every component selected
//! from configuration, constructed once, and passed explicitly. Tests
//! assemble alternative contexts from memory implementations.
//! [`Engine`] owns the background tasks (workers, reconciler) and the
//! HTTP server, and tears them down cooperatively.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::{ApiServer, build_router};
use crate::audit::AuditLog;
use crate::auth::Authenticator;
use crate::blob::{BlobStore, FsBlobStore};
use crate::config::{BrokerKind, QueueMode, Settings, StoreKind};
use crate::connector::{
    CircuitBreaker, ConnectorManager, ConnectorProvider, HttpConnector, Reconciler,
    spawn_reconciler,
};
use crate::ingest::{Dispatch, IngestService};
use crate::metrics::Metrics;
use crate::pipeline::{
    AnalyticsHandler, DeliveryHandler, EnhanceHandler, InlinePipeline, QueueDispatcher, Stages,
    SttHandler,
};
use crate::providers::{
    create_delivery_sink, create_enhancer, create_report_builder, create_stt_engine,
};
use crate::queue::{Broker, JobHandler, MemoryBroker, PgBroker, PipelineStep, Worker};
use crate::readiness::{self, ReadinessReport};
use crate::store::{MeetingStore, MemoryStore, PgStore};

pub struct AppContext {
    pub settings: Settings,
    pub readiness: ReadinessReport,
    pub store: Arc<dyn MeetingStore>,
    pub blob: Arc<dyn BlobStore>,
    pub broker: Arc<dyn Broker>,
    pub metrics: Arc<Metrics>,
    pub audit: AuditLog,
    pub auth: Arc<Authenticator>,
    pub stages: Arc<Stages>,
    pub ingest: Arc<IngestService>,
    pub connector: Option<Arc<ConnectorManager>>,
    pub reconciler: Arc<Reconciler>,
}

impl AppContext {
    /// Build the production context from configuration.
    pub async fn build(settings: Settings) -> anyhow::Result<Arc<Self>> {
        let needs_pg = settings.storage.store == StoreKind::Postgres
            || settings.queue.broker == BrokerKind::Postgres;
        let pg_pool = if needs_pg {
            let url = settings
                .storage
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for postgres store or broker")?;
            PgStore::run_migrations(url)
                .await
                .context("database migrations failed")?;
            Some(
                crate::store::pg_pool(url, 16)
                    .await
                    .context("database pool init failed")?,
            )
        } else {
            None
        };

        let store: Arc<dyn MeetingStore> = match settings.storage.store {
            StoreKind::Memory => Arc::new(MemoryStore::new()),
            StoreKind::Postgres => Arc::new(PgStore::from_pool(
                pg_pool.clone().context("postgres pool missing")?,
            )),
        };

        let broker: Arc<dyn Broker> = match settings.queue.broker {
            BrokerKind::Memory => Arc::new(MemoryBroker::new()),
            BrokerKind::Postgres => Arc::new(PgBroker::new(
                pg_pool.context("postgres pool missing")?,
            )),
        };

        let blob: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&settings.storage.blob_root));

        let provider: Option<Arc<dyn ConnectorProvider>> = if settings.connector.enabled {
            Some(Arc::new(HttpConnector::new(&settings.connector)?))
        } else {
            None
        };

        Self::assemble(settings, store, blob, broker, provider)
    }

    /// Wire components together. Split from [`Self::build`] so tests can
    /// inject memory stores and scripted providers.
    pub fn assemble(
        settings: Settings,
        store: Arc<dyn MeetingStore>,
        blob: Arc<dyn BlobStore>,
        broker: Arc<dyn Broker>,
        provider: Option<Arc<dyn ConnectorProvider>>,
    ) -> anyhow::Result<Arc<Self>> {
        let readiness = readiness::evaluate(&settings);
        let metrics = Arc::new(Metrics::new());

        let audit = if settings.auth.audit_persist {
            AuditLog::with_store(store.clone())
        } else {
            AuditLog::new()
        };
        let auth = Arc::new(Authenticator::new(settings.auth.clone()));

        let stages = Arc::new(Stages::new(
            store.clone(),
            blob.clone(),
            create_stt_engine(&settings.pipeline)?,
            create_enhancer(&settings.pipeline)?,
            create_report_builder(&settings.pipeline)?,
            create_delivery_sink(&settings.pipeline)?,
            metrics.clone(),
            settings.pipeline.delivery_recipient.clone(),
        ));

        let dispatch = match settings.queue.mode {
            QueueMode::Inline => Dispatch::Inline(Arc::new(InlinePipeline::new(stages.clone()))),
            QueueMode::Broker => Dispatch::Queued(QueueDispatcher::new(
                broker.clone(),
                settings.queue.max_attempts,
            )),
        };

        let ingest = Arc::new(IngestService::new(
            store.clone(),
            blob.clone(),
            stages.clone(),
            metrics.clone(),
            dispatch,
        ));

        let connector = provider.map(|provider| {
            let breaker = Arc::new(CircuitBreaker::new(
                provider.name().to_string(),
                settings.connector.breaker.clone(),
            ));
            Arc::new(ConnectorManager::new(
                store.clone(),
                broker.clone(),
                provider,
                breaker,
                ingest.clone(),
                metrics.clone(),
                settings.connector.clone(),
            ))
        });

        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            ingest.clone(),
            connector.clone(),
            settings.reconcile.clone(),
        ));

        Ok(Arc::new(Self {
            settings,
            readiness,
            store,
            blob,
            broker,
            metrics,
            audit,
            auth,
            stages,
            ingest,
            connector,
            reconciler,
        }))
    }
}

pub struct Engine {
    ctx: Arc<AppContext>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    reconciler: JoinHandle<()>,
    server: ApiServer,
}

impl Engine {
    /// Spawn workers, the reconciler and the HTTP server.
    pub async fn start(ctx: Arc<AppContext>) -> anyhow::Result<Self> {
        let (shutdown_tx, _) = watch::channel(false);

        let mut workers = Vec::new();
        if ctx.settings.queue.mode == QueueMode::Broker {
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
                workers.push(tokio::spawn(worker.run(shutdown_tx.subscribe())));
            }
        }

        let reconciler = spawn_reconciler(ctx.reconciler.clone(), shutdown_tx.subscribe());

        let host: IpAddr = ctx
            .settings
            .server
            .host
            .parse()
            .with_context(|| format!("bad HTTP_HOST {:?}", ctx.settings.server.host))?;
        let addr = SocketAddr::new(host, ctx.settings.server.port);
        let server = ApiServer::start(build_router(ctx.clone()), addr)
            .await
            .context("api server bind failed")?;

        Ok(Self {
            ctx,
            shutdown_tx,
            workers,
            reconciler,
            server,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.addr()
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// Block until SIGINT, then drain.
    pub async fn run_until_shutdown(self) -> anyhow::Result<()> {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        tracing::info!("shutdown signal received");
        self.shutdown().await;
        Ok(())
    }

    /// Cooperative shutdown: stop taking work, drain in-flight jobs up
    /// to the drain deadline, stop the server.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        self.server.shutdown().await;
        for worker in self.workers {
            let _ = worker.await;
        }
        let _ = self.reconciler.await;
        tracing::info!("engine stopped");
    }
}
