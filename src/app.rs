//! Wires every component (§4) into one shared `AppState` and builds the HTTP
//! router, mirroring the shape `build_router(registry) -> Router` takes on
//! the teacher crate: one `ComponentRegistry` behind an `Arc`, one flat
//! `api::router(state)` call.
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router as AxumRouter;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregator::Aggregator,
    api,
    config::Config,
    executor::JobExecutor,
    health::HealthProber,
    iteration::{IterationController, NoopRewriter},
    observability::Telemetry,
    preference::PreferenceEngine,
    registry::Registry,
    router::Router as TaskRouter,
    store::{InMemoryStore, OrchestratorStore, PostgresStore},
    template::TemplateEngine,
    worker_client::WorkerClient,
};

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
}

pub struct ComponentRegistry {
    config: Arc<Config>,
    telemetry: Telemetry,
    node_registry: Registry,
    router: TaskRouter,
    templates: TemplateEngine,
    preference: PreferenceEngine,
    aggregator: Aggregator,
    store: Arc<dyn OrchestratorStore>,
    executor: JobExecutor,
    iteration: IterationController,
}

impl AppState {
    pub(crate) fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub(crate) fn config(&self) -> &Config {
        &self.registry.config
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry.node_registry
    }

    pub(crate) fn executor(&self) -> &JobExecutor {
        &self.registry.executor
    }

    pub(crate) fn preference(&self) -> &PreferenceEngine {
        &self.registry.preference
    }

    pub(crate) fn aggregator(&self) -> &Aggregator {
        &self.registry.aggregator
    }

    pub(crate) fn iteration(&self) -> &IterationController {
        &self.registry.iteration
    }

    pub(crate) fn store(&self) -> &Arc<dyn OrchestratorStore> {
        &self.registry.store
    }
}

impl ComponentRegistry {
    /// Loads the node inventory and template manifest, stands up the Worker
    /// Client pool and its per-node event-stream consumers, spawns the
    /// Health Prober, and assembles every remaining component behind one
    /// handle.
    ///
    /// # Errors
    /// Returns an error if telemetry fails to initialize, the node
    /// inventory or template manifest cannot be read/parsed, or (when a
    /// database URL is configured) the Postgres pool fails to connect or its
    /// schema cannot be ensured.
    pub async fn build(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let telemetry = Telemetry::new()?;

        let node_registry = Registry::new();
        node_registry
            .reload(config.node_inventory_path())
            .await
            .with_context(|| {
                format!(
                    "failed to load node inventory from {}",
                    config.node_inventory_path().display()
                )
            })?;

        let prober = HealthProber::new(node_registry.clone(), config.probe_interval(), config.probe_timeout())
            .with_telemetry(telemetry.clone());
        prober.spawn();

        let aggregator = Aggregator::new();
        let mut workers = HashMap::new();
        for node in node_registry.snapshot().await {
            let worker = WorkerClient::new(
                node.id.clone(),
                node.base_url(),
                config.submit_timeout(),
                config.history_poll_timeout(),
                config.artifact_fetch_timeout(),
                config.poll_interval(),
            );
            let events = worker.subscribe_events(
                config.ws_backoff_base_ms(),
                config.ws_backoff_cap_ms(),
                config.ws_keepalive(),
                CancellationToken::new(),
                Some(telemetry.clone()),
            );
            aggregator.spawn_consumer(node.id.clone(), events);
            workers.insert(node.id.clone(), worker);
        }

        let task_router = TaskRouter::new(node_registry.clone(), config.overflow_queue_threshold());

        let mut templates = TemplateEngine::new();
        let manifest_raw = tokio::fs::read_to_string(config.template_manifest_path())
            .await
            .with_context(|| {
                format!(
                    "failed to read template manifest from {}",
                    config.template_manifest_path().display()
                )
            })?;
        templates.load_all(serde_yaml::from_str(&manifest_raw).with_context(|| {
            format!(
                "failed to parse template manifest {}",
                config.template_manifest_path().display()
            )
        })?);

        let preference = PreferenceEngine::new();

        let store: Arc<dyn OrchestratorStore> = match config.database_url() {
            Some(url) => {
                let pool = PgPoolOptions::new()
                    .connect_lazy(url)
                    .context("failed to configure orchestrator database connection pool")?;
                let postgres = PostgresStore::new(pool);
                postgres.ensure_schema().await?;
                Arc::new(postgres)
            }
            None => Arc::new(InMemoryStore::new()),
        };

        let executor = JobExecutor::new(
            node_registry.clone(),
            task_router.clone(),
            templates.clone(),
            workers,
            aggregator.clone(),
            preference.clone(),
            store.clone(),
            config.job_deadline(),
        )
        .with_telemetry(telemetry.clone());
        let iteration = IterationController::new(preference.clone(), store.clone(), Arc::new(NoopRewriter));

        Ok(Self {
            config,
            telemetry,
            node_registry,
            router: task_router,
            templates,
            preference,
            aggregator,
            store,
            executor,
            iteration,
        })
    }
}

pub fn build_router(registry: ComponentRegistry) -> AxumRouter {
    let state = AppState::new(registry);
    api::router(state)
}
