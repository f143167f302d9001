//! Job Executor (§4.6): turns a generation request into a dispatched,
//! polled, and eventually terminal `Job`, and divides a batch request across
//! the router's candidate nodes with preference-driven model/adapter
//! exploration.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    aggregator::Aggregator,
    model::{AdapterSpec, Batch, BatchState, Job, JobState, Node, ParameterBundle, SessionEvent, TaskClass},
    observability::Telemetry,
    preference::PreferenceEngine,
    registry::Registry,
    router::Router,
    store::OrchestratorStore,
    template::TemplateEngine,
    util::error::OrchestratorError,
    worker_client::{JobOutcome, OutputDescriptor, WorkerClient},
};

const MAX_EXPLORED_ADAPTERS: usize = 3;
const ADAPTER_MIN_STRENGTH: f32 = 0.5;
const ADAPTER_MAX_STRENGTH: f32 = 0.8;

/// A single-image generation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub session_id: Uuid,
    pub stage: u32,
    pub task_class: TaskClass,
    pub prompt: String,
    pub negative_prompt: String,
    pub model_family: String,
    pub params: ParameterBundle,
    pub preferred_node_id: Option<String>,
    pub template_name: Option<String>,
}

/// A batch generation request; the executor divides `count` images across
/// the router's candidate nodes and, when `candidate_models`/`auto_adapters`
/// are set, explores model/adapter choices via the Preference Engine.
#[derive(Debug, Clone)]
pub struct BatchGenerateRequest {
    pub session_id: Uuid,
    pub stage: u32,
    pub task_class: TaskClass,
    pub count: u32,
    pub prompt: String,
    pub negative_prompt: String,
    pub candidate_models: Vec<String>,
    pub candidate_adapters: Vec<String>,
    pub auto_adapters: bool,
    pub base_params: ParameterBundle,
    pub seed_start: i64,
    pub template_name: Option<String>,
}

/// Shared, cloneable handle wiring the Registry, Router, Template Engine,
/// Worker Client pool, Progress Aggregator, Preference Engine, and store
/// together. One instance is held by the HTTP layer.
#[derive(Clone)]
pub struct JobExecutor {
    registry: Registry,
    router: Router,
    templates: TemplateEngine,
    workers: HashMap<String, WorkerClient>,
    aggregator: Aggregator,
    preference: PreferenceEngine,
    store: Arc<dyn OrchestratorStore>,
    job_deadline: Duration,
    telemetry: Option<Telemetry>,
    session_cancels: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl JobExecutor {
    #[must_use]
    pub fn new(
        registry: Registry,
        router: Router,
        templates: TemplateEngine,
        workers: HashMap<String, WorkerClient>,
        aggregator: Aggregator,
        preference: PreferenceEngine,
        store: Arc<dyn OrchestratorStore>,
        job_deadline: Duration,
    ) -> Self {
        Self {
            registry,
            router,
            templates,
            workers,
            aggregator,
            preference,
            store,
            job_deadline,
            telemetry: None,
            session_cancels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Attaches a telemetry handle so terminal job/batch transitions are
    /// reflected in the Prometheus job/batch counters and duration
    /// histogram. Optional: executors built without one (e.g. in tests)
    /// simply skip metric recording.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Returns the session-wide cancellation token, creating one if this is
    /// the session's first in-flight job. Every job's poll loop selects on a
    /// child of this token, so cancelling it terminates every in-flight job
    /// belonging to the session without disturbing any other session's jobs.
    async fn session_cancel_token(&self, session_id: Uuid) -> CancellationToken {
        let mut guard = self.session_cancels.write().await;
        guard.entry(session_id).or_insert_with(CancellationToken::new).clone()
    }

    /// Cancels every in-flight job belonging to a session. Best-effort
    /// toward the worker: an already-submitted job may still finish on the
    /// worker side, but its poll loop observes the cancellation and the Job
    /// transitions to `failed(reason=cancelled)` regardless.
    pub async fn cancel_session(&self, session_id: Uuid) {
        let mut guard = self.session_cancels.write().await;
        if let Some(token) = guard.remove(&session_id) {
            token.cancel();
        }
    }

    /// Routes, builds the job graph, submits to the chosen node, and spawns
    /// the background poll-to-completion pipeline. Returns the internal job
    /// id immediately after a successful dispatch.
    pub async fn submit_single(&self, request: GenerateRequest) -> Result<Uuid, OrchestratorError> {
        let needs_img2img = request.params.source_image.is_some();
        let needs_adapters = !request.params.adapters.is_empty();
        let candidates = self
            .router
            .route(&request.task_class, &request.model_family, request.preferred_node_id.as_deref())
            .await?;
        let node = candidates.first().cloned().ok_or(OrchestratorError::NoCapableNode)?;

        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            session_id: request.session_id,
            batch_id: None,
            stage: request.stage,
            task_class: request.task_class,
            prompt: request.prompt,
            negative_prompt: request.negative_prompt,
            model_family: request.model_family,
            params: request.params,
            state: JobState::Queued,
            node_id: None,
            worker_job_id: None,
            artifact_ref: None,
            final_seed: None,
            duration_ms: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.store.put_job(&job).await?;

        let template_name = match &request.template_name {
            Some(name) => name.clone(),
            None => self
                .templates
                .select(&job.model_family, needs_img2img, needs_adapters)
                .ok_or_else(|| OrchestratorError::NotFound(format!("template for {}", job.model_family)))?
                .to_string(),
        };

        self.dispatch_job(job, node, template_name).await
    }

    /// Divides `count` images across the candidates the router returns for
    /// this task class/capability, exploring model and adapter choices via
    /// the Preference Engine when a candidate set is supplied.
    pub async fn submit_batch(&self, request: BatchGenerateRequest) -> Result<Uuid, OrchestratorError> {
        let primary_capability = request
            .candidate_models
            .first()
            .cloned()
            .unwrap_or_else(|| "sd15".to_string());
        let candidates = self
            .router
            .route(&request.task_class, &primary_capability, None)
            .await?;
        if candidates.is_empty() {
            return Err(OrchestratorError::NoCapableNode);
        }

        let allocation = divide_batch(request.count, &candidates);
        let now = Utc::now();
        let batch = Batch {
            id: Uuid::new_v4(),
            session_id: request.session_id,
            stage: request.stage,
            total: request.count,
            allocation: allocation
                .iter()
                .map(|(node, share)| (node.id.clone(), *share))
                .collect(),
            completed: 0,
            state: BatchState::Open,
            created_at: now,
            updated_at: now,
        };
        self.store.put_batch(&batch).await?;

        let models = self
            .model_exploration_set(&request.prompt, &request.candidate_models, &request.task_class)
            .await;

        let mut node_schedule = Vec::with_capacity(request.count as usize);
        for (node, share) in &allocation {
            for _ in 0..*share {
                node_schedule.push(node.clone());
            }
        }

        for i in 0..request.count as usize {
            let Some(node) = node_schedule.get(i).cloned() else {
                break;
            };
            let model_family = models
                .get(i % models.len().max(1))
                .cloned()
                .unwrap_or_else(|| primary_capability.clone());

            let adapters = if request.auto_adapters {
                self.auto_adapters(&request.prompt, &model_family, &request.candidate_adapters)
                    .await
            } else {
                request.base_params.adapters.clone()
            };

            let mut params = request.base_params.clone();
            params.adapters = adapters;
            params.seed = request.seed_start + i as i64;

            let job_now = Utc::now();
            let job = Job {
                id: Uuid::new_v4(),
                session_id: request.session_id,
                batch_id: Some(batch.id),
                stage: request.stage,
                task_class: request.task_class.clone(),
                prompt: request.prompt.clone(),
                negative_prompt: request.negative_prompt.clone(),
                model_family: model_family.clone(),
                params,
                state: JobState::Queued,
                node_id: None,
                worker_job_id: None,
                artifact_ref: None,
                final_seed: None,
                duration_ms: None,
                failure_reason: None,
                created_at: job_now,
                updated_at: job_now,
            };
            self.store.put_job(&job).await?;

            let needs_img2img = job.params.source_image.is_some();
            let needs_adapters = !job.params.adapters.is_empty();
            let template_name = match &request.template_name {
                Some(name) => name.clone(),
                None => match self.templates.select(&model_family, needs_img2img, needs_adapters) {
                    Some(name) => name.to_string(),
                    None => continue,
                },
            };

            if let Err(error) = self.dispatch_job(job.clone(), node.clone(), template_name).await {
                tracing::warn!(job_id = %job.id, %error, "failed to dispatch batch item");
            }
        }

        Ok(batch.id)
    }

    /// Weights candidates by confidence: low confidence (or a draft task)
    /// explores up to three models; high confidence narrows to the single
    /// best-scoring one.
    async fn model_exploration_set(
        &self,
        prompt: &str,
        candidates: &[String],
        task_class: &TaskClass,
    ) -> Vec<String> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let recommendation = self.preference.recommend_model(prompt, candidates).await.ok();
        let confidence = recommendation.as_ref().map_or(0.0, |r| r.confidence);

        let explore = if matches!(task_class, TaskClass::Draft) {
            3
        } else if confidence >= 0.5 {
            1
        } else if confidence >= 0.3 {
            2
        } else {
            3
        };

        let mut ranked = candidates.to_vec();
        if let Some(recommendation) = recommendation {
            ranked.retain(|m| m != &recommendation.model);
            ranked.insert(0, recommendation.model);
        }
        ranked.truncate(explore.min(ranked.len()).max(1));
        ranked
    }

    /// Selects up to three adapters scoring at or above the selection
    /// threshold, clipping their recommended strength into a safe range.
    async fn auto_adapters(&self, prompt: &str, model: &str, candidate_adapters: &[String]) -> Vec<AdapterSpec> {
        if candidate_adapters.is_empty() {
            return Vec::new();
        }
        self.preference
            .recommend_adapters(prompt, model, candidate_adapters, MAX_EXPLORED_ADAPTERS)
            .await
            .into_iter()
            .filter(|r| r.score >= 0.5)
            .map(|r| AdapterSpec {
                adapter_id: r.adapter,
                strength: (r.score as f32).clamp(ADAPTER_MIN_STRENGTH, ADAPTER_MAX_STRENGTH),
            })
            .collect()
    }

    /// Common dispatch path for both single and batch submission: builds the
    /// job graph, submits it to the node's Worker Client, transitions the
    /// job to `Dispatched`, and spawns the poll-to-completion pipeline.
    async fn dispatch_job(&self, mut job: Job, node: Node, template_name: String) -> Result<Uuid, OrchestratorError> {
        let worker = self
            .workers
            .get(&node.id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("worker client for node {}", node.id)))?;

        self.registry.bump_queue(&node.id, 1).await;

        let params_map = parameter_bundle_to_map(&job);
        let build_result = self
            .templates
            .build(&template_name, &params_map)
            .and_then(|graph| self.templates.inject_adapters(&template_name, graph, &job.params.adapters));

        let graph = match build_result {
            Ok(graph) => graph,
            Err(error) => {
                self.registry.bump_queue(&node.id, -1).await;
                self.fail_job(&mut job, error.to_string()).await;
                return Err(error);
            }
        };

        let worker_job_id = match worker.submit(&graph).await {
            Ok(id) => id,
            Err(error) => {
                self.registry.bump_queue(&node.id, -1).await;
                self.fail_job(&mut job, error.to_string()).await;
                return Err(error);
            }
        };

        job.state = JobState::Dispatched;
        job.node_id = Some(node.id.clone());
        job.worker_job_id = Some(worker_job_id.clone());
        job.updated_at = Utc::now();
        self.store.put_job(&job).await?;

        self.aggregator
            .register(worker_job_id.clone(), job.id, job.session_id)
            .await;

        let job_id = job.id;
        let executor = self.clone();
        tokio::spawn(async move {
            executor.run_to_completion(job, worker).await;
        });

        Ok(job_id)
    }

    async fn run_to_completion(&self, mut job: Job, worker: WorkerClient) {
        let worker_job_id = job
            .worker_job_id
            .clone()
            .expect("dispatched job must carry a worker id");
        // A child of the session-wide token: cancelling it locally (once
        // this job's own poll finishes) never disturbs sibling jobs, but
        // the session token cancelling propagates down to every child.
        let cancel = self.session_cancel_token(job.session_id).await.child_token();

        let watcher_cancel = cancel.clone();
        let watcher_executor = self.clone();
        let watcher_job_id = job.id;
        let mut progress_rx = self.aggregator.subscribe(job.session_id, 32).await;
        let watcher = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = watcher_cancel.cancelled() => return,
                    event = progress_rx.recv() => {
                        match event {
                            Some(SessionEvent::Progress { generation_id, .. }) if generation_id == watcher_job_id => {
                                watcher_executor.mark_running(watcher_job_id).await;
                                return;
                            }
                            Some(_) => continue,
                            None => return,
                        }
                    }
                }
            }
        });

        let outcome = worker.poll_until_complete(&worker_job_id, self.job_deadline, &cancel).await;
        cancel.cancel();
        let _ = watcher.await;

        if let Some(node_id) = &job.node_id {
            self.registry.bump_queue(node_id, -1).await;
        }
        self.aggregator.deregister(&worker_job_id).await;

        match outcome {
            Ok(JobOutcome { outputs }) => self.complete_job(&mut job, outputs).await,
            Err(error) => self.fail_job(&mut job, error.to_string()).await,
        }
    }

    async fn mark_running(&self, job_id: Uuid) {
        let Ok(mut job) = self.store.get_job(job_id).await else {
            return;
        };
        if job.state == JobState::Dispatched {
            job.state = JobState::Running;
            job.updated_at = Utc::now();
            let _ = self.store.put_job(&job).await;
        }
    }

    async fn complete_job(&self, job: &mut Job, outputs: Vec<OutputDescriptor>) {
        let now = Utc::now();
        let reference = outputs.first().map(|o| o.filename.clone()).unwrap_or_default();
        job.state = JobState::Complete;
        job.artifact_ref = Some(reference);
        job.final_seed = Some(job.params.seed);
        job.duration_ms = Some((now - job.created_at).num_milliseconds().max(0) as u64);
        job.updated_at = now;
        let _ = self.store.put_job(job).await;

        if let Some(telemetry) = &self.telemetry {
            telemetry.record_job_completed();
            telemetry.record_job_duration(job.duration_ms.unwrap_or_default() as f64 / 1000.0);
        }

        self.aggregator
            .publish(
                job.session_id,
                SessionEvent::Complete {
                    generation_id: job.id,
                    artifact_url: format!("/generate/{}/artifact", job.id),
                    thumbnail_url: None,
                    seed: job.final_seed.unwrap_or_default(),
                    elapsed_ms: job.duration_ms.unwrap_or_default(),
                    node_id: job.node_id.clone().unwrap_or_default(),
                },
            )
            .await;

        if let Some(batch_id) = job.batch_id {
            self.advance_batch(batch_id, job.id).await;
        }
    }

    async fn fail_job(&self, job: &mut Job, reason: String) {
        job.state = JobState::Failed;
        job.failure_reason = Some(reason.clone());
        job.updated_at = Utc::now();
        let _ = self.store.put_job(job).await;

        if let Some(telemetry) = &self.telemetry {
            telemetry.record_job_failed();
        }

        self.aggregator
            .publish(
                job.session_id,
                SessionEvent::Error {
                    generation_id: job.id,
                    message: reason,
                },
            )
            .await;

        if let Some(batch_id) = job.batch_id {
            self.advance_batch(batch_id, job.id).await;
        }
    }

    async fn advance_batch(&self, batch_id: Uuid, job_id: Uuid) {
        let Ok(mut batch) = self.store.get_batch(batch_id).await else {
            return;
        };
        batch.completed += 1;
        batch.state = Batch::recompute_state(batch.total, batch.completed);
        batch.updated_at = Utc::now();
        let session_id = batch.session_id;
        let _ = self.store.put_batch(&batch).await;

        self.aggregator
            .publish(
                session_id,
                SessionEvent::BatchProgress {
                    batch_id,
                    completed: batch.completed,
                    total: batch.total,
                    latest_complete: Some(job_id),
                },
            )
            .await;

        if batch.state == BatchState::Closed {
            let elapsed_ms = (Utc::now() - batch.created_at).num_milliseconds().max(0) as u64;
            if let Some(telemetry) = &self.telemetry {
                telemetry.record_batch_completed();
            }
            self.aggregator
                .publish(
                    session_id,
                    SessionEvent::BatchComplete {
                        batch_id,
                        total: batch.total,
                        elapsed_ms,
                    },
                )
                .await;
        }
    }
}

/// Divides `count` images across `candidates` in router order: each of the
/// first `count % len` candidates gets one extra share.
fn divide_batch(count: u32, candidates: &[Node]) -> Vec<(Node, u32)> {
    if candidates.is_empty() || count == 0 {
        return Vec::new();
    }
    let k = candidates.len() as u32;
    let base = count / k;
    let remainder = count % k;
    candidates
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let share = base + u32::from((i as u32) < remainder);
            (node.clone(), share)
        })
        .filter(|(_, share)| *share > 0)
        .collect()
}

fn parameter_bundle_to_map(job: &Job) -> BTreeMap<String, serde_json::Value> {
    let mut map = BTreeMap::new();
    if let Ok(serde_json::Value::Object(params)) = serde_json::to_value(&job.params) {
        for (k, v) in params {
            map.insert(k, v);
        }
    }
    map.insert("prompt".to_string(), serde_json::Value::String(job.prompt.clone()));
    map.insert(
        "negative_prompt".to_string(),
        serde_json::Value::String(job.negative_prompt.clone()),
    );
    map.insert(
        "model_family".to_string(),
        serde_json::Value::String(job.model_family.clone()),
    );
    map
}
