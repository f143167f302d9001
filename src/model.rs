//! Core data types shared across components: nodes, jobs, batches, sessions,
//! and the preference-learning records derived from user feedback.
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coarse capability/quality ranking of a node. Ordering matters: the Task
/// Router sorts on this for quality-class vs. non-quality-class placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Draft,
    Standard,
    Quality,
    Premium,
}

impl Tier {
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Tier::Draft => 0,
            Tier::Standard => 1,
            Tier::Quality => 2,
            Tier::Premium => 3,
        }
    }
}

/// A task-class requested by a caller; drives both the required capability
/// tag and the quality-vs-non-quality sort order used by the Task Router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskClass {
    Draft,
    Standard,
    Quality,
    Upscale,
    ModelFamily(String),
}

impl TaskClass {
    /// True for task classes whose routing favors highest-tier, least-loaded
    /// nodes; false for classes that prefer cheap capacity.
    #[must_use]
    pub fn is_quality_class(&self) -> bool {
        matches!(self, TaskClass::Quality | TaskClass::Upscale)
            || matches!(self, TaskClass::ModelFamily(tag) if tag.ends_with("_premium"))
    }
}

/// Runtime health/load state of a node, mutated only by the Health Prober
/// (health, latency) and the Job Executor (queue depth).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRuntimeState {
    pub healthy: bool,
    pub last_latency_ms: Option<u64>,
    pub queue_depth: i64,
    /// Monotonic count of healthy<->unhealthy transitions, for observability.
    pub transition_count: u64,
}

impl Default for NodeRuntimeState {
    fn default() -> Self {
        Self {
            healthy: false,
            last_latency_ms: None,
            queue_depth: 0,
            transition_count: 0,
        }
    }
}

/// A GPU-attached worker process, as declared in the node inventory and
/// tracked at runtime by the Registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub display_name: String,
    pub tier: Tier,
    pub vram_gb: u32,
    pub max_concurrent_jobs: u32,
    pub max_resolution: u32,
    pub max_batch: u32,
    pub capabilities: BTreeSet<String>,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub runtime: NodeRuntimeState,
}

impl Node {
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn is_capable(&self, tag: &str) -> bool {
        self.capabilities.contains(tag)
    }
}

/// An adapter (LoRA-style auxiliary model) spliced into a job graph, with a
/// numeric strength in `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub adapter_id: String,
    pub strength: f32,
}

/// The full parameter bundle shared by every image in a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterBundle {
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance: f32,
    pub sampler: String,
    pub scheduler: String,
    pub seed: i64,
    #[serde(default)]
    pub source_image: Option<String>,
    #[serde(default)]
    pub adapters: Vec<AdapterSpec>,
    /// Denoise strength for image-to-image templates; unused for txt2img.
    #[serde(default)]
    pub denoise: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Dispatched,
    Running,
    Complete,
    Failed,
}

impl JobState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }

    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            JobState::Queued => 0,
            JobState::Dispatched => 1,
            JobState::Running => 2,
            JobState::Complete | JobState::Failed => 3,
        }
    }
}

/// A single image-generation job ("generation"). Transitions are strictly
/// forward: queued -> dispatched -> running -> {complete, failed}.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub session_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub stage: u32,
    pub task_class: TaskClass,
    pub prompt: String,
    pub negative_prompt: String,
    pub model_family: String,
    pub params: ParameterBundle,
    pub state: JobState,
    pub node_id: Option<String>,
    pub worker_job_id: Option<String>,
    pub artifact_ref: Option<String>,
    pub final_seed: Option<i64>,
    pub duration_ms: Option<u64>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Enforces the invariants from the data model: worker-side id is set
    /// for every state the job reaches by way of a successful dispatch
    /// (dispatched, running, complete); artifact ref is set iff state ==
    /// complete. `Failed` is reachable from a pre-dispatch error too (a
    /// template build or submission failure), so it does not require a
    /// worker-side id.
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        let worker_id_ok = match self.state {
            JobState::Queued => self.worker_job_id.is_none(),
            JobState::Dispatched | JobState::Running | JobState::Complete => self.worker_job_id.is_some(),
            JobState::Failed => true,
        };
        let artifact_ok = (self.state == JobState::Complete) == self.artifact_ref.is_some();
        worker_id_ok && artifact_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Open,
    Closed,
}

/// An atomic set of Jobs submitted from a single batch request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub session_id: Uuid,
    pub stage: u32,
    pub total: u32,
    pub allocation: Vec<(String, u32)>,
    pub completed: u32,
    pub state: BatchState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    #[must_use]
    pub fn recompute_state(total: u32, completed: u32) -> BatchState {
        if completed >= total {
            BatchState::Closed
        } else {
            BatchState::Open
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStage {
    Configuring,
    Generating,
    Reviewing,
    Done,
}

/// A user-facing workflow run consisting of ordered stages with feedback
/// between them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub flow_kind: String,
    pub current_stage_index: u32,
    pub stage: SessionStage,
    /// Free-form key/value intent accumulator carried between stages.
    pub config: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackAction {
    Selected,
    Rejected,
}

/// An immutable, append-only preference event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceRecord {
    pub keyword: String,
    pub model: String,
    pub adapter: Option<String>,
    pub stage: u32,
    pub action: FeedbackAction,
    pub feedback_text: Option<String>,
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// A materialized (selected_count, total_count) cache for one dimension key.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PreferenceStat {
    pub selected: u64,
    pub total: u64,
}

impl PreferenceStat {
    pub(crate) fn record(&mut self, selected: bool) {
        self.total += 1;
        if selected {
            self.selected += 1;
        }
    }
}

/// A normalized event emitted downstream over a session's subscription, per
/// the Progress Aggregator's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Progress {
        generation_id: Uuid,
        current_step: u32,
        total_steps: u32,
    },
    Complete {
        generation_id: Uuid,
        artifact_url: String,
        thumbnail_url: Option<String>,
        seed: i64,
        elapsed_ms: u64,
        node_id: String,
    },
    BatchProgress {
        batch_id: Uuid,
        completed: u32,
        total: u32,
        latest_complete: Option<Uuid>,
    },
    BatchComplete {
        batch_id: Uuid,
        total: u32,
        elapsed_ms: u64,
    },
    Error {
        generation_id: Uuid,
        message: String,
    },
}
