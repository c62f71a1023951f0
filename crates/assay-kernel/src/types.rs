//! Core domain types
//!
//! Identifiers, task and workflow records, plans and experiment results.
//! Every type here is serialisable; enums use lowercase snake case names,
//! which are part of the wire contract.

use assay_registry::{ResourceRequirements, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use uuid::Uuid;

/// Workflow identifier (caller supplied, unique per engine)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    /// Create from any string
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh `wf-<ulid>` identifier
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("wf-{}", ulid::Ulid::new().to_string().to_lowercase()))
    }

    /// String form
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkflowId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Task identifier, unique within a workflow
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create from any string
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh `task-<ulid>` identifier
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("task-{}", ulid::Ulid::new().to_string().to_lowercase()))
    }

    /// String form
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Event identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Random identifier
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// Task priority; drives the dispatch timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// All priorities, ascending
    pub const ALL: [Priority; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// All states
    pub const ALL: [TaskState; 6] = [
        Self::Pending,
        Self::Running,
        Self::Retrying,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Completed, failed or cancelled
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Workflow lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Running,
    Completed,
    Failed,
    Cancelled,
    Terminated,
}

impl WorkflowState {
    /// Anything but running
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Immutable description of one unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: TaskId,
    pub workflow_id: WorkflowId,
    pub algorithm: String,
    /// Version resolved at submission
    pub version: Version,
    pub input: Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub resources: ResourceRequirements,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Tasks of the same workflow whose output this task consumes
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Wait for a wet-lab result before reviewing
    #[serde(default)]
    pub requires_validation: bool,
}

impl TaskSpec {
    /// Medium priority, default resources, no dependencies
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        task_id: TaskId,
        algorithm: impl Into<String>,
        version: Version,
        input: Value,
    ) -> Self {
        Self {
            task_id,
            workflow_id,
            algorithm: algorithm.into(),
            version,
            input,
            priority: Priority::default(),
            resources: ResourceRequirements::default(),
            created_at: Utc::now(),
            labels: BTreeMap::new(),
            depends_on: Vec::new(),
            requires_validation: false,
        }
    }

    /// With priority
    #[inline]
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// With resources
    #[inline]
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceRequirements) -> Self {
        self.resources = resources;
        self
    }

    /// With label
    #[inline]
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// With dependency
    #[inline]
    #[must_use]
    pub fn depends_on(mut self, task_id: TaskId) -> Self {
        self.depends_on.push(task_id);
        self
    }

    /// Gate review on a wet-lab result
    #[inline]
    #[must_use]
    pub fn requiring_validation(mut self) -> Self {
        self.requires_validation = true;
        self
    }
}

/// Metadata keys the engine writes on task status
pub mod metadata {
    /// `true` once a compensating action has run
    pub const COMPENSATED: &str = "compensated";
    /// QC outcome of the wet-lab result (`true` pass, `false` fail)
    pub const VALIDATED: &str = "validated";
    /// Critic verdict
    pub const VERDICT: &str = "verdict";
    /// Failure resolved by compensation
    pub const RESOLVED: &str = "resolved";
}

/// Mutable execution record of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub spec: TaskSpec,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl TaskStatus {
    /// Fresh pending status
    #[must_use]
    pub fn pending(spec: TaskSpec) -> Self {
        Self {
            spec,
            state: TaskState::Pending,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            metadata: BTreeMap::new(),
        }
    }

    /// Task id
    #[inline]
    #[must_use]
    pub fn id(&self) -> &TaskId {
        &self.spec.task_id
    }

    fn flag(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(Value::as_bool)
    }

    /// A compensating action has run for this task
    #[must_use]
    pub fn is_compensated(&self) -> bool {
        self.flag(metadata::COMPENSATED).unwrap_or(false)
    }

    /// QC outcome, once a wet-lab result has been applied
    #[must_use]
    pub fn validation(&self) -> Option<bool> {
        self.flag(metadata::VALIDATED)
    }

    /// Failed, but the failure was resolved by compensation
    #[must_use]
    pub fn is_resolved_failure(&self) -> bool {
        self.state == TaskState::Failed && self.flag(metadata::RESOLVED).unwrap_or(false)
    }

    /// Critic verdict, once reviewed
    #[must_use]
    pub fn verdict(&self) -> Option<Verdict> {
        self.metadata
            .get(metadata::VERDICT)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Critic decision on a task result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    Refine { feedback: String },
}

/// One task in a plan step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    /// Generated at submission when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub algorithm: String,
    /// Highest registered version when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub priority: Priority,
    /// Manifest-declared resources when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub requires_validation: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl PlannedTask {
    /// Task for `algorithm` at its highest version
    #[must_use]
    pub fn new(algorithm: impl Into<String>, input: Value) -> Self {
        Self {
            task_id: None,
            algorithm: algorithm.into(),
            version: None,
            input,
            priority: Priority::default(),
            resources: None,
            depends_on: Vec::new(),
            requires_validation: false,
            labels: BTreeMap::new(),
        }
    }

    /// With explicit id
    #[inline]
    #[must_use]
    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(TaskId::new(task_id));
        self
    }

    /// Pin a version
    #[inline]
    #[must_use]
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// With priority
    #[inline]
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// With requested resources
    #[inline]
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceRequirements) -> Self {
        self.resources = Some(resources);
        self
    }

    /// With dependency
    #[inline]
    #[must_use]
    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.depends_on.push(TaskId::new(task_id));
        self
    }

    /// Gate review on a wet-lab result
    #[inline]
    #[must_use]
    pub fn requiring_validation(mut self) -> Self {
        self.requires_validation = true;
        self
    }

    /// Turn into a spec once the version and default resources are known
    #[must_use]
    pub fn materialize(
        &self,
        workflow_id: &WorkflowId,
        version: Version,
        declared: &ResourceRequirements,
        step: usize,
        description: &str,
    ) -> TaskSpec {
        let mut labels = self.labels.clone();
        labels.entry("step".into()).or_insert_with(|| step.to_string());
        if !description.is_empty() {
            labels
                .entry("description".into())
                .or_insert_with(|| description.to_string());
        }

        TaskSpec {
            task_id: self.task_id.clone().unwrap_or_else(TaskId::generate),
            workflow_id: workflow_id.clone(),
            algorithm: self.algorithm.clone(),
            version,
            input: self.input.clone(),
            priority: self.priority,
            resources: self.resources.clone().unwrap_or_else(|| declared.clone()),
            created_at: Utc::now(),
            labels,
            depends_on: self.depends_on.clone(),
            requires_validation: self.requires_validation,
        }
    }
}

/// A batch of independent tasks the Executor submits together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    #[serde(default)]
    pub description: String,
    pub tasks: Vec<PlannedTask>,
}

impl PlanStep {
    /// Step with a description
    #[must_use]
    pub fn new(description: impl Into<String>, tasks: Vec<PlannedTask>) -> Self {
        Self {
            description: description.into(),
            tasks,
        }
    }
}

/// How a new plan relates to unsubmitted steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    #[default]
    Append,
    /// Drop unsubmitted steps first
    ReplacePending,
}

/// Wet-lab result delivered as a signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub experiment_id: String,
    pub task_id: TaskId,
    pub workflow_id: WorkflowId,
    #[serde(default)]
    pub measurements: BTreeMap<String, Value>,
    pub pass_qc: bool,
    #[serde(default)]
    pub operator: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Label for the checkpoint a passing result creates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_version: Option<String>,
}

impl ExperimentResult {
    /// Result with no measurements
    #[must_use]
    pub fn new(
        experiment_id: impl Into<String>,
        workflow_id: WorkflowId,
        task_id: TaskId,
        pass_qc: bool,
    ) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            task_id,
            workflow_id,
            measurements: BTreeMap::new(),
            pass_qc,
            operator: String::new(),
            recorded_at: Utc::now(),
            attachments: Vec::new(),
            annotations: BTreeMap::new(),
            suggested_version: None,
        }
    }

    /// With measurement
    #[inline]
    #[must_use]
    pub fn with_measurement(mut self, key: impl Into<String>, value: Value) -> Self {
        self.measurements.insert(key.into(), value);
        self
    }

    /// With operator
    #[inline]
    #[must_use]
    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = operator.into();
        self
    }

    /// With checkpoint label
    #[inline]
    #[must_use]
    pub fn with_suggested_version(mut self, label: impl Into<String>) -> Self {
        self.suggested_version = Some(label.into());
        self
    }
}

/// What happened to a received signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalDisposition {
    /// Waiting for its task to complete
    Pending,
    /// QC pass moved the workflow to `version`
    Advanced { version: u32 },
    /// QC fail compensated these tasks, in order
    Compensated { tasks: Vec<TaskId> },
}

/// Received signal and its disposition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub result: ExperimentResult,
    pub disposition: SignalDisposition,
    pub received_at: DateTime<Utc>,
}

/// Why a compensating action ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompensationTrigger {
    QcFailed { experiment_id: String },
    TaskFailed { task_id: TaskId },
}

/// Outcome of one compensating action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompensationOutcome {
    Compensated,
    Failed { error: String },
}

/// Compensation history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub task_id: TaskId,
    pub trigger: CompensationTrigger,
    pub outcome: CompensationOutcome,
    pub at: DateTime<Utc>,
}

/// Continue-as-new history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub from_version: u32,
    pub to_version: u32,
    pub experiment_id: String,
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Completed tasks carried into the new version
    pub carried: Vec<TaskId>,
    pub at: DateTime<Utc>,
}

/// Why the planner must be consulted before the Executor moves on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ReplanReason {
    /// The Critic asked for refinement of a task's result
    Refine { task_id: TaskId, feedback: String },
    /// A failed task was resolved by compensation
    TaskFailed { task_id: TaskId, error: String },
    /// A QC failure compensated these tasks
    QcFailed {
        experiment_id: String,
        task_id: TaskId,
        compensated: Vec<TaskId>,
    },
    /// A QC pass moved the workflow to a new version
    Validated {
        experiment_id: String,
        task_id: TaskId,
        version: u32,
    },
}

/// Durable workflow aggregate
///
/// Only [`WorkflowStatus::apply`](crate::events) changes it; everything else
/// reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub workflow_id: WorkflowId,
    pub workflow_type: String,
    pub input: Value,
    pub state: WorkflowState,
    /// Logical version, starts at 1
    pub version: u32,
    /// Submission order
    pub tasks: Vec<TaskStatus>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub compensations: Vec<CompensationRecord>,
    #[serde(default)]
    pub experiments: Vec<SignalRecord>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    /// Plan steps not yet submitted
    #[serde(default)]
    pub pending_plan: VecDeque<PlanStep>,
    #[serde(default)]
    pub plan_complete: bool,
    /// Planner invocations that produced steps
    #[serde(default)]
    pub planning_rounds: u32,
    /// Outcomes the planner has not yet seen, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replan: Vec<ReplanReason>,
    /// Sequence of the last applied log record
    #[serde(default)]
    pub last_sequence: u64,
}

impl WorkflowStatus {
    /// Task by id
    #[must_use]
    pub fn task(&self, task_id: &TaskId) -> Option<&TaskStatus> {
        self.tasks.iter().find(|t| t.id() == task_id)
    }

    pub(crate) fn task_mut(&mut self, task_id: &TaskId) -> Option<&mut TaskStatus> {
        self.tasks.iter_mut().find(|t| t.id() == task_id)
    }

    /// Tasks not in a terminal state
    pub fn outstanding(&self) -> impl Iterator<Item = &TaskStatus> + '_ {
        self.tasks.iter().filter(|t| !t.state.is_terminal())
    }

    /// Signal by experiment id
    #[must_use]
    pub fn experiment(&self, experiment_id: &str) -> Option<&SignalRecord> {
        self.experiments
            .iter()
            .find(|s| s.result.experiment_id == experiment_id)
    }

    /// Every task settled and the plan exhausted
    ///
    /// Non-cancelled tasks must be completed or failed with the failure
    /// resolved by compensation, and every validation-gated task must have
    /// received its QC outcome unless it was compensated.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.plan_complete
            && self.pending_plan.is_empty()
            && self.tasks.iter().all(|t| match t.state {
                TaskState::Cancelled => true,
                TaskState::Completed => {
                    !t.spec.requires_validation || t.validation().is_some() || t.is_compensated()
                }
                TaskState::Failed => t.is_resolved_failure(),
                _ => false,
            })
    }

    /// Output of every completed, uncompensated task
    #[must_use]
    pub fn results(&self) -> BTreeMap<TaskId, Value> {
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::Completed && !t.is_compensated())
            .filter_map(|t| t.output.clone().map(|o| (t.id().clone(), o)))
            .collect()
    }
}
