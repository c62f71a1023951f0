//! Testing utilities for the Assay workspace
//!
//! Scripted algorithm services, a scripted reasoner and fixtures.

#![allow(missing_docs)]

use assay_core::{
    CritiqueContext, OrchestratorConfig, PlanContext, PlanDecision, Reasoner, ReasonerError,
    WorkflowEngine,
};
use assay_kernel::{
    AlgorithmService, ExperimentResult, HealthReport, HealthStatus, PlanStep,
    PlannedTask, RetryPolicy, ServiceError, ServiceHandle, ServiceRegistry, TaskId, TimeoutPolicy,
    Verdict, WorkflowId, WorkflowStatus,
};
use assay_registry::{AlgorithmManifest, DataType, IoSpec, Version};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Algorithm services
// ---------------------------------------------------------------------------

/// What one `predict` call does
#[derive(Debug, Clone)]
pub enum Outcome {
    Output(Value),
    Fail(ServiceError),
    /// Never answers; only a timeout or cancel ends the call
    Hang,
}

impl Outcome {
    pub fn transient(message: &str) -> Self {
        Self::Fail(ServiceError::transient(message))
    }

    pub fn permanent(message: &str) -> Self {
        Self::Fail(ServiceError::permanent(message))
    }
}

/// A call a stub received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Predict { algorithm: String, task_id: TaskId },
    Cancel { algorithm: String, task_id: TaskId },
    Compensate { algorithm: String, task_id: TaskId },
}

/// Ordered record of calls, shareable across stubs
#[derive(Debug, Clone, Default)]
pub struct CallJournal(Arc<Mutex<Vec<Call>>>);

impl CallJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: Call) {
        self.0.lock().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().clone()
    }

    pub fn predicted(&self) -> Vec<TaskId> {
        self.select(|c| match c {
            Call::Predict { task_id, .. } => Some(task_id.clone()),
            _ => None,
        })
    }

    pub fn cancelled(&self) -> Vec<TaskId> {
        self.select(|c| match c {
            Call::Cancel { task_id, .. } => Some(task_id.clone()),
            _ => None,
        })
    }

    pub fn compensated(&self) -> Vec<TaskId> {
        self.select(|c| match c {
            Call::Compensate { task_id, .. } => Some(task_id.clone()),
            _ => None,
        })
    }

    fn select(&self, f: impl Fn(&Call) -> Option<TaskId>) -> Vec<TaskId> {
        self.0.lock().iter().filter_map(f).collect()
    }
}

/// Scripted in-process algorithm service
///
/// Without a script every prediction succeeds and echoes its input.
pub struct StubService {
    manifest: AlgorithmManifest,
    queued: Mutex<VecDeque<Outcome>>,
    per_task: Mutex<HashMap<TaskId, VecDeque<Outcome>>>,
    delays: Mutex<HashMap<TaskId, Duration>>,
    health: Mutex<HealthStatus>,
    compensation_error: Mutex<Option<ServiceError>>,
    journal: CallJournal,
}

impl StubService {
    pub fn new(manifest: AlgorithmManifest) -> Self {
        Self {
            manifest,
            queued: Mutex::new(VecDeque::new()),
            per_task: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            health: Mutex::new(HealthStatus::Healthy),
            compensation_error: Mutex::new(None),
            journal: CallJournal::new(),
        }
    }

    /// Record calls into a journal shared with other stubs
    #[must_use]
    pub fn with_journal(mut self, journal: &CallJournal) -> Self {
        self.journal = journal.clone();
        self
    }

    /// Delay every prediction of `task_id`
    #[must_use]
    pub fn with_delay(self, task_id: &str, delay: Duration) -> Self {
        self.delays.lock().insert(TaskId::new(task_id), delay);
        self
    }

    /// Next outcome for any task without its own script
    pub fn push(&self, outcome: Outcome) -> &Self {
        self.queued.lock().push_back(outcome);
        self
    }

    /// Next outcome for `task_id`
    pub fn push_for(&self, task_id: &str, outcome: Outcome) -> &Self {
        self.per_task
            .lock()
            .entry(TaskId::new(task_id))
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn set_health(&self, status: HealthStatus) {
        *self.health.lock() = status;
    }

    pub fn fail_compensation(&self, message: &str) {
        *self.compensation_error.lock() = Some(ServiceError::permanent(message));
    }

    pub fn journal(&self) -> &CallJournal {
        &self.journal
    }

    pub fn manifest_ref(&self) -> &AlgorithmManifest {
        &self.manifest
    }

    fn next_outcome(&self, task_id: &TaskId) -> Option<Outcome> {
        if let Some(script) = self.per_task.lock().get_mut(task_id) {
            if let Some(outcome) = script.pop_front() {
                return Some(outcome);
            }
        }
        self.queued.lock().pop_front()
    }
}

#[async_trait]
impl AlgorithmService for StubService {
    async fn predict(&self, task_id: &TaskId, input: &Value) -> Result<Value, ServiceError> {
        self.journal.record(Call::Predict {
            algorithm: self.manifest.name.clone(),
            task_id: task_id.clone(),
        });

        let delay = self.delays.lock().get(task_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_outcome(task_id) {
            Some(Outcome::Output(value)) => Ok(value),
            Some(Outcome::Fail(e)) => Err(e),
            Some(Outcome::Hang) => std::future::pending().await,
            None => Ok(json!({
                "algorithm": self.manifest.name,
                "task_id": task_id.to_string(),
                "input": input,
            })),
        }
    }

    async fn health(&self) -> HealthReport {
        HealthReport::new(*self.health.lock(), self.manifest.version.to_string())
    }

    async fn manifest(&self) -> Result<AlgorithmManifest, ServiceError> {
        Ok(self.manifest.clone())
    }

    async fn cancel(&self, task_id: &TaskId) -> Result<(), ServiceError> {
        self.journal.record(Call::Cancel {
            algorithm: self.manifest.name.clone(),
            task_id: task_id.clone(),
        });
        Ok(())
    }

    async fn compensate(&self, task_id: &TaskId, _output: &Value) -> Result<(), ServiceError> {
        self.journal.record(Call::Compensate {
            algorithm: self.manifest.name.clone(),
            task_id: task_id.clone(),
        });
        match self.compensation_error.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Register a stub under its own manifest
pub fn install(registry: &ServiceRegistry, stub: StubService) -> Arc<StubService> {
    let stub = Arc::new(stub);
    let handle: ServiceHandle = Arc::clone(&stub) as ServiceHandle;
    registry
        .register(stub.manifest.clone(), handle)
        .unwrap();
    stub
}

// ---------------------------------------------------------------------------
// Reasoner
// ---------------------------------------------------------------------------

/// Reasoner answering from queues
///
/// Plans default to `Done` and verdicts to `Accept` once the queues run dry,
/// unless a repeating plan is set.
#[derive(Default)]
pub struct ScriptedReasoner {
    plans: Mutex<VecDeque<Result<PlanDecision, ReasonerError>>>,
    verdicts: Mutex<VecDeque<Verdict>>,
    repeat: Option<PlanDecision>,
    planned: Mutex<Vec<PlanContext>>,
    critiqued: Mutex<Vec<CritiqueContext>>,
}

impl ScriptedReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn then_plan(self, decision: PlanDecision) -> Self {
        self.plans.lock().push_back(Ok(decision));
        self
    }

    #[must_use]
    pub fn then_fail(self, message: &str) -> Self {
        self.plans.lock().push_back(Err(ReasonerError::new(message)));
        self
    }

    #[must_use]
    pub fn then_verdict(self, verdict: Verdict) -> Self {
        self.verdicts.lock().push_back(verdict);
        self
    }

    /// Answer with `decision` once the queue is empty
    #[must_use]
    pub fn repeating(mut self, decision: PlanDecision) -> Self {
        self.repeat = Some(decision);
        self
    }

    pub fn push_plan(&self, decision: PlanDecision) {
        self.plans.lock().push_back(Ok(decision));
    }

    pub fn plan_contexts(&self) -> Vec<PlanContext> {
        self.planned.lock().clone()
    }

    pub fn critique_contexts(&self) -> Vec<CritiqueContext> {
        self.critiqued.lock().clone()
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn plan(&self, ctx: &PlanContext) -> Result<PlanDecision, ReasonerError> {
        self.planned.lock().push(ctx.clone());
        let next = self.plans.lock().pop_front();
        next.unwrap_or_else(|| Ok(self.repeat.clone().unwrap_or(PlanDecision::Done)))
    }

    async fn critique(&self, ctx: &CritiqueContext) -> Result<Verdict, ReasonerError> {
        self.critiqued.lock().push(ctx.clone());
        Ok(self.verdicts.lock().pop_front().unwrap_or(Verdict::Accept))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn version(s: &str) -> Version {
    s.parse().unwrap()
}

pub fn manifest(name: &str, v: &str) -> AlgorithmManifest {
    AlgorithmManifest::new(name, version(v), format!("python -m {name}.serve"))
}

/// Manifest requiring a `smiles` string input
pub fn scoring_manifest(name: &str) -> AlgorithmManifest {
    manifest(name, "1.0.0")
        .with_input(IoSpec::new("smiles", DataType::String))
        .with_output(IoSpec::new("score", DataType::Float))
}

/// Short backoff and timeouts so tests run fast
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig::new()
        .with_retry(
            RetryPolicy::default()
                .with_max_retries(2)
                .with_backoff(Duration::from_millis(5), Duration::from_millis(20)),
        )
        .with_timeouts(TimeoutPolicy::default().with_base(Duration::from_secs(2)))
}

pub fn task(id: &str, algorithm: &str) -> PlannedTask {
    PlannedTask::new(algorithm, json!({"smiles": "CCO"})).with_id(id)
}

pub fn step(description: &str, tasks: Vec<PlannedTask>) -> PlanStep {
    PlanStep::new(description, tasks)
}

pub fn experiment(
    workflow_id: &WorkflowId,
    task_id: &str,
    experiment_id: &str,
    pass_qc: bool,
) -> ExperimentResult {
    ExperimentResult::new(experiment_id, workflow_id.clone(), TaskId::new(task_id), pass_qc)
}

pub fn engine(
    registry: &Arc<ServiceRegistry>,
    reasoner: Arc<dyn Reasoner>,
    config: &OrchestratorConfig,
) -> Arc<WorkflowEngine> {
    Arc::new(WorkflowEngine::new(Arc::clone(registry), reasoner, config).unwrap())
}

/// Poll until `predicate` holds, panicking after five seconds
pub async fn wait_until(
    engine: &WorkflowEngine,
    workflow_id: &WorkflowId,
    predicate: impl Fn(&WorkflowStatus) -> bool,
) -> WorkflowStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = engine.get_workflow_status(workflow_id).unwrap();
        if predicate(&status) {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached; last status: {status:#?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
