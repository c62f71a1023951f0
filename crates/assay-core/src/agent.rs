//! Agent control loop
//!
//! Planner, Executor and Critic cooperate over one workflow:
//! - the Planner (an injected [`Reasoner`]) turns the goal, the registry
//!   listing and everything that happened so far into plan steps
//! - the Executor submits one step at a time, runs its tasks concurrently,
//!   applies wet-lab signals and failure policy
//! - the Critic (same [`Reasoner`]) accepts each completed result or asks
//!   the Planner for a refined plan
//!
//! The loop keeps no position of its own. Each iteration reads the workflow
//! aggregate and does the first thing it calls for, so a loop started over a
//! recovered workflow carries on where the crashed one stopped.

use crate::config::OrchestratorConfig;
use crate::error::{AgentError, ReasonerError};
use assay_kernel::{
    Compensator, Dispatcher, ExperimentResult, FailurePolicy, PlanMode, PlanStep, ReplanReason,
    RetryPolicy, SignalDisposition, TaskId, TaskRunner, TaskSpec, TaskState, TaskStatus, Verdict,
    WorkflowError, WorkflowId, WorkflowMachine, WorkflowState, WorkflowStatus,
};
use assay_registry::{AlgorithmManifest, ResourceRequirements, Version};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// What the Planner sees
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub workflow_id: WorkflowId,
    pub workflow_type: String,
    /// Workflow input
    pub goal: Value,
    pub version: u32,
    /// Planner rounds that produced steps so far
    pub round: u32,
    /// Outputs of completed, uncompensated tasks
    pub results: BTreeMap<TaskId, Value>,
    /// Full task history in submission order
    pub tasks: Vec<TaskStatus>,
    /// Outcomes since the last plan, oldest first
    pub reasons: Vec<ReplanReason>,
    /// Steps planned but not yet submitted
    pub pending_steps: Vec<PlanStep>,
    /// Registry listing at planning time
    pub algorithms: Vec<Arc<AlgorithmManifest>>,
}

impl PlanContext {
    fn new(status: &WorkflowStatus, algorithms: Vec<Arc<AlgorithmManifest>>) -> Self {
        Self {
            workflow_id: status.workflow_id.clone(),
            workflow_type: status.workflow_type.clone(),
            goal: status.input.clone(),
            version: status.version,
            round: status.planning_rounds,
            results: status.results(),
            tasks: status.tasks.clone(),
            reasons: status.replan.clone(),
            pending_steps: status.pending_plan.iter().cloned().collect(),
            algorithms,
        }
    }

    /// Nothing planned or run yet
    #[inline]
    #[must_use]
    pub fn is_initial(&self) -> bool {
        self.round == 0 && self.tasks.is_empty()
    }

    /// Highest registered version of an algorithm
    #[must_use]
    pub fn algorithm(&self, name: &str) -> Option<&Arc<AlgorithmManifest>> {
        self.algorithms
            .iter()
            .filter(|m| m.name == name)
            .max_by(|a, b| a.version.cmp(&b.version))
    }
}

/// What the Critic sees
#[derive(Debug, Clone)]
pub struct CritiqueContext {
    pub workflow_id: WorkflowId,
    pub workflow_type: String,
    pub goal: Value,
    pub version: u32,
    /// The completed task under review
    pub task: TaskStatus,
    /// Wet-lab result that validated the task, if it was gated
    pub experiment: Option<ExperimentResult>,
}

/// Planner answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PlanDecision {
    /// More work; an empty list counts as `Done`
    Steps { steps: Vec<PlanStep>, mode: PlanMode },
    /// Goal reached
    Done,
}

impl PlanDecision {
    /// Steps appended after the pending ones
    #[inline]
    #[must_use]
    pub fn append(steps: Vec<PlanStep>) -> Self {
        Self::Steps {
            steps,
            mode: PlanMode::Append,
        }
    }

    /// Steps replacing every unsubmitted step
    #[inline]
    #[must_use]
    pub fn replace(steps: Vec<PlanStep>) -> Self {
        Self::Steps {
            steps,
            mode: PlanMode::ReplacePending,
        }
    }
}

/// The injected decision capability behind Planner and Critic
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Decide the next plan fragment
    async fn plan(&self, ctx: &PlanContext) -> Result<PlanDecision, ReasonerError>;

    /// Judge a completed task
    async fn critique(&self, ctx: &CritiqueContext) -> Result<Verdict, ReasonerError>;
}

enum Progress {
    Continue,
    Wait,
    Finished(WorkflowState),
}

/// Drives one workflow from its current state to a terminal one
pub struct ControlLoop {
    dispatcher: Arc<Dispatcher>,
    reasoner: Arc<dyn Reasoner>,
    retry: RetryPolicy,
    failure_policy: FailurePolicy,
    max_planning_rounds: Option<u32>,
}

impl std::fmt::Debug for ControlLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLoop")
            .field("retry", &self.retry)
            .field("failure_policy", &self.failure_policy)
            .field("max_planning_rounds", &self.max_planning_rounds)
            .finish_non_exhaustive()
    }
}

impl ControlLoop {
    /// Create loop with policies from `config`
    #[must_use]
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        reasoner: Arc<dyn Reasoner>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            dispatcher,
            reasoner,
            retry: config.retry.clone(),
            failure_policy: config.failure_policy,
            max_planning_rounds: config.max_planning_rounds,
        }
    }

    /// Run until the workflow is terminal or `cancel` fires
    ///
    /// Reasoner failures, a planning limit breach and rejected plans fail the
    /// workflow with the error recorded. Only errors that cannot be recorded
    /// (log persistence) are returned.
    pub async fn run(
        &self,
        machine: &Mutex<WorkflowMachine>,
        cancel: &CancellationToken,
        signals: &Notify,
    ) -> Result<WorkflowState, AgentError> {
        loop {
            let progress = match self.advance(machine, cancel).await {
                Ok(progress) => progress,
                Err(e) => return self.abort(machine, e).await,
            };
            match progress {
                Progress::Continue => {}
                Progress::Finished(state) => return Ok(state),
                Progress::Wait => {
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        () = signals.notified() => {}
                    }
                }
            }
        }
    }

    async fn abort(
        &self,
        machine: &Mutex<WorkflowMachine>,
        error: AgentError,
    ) -> Result<WorkflowState, AgentError> {
        let mut guard = machine.lock().await;
        if guard.is_terminal() {
            // Lost a race with cancellation or termination
            return Ok(guard.state());
        }
        if error.is_persistence() {
            return Err(error);
        }
        tracing::error!(workflow_id = %guard.id(), error = %error, "control loop aborted");
        guard.fail(&error.to_string())?;
        Ok(guard.state())
    }

    async fn advance(
        &self,
        machine: &Mutex<WorkflowMachine>,
        cancel: &CancellationToken,
    ) -> Result<Progress, AgentError> {
        let snapshot = machine.lock().await.status().clone();
        if snapshot.state.is_terminal() || cancel.is_cancelled() {
            return Ok(Progress::Finished(snapshot.state));
        }

        if snapshot.outstanding().next().is_some() {
            self.run_outstanding(machine, cancel).await?;
            return Ok(Progress::Continue);
        }

        if !machine.lock().await.ready_signals().is_empty() {
            match Compensator::new(&self.dispatcher).apply_ready_signals(machine).await {
                // A failed compensation has already failed the workflow
                Ok(_) | Err(WorkflowError::Compensation(_)) => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(Progress::Continue);
        }

        if let Some(failed) = snapshot
            .tasks
            .iter()
            .find(|t| t.state == TaskState::Failed && !t.is_resolved_failure())
        {
            self.handle_failure(machine, failed).await?;
            return Ok(Progress::Continue);
        }

        if let Some(task) = snapshot.tasks.iter().find(|t| is_reviewable(t)) {
            self.review(machine, &snapshot, task, cancel).await?;
            return Ok(Progress::Continue);
        }
        if snapshot.tasks.iter().any(awaits_validation) {
            tracing::debug!(workflow_id = %snapshot.workflow_id, "waiting for experiment results");
            return Ok(Progress::Wait);
        }

        if !snapshot.replan.is_empty() {
            self.plan(machine, &snapshot, cancel).await?;
            return Ok(Progress::Continue);
        }

        if let Some(step) = snapshot.pending_plan.front() {
            let specs = self.materialize(&snapshot, step);
            machine
                .lock()
                .await
                .submit_step(step.description.clone(), specs)?;
            return Ok(Progress::Continue);
        }

        if !snapshot.plan_complete {
            self.plan(machine, &snapshot, cancel).await?;
            return Ok(Progress::Continue);
        }

        let mut guard = machine.lock().await;
        if guard.complete()? {
            return Ok(Progress::Finished(WorkflowState::Completed));
        }
        if guard.has_pending_signals() {
            return Ok(Progress::Wait);
        }
        Err(AgentError::Stalled)
    }

    /// Run every outstanding task concurrently
    ///
    /// Pending tasks whose dependencies are no longer usable are cancelled
    /// instead of dispatched.
    async fn run_outstanding(
        &self,
        machine: &Mutex<WorkflowMachine>,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let runnable = {
            let mut guard = machine.lock().await;
            let mut blocked = Vec::new();
            let mut runnable = Vec::new();
            for task in guard.status().outstanding() {
                let unusable = task.spec.depends_on.iter().find(|d| {
                    !guard
                        .task(d)
                        .is_some_and(|t| t.state == TaskState::Completed && !t.is_compensated())
                });
                match (task.state, unusable) {
                    (TaskState::Pending, Some(dep)) => {
                        blocked.push((task.id().clone(), dep.clone()));
                    }
                    _ => runnable.push(task.id().clone()),
                }
            }
            for (task_id, dep) in blocked {
                guard.mark_cancelled(&task_id, &format!("dependency {dep} is unavailable"))?;
            }
            runnable
        };

        let runner = TaskRunner::new(&self.dispatcher, &self.retry);
        let runs = runnable.iter().map(|task_id| runner.run(machine, task_id, cancel));
        let results = join_all(runs).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    async fn handle_failure(
        &self,
        machine: &Mutex<WorkflowMachine>,
        failed: &TaskStatus,
    ) -> Result<(), AgentError> {
        let error = failed.error.clone().unwrap_or_default();
        match self.failure_policy {
            FailurePolicy::FailWorkflow => {
                machine
                    .lock()
                    .await
                    .fail(&format!("task {} failed: {error}", failed.id()))?;
            }
            FailurePolicy::Compensate => {
                tracing::info!(task_id = %failed.id(), %error, "compensating failed task");
                match Compensator::new(&self.dispatcher)
                    .resolve_failure(machine, failed.id())
                    .await
                {
                    Ok(_) | Err(WorkflowError::Compensation(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    async fn review(
        &self,
        machine: &Mutex<WorkflowMachine>,
        snapshot: &WorkflowStatus,
        task: &TaskStatus,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let experiment = snapshot
            .experiments
            .iter()
            .rev()
            .find(|s| {
                &s.result.task_id == task.id()
                    && matches!(s.disposition, SignalDisposition::Advanced { .. })
            })
            .map(|s| s.result.clone());
        let ctx = CritiqueContext {
            workflow_id: snapshot.workflow_id.clone(),
            workflow_type: snapshot.workflow_type.clone(),
            goal: snapshot.input.clone(),
            version: snapshot.version,
            task: task.clone(),
            experiment,
        };

        let verdict = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            verdict = self.reasoner.critique(&ctx) => verdict?,
        };
        tracing::info!(
            workflow_id = %snapshot.workflow_id,
            task_id = %task.id(),
            ?verdict,
            "task reviewed"
        );
        machine.lock().await.review(task.id(), verdict)?;
        Ok(())
    }

    async fn plan(
        &self,
        machine: &Mutex<WorkflowMachine>,
        snapshot: &WorkflowStatus,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let algorithms = self
            .dispatcher
            .registry()
            .list()
            .manifests()
            .cloned()
            .collect();
        let ctx = PlanContext::new(snapshot, algorithms);

        let decision = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            decision = self.reasoner.plan(&ctx) => decision?,
        };

        match decision {
            PlanDecision::Steps { steps, mode } if !steps.is_empty() => {
                if let Some(limit) = self.max_planning_rounds {
                    if snapshot.planning_rounds >= limit {
                        return Err(AgentError::PlanningLimit { limit });
                    }
                }
                machine.lock().await.extend_plan(steps, mode)?;
            }
            _ => {
                tracing::info!(
                    workflow_id = %snapshot.workflow_id,
                    "planner reports no further steps"
                );
                machine.lock().await.finish_plan()?;
            }
        }
        Ok(())
    }

    /// Resolve versions and default resources through the registry
    ///
    /// An algorithm that doesn't resolve is kept as requested; the
    /// dispatcher then fails that task before dispatch.
    fn materialize(&self, status: &WorkflowStatus, step: &PlanStep) -> Vec<TaskSpec> {
        let index = status
            .tasks
            .iter()
            .filter_map(|t| t.spec.labels.get("step"))
            .collect::<HashSet<_>>()
            .len()
            + 1;

        step.tasks
            .iter()
            .map(|planned| {
                match self
                    .dispatcher
                    .registry()
                    .lookup(&planned.algorithm, planned.version.as_ref())
                {
                    Ok(entry) => planned.materialize(
                        &status.workflow_id,
                        entry.manifest.version.clone(),
                        &entry.manifest.resources,
                        index,
                        &step.description,
                    ),
                    Err(e) => {
                        tracing::warn!(
                            workflow_id = %status.workflow_id,
                            algorithm = %planned.algorithm,
                            error = %e,
                            "planned algorithm not registered"
                        );
                        planned.materialize(
                            &status.workflow_id,
                            planned.version.clone().unwrap_or_else(|| Version::new(0, 0, 0)),
                            &ResourceRequirements::default(),
                            index,
                            &step.description,
                        )
                    }
                }
            })
            .collect()
    }
}

/// Completed and ready for the Critic
fn is_reviewable(task: &TaskStatus) -> bool {
    task.state == TaskState::Completed
        && !task.is_compensated()
        && task.verdict().is_none()
        && (!task.spec.requires_validation || task.validation() == Some(true))
}

/// Completed but gated on a wet-lab result that hasn't been applied
fn awaits_validation(task: &TaskStatus) -> bool {
    task.state == TaskState::Completed
        && task.spec.requires_validation
        && !task.is_compensated()
        && task.validation().is_none()
}
