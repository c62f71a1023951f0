//! Workflow state machine
//!
//! [`WorkflowMachine`] owns one workflow aggregate and its log segment.
//! Every operation is expressed as a [`WorkflowEvent`]: the event is sealed
//! into a chained record, applied to a copy of the aggregate, persisted, and
//! only then swapped in. A rejected event or a failed write leaves the
//! in-memory state untouched.

use crate::error::{TransitionError, WorkflowError};
use crate::events::WorkflowEvent;
use crate::log::{EventLog, EventStore};
use crate::types::{
    CompensationTrigger, ExperimentResult, PlanMode, PlanStep, SignalDisposition, TaskId,
    TaskSpec, TaskState, TaskStatus, Verdict, WorkflowId, WorkflowState, WorkflowStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How a signal was taken in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalReceipt {
    /// Task already completed; the signal is ready to apply
    Accepted,
    /// Held until the task completes
    Deferred,
    /// Experiment id seen before; ignored
    Duplicate,
}

/// Acknowledgement returned to the signal sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalAck {
    pub workflow_id: WorkflowId,
    pub experiment_id: String,
    pub receipt: SignalReceipt,
}

/// One workflow's aggregate plus its durable log
pub struct WorkflowMachine {
    status: WorkflowStatus,
    log: EventLog,
    observer: Option<watch::Sender<WorkflowStatus>>,
}

impl std::fmt::Debug for WorkflowMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowMachine")
            .field("workflow_id", &self.status.workflow_id)
            .field("state", &self.status.state)
            .field("version", &self.status.version)
            .field("tasks", &self.status.tasks.len())
            .finish_non_exhaustive()
    }
}

impl WorkflowMachine {
    /// Start a new workflow
    ///
    /// # Errors
    /// `AlreadyStarted` if the store already holds a segment for this id.
    pub fn start(
        store: Arc<dyn EventStore>,
        workflow_id: WorkflowId,
        workflow_type: impl Into<String>,
        input: Value,
    ) -> Result<Self, WorkflowError> {
        let (mut log, existing) = EventLog::open(store, workflow_id.clone())?;
        if !existing.is_empty() {
            return Err(TransitionError::AlreadyStarted.into());
        }

        let record = log.seal(
            WorkflowEvent::WorkflowStarted {
                workflow_type: workflow_type.into(),
                input,
            },
            Utc::now(),
        )?;
        let status = WorkflowStatus::started(
            workflow_id,
            record.sequence,
            record.recorded_at,
            &record.event,
        )?;
        log.commit(&record)?;

        tracing::info!(
            workflow_id = %status.workflow_id,
            workflow_type = %status.workflow_type,
            "workflow started"
        );
        Ok(Self {
            status,
            log,
            observer: None,
        })
    }

    /// Rebuild a workflow from its log; `None` if nothing was ever recorded
    pub fn recover(
        store: Arc<dyn EventStore>,
        workflow_id: WorkflowId,
    ) -> Result<Option<Self>, WorkflowError> {
        let (log, records) = EventLog::open(store, workflow_id)?;
        if records.is_empty() {
            return Ok(None);
        }
        let status = WorkflowStatus::replay(&records)?;

        tracing::info!(
            workflow_id = %status.workflow_id,
            state = %status.state,
            events = records.len(),
            "workflow recovered from log"
        );
        Ok(Some(Self {
            status,
            log,
            observer: None,
        }))
    }

    /// Publish every new state to `observer`
    #[must_use]
    pub fn with_observer(mut self, observer: watch::Sender<WorkflowStatus>) -> Self {
        observer.send_replace(self.status.clone());
        self.observer = Some(observer);
        self
    }

    /// Current aggregate
    #[inline]
    #[must_use]
    pub fn status(&self) -> &WorkflowStatus {
        &self.status
    }

    /// Workflow id
    #[inline]
    #[must_use]
    pub fn id(&self) -> &WorkflowId {
        &self.status.workflow_id
    }

    /// Workflow no longer running
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.state.is_terminal()
    }

    /// Task by id
    #[must_use]
    pub fn task(&self, task_id: &TaskId) -> Option<&TaskStatus> {
        self.status.task(task_id)
    }

    fn record(&mut self, event: WorkflowEvent) -> Result<&WorkflowStatus, WorkflowError> {
        let record = self.log.seal(event, Utc::now())?;
        let mut next = self.status.clone();
        next.apply_record(&record)?;
        self.log.commit(&record)?;
        self.status = next;

        tracing::debug!(
            workflow_id = %self.status.workflow_id,
            sequence = record.sequence,
            event = record.event.kind(),
            "event recorded"
        );
        if let Some(observer) = &self.observer {
            observer.send_replace(self.status.clone());
        }
        Ok(&self.status)
    }

    fn ensure_running(&self) -> Result<(), WorkflowError> {
        if self.is_terminal() {
            Err(TransitionError::WorkflowTerminal {
                state: self.status.state,
            }
            .into())
        } else {
            Ok(())
        }
    }

    /// Submit a task outside the plan
    pub fn submit(&mut self, mut spec: TaskSpec) -> Result<(), WorkflowError> {
        spec.workflow_id = self.status.workflow_id.clone();
        tracing::info!(
            workflow_id = %spec.workflow_id,
            task_id = %spec.task_id,
            algorithm = %spec.algorithm,
            "task submitted"
        );
        self.record(WorkflowEvent::TaskSubmitted { spec })?;
        Ok(())
    }

    /// Add planner steps
    pub fn extend_plan(
        &mut self,
        steps: Vec<PlanStep>,
        mode: PlanMode,
    ) -> Result<(), WorkflowError> {
        tracing::info!(
            workflow_id = %self.status.workflow_id,
            steps = steps.len(),
            ?mode,
            "plan extended"
        );
        self.record(WorkflowEvent::PlanExtended { steps, mode })?;
        Ok(())
    }

    /// Next unsubmitted plan step
    #[must_use]
    pub fn next_step(&self) -> Option<&PlanStep> {
        self.status.pending_plan.front()
    }

    /// Pop the front plan step, submitting its materialised tasks
    pub fn submit_step(
        &mut self,
        description: String,
        tasks: Vec<TaskSpec>,
    ) -> Result<(), WorkflowError> {
        tracing::info!(
            workflow_id = %self.status.workflow_id,
            step = %description,
            tasks = tasks.len(),
            "plan step submitted"
        );
        self.record(WorkflowEvent::StepSubmitted { description, tasks })?;
        Ok(())
    }

    /// Planner has nothing more to add
    pub fn finish_plan(&mut self) -> Result<(), WorkflowError> {
        self.record(WorkflowEvent::PlanCompleted)?;
        Ok(())
    }

    /// `pending | retrying → running`
    pub fn mark_running(&mut self, task_id: &TaskId, attempt: u32) -> Result<(), WorkflowError> {
        self.record(WorkflowEvent::TaskStarted {
            task_id: task_id.clone(),
            attempt,
        })?;
        Ok(())
    }

    /// `running → completed`
    pub fn mark_complete(&mut self, task_id: &TaskId, output: Value) -> Result<(), WorkflowError> {
        self.record(WorkflowEvent::TaskCompleted {
            task_id: task_id.clone(),
            output,
        })?;
        tracing::info!(workflow_id = %self.status.workflow_id, %task_id, "task completed");
        Ok(())
    }

    /// `running → retrying`
    pub fn mark_retry(
        &mut self,
        task_id: &TaskId,
        error: &str,
        backoff: Duration,
    ) -> Result<(), WorkflowError> {
        self.record(WorkflowEvent::TaskRetryScheduled {
            task_id: task_id.clone(),
            error: error.to_string(),
            backoff_ms: u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
        })?;
        Ok(())
    }

    /// `pending | running | retrying → failed`
    pub fn mark_failed(&mut self, task_id: &TaskId, error: &str) -> Result<(), WorkflowError> {
        self.record(WorkflowEvent::TaskFailed {
            task_id: task_id.clone(),
            error: error.to_string(),
        })?;
        tracing::warn!(workflow_id = %self.status.workflow_id, %task_id, %error, "task failed");
        Ok(())
    }

    /// `pending | running | retrying → cancelled`
    pub fn mark_cancelled(&mut self, task_id: &TaskId, reason: &str) -> Result<(), WorkflowError> {
        self.record(WorkflowEvent::TaskCancelled {
            task_id: task_id.clone(),
            reason: reason.to_string(),
        })?;
        Ok(())
    }

    /// Record the Critic's verdict on a completed task
    pub fn review(&mut self, task_id: &TaskId, verdict: Verdict) -> Result<(), WorkflowError> {
        self.record(WorkflowEvent::TaskReviewed {
            task_id: task_id.clone(),
            verdict,
        })?;
        Ok(())
    }

    /// Mark a failed task as resolved by compensation
    pub fn resolve_failure(&mut self, task_id: &TaskId) -> Result<(), WorkflowError> {
        self.record(WorkflowEvent::FailureResolved {
            task_id: task_id.clone(),
        })?;
        Ok(())
    }

    /// Take in a wet-lab result
    ///
    /// # Errors
    /// `WorkflowTerminal` once the workflow has ended, `UnknownTask` if the
    /// result references a task that was never submitted.
    pub fn receive_signal(&mut self, result: ExperimentResult) -> Result<SignalAck, WorkflowError> {
        self.ensure_running()?;
        let ack = |receipt| SignalAck {
            workflow_id: self.status.workflow_id.clone(),
            experiment_id: result.experiment_id.clone(),
            receipt,
        };

        if self.status.experiment(&result.experiment_id).is_some() {
            tracing::info!(
                workflow_id = %self.status.workflow_id,
                experiment_id = %result.experiment_id,
                "duplicate experiment result ignored"
            );
            return Ok(ack(SignalReceipt::Duplicate));
        }
        let task = self
            .task(&result.task_id)
            .ok_or_else(|| TransitionError::UnknownTask(result.task_id.clone()))?;
        let receipt = if task.state == TaskState::Completed {
            SignalReceipt::Accepted
        } else {
            SignalReceipt::Deferred
        };
        let ack = ack(receipt);

        tracing::info!(
            workflow_id = %self.status.workflow_id,
            experiment_id = %result.experiment_id,
            task_id = %result.task_id,
            pass_qc = result.pass_qc,
            ?receipt,
            "experiment result received"
        );
        self.record(WorkflowEvent::SignalReceived { result })?;
        Ok(ack)
    }

    /// Unprocessed signals whose task has completed, in arrival order
    #[must_use]
    pub fn ready_signals(&self) -> Vec<ExperimentResult> {
        self.status
            .experiments
            .iter()
            .filter(|s| s.disposition == SignalDisposition::Pending)
            .filter(|s| {
                self.task(&s.result.task_id)
                    .is_some_and(|t| t.state == TaskState::Completed)
            })
            .map(|s| s.result.clone())
            .collect()
    }

    /// Signals still waiting for their task
    #[must_use]
    pub fn has_pending_signals(&self) -> bool {
        self.status
            .experiments
            .iter()
            .any(|s| s.disposition == SignalDisposition::Pending)
    }

    /// QC pass: continue as the next logical version
    pub fn advance_version(
        &mut self,
        experiment_id: &str,
        label: Option<String>,
    ) -> Result<u32, WorkflowError> {
        let from = self.status.version;
        self.record(WorkflowEvent::ContinuedAsNew {
            experiment_id: experiment_id.to_string(),
            label,
        })?;
        tracing::info!(
            workflow_id = %self.status.workflow_id,
            experiment_id,
            from_version = from,
            to_version = self.status.version,
            "continued as new version"
        );
        Ok(self.status.version)
    }

    /// QC fail fully compensated
    pub fn record_qc_compensated(
        &mut self,
        experiment_id: &str,
        tasks: Vec<TaskId>,
    ) -> Result<(), WorkflowError> {
        self.record(WorkflowEvent::QcFailureCompensated {
            experiment_id: experiment_id.to_string(),
            tasks,
        })?;
        Ok(())
    }

    /// A compensating action succeeded
    pub fn record_compensated(
        &mut self,
        task_id: &TaskId,
        trigger: CompensationTrigger,
    ) -> Result<(), WorkflowError> {
        self.record(WorkflowEvent::TaskCompensated {
            task_id: task_id.clone(),
            trigger,
        })?;
        tracing::info!(workflow_id = %self.status.workflow_id, %task_id, "task compensated");
        Ok(())
    }

    /// A compensating action failed
    pub fn record_compensation_failed(
        &mut self,
        task_id: &TaskId,
        trigger: CompensationTrigger,
        error: &str,
    ) -> Result<(), WorkflowError> {
        self.record(WorkflowEvent::CompensationFailed {
            task_id: task_id.clone(),
            trigger,
            error: error.to_string(),
        })?;
        tracing::error!(
            workflow_id = %self.status.workflow_id,
            %task_id,
            %error,
            "compensation failed"
        );
        Ok(())
    }

    /// Tasks to compensate when `task_id` is invalidated
    ///
    /// The task itself plus every completed task that transitively depends
    /// on it, dependents before their dependencies and later submissions
    /// first among peers. Already compensated tasks are skipped.
    pub fn compensation_plan(&self, task_id: &TaskId) -> Result<Vec<TaskId>, WorkflowError> {
        if self.task(task_id).is_none() {
            return Err(TransitionError::UnknownTask(task_id.clone()).into());
        }
        let affected = self.downstream_of(task_id);
        Ok(self.reverse_completed(|t| t.id() == task_id || affected.contains(t.id())))
    }

    /// Completed tasks a failed task transitively consumed, in compensation order
    pub fn upstream_plan(&self, task_id: &TaskId) -> Result<Vec<TaskId>, WorkflowError> {
        let task = self
            .task(task_id)
            .ok_or_else(|| TransitionError::UnknownTask(task_id.clone()))?;

        let mut upstream = HashSet::new();
        let mut frontier = task.spec.depends_on.clone();
        while let Some(next) = frontier.pop() {
            if upstream.insert(next.clone()) {
                if let Some(dep) = self.task(&next) {
                    frontier.extend(dep.spec.depends_on.iter().cloned());
                }
            }
        }
        Ok(self.reverse_completed(|t| upstream.contains(t.id())))
    }

    /// Transitive dependents that have not started yet
    #[must_use]
    pub fn pending_dependents(&self, task_id: &TaskId) -> Vec<TaskId> {
        let downstream = self.downstream_of(task_id);
        self.status
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Pending && downstream.contains(t.id()))
            .map(|t| t.id().clone())
            .collect()
    }

    /// Every task that transitively depends on `task_id`
    fn downstream_of(&self, task_id: &TaskId) -> HashSet<TaskId> {
        let mut affected: HashSet<TaskId> = HashSet::new();
        // Dependencies precede dependents in submission order, so one pass suffices
        for task in &self.status.tasks {
            if task
                .spec
                .depends_on
                .iter()
                .any(|d| d == task_id || affected.contains(d))
            {
                affected.insert(task.id().clone());
            }
        }
        affected
    }

    fn reverse_completed(&self, include: impl Fn(&TaskStatus) -> bool) -> Vec<TaskId> {
        self.status
            .tasks
            .iter()
            .rev()
            .filter(|t| t.state == TaskState::Completed && !t.is_compensated())
            .filter(|t| include(t))
            .map(|t| t.id().clone())
            .collect()
    }

    /// Complete the workflow if every completion condition holds
    pub fn complete(&mut self) -> Result<bool, WorkflowError> {
        if self.is_terminal() || !self.status.is_complete() {
            return Ok(false);
        }
        self.record(WorkflowEvent::WorkflowCompleted)?;
        tracing::info!(
            workflow_id = %self.status.workflow_id,
            version = self.status.version,
            tasks = self.status.tasks.len(),
            "workflow completed"
        );
        Ok(true)
    }

    /// Cancel outstanding tasks, then fail the workflow
    pub fn fail(&mut self, error: &str) -> Result<(), WorkflowError> {
        self.ensure_running()?;
        self.cancel_outstanding("workflow failed")?;
        self.record(WorkflowEvent::WorkflowFailed {
            error: error.to_string(),
        })?;
        tracing::error!(workflow_id = %self.status.workflow_id, %error, "workflow failed");
        Ok(())
    }

    /// Cancel outstanding tasks, then the workflow
    pub fn cancel(&mut self, reason: &str) -> Result<(), WorkflowError> {
        self.ensure_running()?;
        self.cancel_outstanding(reason)?;
        self.record(WorkflowEvent::WorkflowCancelled {
            reason: reason.to_string(),
        })?;
        tracing::info!(workflow_id = %self.status.workflow_id, %reason, "workflow cancelled");
        Ok(())
    }

    /// Operator termination
    pub fn terminate(&mut self, reason: &str) -> Result<(), WorkflowError> {
        self.ensure_running()?;
        self.cancel_outstanding("workflow terminated")?;
        self.record(WorkflowEvent::WorkflowTerminated {
            reason: reason.to_string(),
        })?;
        tracing::warn!(workflow_id = %self.status.workflow_id, %reason, "workflow terminated");
        Ok(())
    }

    fn cancel_outstanding(&mut self, reason: &str) -> Result<(), WorkflowError> {
        let outstanding: Vec<TaskId> = self.status.outstanding().map(|t| t.id().clone()).collect();
        for task_id in outstanding {
            self.mark_cancelled(&task_id, reason)?;
        }
        Ok(())
    }

    /// Workflow state
    #[inline]
    #[must_use]
    pub fn state(&self) -> WorkflowState {
        self.status.state
    }
}
