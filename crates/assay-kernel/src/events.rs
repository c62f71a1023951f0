//! Workflow events and the pure fold over them
//!
//! [`WorkflowStatus::apply`] is the only code that mutates a workflow
//! aggregate. Live execution and crash recovery both go through it, so a
//! replayed log always reproduces the state the live process had.

use crate::error::TransitionError;
use crate::log::EventRecord;
use crate::state_machine::validate_transition;
use crate::types::{
    metadata, Checkpoint, CompensationOutcome, CompensationRecord, CompensationTrigger,
    ExperimentResult, PlanMode, PlanStep, ReplanReason, SignalDisposition, SignalRecord, TaskId,
    TaskSpec, TaskState, TaskStatus, Verdict, WorkflowId, WorkflowState, WorkflowStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};

/// Everything that can happen to a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        workflow_type: String,
        input: Value,
    },
    /// Planner produced steps
    PlanExtended {
        steps: Vec<PlanStep>,
        mode: PlanMode,
    },
    /// Front plan step popped and its tasks submitted
    StepSubmitted {
        description: String,
        tasks: Vec<TaskSpec>,
    },
    /// Task submitted outside the plan
    TaskSubmitted {
        spec: TaskSpec,
    },
    TaskStarted {
        task_id: TaskId,
        attempt: u32,
    },
    TaskCompleted {
        task_id: TaskId,
        output: Value,
    },
    TaskRetryScheduled {
        task_id: TaskId,
        error: String,
        backoff_ms: u64,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    TaskCancelled {
        task_id: TaskId,
        reason: String,
    },
    /// Critic verdict on a completed task
    TaskReviewed {
        task_id: TaskId,
        verdict: Verdict,
    },
    /// Failure compensated; no longer blocks completion
    FailureResolved {
        task_id: TaskId,
    },
    SignalReceived {
        result: ExperimentResult,
    },
    /// QC pass moved the workflow to the next logical version
    ContinuedAsNew {
        experiment_id: String,
        label: Option<String>,
    },
    /// QC fail handled by compensating `tasks`, in order
    QcFailureCompensated {
        experiment_id: String,
        tasks: Vec<TaskId>,
    },
    TaskCompensated {
        task_id: TaskId,
        trigger: CompensationTrigger,
    },
    CompensationFailed {
        task_id: TaskId,
        trigger: CompensationTrigger,
        error: String,
    },
    /// Planner reported no further steps
    PlanCompleted,
    WorkflowCompleted,
    WorkflowFailed {
        error: String,
    },
    WorkflowCancelled {
        reason: String,
    },
    WorkflowTerminated {
        reason: String,
    },
}

impl WorkflowEvent {
    /// Event name as written to the log
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::PlanExtended { .. } => "plan_extended",
            Self::StepSubmitted { .. } => "step_submitted",
            Self::TaskSubmitted { .. } => "task_submitted",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskRetryScheduled { .. } => "task_retry_scheduled",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskCancelled { .. } => "task_cancelled",
            Self::TaskReviewed { .. } => "task_reviewed",
            Self::FailureResolved { .. } => "failure_resolved",
            Self::SignalReceived { .. } => "signal_received",
            Self::ContinuedAsNew { .. } => "continued_as_new",
            Self::QcFailureCompensated { .. } => "qc_failure_compensated",
            Self::TaskCompensated { .. } => "task_compensated",
            Self::CompensationFailed { .. } => "compensation_failed",
            Self::PlanCompleted => "plan_completed",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowCancelled { .. } => "workflow_cancelled",
            Self::WorkflowTerminated { .. } => "workflow_terminated",
        }
    }
}

impl WorkflowStatus {
    /// Aggregate created by a `WorkflowStarted` event
    pub fn started(
        workflow_id: WorkflowId,
        sequence: u64,
        at: DateTime<Utc>,
        event: &WorkflowEvent,
    ) -> Result<Self, TransitionError> {
        let WorkflowEvent::WorkflowStarted {
            workflow_type,
            input,
        } = event
        else {
            return Err(TransitionError::NotStarted);
        };

        Ok(Self {
            workflow_id,
            workflow_type: workflow_type.clone(),
            input: input.clone(),
            state: WorkflowState::Running,
            version: 1,
            tasks: Vec::new(),
            started_at: at,
            updated_at: at,
            error: None,
            compensations: Vec::new(),
            experiments: Vec::new(),
            checkpoints: Vec::new(),
            pending_plan: VecDeque::new(),
            plan_complete: false,
            planning_rounds: 0,
            replan: Vec::new(),
            last_sequence: sequence,
        })
    }

    /// Rebuild an aggregate from its log
    pub fn replay<'a>(
        records: impl IntoIterator<Item = &'a EventRecord>,
    ) -> Result<Self, TransitionError> {
        let mut records = records.into_iter();
        let first = records.next().ok_or(TransitionError::NotStarted)?;
        let mut status = Self::started(
            first.workflow_id.clone(),
            first.sequence,
            first.recorded_at,
            &first.event,
        )?;
        for record in records {
            status.apply_record(record)?;
        }
        Ok(status)
    }

    /// Apply a logged record
    pub fn apply_record(&mut self, record: &EventRecord) -> Result<bool, TransitionError> {
        self.apply(record.sequence, record.recorded_at, &record.event)
    }

    /// Apply one event
    ///
    /// Returns `Ok(false)` without touching state when `sequence` was already
    /// applied. On error the aggregate may be partially modified; callers
    /// apply to a clone and discard it on failure.
    pub fn apply(
        &mut self,
        sequence: u64,
        at: DateTime<Utc>,
        event: &WorkflowEvent,
    ) -> Result<bool, TransitionError> {
        if sequence <= self.last_sequence {
            return Ok(false);
        }
        if self.state.is_terminal() {
            return Err(TransitionError::WorkflowTerminal { state: self.state });
        }

        match event {
            WorkflowEvent::WorkflowStarted { .. } => return Err(TransitionError::AlreadyStarted),

            WorkflowEvent::PlanExtended { steps, mode } => {
                if *mode == PlanMode::ReplacePending {
                    self.pending_plan.clear();
                }
                self.pending_plan.extend(steps.iter().cloned());
                self.planning_rounds += 1;
                self.plan_complete = false;
                self.replan.clear();
            }

            WorkflowEvent::StepSubmitted { tasks, .. } => {
                if self.pending_plan.pop_front().is_none() {
                    return Err(TransitionError::NoPendingStep);
                }
                self.submit(tasks)?;
            }

            WorkflowEvent::TaskSubmitted { spec } => {
                self.submit(std::slice::from_ref(spec))?;
            }

            WorkflowEvent::TaskStarted { task_id, .. } => {
                let task = self.transition(task_id, TaskState::Running)?;
                task.started_at.get_or_insert(at);
                task.error = None;
            }

            WorkflowEvent::TaskCompleted { task_id, output } => {
                let task = self.transition(task_id, TaskState::Completed)?;
                task.output = Some(output.clone());
                task.error = None;
                task.completed_at = Some(at);
            }

            WorkflowEvent::TaskRetryScheduled { task_id, error, .. } => {
                let task = self.transition(task_id, TaskState::Retrying)?;
                task.retry_count += 1;
                task.error = Some(error.clone());
            }

            WorkflowEvent::TaskFailed { task_id, error } => {
                let task = self.transition(task_id, TaskState::Failed)?;
                task.error = Some(error.clone());
                task.completed_at = Some(at);
            }

            WorkflowEvent::TaskCancelled { task_id, .. } => {
                let task = self.transition(task_id, TaskState::Cancelled)?;
                task.error = None;
                task.completed_at = Some(at);
            }

            WorkflowEvent::TaskReviewed { task_id, verdict } => {
                let task = self.settled_task(task_id, TaskState::Completed)?;
                task.metadata.insert(
                    metadata::VERDICT.into(),
                    serde_json::to_value(verdict).unwrap_or(Value::Null),
                );
                if let Verdict::Refine { feedback } = verdict {
                    self.replan.push(ReplanReason::Refine {
                        task_id: task_id.clone(),
                        feedback: feedback.clone(),
                    });
                }
            }

            WorkflowEvent::FailureResolved { task_id } => {
                let task = self.settled_task(task_id, TaskState::Failed)?;
                task.metadata.insert(metadata::RESOLVED.into(), Value::Bool(true));
                let error = task.error.clone().unwrap_or_default();
                self.replan.push(ReplanReason::TaskFailed {
                    task_id: task_id.clone(),
                    error,
                });
            }

            WorkflowEvent::SignalReceived { result } => {
                if self.task(&result.task_id).is_none() {
                    return Err(TransitionError::UnknownTask(result.task_id.clone()));
                }
                if self.experiment(&result.experiment_id).is_some() {
                    return Err(TransitionError::DuplicateExperiment(
                        result.experiment_id.clone(),
                    ));
                }
                self.experiments.push(SignalRecord {
                    result: result.clone(),
                    disposition: SignalDisposition::Pending,
                    received_at: at,
                });
            }

            WorkflowEvent::ContinuedAsNew {
                experiment_id,
                label,
            } => {
                let task_id = self.signal_task(experiment_id)?;
                self.settled_task(&task_id, TaskState::Completed)?
                    .metadata
                    .insert(metadata::VALIDATED.into(), Value::Bool(true));

                let from_version = self.version;
                self.version += 1;
                let carried = self
                    .tasks
                    .iter()
                    .filter(|t| t.state == TaskState::Completed && !t.is_compensated())
                    .map(|t| t.id().clone())
                    .collect();
                self.checkpoints.push(Checkpoint {
                    from_version,
                    to_version: self.version,
                    experiment_id: experiment_id.clone(),
                    task_id: task_id.clone(),
                    label: label.clone(),
                    carried,
                    at,
                });
                self.replan.push(ReplanReason::Validated {
                    experiment_id: experiment_id.clone(),
                    task_id,
                    version: self.version,
                });
                self.set_disposition(
                    experiment_id,
                    SignalDisposition::Advanced {
                        version: self.version,
                    },
                );
            }

            WorkflowEvent::QcFailureCompensated {
                experiment_id,
                tasks,
            } => {
                let task_id = self.signal_task(experiment_id)?;
                self.settled_task(&task_id, TaskState::Completed)?
                    .metadata
                    .insert(metadata::VALIDATED.into(), Value::Bool(false));
                self.replan.push(ReplanReason::QcFailed {
                    experiment_id: experiment_id.clone(),
                    task_id,
                    compensated: tasks.clone(),
                });
                self.set_disposition(
                    experiment_id,
                    SignalDisposition::Compensated {
                        tasks: tasks.clone(),
                    },
                );
            }

            WorkflowEvent::TaskCompensated { task_id, trigger } => {
                self.settled_task(task_id, TaskState::Completed)?
                    .metadata
                    .insert(metadata::COMPENSATED.into(), Value::Bool(true));
                self.compensations.push(CompensationRecord {
                    task_id: task_id.clone(),
                    trigger: trigger.clone(),
                    outcome: CompensationOutcome::Compensated,
                    at,
                });
            }

            WorkflowEvent::CompensationFailed {
                task_id,
                trigger,
                error,
            } => {
                if self.task(task_id).is_none() {
                    return Err(TransitionError::UnknownTask(task_id.clone()));
                }
                self.compensations.push(CompensationRecord {
                    task_id: task_id.clone(),
                    trigger: trigger.clone(),
                    outcome: CompensationOutcome::Failed {
                        error: error.clone(),
                    },
                    at,
                });
            }

            WorkflowEvent::PlanCompleted => {
                self.pending_plan.clear();
                self.plan_complete = true;
                self.replan.clear();
            }

            WorkflowEvent::WorkflowCompleted => {
                self.ensure_quiescent()?;
                if !self.is_complete() {
                    return Err(TransitionError::Incomplete);
                }
                self.state = WorkflowState::Completed;
            }

            WorkflowEvent::WorkflowFailed { error } => {
                self.ensure_quiescent()?;
                self.state = WorkflowState::Failed;
                self.error = Some(error.clone());
            }

            WorkflowEvent::WorkflowCancelled { .. } => {
                self.ensure_quiescent()?;
                self.state = WorkflowState::Cancelled;
            }

            WorkflowEvent::WorkflowTerminated { reason } => {
                self.ensure_quiescent()?;
                self.state = WorkflowState::Terminated;
                self.error = Some(reason.clone());
            }
        }

        self.last_sequence = sequence;
        self.updated_at = at;
        Ok(true)
    }

    fn submit(&mut self, specs: &[TaskSpec]) -> Result<(), TransitionError> {
        let known: HashSet<TaskId> = self.tasks.iter().map(|t| t.id().clone()).collect();
        let mut batch = HashSet::new();

        for spec in specs {
            if known.contains(&spec.task_id) || !batch.insert(spec.task_id.clone()) {
                return Err(TransitionError::DuplicateTask(spec.task_id.clone()));
            }
            // Dependencies must already be submitted; tasks of one batch run concurrently
            if let Some(dependency) = spec.depends_on.iter().find(|d| !known.contains(*d)) {
                return Err(TransitionError::UnknownDependency {
                    task_id: spec.task_id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        self.tasks
            .extend(specs.iter().cloned().map(TaskStatus::pending));
        Ok(())
    }

    fn transition(
        &mut self,
        task_id: &TaskId,
        to: TaskState,
    ) -> Result<&mut TaskStatus, TransitionError> {
        let task = self
            .task_mut(task_id)
            .ok_or_else(|| TransitionError::UnknownTask(task_id.clone()))?;
        validate_transition(task_id, task.state, to)?;
        task.state = to;
        Ok(task)
    }

    /// Task that must already be in `expected`
    fn settled_task(
        &mut self,
        task_id: &TaskId,
        expected: TaskState,
    ) -> Result<&mut TaskStatus, TransitionError> {
        let task = self
            .task_mut(task_id)
            .ok_or_else(|| TransitionError::UnknownTask(task_id.clone()))?;
        if task.state == expected {
            Ok(task)
        } else {
            Err(TransitionError::IllegalTaskTransition {
                task_id: task_id.clone(),
                from: task.state,
                to: expected,
            })
        }
    }

    fn signal_task(&self, experiment_id: &str) -> Result<TaskId, TransitionError> {
        self.experiment(experiment_id)
            .map(|s| s.result.task_id.clone())
            .ok_or_else(|| TransitionError::UnknownExperiment(experiment_id.to_string()))
    }

    fn set_disposition(&mut self, experiment_id: &str, disposition: SignalDisposition) {
        if let Some(record) = self
            .experiments
            .iter_mut()
            .find(|s| s.result.experiment_id == experiment_id)
        {
            record.disposition = disposition;
        }
    }

    fn ensure_quiescent(&self) -> Result<(), TransitionError> {
        match self.outstanding().count() {
            0 => Ok(()),
            count => Err(TransitionError::OutstandingTasks { count }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assay_registry::Version;
    use serde_json::json;

    fn spec(id: &str, deps: &[&str]) -> TaskSpec {
        let mut spec = TaskSpec::new(
            WorkflowId::new("w1"),
            TaskId::new(id),
            "docking",
            Version::new(1, 0, 0),
            json!({}),
        );
        spec.depends_on = deps.iter().map(|d| TaskId::new(*d)).collect();
        spec
    }

    fn started() -> WorkflowStatus {
        WorkflowStatus::started(
            WorkflowId::new("w1"),
            1,
            Utc::now(),
            &WorkflowEvent::WorkflowStarted {
                workflow_type: "drug_discovery".into(),
                input: json!({"target": "EGFR"}),
            },
        )
        .unwrap()
    }

    struct Applier {
        status: WorkflowStatus,
        seq: u64,
    }

    impl Applier {
        fn new() -> Self {
            Self {
                status: started(),
                seq: 1,
            }
        }

        fn apply(&mut self, event: WorkflowEvent) -> Result<bool, TransitionError> {
            self.seq += 1;
            self.status.apply(self.seq, Utc::now(), &event)
        }
    }

    fn tid(id: &str) -> TaskId {
        TaskId::new(id)
    }

    #[test]
    fn started_aggregate_defaults() {
        let status = started();
        assert_eq!(status.state, WorkflowState::Running);
        assert_eq!(status.version, 1);
        assert_eq!(status.last_sequence, 1);
        assert!(!status.is_complete());
    }

    #[test]
    fn task_lifecycle() {
        let mut a = Applier::new();
        a.apply(WorkflowEvent::TaskSubmitted {
            spec: spec("t1", &[]),
        })
        .unwrap();
        a.apply(WorkflowEvent::TaskStarted {
            task_id: tid("t1"),
            attempt: 1,
        })
        .unwrap();
        a.apply(WorkflowEvent::TaskRetryScheduled {
            task_id: tid("t1"),
            error: "503".into(),
            backoff_ms: 10,
        })
        .unwrap();
        a.apply(WorkflowEvent::TaskStarted {
            task_id: tid("t1"),
            attempt: 2,
        })
        .unwrap();
        a.apply(WorkflowEvent::TaskCompleted {
            task_id: tid("t1"),
            output: json!({"score": 0.9}),
        })
        .unwrap();

        let task = a.status.task(&tid("t1")).unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.error, None);
        assert!(task.started_at.is_some());
        assert_eq!(task.output, Some(json!({"score": 0.9})));
    }

    #[test]
    fn duplicate_sequence_is_noop() {
        let mut status = started();
        let event = WorkflowEvent::TaskSubmitted {
            spec: spec("t1", &[]),
        };
        assert!(status.apply(2, Utc::now(), &event).unwrap());
        assert!(!status.apply(2, Utc::now(), &event).unwrap());
        assert_eq!(status.tasks.len(), 1);
    }

    #[test]
    fn rejects_duplicates_and_unknown_dependencies() {
        let mut a = Applier::new();
        a.apply(WorkflowEvent::TaskSubmitted {
            spec: spec("t1", &[]),
        })
        .unwrap();
        assert_eq!(
            a.apply(WorkflowEvent::TaskSubmitted {
                spec: spec("t1", &[]),
            }),
            Err(TransitionError::DuplicateTask(tid("t1")))
        );
        assert!(matches!(
            a.apply(WorkflowEvent::TaskSubmitted {
                spec: spec("t2", &["t9"]),
            }),
            Err(TransitionError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn replace_pending_only_touches_unsubmitted_steps() {
        let mut a = Applier::new();
        let step = |name: &str| PlanStep::new(name, vec![]);
        a.apply(WorkflowEvent::PlanExtended {
            steps: vec![step("a"), step("b")],
            mode: PlanMode::Append,
        })
        .unwrap();
        a.apply(WorkflowEvent::StepSubmitted {
            description: "a".into(),
            tasks: vec![spec("t1", &[])],
        })
        .unwrap();
        a.apply(WorkflowEvent::PlanExtended {
            steps: vec![step("c")],
            mode: PlanMode::ReplacePending,
        })
        .unwrap();

        let pending: Vec<_> = a
            .status
            .pending_plan
            .iter()
            .map(|s| s.description.as_str())
            .collect();
        assert_eq!(pending, vec!["c"]);
        assert_eq!(a.status.tasks.len(), 1);
        assert_eq!(a.status.planning_rounds, 2);
    }

    #[test]
    fn completion_requires_settled_tasks_and_finished_plan() {
        let mut a = Applier::new();
        let mut gated = spec("t1", &[]);
        gated.requires_validation = true;
        a.apply(WorkflowEvent::TaskSubmitted { spec: gated }).unwrap();
        a.apply(WorkflowEvent::TaskStarted {
            task_id: tid("t1"),
            attempt: 1,
        })
        .unwrap();
        a.apply(WorkflowEvent::TaskCompleted {
            task_id: tid("t1"),
            output: json!(1),
        })
        .unwrap();
        a.apply(WorkflowEvent::PlanCompleted).unwrap();

        // still waiting for the wet-lab result
        assert_eq!(a.apply(WorkflowEvent::WorkflowCompleted), Err(TransitionError::Incomplete));

        let result = ExperimentResult::new("exp-1", WorkflowId::new("w1"), tid("t1"), true)
            .with_suggested_version("v2");
        a.apply(WorkflowEvent::SignalReceived { result }).unwrap();
        a.apply(WorkflowEvent::ContinuedAsNew {
            experiment_id: "exp-1".into(),
            label: Some("v2".into()),
        })
        .unwrap();
        a.apply(WorkflowEvent::WorkflowCompleted).unwrap();

        assert_eq!(a.status.state, WorkflowState::Completed);
        assert_eq!(a.status.version, 2);
        assert_eq!(a.status.checkpoints[0].carried, vec![tid("t1")]);
        assert_eq!(
            a.status.experiments[0].disposition,
            SignalDisposition::Advanced { version: 2 }
        );
    }

    #[test]
    fn outcomes_queue_for_the_planner_until_it_answers() {
        let mut a = Applier::new();
        a.apply(WorkflowEvent::TaskSubmitted {
            spec: spec("t1", &[]),
        })
        .unwrap();
        a.apply(WorkflowEvent::TaskStarted {
            task_id: tid("t1"),
            attempt: 1,
        })
        .unwrap();
        a.apply(WorkflowEvent::TaskCompleted {
            task_id: tid("t1"),
            output: json!(1),
        })
        .unwrap();
        a.apply(WorkflowEvent::TaskReviewed {
            task_id: tid("t1"),
            verdict: Verdict::Accept,
        })
        .unwrap();
        assert!(a.status.replan.is_empty());

        a.apply(WorkflowEvent::TaskReviewed {
            task_id: tid("t1"),
            verdict: Verdict::Refine {
                feedback: "affinity too low".into(),
            },
        })
        .unwrap();
        assert_eq!(
            a.status.replan,
            vec![ReplanReason::Refine {
                task_id: tid("t1"),
                feedback: "affinity too low".into(),
            }]
        );

        a.apply(WorkflowEvent::PlanExtended {
            steps: vec![PlanStep::new("retry", vec![])],
            mode: PlanMode::Append,
        })
        .unwrap();
        assert!(a.status.replan.is_empty());
    }

    #[test]
    fn terminal_requires_no_outstanding_tasks() {
        let mut a = Applier::new();
        a.apply(WorkflowEvent::TaskSubmitted {
            spec: spec("t1", &[]),
        })
        .unwrap();
        assert_eq!(
            a.apply(WorkflowEvent::WorkflowCancelled {
                reason: "user".into(),
            }),
            Err(TransitionError::OutstandingTasks { count: 1 })
        );
        a.apply(WorkflowEvent::TaskCancelled {
            task_id: tid("t1"),
            reason: "user".into(),
        })
        .unwrap();
        a.apply(WorkflowEvent::WorkflowCancelled {
            reason: "user".into(),
        })
        .unwrap();

        assert!(matches!(
            a.apply(WorkflowEvent::TaskSubmitted {
                spec: spec("t2", &[]),
            }),
            Err(TransitionError::WorkflowTerminal { .. })
        ));
    }

    #[test]
    fn compensated_and_resolved_failures_allow_completion() {
        let mut a = Applier::new();
        a.apply(WorkflowEvent::TaskSubmitted {
            spec: spec("t1", &[]),
        })
        .unwrap();
        a.apply(WorkflowEvent::TaskSubmitted {
            spec: spec("t2", &["t1"]),
        })
        .unwrap();
        a.apply(WorkflowEvent::TaskStarted {
            task_id: tid("t1"),
            attempt: 1,
        })
        .unwrap();
        a.apply(WorkflowEvent::TaskCompleted {
            task_id: tid("t1"),
            output: json!(1),
        })
        .unwrap();
        a.apply(WorkflowEvent::TaskStarted {
            task_id: tid("t2"),
            attempt: 1,
        })
        .unwrap();
        a.apply(WorkflowEvent::TaskFailed {
            task_id: tid("t2"),
            error: "boom".into(),
        })
        .unwrap();

        let trigger = CompensationTrigger::TaskFailed { task_id: tid("t2") };
        a.apply(WorkflowEvent::TaskCompensated {
            task_id: tid("t1"),
            trigger,
        })
        .unwrap();
        a.apply(WorkflowEvent::FailureResolved { task_id: tid("t2") }).unwrap();
        a.apply(WorkflowEvent::PlanCompleted).unwrap();

        assert!(a.status.task(&tid("t1")).unwrap().is_compensated());
        assert!(a.status.results().is_empty());
        assert!(a.status.replan.is_empty());
        a.apply(WorkflowEvent::WorkflowCompleted).unwrap();
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = WorkflowEvent::TaskStarted {
            task_id: tid("t1"),
            attempt: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_started");
        assert_eq!(event.kind(), "task_started");
    }
}
