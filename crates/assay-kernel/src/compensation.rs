//! Compensation and signal application
//!
//! These flows mix service calls with state changes, so they take the
//! machine behind its async mutex and never hold the lock across a call.

use crate::dispatch::Dispatcher;
use crate::error::{CompensationError, WorkflowError};
use crate::types::{CompensationTrigger, ExperimentResult, TaskId, TaskState};
use crate::workflow::WorkflowMachine;
use tokio::sync::Mutex;

/// What applying a signal did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    /// QC pass; workflow now at `version`
    Advanced { version: u32 },
    /// QC fail; these tasks were compensated, in order
    Compensated { tasks: Vec<TaskId> },
    /// Workflow ended before the signal could be applied
    Skipped,
}

/// Runs compensating actions and records their outcome
#[derive(Debug, Clone, Copy)]
pub struct Compensator<'a> {
    dispatcher: &'a Dispatcher,
}

impl<'a> Compensator<'a> {
    /// Create compensator
    #[inline]
    #[must_use]
    pub fn new(dispatcher: &'a Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Compensate `tasks` in the given order
    ///
    /// Stops at the first failing action, records it, and returns a
    /// [`CompensationError`] listing what was compensated before it.
    pub async fn run(
        &self,
        machine: &Mutex<WorkflowMachine>,
        tasks: &[TaskId],
        trigger: &CompensationTrigger,
    ) -> Result<Vec<TaskId>, WorkflowError> {
        let mut compensated = Vec::with_capacity(tasks.len());

        for task_id in tasks {
            let (spec, output) = {
                let guard = machine.lock().await;
                match guard.task(task_id) {
                    Some(t) if t.state == TaskState::Completed && !t.is_compensated() => {
                        (t.spec.clone(), t.output.clone().unwrap_or_default())
                    }
                    _ => continue,
                }
            };

            match self.dispatcher.compensate(&spec, &output).await {
                Ok(()) => {
                    machine
                        .lock()
                        .await
                        .record_compensated(task_id, trigger.clone())?;
                    compensated.push(task_id.clone());
                }
                Err(e) => {
                    let message = e.to_string();
                    machine
                        .lock()
                        .await
                        .record_compensation_failed(task_id, trigger.clone(), &message)?;
                    return Err(CompensationError {
                        task_id: task_id.clone(),
                        message,
                        compensated,
                    }
                    .into());
                }
            }
        }
        Ok(compensated)
    }

    /// Apply a ready signal
    ///
    /// QC pass advances the workflow version. QC fail compensates the task
    /// and its completed dependents; if that fails the workflow fails with
    /// both the QC failure and the compensation error recorded.
    pub async fn apply_signal(
        &self,
        machine: &Mutex<WorkflowMachine>,
        result: &ExperimentResult,
    ) -> Result<SignalOutcome, WorkflowError> {
        if result.pass_qc {
            let mut guard = machine.lock().await;
            if guard.is_terminal() {
                return Ok(SignalOutcome::Skipped);
            }
            let version =
                guard.advance_version(&result.experiment_id, result.suggested_version.clone())?;
            return Ok(SignalOutcome::Advanced { version });
        }

        let plan = {
            let guard = machine.lock().await;
            if guard.is_terminal() {
                return Ok(SignalOutcome::Skipped);
            }
            guard.compensation_plan(&result.task_id)?
        };
        tracing::info!(
            experiment_id = %result.experiment_id,
            task_id = %result.task_id,
            plan = ?plan,
            "QC failed, compensating"
        );

        let trigger = CompensationTrigger::QcFailed {
            experiment_id: result.experiment_id.clone(),
        };
        match self.run(machine, &plan, &trigger).await {
            Ok(tasks) => {
                machine
                    .lock()
                    .await
                    .record_qc_compensated(&result.experiment_id, tasks.clone())?;
                Ok(SignalOutcome::Compensated { tasks })
            }
            Err(WorkflowError::Compensation(e)) => {
                let error = format!(
                    "QC failed for task {} (experiment {}); {e}",
                    result.task_id, result.experiment_id
                );
                machine.lock().await.fail(&error)?;
                Err(e.into())
            }
            Err(e) => Err(e),
        }
    }

    /// Apply every signal whose task has completed
    pub async fn apply_ready_signals(
        &self,
        machine: &Mutex<WorkflowMachine>,
    ) -> Result<Vec<SignalOutcome>, WorkflowError> {
        let mut outcomes = Vec::new();
        loop {
            let next = machine.lock().await.ready_signals().into_iter().next();
            let Some(result) = next else {
                return Ok(outcomes);
            };
            let outcome = self.apply_signal(machine, &result).await?;
            let skipped = outcome == SignalOutcome::Skipped;
            outcomes.push(outcome);
            if skipped {
                return Ok(outcomes);
            }
        }
    }

    /// Resolve a failed task by compensating the work it consumed
    ///
    /// Completed upstream tasks are compensated, dependents that have not
    /// started are cancelled, and the failure is marked resolved. A failing
    /// compensation fails the workflow with both errors recorded.
    pub async fn resolve_failure(
        &self,
        machine: &Mutex<WorkflowMachine>,
        failed: &TaskId,
    ) -> Result<Vec<TaskId>, WorkflowError> {
        let (plan, task_error) = {
            let guard = machine.lock().await;
            let error = guard
                .task(failed)
                .and_then(|t| t.error.clone())
                .unwrap_or_default();
            (guard.upstream_plan(failed)?, error)
        };

        let trigger = CompensationTrigger::TaskFailed {
            task_id: failed.clone(),
        };
        let compensated = match self.run(machine, &plan, &trigger).await {
            Ok(tasks) => tasks,
            Err(WorkflowError::Compensation(e)) => {
                let error = format!("task {failed} failed: {task_error}; {e}");
                machine.lock().await.fail(&error)?;
                return Err(e.into());
            }
            Err(e) => return Err(e),
        };

        let mut guard = machine.lock().await;
        for dependent in guard.pending_dependents(failed) {
            guard.mark_cancelled(&dependent, &format!("dependency {failed} failed"))?;
        }
        guard.resolve_failure(failed)?;
        Ok(compensated)
    }
}
