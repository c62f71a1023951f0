//! Task runner
//!
//! Drives one task through `pending → running → {completed | failed |
//! cancelled}`, retrying transient failures with exponential backoff. Every
//! transition is recorded through the workflow state machine; the machine
//! lock is never held across a service call or a backoff sleep. A task found
//! `running` after recovery has its interrupted attempt dispatched again.

use crate::dispatch::{Dispatcher, HealthStatus, PreparedCall};
use crate::error::{TransitionError, WorkflowError};
use crate::policy::RetryPolicy;
use crate::types::{TaskId, TaskSpec, TaskState};
use crate::workflow::WorkflowMachine;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Runs individual tasks
#[derive(Debug, Clone, Copy)]
pub struct TaskRunner<'a> {
    dispatcher: &'a Dispatcher,
    retry: &'a RetryPolicy,
}

enum Step {
    Done(TaskState),
    Retry,
}

impl<'a> TaskRunner<'a> {
    /// Create runner
    #[inline]
    #[must_use]
    pub fn new(dispatcher: &'a Dispatcher, retry: &'a RetryPolicy) -> Self {
        Self { dispatcher, retry }
    }

    /// Drive a task to a terminal state
    ///
    /// Returns the state the task ended in. A task that is already terminal,
    /// or whose workflow has ended, is left alone. Cancelling `cancel` stops
    /// the task at the next await point and asks the service to abort.
    pub async fn run(
        &self,
        machine: &Mutex<WorkflowMachine>,
        task_id: &TaskId,
        cancel: &CancellationToken,
    ) -> Result<TaskState, WorkflowError> {
        let spec = {
            let guard = machine.lock().await;
            let task = guard
                .task(task_id)
                .ok_or_else(|| TransitionError::UnknownTask(task_id.clone()))?;
            if task.state.is_terminal() || guard.is_terminal() {
                return Ok(task.state);
            }
            task.spec.clone()
        };

        let call = match self.dispatcher.prepare(&spec) {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!(
                    workflow_id = %spec.workflow_id,
                    %task_id,
                    error = %e,
                    "task rejected before dispatch"
                );
                let reason = e.to_string();
                return self
                    .settle(
                        machine,
                        task_id,
                        |m| m.mark_failed(task_id, &reason),
                        TaskState::Failed,
                    )
                    .await;
            }
        };

        loop {
            let attempt = {
                let mut guard = machine.lock().await;
                let (state, retries) = match guard.task(task_id) {
                    Some(t) if !t.state.is_terminal() && !guard.is_terminal() => {
                        (t.state, t.retry_count)
                    }
                    Some(t) => return Ok(t.state),
                    None => return Err(TransitionError::UnknownTask(task_id.clone()).into()),
                };
                let attempt = retries + 1;
                if state == TaskState::Running {
                    // Recovered mid-call; the interrupted attempt is dispatched again
                    tracing::info!(
                        workflow_id = %spec.workflow_id,
                        %task_id,
                        attempt,
                        "resuming interrupted attempt"
                    );
                } else {
                    guard.mark_running(task_id, attempt)?;
                }
                attempt
            };

            tracing::debug!(workflow_id = %spec.workflow_id, %task_id, attempt, "task attempt");
            match self.attempt(machine, &call, &spec, cancel).await? {
                Step::Done(state) => return Ok(state),
                Step::Retry => {}
            }
        }
    }

    async fn attempt(
        &self,
        machine: &Mutex<WorkflowMachine>,
        call: &PreparedCall,
        spec: &TaskSpec,
        cancel: &CancellationToken,
    ) -> Result<Step, WorkflowError> {
        let task_id = &spec.task_id;

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.dispatcher.cancel(call, task_id).await;
                return self.cancelled(machine, task_id).await.map(Step::Done);
            }
            outcome = self.dispatcher.invoke(call, spec) => outcome,
        };

        let error = match outcome {
            Ok(output) => {
                return self
                    .settle(
                        machine,
                        task_id,
                        |m| m.mark_complete(task_id, output),
                        TaskState::Completed,
                    )
                    .await
                    .map(Step::Done);
            }
            Err(e) => e,
        };

        let retries = machine
            .lock()
            .await
            .task(task_id)
            .map_or(0, |t| t.retry_count);
        let unhealthy = error.observed_health() == Some(HealthStatus::Unhealthy);
        let retry = error.is_retryable()
            && self.retry.allows_retry(retries)
            && (self.retry.retry_unhealthy || !unhealthy);

        if !retry {
            let message = if error.is_retryable() && unhealthy && self.retry.allows_retry(retries) {
                format!("{error} (endpoint unhealthy)")
            } else {
                error.to_string()
            };
            return self
                .settle(machine, task_id, |m| m.mark_failed(task_id, &message), TaskState::Failed)
                .await
                .map(Step::Done);
        }

        let backoff = self.retry.backoff(retries);
        tracing::info!(
            workflow_id = %spec.workflow_id,
            %task_id,
            retry = retries + 1,
            max_retries = self.retry.max_retries,
            backoff_ms = backoff.as_millis(),
            error = %error,
            "retrying task"
        );
        let reason = error.to_string();
        if let Some(state) = self
            .settle_if_live(machine, task_id, |m| m.mark_retry(task_id, &reason, backoff))
            .await?
        {
            return Ok(Step::Done(state));
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => self.cancelled(machine, task_id).await.map(Step::Done),
            () = tokio::time::sleep(backoff) => Ok(Step::Retry),
        }
    }

    async fn cancelled(
        &self,
        machine: &Mutex<WorkflowMachine>,
        task_id: &TaskId,
    ) -> Result<TaskState, WorkflowError> {
        tracing::info!(%task_id, "task cancelled");
        self.settle(
            machine,
            task_id,
            |m| m.mark_cancelled(task_id, "cancelled"),
            TaskState::Cancelled,
        )
        .await
    }

    /// Record a terminal transition unless the task or workflow already ended
    async fn settle(
        &self,
        machine: &Mutex<WorkflowMachine>,
        task_id: &TaskId,
        record: impl FnOnce(&mut WorkflowMachine) -> Result<(), WorkflowError>,
        to: TaskState,
    ) -> Result<TaskState, WorkflowError> {
        Ok(self
            .settle_if_live(machine, task_id, record)
            .await?
            .unwrap_or(to))
    }

    /// Returns the current state instead of recording when nothing may change
    async fn settle_if_live(
        &self,
        machine: &Mutex<WorkflowMachine>,
        task_id: &TaskId,
        record: impl FnOnce(&mut WorkflowMachine) -> Result<(), WorkflowError>,
    ) -> Result<Option<TaskState>, WorkflowError> {
        let mut guard = machine.lock().await;
        let state = guard
            .task(task_id)
            .map(|t| t.state)
            .ok_or_else(|| TransitionError::UnknownTask(task_id.clone()))?;
        if state.is_terminal() || guard.is_terminal() {
            return Ok(Some(state));
        }
        record(&mut *guard)?;
        Ok(None)
    }
}
