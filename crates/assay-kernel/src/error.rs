//! Error types for the orchestration kernel
//!
//! Provides error handling for:
//! - Pre-dispatch validation (payload and resources)
//! - Service calls, timeouts and compensation
//! - Illegal state transitions
//! - Durable log persistence and integrity

use crate::dispatch::HealthStatus;
use crate::types::{TaskId, TaskState, WorkflowId, WorkflowState};
use assay_registry::{RegistryError, ResourceMismatch, Version, Violation};

/// Main kernel error type
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Dispatch failed
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Workflow state machine rejected an operation
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// Registry rejected an operation
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl KernelError {
    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Dispatch(e) => e.is_retryable(),
            Self::Workflow(WorkflowError::Log(LogError::Io { .. })) => true,
            Self::Workflow(_) | Self::Registry(_) => false,
        }
    }
}

/// Task rejected before dispatch; never retried
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Input payload violates the manifest's input declarations
    #[error("payload rejected by {algorithm}@{version}: {}", join(.violations))]
    Payload {
        algorithm: String,
        version: Version,
        violations: Vec<Violation>,
    },

    /// Requested resources exceed the manifest's declared resources
    #[error("resources rejected by {algorithm}@{version}: {source}")]
    Resources {
        algorithm: String,
        version: Version,
        #[source]
        source: ResourceMismatch,
    },
}

fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure reported by an algorithm service
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ServiceError {
    pub message: String,
    pub retryable: bool,
}

impl ServiceError {
    /// Failure worth retrying
    #[inline]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Failure retrying cannot fix
    #[inline]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Dispatch errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    /// Pre-dispatch validation failed
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Algorithm version is not registered
    #[error("algorithm {algorithm}@{version} is not registered")]
    NotFound { algorithm: String, version: Version },

    /// Service returned an error
    #[error("service error: {message}")]
    Service {
        message: String,
        retryable: bool,
        /// Health observed right after the failure
        health: Option<HealthStatus>,
    },

    /// Service did not answer in time
    #[error("timed out after {after_ms}ms")]
    Timeout {
        after_ms: u64,
        health: Option<HealthStatus>,
    },
}

impl DispatchError {
    /// Timeouts and transient service errors
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Service { retryable, .. } => *retryable,
            Self::Validation(_) | Self::NotFound { .. } => false,
        }
    }

    /// Failed before any call was made
    #[inline]
    #[must_use]
    pub fn is_pre_dispatch(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound { .. })
    }

    /// Health observed after the failure, if checked
    #[inline]
    #[must_use]
    pub fn observed_health(&self) -> Option<HealthStatus> {
        match self {
            Self::Service { health, .. } | Self::Timeout { health, .. } => *health,
            Self::Validation(_) | Self::NotFound { .. } => None,
        }
    }

    pub(crate) fn with_health(mut self, observed: Option<HealthStatus>) -> Self {
        if let Self::Service { health, .. } | Self::Timeout { health, .. } = &mut self {
            *health = observed;
        }
        self
    }
}

/// A compensating action failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("compensation of task {task_id} failed: {message}")]
pub struct CompensationError {
    /// Task whose compensation failed
    pub task_id: TaskId,
    pub message: String,
    /// Tasks compensated before the failure
    pub compensated: Vec<TaskId>,
}

/// Illegal state changes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// Task transition not in the table
    #[error("task {task_id}: illegal transition {from} -> {to}")]
    IllegalTaskTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    /// No such task in the workflow
    #[error("task {0} not found")]
    UnknownTask(TaskId),

    /// Task id already submitted
    #[error("task {0} already submitted")]
    DuplicateTask(TaskId),

    /// Dependency on a task that was never submitted
    #[error("task {task_id} depends on unknown task {dependency}")]
    UnknownDependency {
        task_id: TaskId,
        dependency: TaskId,
    },

    /// Workflow no longer accepts changes
    #[error("workflow is {state}")]
    WorkflowTerminal { state: WorkflowState },

    /// Event other than start applied to an empty aggregate
    #[error("workflow not started")]
    NotStarted,

    /// Second start event
    #[error("workflow already started")]
    AlreadyStarted,

    /// Step submitted with no pending plan
    #[error("no pending plan step")]
    NoPendingStep,

    /// No signal with this experiment id
    #[error("experiment {0} not found")]
    UnknownExperiment(String),

    /// Signal with this experiment id already recorded
    #[error("experiment {0} already received")]
    DuplicateExperiment(String),

    /// Workflow cannot end while tasks are still live
    #[error("{count} task(s) still outstanding")]
    OutstandingTasks { count: usize },

    /// Completion requested before every task settled
    #[error("workflow is not complete")]
    Incomplete,
}

/// Durable log errors
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Reading or writing the backing file failed
    #[error("log I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Record could not be encoded or decoded
    #[error("log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Hash chain broken
    #[error("log integrity violation at sequence {sequence}: {reason}")]
    IntegrityViolation { sequence: u64, reason: String },

    /// Segment holds another workflow's records
    #[error("log segment for workflow {expected} holds records of {found}")]
    WorkflowMismatch {
        expected: WorkflowId,
        found: WorkflowId,
    },
}

impl LogError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Workflow state machine errors
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Illegal transition or request
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Event could not be persisted; in-memory state is unchanged
    #[error(transparent)]
    Log(#[from] LogError),

    /// Compensation failed
    #[error(transparent)]
    Compensation(#[from] CompensationError),
}

impl WorkflowError {
    /// Unknown task or experiment
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Transition(
                TransitionError::UnknownTask(_) | TransitionError::UnknownExperiment(_)
            )
        )
    }

    /// Workflow already reached a terminal state
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Transition(TransitionError::WorkflowTerminal { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_error_is_retryable() {
        assert!(DispatchError::Timeout {
            after_ms: 10,
            health: None
        }
        .is_retryable());
        assert!(DispatchError::Service {
            message: "503".into(),
            retryable: true,
            health: None
        }
        .is_retryable());
        assert!(!DispatchError::Service {
            message: "bad input".into(),
            retryable: false,
            health: None
        }
        .is_retryable());
        assert!(!DispatchError::NotFound {
            algorithm: "x".into(),
            version: Version::new(1, 0, 0)
        }
        .is_retryable());
    }

    #[test]
    fn with_health_only_touches_call_failures() {
        let err = DispatchError::Timeout {
            after_ms: 5,
            health: None,
        }
        .with_health(Some(HealthStatus::Unhealthy));
        assert_eq!(err.observed_health(), Some(HealthStatus::Unhealthy));

        let err = DispatchError::NotFound {
            algorithm: "x".into(),
            version: Version::new(1, 0, 0),
        }
        .with_health(Some(HealthStatus::Healthy));
        assert_eq!(err.observed_health(), None);
    }

    #[test]
    fn validation_error_lists_violations() {
        let err = ValidationError::Payload {
            algorithm: "docking".into(),
            version: Version::new(1, 0, 0),
            violations: vec![
                Violation {
                    field: "a".into(),
                    message: "required field is missing".into(),
                },
                Violation {
                    field: "b".into(),
                    message: "expected integer, got string".into(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("a: required field is missing; b: expected integer"));
    }

    #[test]
    fn kernel_error_retryability() {
        let err: KernelError = DispatchError::Timeout {
            after_ms: 1,
            health: None,
        }
        .into();
        assert!(err.is_retryable());
        let err: KernelError = WorkflowError::from(TransitionError::NotStarted).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn workflow_error_classification() {
        let err = WorkflowError::from(TransitionError::UnknownTask(TaskId::new("t9")));
        assert!(err.is_not_found());
        let err = WorkflowError::from(TransitionError::WorkflowTerminal {
            state: WorkflowState::Cancelled,
        });
        assert!(err.is_terminal());
    }
}
