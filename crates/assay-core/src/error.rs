//! Error types for the orchestration core
//!
//! Provides error handling for:
//! - Reasoner (planner / critic) failures
//! - Agent control loop aborts
//! - Workflow engine requests
//! - Configuration loading
//! - Algorithm service registration

use assay_kernel::{LogError, ServiceError, WorkflowError, WorkflowId};
use assay_registry::RegistryError;
use std::path::PathBuf;

/// Failure of the injected decision capability
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("reasoner failed: {0}")]
pub struct ReasonerError(pub String);

impl ReasonerError {
    /// Create from any message
    #[inline]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Agent control loop errors
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Planner or critic failed
    #[error(transparent)]
    Reasoner(#[from] ReasonerError),

    /// Planner kept producing steps past the configured bound
    #[error("planning limit of {limit} round(s) exceeded")]
    PlanningLimit { limit: u32 },

    /// No task, signal or plan step can move the workflow forward
    #[error("workflow cannot make progress")]
    Stalled,

    /// Workflow state machine rejected an operation
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

impl AgentError {
    /// Errors the loop cannot record in the workflow log
    #[inline]
    #[must_use]
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Workflow(WorkflowError::Log(_)))
    }
}

/// Workflow engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No workflow with this id is known
    #[error("workflow {0} not found")]
    WorkflowNotFound(WorkflowId),

    /// A workflow with this id is already loaded
    #[error("workflow {0} already exists")]
    AlreadyExists(WorkflowId),

    /// The workflow's driver stopped without reaching a terminal state
    #[error("workflow {workflow_id} driver stopped: {message}")]
    Driver {
        workflow_id: WorkflowId,
        message: String,
    },

    /// Signal intake is no longer running
    #[error("signal intake closed")]
    IntakeClosed,

    /// Workflow state machine rejected the request
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// Event store failure
    #[error(transparent)]
    Log(#[from] LogError),
}

impl EngineError {
    /// Unknown workflow, task or experiment
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::WorkflowNotFound(_) => true,
            Self::Workflow(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Request rejected because the workflow has ended
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Workflow(e) if e.is_terminal())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Document is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Registering a running service failed
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// The service could not report its manifest
    #[error("service did not provide a manifest: {0}")]
    Service(#[from] ServiceError),

    /// The registry rejected the manifest
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use assay_kernel::{TransitionError, TaskId, WorkflowState};

    #[test]
    fn engine_error_classification() {
        assert!(EngineError::WorkflowNotFound(WorkflowId::new("w1")).is_not_found());

        let unknown_task: WorkflowError = TransitionError::UnknownTask(TaskId::new("t9")).into();
        assert!(EngineError::from(unknown_task).is_not_found());

        let ended: WorkflowError = TransitionError::WorkflowTerminal {
            state: WorkflowState::Cancelled,
        }
        .into();
        let err = EngineError::from(ended);
        assert!(err.is_terminal());
        assert!(!err.is_not_found());
    }

    #[test]
    fn persistence_errors_are_not_recorded() {
        let log: WorkflowError = LogError::IntegrityViolation {
            sequence: 3,
            reason: "hash mismatch".into(),
        }
        .into();
        assert!(AgentError::from(log).is_persistence());
        assert!(!AgentError::Stalled.is_persistence());
    }

    #[test]
    fn messages_are_verbatim() {
        let err = AgentError::from(ReasonerError::new("backend unavailable"));
        assert_eq!(err.to_string(), "reasoner failed: backend unavailable");
        assert_eq!(
            ConfigError::invalid("retry.multiplier", "must be >= 1").to_string(),
            "invalid config value for retry.multiplier: must be >= 1"
        );
    }
}
