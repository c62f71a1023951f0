//! Assay Orchestration Kernel
//!
//! Durable state machines for research workflows and the tasks they
//! dispatch to pluggable algorithm services.
//!
//! # Core Concepts
//!
//! - [`WorkflowMachine`]: Workflow aggregate plus its hash-chained event log
//! - [`WorkflowEvent`]: Every state change, folded by [`WorkflowStatus::replay`]
//! - [`TaskRunner`]: Drives one task through dispatch, retries and cancellation
//! - [`Dispatcher`]: Validates, invokes and health-checks [`AlgorithmService`]s
//! - [`Compensator`]: Reverse-order compensation and wet-lab signal application
//! - [`EventStore`]: In-memory and JSON-lines log storage
//!
//! # Example
//!
//! ```rust
//! use assay_kernel::{InMemoryEventStore, WorkflowId, WorkflowMachine, WorkflowState};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let store = Arc::new(InMemoryEventStore::new());
//! let mut machine = WorkflowMachine::start(
//!     store,
//!     WorkflowId::new("w1"),
//!     "drug_discovery",
//!     json!({"target": "EGFR"}),
//! )
//! .unwrap();
//!
//! machine.cancel("operator request").unwrap();
//! assert_eq!(machine.state(), WorkflowState::Cancelled);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod compensation;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod log;
pub mod policy;
pub mod state_machine;
pub mod task;
pub mod types;
pub mod workflow;

// Re-exports
pub use compensation::{Compensator, SignalOutcome};
pub use dispatch::{
    AlgorithmService, Dispatcher, HealthReport, HealthStatus, PreparedCall, ServiceHandle,
    ServiceRegistry,
};
pub use error::{
    CompensationError, DispatchError, KernelError, LogError, ServiceError, TransitionError,
    ValidationError, WorkflowError,
};
pub use events::WorkflowEvent;
pub use log::{
    read_segment, verify_chain, EventLog, EventRecord, EventStore, FileEventStore,
    InMemoryEventStore, GENESIS_HASH,
};
pub use policy::{FailurePolicy, PriorityMultipliers, RetryPolicy, TimeoutPolicy};
pub use state_machine::{allowed_transitions, validate_transition};
pub use task::TaskRunner;
pub use types::{
    Checkpoint, CompensationOutcome, CompensationRecord, CompensationTrigger, EventId,
    ExperimentResult, PlanMode, PlanStep, PlannedTask, Priority, ReplanReason, SignalDisposition,
    SignalRecord, TaskId, TaskSpec, TaskState, TaskStatus, Verdict, WorkflowId, WorkflowState,
    WorkflowStatus,
};
pub use workflow::{SignalAck, SignalReceipt, WorkflowMachine};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
