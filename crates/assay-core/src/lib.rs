//! Assay Orchestration Core
//!
//! The agent control loop and the workflow service built on
//! [`assay_kernel`].
//!
//! # Core Concepts
//!
//! - [`Reasoner`]: Injected planner and critic
//! - [`ControlLoop`]: Plan, dispatch, critique, compensate, repeat
//! - [`WorkflowEngine`]: Start, query, signal, cancel and recover workflows
//! - [`RegistryService`]: Bind algorithm manifests to running services
//! - [`SignalIntake`]: Ordered delivery of wet-lab results
//! - [`OrchestratorConfig`]: TOML configuration, including [`LogConfig`]
//!
//! # Example
//!
//! ```rust,no_run
//! use assay_core::{
//!     CritiqueContext, OrchestratorConfig, PlanContext, PlanDecision, Reasoner,
//!     ReasonerError, RegistryService, WorkflowEngine,
//! };
//! use assay_kernel::{Verdict, WorkflowId};
//! use async_trait::async_trait;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! struct NothingToDo;
//!
//! #[async_trait]
//! impl Reasoner for NothingToDo {
//!     async fn plan(&self, _: &PlanContext) -> Result<PlanDecision, ReasonerError> {
//!         Ok(PlanDecision::Done)
//!     }
//!     async fn critique(&self, _: &CritiqueContext) -> Result<Verdict, ReasonerError> {
//!         Ok(Verdict::Accept)
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = RegistryService::default();
//! let engine = WorkflowEngine::new(
//!     Arc::clone(registry.registry()),
//!     Arc::new(NothingToDo),
//!     &OrchestratorConfig::default(),
//! )?;
//!
//! let id = WorkflowId::new("w1");
//! engine.start_workflow(id.clone(), "screening", json!({"target": "EGFR"}))?;
//! let status = engine.wait_for_completion(&id).await?;
//! println!("{}", status.state);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod registry_service;
pub mod signal;
pub mod telemetry;

// Re-exports
pub use agent::{ControlLoop, CritiqueContext, PlanContext, PlanDecision, Reasoner};
pub use config::{EventLogConfig, OrchestratorConfig};
pub use engine::WorkflowEngine;
pub use error::{AgentError, ConfigError, EngineError, ReasonerError, RegistrationError};
pub use registry_service::RegistryService;
pub use signal::{SignalIntake, SignalSender};
pub use telemetry::{LogConfig, LogFormat, Logger, LoggerError};

/// Version of the orchestration core
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
