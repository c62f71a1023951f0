//! Algorithm dispatch
//!
//! The dispatcher validates a task against the manifest it resolved to,
//! invokes the algorithm service under a priority-derived timeout and
//! classifies failures. After every failed call the endpoint's health is
//! checked and attached to the error, so callers can decide whether a retry
//! against the same endpoint makes sense.

use crate::error::{DispatchError, ServiceError, ValidationError};
use crate::policy::TimeoutPolicy;
use crate::types::{TaskId, TaskSpec, WorkflowId};
use assay_registry::{validate_payload, AlgorithmManifest, AlgorithmRegistry, Version};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Self-reported service health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health check answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Service build version
    #[serde(default)]
    pub version: String,
    /// Dependency name to its status
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Report with no dependencies
    #[must_use]
    pub fn new(status: HealthStatus, version: impl Into<String>) -> Self {
        Self {
            status,
            version: version.into(),
            dependencies: BTreeMap::new(),
            checked_at: Utc::now(),
        }
    }

    /// With dependency status
    #[inline]
    #[must_use]
    pub fn with_dependency(mut self, name: impl Into<String>, status: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), status.into());
        self
    }
}

/// Contract every algorithm service implements
///
/// Transport is up to the implementation; the kernel only relies on these
/// five calls.
#[async_trait]
pub trait AlgorithmService: Send + Sync {
    /// Run the algorithm on an input payload
    async fn predict(&self, task_id: &TaskId, input: &Value) -> Result<Value, ServiceError>;

    /// Current health
    async fn health(&self) -> HealthReport;

    /// Manifest the service declares
    async fn manifest(&self) -> Result<AlgorithmManifest, ServiceError>;

    /// Abort an in-flight prediction
    async fn cancel(&self, task_id: &TaskId) -> Result<(), ServiceError>;

    /// Undo the effects of a completed prediction
    async fn compensate(&self, task_id: &TaskId, output: &Value) -> Result<(), ServiceError>;
}

/// Shared handle to a service
pub type ServiceHandle = Arc<dyn AlgorithmService>;

/// Registry of service handles
pub type ServiceRegistry = AlgorithmRegistry<ServiceHandle>;

/// A validated task bound to the service it resolved to
///
/// The handle stays usable even if the algorithm is unregistered meanwhile.
#[derive(Clone)]
pub struct PreparedCall {
    pub manifest: Arc<AlgorithmManifest>,
    pub service: ServiceHandle,
}

impl fmt::Debug for PreparedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedCall")
            .field("algorithm", &self.manifest.id())
            .finish_non_exhaustive()
    }
}

/// Validates, invokes and health-checks algorithm services
pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    timeouts: TimeoutPolicy,
    health: DashMap<(String, Version), HealthReport>,
    /// Handle each task resolved to, kept for compensation
    resolved: DashMap<(WorkflowId, TaskId), PreparedCall>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("algorithms", &self.registry.len())
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create dispatcher over a registry
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>, timeouts: TimeoutPolicy) -> Self {
        Self {
            registry,
            timeouts,
            health: DashMap::new(),
            resolved: DashMap::new(),
        }
    }

    /// Registry this dispatcher resolves against
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Timeout policy
    #[inline]
    #[must_use]
    pub fn timeouts(&self) -> &TimeoutPolicy {
        &self.timeouts
    }

    /// Resolve and validate a task before any call is made
    ///
    /// # Errors
    /// `NotFound` when the resolved version is gone, `Validation` when the
    /// payload or requested resources don't fit the manifest.
    pub fn prepare(&self, spec: &TaskSpec) -> Result<PreparedCall, DispatchError> {
        let entry = self
            .registry
            .lookup(&spec.algorithm, Some(&spec.version))
            .map_err(|_| DispatchError::NotFound {
                algorithm: spec.algorithm.clone(),
                version: spec.version.clone(),
            })?;
        let manifest = entry.manifest;

        validate_payload(&manifest, &spec.input).map_err(|violations| ValidationError::Payload {
            algorithm: spec.algorithm.clone(),
            version: spec.version.clone(),
            violations,
        })?;

        spec.resources
            .fits_within(&manifest.resources)
            .map_err(|source| ValidationError::Resources {
                algorithm: spec.algorithm.clone(),
                version: spec.version.clone(),
                source,
            })?;

        let call = PreparedCall {
            manifest,
            service: entry.endpoint,
        };
        self.resolved.insert(
            (spec.workflow_id.clone(), spec.task_id.clone()),
            call.clone(),
        );
        Ok(call)
    }

    /// Forget the handles a workflow's tasks resolved to
    pub fn release(&self, workflow_id: &WorkflowId) {
        self.resolved.retain(|(w, _), _| w != workflow_id);
    }

    /// Call `predict` under the task's timeout
    ///
    /// The output is returned unmodified. On timeout the service's `cancel`
    /// is attempted; on any failure the endpoint health is checked and
    /// attached to the error.
    pub async fn invoke(
        &self,
        call: &PreparedCall,
        spec: &TaskSpec,
    ) -> Result<Value, DispatchError> {
        let timeout = self.timeouts.for_priority(spec.priority);
        tracing::debug!(
            workflow_id = %spec.workflow_id,
            task_id = %spec.task_id,
            algorithm = %call.manifest.id(),
            timeout_ms = timeout.as_millis(),
            "dispatching task"
        );

        let request = call.service.predict(&spec.task_id, &spec.input);
        let error = match tokio::time::timeout(timeout, request).await {
            Ok(Ok(output)) => return Ok(output),
            Ok(Err(e)) => DispatchError::Service {
                message: e.message,
                retryable: e.retryable,
                health: None,
            },
            Err(_) => {
                self.cancel(call, &spec.task_id).await;
                DispatchError::Timeout {
                    after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    health: None,
                }
            }
        };

        let report = self.check_health(call).await;
        tracing::warn!(
            workflow_id = %spec.workflow_id,
            task_id = %spec.task_id,
            algorithm = %call.manifest.id(),
            health = ?report.status,
            error = %error,
            "dispatch failed"
        );
        Err(error.with_health(Some(report.status)))
    }

    /// Best-effort cancel of an in-flight call
    pub async fn cancel(&self, call: &PreparedCall, task_id: &TaskId) {
        match tokio::time::timeout(self.timeouts.cancel(), call.service.cancel(task_id)).await {
            Ok(Ok(())) => tracing::debug!(%task_id, "service cancel acknowledged"),
            Ok(Err(e)) => tracing::warn!(%task_id, error = %e, "service cancel failed"),
            Err(_) => tracing::warn!(%task_id, "service cancel timed out"),
        }
    }

    /// Run the compensating action for a completed task
    ///
    /// Uses the handle the task was dispatched to, so unregistering the
    /// version afterwards doesn't strand it. Tasks dispatched before a
    /// restart are resolved through the registry again.
    pub async fn compensate(&self, spec: &TaskSpec, output: &Value) -> Result<(), DispatchError> {
        let key = (spec.workflow_id.clone(), spec.task_id.clone());
        let resolved = self.resolved.get(&key).map(|call| Arc::clone(&call.service));
        let service = match resolved {
            Some(service) => service,
            None => {
                self.registry
                    .lookup(&spec.algorithm, Some(&spec.version))
                    .map_err(|_| DispatchError::NotFound {
                        algorithm: spec.algorithm.clone(),
                        version: spec.version.clone(),
                    })?
                    .endpoint
            }
        };
        let timeout = self.timeouts.compensation();

        match tokio::time::timeout(timeout, service.compensate(&spec.task_id, output)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DispatchError::Service {
                message: e.message,
                retryable: e.retryable,
                health: None,
            }),
            Err(_) => Err(DispatchError::Timeout {
                after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                health: None,
            }),
        }
    }

    /// Ask a service for its health and cache the report
    ///
    /// A service that doesn't answer in time counts as unhealthy.
    pub async fn check_health(&self, call: &PreparedCall) -> HealthReport {
        let deadline = self.timeouts.health_check();
        let report = match tokio::time::timeout(deadline, call.service.health()).await {
            Ok(report) => report,
            Err(_) => HealthReport::new(HealthStatus::Unhealthy, String::new()),
        };
        self.health.insert(
            (call.manifest.name.clone(), call.manifest.version.clone()),
            report.clone(),
        );
        report
    }

    /// Last observed health of an algorithm version
    #[must_use]
    pub fn health(&self, name: &str, version: &Version) -> Option<HealthReport> {
        self.health
            .get(&(name.to_string(), version.clone()))
            .map(|r| r.value().clone())
    }
}
