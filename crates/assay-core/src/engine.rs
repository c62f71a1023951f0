//! Workflow engine
//!
//! Hosts workflow instances. Each instance owns its state machine behind an
//! async mutex and is driven by a [`ControlLoop`] on its own tokio task;
//! observers read ordered snapshots from a `watch` channel. After a restart
//! the engine rebuilds instances from the event store and resumes them.

use crate::agent::{ControlLoop, Reasoner};
use crate::config::{EventLogConfig, OrchestratorConfig};
use crate::error::EngineError;
use assay_kernel::{
    verify_chain, Dispatcher, EventStore, ExperimentResult, FileEventStore, InMemoryEventStore,
    ServiceRegistry, SignalAck, TransitionError, WorkflowError, WorkflowId, WorkflowMachine,
    WorkflowStatus,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Instance {
    machine: Mutex<WorkflowMachine>,
    /// Top-down cancellation of the driver and its tasks
    cancel: CancellationToken,
    /// Fired once a cancel or terminate request was recorded or failed
    stopped: CancellationToken,
    /// Signal arrivals
    signals: Notify,
    status: watch::Receiver<WorkflowStatus>,
    /// Fired when the driver exits for any reason
    finished: CancellationToken,
    failure: parking_lot::Mutex<Option<String>>,
    driver: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Instance {
    fn new(machine: WorkflowMachine) -> Arc<Self> {
        let (tx, rx) = watch::channel(machine.status().clone());
        Arc::new(Self {
            machine: Mutex::new(machine.with_observer(tx)),
            cancel: CancellationToken::new(),
            stopped: CancellationToken::new(),
            signals: Notify::new(),
            status: rx,
            finished: CancellationToken::new(),
            failure: parking_lot::Mutex::new(None),
            driver: parking_lot::Mutex::new(None),
        })
    }

    fn snapshot(&self) -> WorkflowStatus {
        self.status.borrow().clone()
    }
}

/// Workflow service: start, query, signal, cancel and recover workflows
pub struct WorkflowEngine {
    store: Arc<dyn EventStore>,
    dispatcher: Arc<Dispatcher>,
    control: Arc<ControlLoop>,
    signal_buffer: usize,
    instances: DashMap<WorkflowId, Arc<Instance>>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("instances", &self.instances.len())
            .field("control", &self.control)
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    /// Create engine with the event store named in `config`
    ///
    /// # Errors
    /// `Log` when a file store directory cannot be created.
    pub fn new(
        registry: Arc<ServiceRegistry>,
        reasoner: Arc<dyn Reasoner>,
        config: &OrchestratorConfig,
    ) -> Result<Self, EngineError> {
        let store: Arc<dyn EventStore> = match &config.event_log {
            EventLogConfig::Memory => Arc::new(InMemoryEventStore::new()),
            EventLogConfig::File { dir } => Arc::new(FileEventStore::open(dir)?),
        };
        Ok(Self::with_store(store, registry, reasoner, config))
    }

    /// Create engine over an existing store
    #[must_use]
    pub fn with_store(
        store: Arc<dyn EventStore>,
        registry: Arc<ServiceRegistry>,
        reasoner: Arc<dyn Reasoner>,
        config: &OrchestratorConfig,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(registry, config.timeouts.clone()));
        let control = Arc::new(ControlLoop::new(Arc::clone(&dispatcher), reasoner, config));
        Self {
            store,
            dispatcher,
            control,
            signal_buffer: config.signal_buffer,
            instances: DashMap::new(),
        }
    }

    /// Dispatcher shared by every workflow
    #[inline]
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Registry tasks resolve against
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        self.dispatcher.registry()
    }

    /// Event store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Signal channel capacity
    #[inline]
    #[must_use]
    pub fn signal_buffer(&self) -> usize {
        self.signal_buffer
    }

    fn instance(&self, workflow_id: &WorkflowId) -> Result<Arc<Instance>, EngineError> {
        self.instances
            .get(workflow_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.clone()))
    }

    /// Start a workflow and its driver
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// `AlreadyExists` if the id is loaded or already has a log segment.
    pub fn start_workflow(
        &self,
        workflow_id: WorkflowId,
        workflow_type: impl Into<String>,
        input: Value,
    ) -> Result<WorkflowStatus, EngineError> {
        let instance = match self.instances.entry(workflow_id.clone()) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(workflow_id)),
            Entry::Vacant(slot) => {
                let machine = WorkflowMachine::start(
                    Arc::clone(&self.store),
                    workflow_id.clone(),
                    workflow_type,
                    input,
                )
                .map_err(|e| match e {
                    WorkflowError::Transition(TransitionError::AlreadyStarted) => {
                        EngineError::AlreadyExists(workflow_id.clone())
                    }
                    e => e.into(),
                })?;
                let instance = Instance::new(machine);
                slot.insert(Arc::clone(&instance));
                instance
            }
        };

        self.drive(&instance);
        Ok(instance.snapshot())
    }

    fn drive(&self, instance: &Arc<Instance>) {
        let control = Arc::clone(&self.control);
        let dispatcher = Arc::clone(&self.dispatcher);
        let inst = Arc::clone(instance);
        let workflow_id = instance.snapshot().workflow_id;

        let handle = tokio::spawn(async move {
            match control.run(&inst.machine, &inst.cancel, &inst.signals).await {
                Ok(state) => tracing::info!(%workflow_id, %state, "workflow driver finished"),
                Err(e) => {
                    tracing::error!(%workflow_id, error = %e, "workflow driver stopped");
                    *inst.failure.lock() = Some(e.to_string());
                }
            }
            dispatcher.release(&workflow_id);
            inst.finished.cancel();
        });
        *instance.driver.lock() = Some(handle);
    }

    /// Current status
    ///
    /// Falls back to replaying the store for workflows that aren't loaded.
    pub fn get_workflow_status(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<WorkflowStatus, EngineError> {
        if let Ok(instance) = self.instance(workflow_id) {
            return Ok(instance.snapshot());
        }
        let records = self.store.load(workflow_id)?;
        if records.is_empty() {
            return Err(EngineError::WorkflowNotFound(workflow_id.clone()));
        }
        verify_chain(&records)?;
        Ok(WorkflowStatus::replay(&records).map_err(WorkflowError::from)?)
    }

    /// Deliver a wet-lab result
    ///
    /// # Errors
    /// `WorkflowNotFound` for an unloaded workflow, `UnknownTask` for a task
    /// it never submitted, `WorkflowTerminal` once it has ended.
    pub async fn signal_workflow(
        &self,
        result: ExperimentResult,
    ) -> Result<SignalAck, EngineError> {
        let instance = self.instance(&result.workflow_id)?;
        let ack = instance.machine.lock().await.receive_signal(result)?;
        instance.signals.notify_one();
        Ok(ack)
    }

    /// Cancel outstanding tasks, then the workflow
    pub async fn cancel_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<WorkflowStatus, EngineError> {
        self.stop(workflow_id, |machine| machine.cancel("cancelled by request"))
            .await
    }

    /// Operator termination
    pub async fn terminate_workflow(
        &self,
        workflow_id: &WorkflowId,
        reason: &str,
    ) -> Result<WorkflowStatus, EngineError> {
        self.stop(workflow_id, |machine| machine.terminate(reason)).await
    }

    /// Stop the driver, then record the terminal state
    ///
    /// If recording fails the workflow stays non-terminal; the error is kept
    /// for [`Self::wait_for_completion`] to report.
    async fn stop<F>(
        &self,
        workflow_id: &WorkflowId,
        record: F,
    ) -> Result<WorkflowStatus, EngineError>
    where
        F: FnOnce(&mut WorkflowMachine) -> Result<(), WorkflowError>,
    {
        let instance = self.instance(workflow_id)?;
        instance.cancel.cancel();
        let result = {
            let mut machine = instance.machine.lock().await;
            let result = record(&mut machine).map(|()| machine.status().clone());
            if let Err(e) = &result {
                if !machine.is_terminal() {
                    tracing::error!(%workflow_id, error = %e, "could not record stop request");
                    *instance.failure.lock() = Some(e.to_string());
                }
            }
            result
        };
        instance.stopped.cancel();
        Ok(result?)
    }

    /// Wait until the workflow reaches a terminal state
    ///
    /// # Errors
    /// `Driver` if its driver stopped on an error it could not record.
    pub async fn wait_for_completion(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<WorkflowStatus, EngineError> {
        let instance = self.instance(workflow_id)?;
        let mut status = instance.status.clone();

        let driver_gone = async {
            instance.finished.cancelled().await;
            if instance.cancel.is_cancelled() {
                // The canceller records the terminal state itself
                instance.stopped.cancelled().await;
            }
        };

        tokio::select! {
            result = status.wait_for(|s| s.state.is_terminal()) => {
                if let Ok(status) = result {
                    return Ok(status.clone());
                }
            }
            () = driver_gone => {}
        }

        let status = instance.snapshot();
        if status.state.is_terminal() {
            return Ok(status);
        }
        let message = instance
            .failure
            .lock()
            .clone()
            .unwrap_or_else(|| "driver exited".to_string());
        Err(EngineError::Driver {
            workflow_id: workflow_id.clone(),
            message,
        })
    }

    /// Load one workflow from the store and resume it if it is still running
    ///
    /// Must be called from within a Tokio runtime.
    pub fn recover_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<WorkflowStatus, EngineError> {
        let instance = match self.instances.entry(workflow_id.clone()) {
            Entry::Occupied(entry) => return Ok(entry.get().snapshot()),
            Entry::Vacant(slot) => {
                let recovered =
                    WorkflowMachine::recover(Arc::clone(&self.store), workflow_id.clone())?;
                let machine = recovered
                    .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.clone()))?;
                let instance = Instance::new(machine);
                slot.insert(Arc::clone(&instance));
                instance
            }
        };

        let status = instance.snapshot();
        if status.state.is_terminal() {
            instance.finished.cancel();
        } else {
            tracing::info!(
                workflow_id = %status.workflow_id,
                tasks = status.tasks.len(),
                "resuming workflow"
            );
            self.drive(&instance);
        }
        Ok(status)
    }

    /// Load every workflow in the store; returns the ones resumed
    pub fn recover(&self) -> Result<Vec<WorkflowId>, EngineError> {
        let mut resumed = Vec::new();
        for workflow_id in self.store.workflows()? {
            if self.instances.contains_key(&workflow_id) {
                continue;
            }
            if !self.recover_workflow(&workflow_id)?.state.is_terminal() {
                resumed.push(workflow_id);
            }
        }
        Ok(resumed)
    }

    /// Snapshots of every loaded workflow, oldest first
    #[must_use]
    pub fn list_workflows(&self) -> Vec<WorkflowStatus> {
        let mut all: Vec<WorkflowStatus> = self
            .instances
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        all.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.workflow_id.cmp(&b.workflow_id))
        });
        all
    }

    /// Stop every driver without recording anything
    ///
    /// The logs are left as they are, so another engine over the same store
    /// can recover the workflows.
    pub fn halt(&self) {
        for entry in &self.instances {
            let instance = entry.value();
            if let Some(driver) = instance.driver.lock().take() {
                driver.abort();
            }
            self.dispatcher.release(entry.key());
            instance.finished.cancel();
            instance.stopped.cancel();
        }
        self.instances.clear();
        tracing::warn!("engine halted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{CritiqueContext, PlanContext, PlanDecision};
    use crate::error::ReasonerError;
    use assay_kernel::{EventRecord, LogError, Verdict, WorkflowState};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// In-memory store whose appends can be made to fail
    #[derive(Default)]
    struct BrittleStore {
        inner: InMemoryEventStore,
        broken: AtomicBool,
    }

    impl EventStore for BrittleStore {
        fn append(&self, record: &EventRecord) -> Result<(), LogError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(LogError::Io {
                    path: "memory".into(),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.inner.append(record)
        }

        fn load(&self, workflow_id: &WorkflowId) -> Result<Vec<EventRecord>, LogError> {
            self.inner.load(workflow_id)
        }

        fn workflows(&self) -> Result<Vec<WorkflowId>, LogError> {
            self.inner.workflows()
        }
    }

    struct Idle;

    #[async_trait]
    impl Reasoner for Idle {
        async fn plan(&self, _ctx: &PlanContext) -> Result<PlanDecision, ReasonerError> {
            std::future::pending().await
        }

        async fn critique(&self, _ctx: &CritiqueContext) -> Result<Verdict, ReasonerError> {
            Ok(Verdict::Accept)
        }
    }

    fn engine() -> WorkflowEngine {
        WorkflowEngine::new(
            Arc::new(ServiceRegistry::new()),
            Arc::new(Idle),
            &OrchestratorConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn duplicate_start_is_rejected() {
        let engine = engine();
        let id = WorkflowId::new("w1");
        engine.start_workflow(id.clone(), "screening", json!({})).unwrap();
        assert!(matches!(
            engine.start_workflow(id, "screening", json!({})),
            Err(EngineError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn unknown_workflow_is_not_found() {
        let engine = engine();
        let err = engine.get_workflow_status(&WorkflowId::new("nope")).unwrap_err();
        assert!(err.is_not_found());
        let err = engine.cancel_workflow(&WorkflowId::new("nope")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn cancel_while_planning() {
        let engine = engine();
        let id = WorkflowId::new("w1");
        engine.start_workflow(id.clone(), "screening", json!({})).unwrap();

        let status = engine.cancel_workflow(&id).await.unwrap();
        assert_eq!(status.state, WorkflowState::Cancelled);
        let done = engine.wait_for_completion(&id).await.unwrap();
        assert_eq!(done.state, WorkflowState::Cancelled);

        // second cancel is rejected, not silently accepted
        assert!(engine.cancel_workflow(&id).await.unwrap_err().is_terminal());
    }

    #[tokio::test]
    async fn halted_workflows_stay_queryable_from_the_store() {
        let engine = engine();
        let id = WorkflowId::new("w1");
        engine.start_workflow(id.clone(), "screening", json!({"target": "EGFR"})).unwrap();
        engine.halt();

        assert!(engine.list_workflows().is_empty());
        let status = engine.get_workflow_status(&id).unwrap();
        assert_eq!(status.state, WorkflowState::Running);
        assert_eq!(status.input, json!({"target": "EGFR"}));
    }

    #[tokio::test]
    async fn unrecorded_cancel_is_reported_to_waiters() {
        let store = Arc::new(BrittleStore::default());
        let engine = WorkflowEngine::with_store(
            Arc::clone(&store) as Arc<dyn EventStore>,
            Arc::new(ServiceRegistry::new()),
            Arc::new(Idle),
            &OrchestratorConfig::default(),
        );
        let id = WorkflowId::new("w1");
        engine.start_workflow(id.clone(), "screening", json!({})).unwrap();
        store.broken.store(true, Ordering::SeqCst);

        let err = engine.cancel_workflow(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::Workflow(WorkflowError::Log(_))), "{err:?}");
        assert_eq!(engine.get_workflow_status(&id).unwrap().state, WorkflowState::Running);

        let waited = tokio::time::timeout(Duration::from_secs(5), engine.wait_for_completion(&id))
            .await
            .expect("waiter returned");
        match waited {
            Err(EngineError::Driver { message, .. }) => {
                assert!(message.contains("disk full"), "{message}");
            }
            other => panic!("expected driver error, got {other:?}"),
        }
    }
}
