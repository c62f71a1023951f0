//! Compensation Tests
//!
//! QC failures, failure resolution and compensation failures.

use assay_kernel::{
    Compensator, CompensationTrigger, Dispatcher, InMemoryEventStore, ServiceRegistry,
    SignalOutcome, TaskId, TaskSpec, TaskState, TimeoutPolicy, WorkflowError, WorkflowId,
    WorkflowMachine, WorkflowState,
};
use assay_test_utils::{experiment, install, manifest, version, CallJournal, StubService};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;

fn id(s: &str) -> TaskId {
    TaskId::new(s)
}

struct Harness {
    dispatcher: Dispatcher,
    journal: CallJournal,
    stub: Arc<StubService>,
    machine: Mutex<WorkflowMachine>,
}

/// `t1` independent, `t3 → t4 → t5` chained; `t5` left pending
fn harness() -> Harness {
    let registry = Arc::new(ServiceRegistry::new());
    let journal = CallJournal::new();
    let stub = install(
        &registry,
        StubService::new(manifest("dock", "1.0.0")).with_journal(&journal),
    );
    let dispatcher = Dispatcher::new(registry, TimeoutPolicy::default());

    let workflow_id = WorkflowId::new("w1");
    let mut machine = WorkflowMachine::start(
        Arc::new(InMemoryEventStore::new()),
        workflow_id.clone(),
        "screening",
        json!({}),
    )
    .unwrap();

    let spec = |task: &str| {
        TaskSpec::new(workflow_id.clone(), id(task), "dock", version("1.0.0"), json!({}))
    };
    machine.submit(spec("t1")).unwrap();
    machine.submit(spec("t3").requiring_validation()).unwrap();
    machine.submit(spec("t4").depends_on(id("t3"))).unwrap();
    machine.submit(spec("t5").depends_on(id("t4"))).unwrap();
    for task in ["t1", "t3", "t4"] {
        machine.mark_running(&id(task), 1).unwrap();
        machine.mark_complete(&id(task), json!({"pose": task})).unwrap();
    }

    Harness {
        dispatcher,
        journal,
        stub,
        machine: Mutex::new(machine),
    }
}

#[tokio::test]
async fn test_qc_failure_compensates_dependents_first() {
    let h = harness();
    {
        let mut machine = h.machine.lock().await;
        machine
            .receive_signal(experiment(&WorkflowId::new("w1"), "t3", "exp-1", false))
            .unwrap();
    }

    let outcomes = Compensator::new(&h.dispatcher)
        .apply_ready_signals(&h.machine)
        .await
        .unwrap();

    assert_eq!(
        outcomes,
        vec![SignalOutcome::Compensated {
            tasks: vec![id("t4"), id("t3")]
        }]
    );
    assert_eq!(h.journal.compensated(), vec![id("t4"), id("t3")]);

    let machine = h.machine.lock().await;
    for task in ["t3", "t4"] {
        let t = machine.task(&id(task)).unwrap();
        assert_eq!(t.state, TaskState::Completed);
        assert!(t.is_compensated(), "{task}");
    }
    assert!(!machine.task(&id("t1")).unwrap().is_compensated());
    assert_eq!(machine.task(&id("t3")).unwrap().validation(), Some(false));
    assert_eq!(machine.state(), WorkflowState::Running);
    assert_eq!(machine.status().compensations.len(), 2);
}

#[tokio::test]
async fn test_qc_pass_advances_version() {
    let h = harness();
    {
        let mut machine = h.machine.lock().await;
        let result =
            experiment(machine.id(), "t3", "exp-1", true).with_suggested_version("lead-v2");
        machine.receive_signal(result).unwrap();
    }

    let outcomes = Compensator::new(&h.dispatcher)
        .apply_ready_signals(&h.machine)
        .await
        .unwrap();

    assert_eq!(outcomes, vec![SignalOutcome::Advanced { version: 2 }]);
    assert!(h.journal.compensated().is_empty());

    let machine = h.machine.lock().await;
    let status = machine.status();
    assert_eq!(status.version, 2);
    let checkpoint = status.checkpoints.last().unwrap();
    assert_eq!(checkpoint.label.as_deref(), Some("lead-v2"));
    assert_eq!(checkpoint.carried, vec![id("t1"), id("t3"), id("t4")]);
    assert_eq!(machine.task(&id("t3")).unwrap().validation(), Some(true));
}

#[tokio::test]
async fn test_compensation_failure_fails_workflow() {
    let h = harness();
    h.stub.fail_compensation("tube already discarded");
    {
        let mut machine = h.machine.lock().await;
        machine
            .receive_signal(experiment(&WorkflowId::new("w1"), "t3", "exp-1", false))
            .unwrap();
    }

    let err = Compensator::new(&h.dispatcher)
        .apply_ready_signals(&h.machine)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Compensation(_)));

    let machine = h.machine.lock().await;
    assert_eq!(machine.state(), WorkflowState::Failed);
    let error = machine.status().error.clone().unwrap();
    assert!(error.contains("QC failed for task t3"), "{error}");
    assert!(error.contains("tube already discarded"), "{error}");
    // first action failed, nothing else attempted
    assert_eq!(h.journal.compensated(), vec![id("t4")]);
    assert_eq!(machine.task(&id("t5")).unwrap().state, TaskState::Cancelled);
}

#[tokio::test]
async fn test_resolve_failure_compensates_upstream_and_cancels_dependents() {
    let h = harness();
    {
        let mut machine = h.machine.lock().await;
        machine.mark_running(&id("t5"), 1).unwrap();
        machine.mark_failed(&id("t5"), "docking diverged").unwrap();
    }
    // t6 waits on the failed task
    {
        let mut machine = h.machine.lock().await;
        let wid = machine.id().clone();
        let t6 = TaskSpec::new(wid, id("t6"), "dock", version("1.0.0"), json!({}));
        machine.submit(t6.depends_on(id("t5"))).unwrap();
    }

    let compensated = Compensator::new(&h.dispatcher)
        .resolve_failure(&h.machine, &id("t5"))
        .await
        .unwrap();

    assert_eq!(compensated, vec![id("t4"), id("t3")]);
    let machine = h.machine.lock().await;
    assert!(machine.task(&id("t5")).unwrap().is_resolved_failure());
    assert_eq!(machine.task(&id("t6")).unwrap().state, TaskState::Cancelled);
    assert!(!machine.task(&id("t1")).unwrap().is_compensated());
    assert!(machine
        .status()
        .compensations
        .iter()
        .all(|c| c.trigger == CompensationTrigger::TaskFailed { task_id: id("t5") }));
}

#[tokio::test]
async fn test_deferred_signal_applies_after_completion() {
    let h = harness();
    {
        let mut machine = h.machine.lock().await;
        let ack = machine
            .receive_signal(experiment(&WorkflowId::new("w1"), "t5", "exp-9", true))
            .unwrap();
        assert_eq!(ack.receipt, assay_kernel::SignalReceipt::Deferred);
    }

    let compensator = Compensator::new(&h.dispatcher);
    assert!(compensator.apply_ready_signals(&h.machine).await.unwrap().is_empty());

    {
        let mut machine = h.machine.lock().await;
        machine.mark_running(&id("t5"), 1).unwrap();
        machine.mark_complete(&id("t5"), json!({})).unwrap();
    }
    assert_eq!(
        compensator.apply_ready_signals(&h.machine).await.unwrap(),
        vec![SignalOutcome::Advanced { version: 2 }]
    );
}

#[tokio::test]
async fn test_compensation_uses_handle_resolved_at_dispatch() {
    let h = harness();
    {
        let machine = h.machine.lock().await;
        for task in ["t3", "t4"] {
            h.dispatcher.prepare(&machine.task(&id(task)).unwrap().spec).unwrap();
        }
    }
    h.dispatcher
        .registry()
        .unregister("dock", &version("1.0.0"))
        .unwrap();
    {
        let mut machine = h.machine.lock().await;
        machine
            .receive_signal(experiment(&WorkflowId::new("w1"), "t3", "exp-1", false))
            .unwrap();
    }

    let outcomes = Compensator::new(&h.dispatcher)
        .apply_ready_signals(&h.machine)
        .await
        .unwrap();

    assert_eq!(
        outcomes,
        vec![SignalOutcome::Compensated {
            tasks: vec![id("t4"), id("t3")]
        }]
    );
    assert_eq!(h.journal.compensated(), vec![id("t4"), id("t3")]);
    assert_eq!(h.machine.lock().await.state(), WorkflowState::Running);
}

#[tokio::test]
async fn test_released_workflow_compensates_through_registry() {
    let h = harness();
    {
        let machine = h.machine.lock().await;
        h.dispatcher.prepare(&machine.task(&id("t1")).unwrap().spec).unwrap();
    }
    h.dispatcher.release(&WorkflowId::new("w1"));
    h.dispatcher
        .registry()
        .unregister("dock", &version("1.0.0"))
        .unwrap();

    let err = Compensator::new(&h.dispatcher)
        .run(&h.machine, &[id("t1")], &CompensationTrigger::TaskFailed { task_id: id("t5") })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not registered"), "{err}");
    assert!(h.journal.compensated().is_empty());
}
