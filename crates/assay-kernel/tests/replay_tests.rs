//! Replay Tests
//!
//! Replaying a log reproduces the live aggregate, and file-backed workflows
//! survive a restart.

use assay_kernel::{
    read_segment, verify_chain, EventStore, FileEventStore, InMemoryEventStore, LogError, TaskId,
    TaskSpec, TaskState, WorkflowId, WorkflowMachine, WorkflowState, WorkflowStatus,
};
use assay_test_utils::{experiment, version};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

const TASKS: [&str; 3] = ["t1", "t2", "t3"];

#[derive(Debug, Clone)]
enum Op {
    Run(usize),
    Complete(usize),
    Retry(usize),
    Fail(usize),
    Cancel(usize),
    Signal(usize, bool),
}

fn op() -> impl Strategy<Value = Op> {
    let task = 0..TASKS.len();
    prop_oneof![
        task.clone().prop_map(Op::Run),
        task.clone().prop_map(Op::Complete),
        task.clone().prop_map(Op::Retry),
        task.clone().prop_map(Op::Fail),
        task.clone().prop_map(Op::Cancel),
        (task, any::<bool>()).prop_map(|(t, pass)| Op::Signal(t, pass)),
    ]
}

fn start(store: Arc<dyn EventStore>, workflow_id: &WorkflowId) -> WorkflowMachine {
    let input = json!({"target": "EGFR"});
    let mut machine =
        WorkflowMachine::start(store, workflow_id.clone(), "screening", input).unwrap();
    for task in TASKS {
        machine
            .submit(TaskSpec::new(
                workflow_id.clone(),
                TaskId::new(task),
                "dock",
                version("1.0.0"),
                json!({}),
            ))
            .unwrap();
    }
    machine
}

proptest! {
    #[test]
    fn prop_replay_matches_live_state(ops in proptest::collection::vec(op(), 0..40)) {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let workflow_id = WorkflowId::new("w1");
        let mut machine = start(Arc::clone(&store), &workflow_id);

        for (n, op) in ops.into_iter().enumerate() {
            // Illegal operations are rejected without touching state
            let _ = match op {
                Op::Run(t) => machine.mark_running(&TaskId::new(TASKS[t]), 1),
                Op::Complete(t) => machine.mark_complete(&TaskId::new(TASKS[t]), json!({"n": n})),
                Op::Retry(t) => {
                    machine.mark_retry(&TaskId::new(TASKS[t]), "busy", Duration::from_millis(1))
                }
                Op::Fail(t) => machine.mark_failed(&TaskId::new(TASKS[t]), "boom"),
                Op::Cancel(t) => machine.mark_cancelled(&TaskId::new(TASKS[t]), "stop"),
                Op::Signal(t, pass) => machine
                    .receive_signal(experiment(&workflow_id, TASKS[t], &format!("exp-{n}"), pass))
                    .map(|_| ()),
            };
        }

        let records = store.load(&workflow_id).unwrap();
        prop_assert!(verify_chain(&records).is_ok());
        let replayed = WorkflowStatus::replay(&records).unwrap();
        prop_assert_eq!(&replayed, machine.status());
        prop_assert_eq!(replayed.last_sequence, records.len() as u64);

        // Replay is deterministic and re-applying the log changes nothing
        prop_assert_eq!(&WorkflowStatus::replay(&records).unwrap(), &replayed);
        let mut reapplied = replayed.clone();
        for record in &records {
            prop_assert!(!reapplied.apply_record(record).unwrap());
        }
        prop_assert_eq!(&reapplied, &replayed);
    }
}

#[test]
fn test_file_backed_workflow_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let workflow_id = WorkflowId::new("w1");

    let before = {
        let store: Arc<dyn EventStore> = Arc::new(FileEventStore::open(dir.path()).unwrap());
        let mut machine = start(store, &workflow_id);
        machine.mark_running(&TaskId::new("t1"), 1).unwrap();
        machine.mark_complete(&TaskId::new("t1"), json!({"pose": 1})).unwrap();
        machine.mark_running(&TaskId::new("t2"), 1).unwrap();
        machine.status().clone()
    };

    let store: Arc<dyn EventStore> = Arc::new(FileEventStore::open(dir.path()).unwrap());
    assert_eq!(store.workflows().unwrap(), vec![workflow_id.clone()]);
    let mut machine = WorkflowMachine::recover(Arc::clone(&store), workflow_id.clone())
        .unwrap()
        .unwrap();
    assert_eq!(machine.status(), &before);
    assert_eq!(machine.task(&TaskId::new("t2")).unwrap().state, TaskState::Running);

    // Appending continues the same chain
    machine.mark_complete(&TaskId::new("t2"), json!({})).unwrap();
    machine.mark_cancelled(&TaskId::new("t3"), "enough").unwrap();
    machine.finish_plan().unwrap();
    assert!(machine.complete().unwrap());
    assert_eq!(machine.state(), WorkflowState::Completed);

    let records = store.load(&workflow_id).unwrap();
    verify_chain(&records).unwrap();
    assert_eq!(WorkflowStatus::replay(&records).unwrap(), machine.status().clone());
}

#[test]
fn test_torn_tail_dropped_on_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let workflow_id = WorkflowId::new("w1");
    let file_store = FileEventStore::open(dir.path()).unwrap();
    let path = file_store.segment_path(&workflow_id);

    let before = {
        let mut machine = start(Arc::new(file_store), &workflow_id);
        machine.mark_running(&TaskId::new("t1"), 1).unwrap();
        machine.status().clone()
    };

    // Crash mid-write
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(br#"{"sequence":99,"workflow_id":"w1","ev"#).unwrap();
    drop(file);

    let store: Arc<dyn EventStore> = Arc::new(FileEventStore::open(dir.path()).unwrap());
    let mut machine = WorkflowMachine::recover(store, workflow_id).unwrap().unwrap();
    assert_eq!(machine.status(), &before);
    machine.mark_complete(&TaskId::new("t1"), json!({})).unwrap();

    let records = read_segment(&path).unwrap();
    verify_chain(&records).unwrap();
    assert_eq!(records.last().unwrap().sequence, before.last_sequence + 1);
}

#[test]
fn test_tampered_segment_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let workflow_id = WorkflowId::new("w1");
    let file_store = FileEventStore::open(dir.path()).unwrap();
    let path = file_store.segment_path(&workflow_id);
    drop(start(Arc::new(file_store), &workflow_id));

    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, text.replace("EGFR", "KRAS")).unwrap();

    let store: Arc<dyn EventStore> = Arc::new(FileEventStore::open(dir.path()).unwrap());
    let err = WorkflowMachine::recover(store, workflow_id).err().unwrap();
    assert!(
        matches!(
            err,
            assay_kernel::WorkflowError::Log(LogError::IntegrityViolation { sequence: 1, .. })
        ),
        "{err:?}"
    );
}

#[test]
fn test_lookalike_ids_recover_independently() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn EventStore> = Arc::new(FileEventStore::open(dir.path()).unwrap());
    let slash = WorkflowId::new("w/1");
    let underscore = WorkflowId::new("w_1");

    let mut first = start(Arc::clone(&store), &slash);
    first.mark_running(&TaskId::new("t1"), 1).unwrap();
    let second = start(Arc::clone(&store), &underscore);
    assert_eq!(second.status().workflow_id, underscore);

    let recovered = WorkflowMachine::recover(Arc::clone(&store), underscore.clone())
        .unwrap()
        .unwrap();
    assert_eq!(recovered.status(), second.status());
    assert_eq!(recovered.task(&TaskId::new("t1")).unwrap().state, TaskState::Pending);
    assert_eq!(store.workflows().unwrap(), vec![slash, underscore]);
}
