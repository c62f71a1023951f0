//! Task transition table
//!
//! `pending → running → {completed | failed | cancelled}`, with
//! `running → retrying → running` for retries and `pending → failed` for
//! tasks rejected before dispatch. Terminal states have no exits.

use crate::error::TransitionError;
use crate::types::{TaskId, TaskState};

/// Validate a task state transition
pub fn validate_transition(
    task_id: &TaskId,
    from: TaskState,
    to: TaskState,
) -> Result<(), TransitionError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(TransitionError::IllegalTaskTransition {
            task_id: task_id.clone(),
            from,
            to,
        })
    }
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: TaskState) -> &'static [TaskState] {
    use TaskState::{Cancelled, Completed, Failed, Pending, Retrying, Running};
    match from {
        Pending => &[Running, Failed, Cancelled],
        Running => &[Completed, Failed, Retrying, Cancelled],
        Retrying => &[Running, Failed, Cancelled],
        Completed | Failed | Cancelled => &[],
    }
}

fn allowed(from: TaskState, to: TaskState) -> bool {
    allowed_transitions(from).contains(&to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn state() -> impl Strategy<Value = TaskState> {
        proptest::sample::select(TaskState::ALL.to_vec())
    }

    #[test]
    fn happy_path() {
        let id = TaskId::new("t1");
        assert!(validate_transition(&id, TaskState::Pending, TaskState::Running).is_ok());
        assert!(validate_transition(&id, TaskState::Running, TaskState::Completed).is_ok());
    }

    #[test]
    fn retry_loop() {
        let id = TaskId::new("t1");
        assert!(validate_transition(&id, TaskState::Running, TaskState::Retrying).is_ok());
        assert!(validate_transition(&id, TaskState::Retrying, TaskState::Running).is_ok());
    }

    #[test]
    fn pre_dispatch_failure() {
        let id = TaskId::new("t1");
        assert!(validate_transition(&id, TaskState::Pending, TaskState::Failed).is_ok());
    }

    #[test]
    fn no_skipping_running() {
        let id = TaskId::new("t1");
        let err = validate_transition(&id, TaskState::Pending, TaskState::Completed).unwrap_err();
        assert_eq!(
            err,
            TransitionError::IllegalTaskTransition {
                task_id: id,
                from: TaskState::Pending,
                to: TaskState::Completed,
            }
        );
    }

    proptest! {
        #[test]
        fn prop_terminal_states_have_no_exits(from in state(), to in state()) {
            let id = TaskId::new("t");
            if from.is_terminal() {
                prop_assert!(validate_transition(&id, from, to).is_err());
            }
        }

        #[test]
        fn prop_no_self_loops(s in state()) {
            prop_assert!(validate_transition(&TaskId::new("t"), s, s).is_err());
        }

        #[test]
        fn prop_table_and_validation_agree(from in state(), to in state()) {
            let listed = allowed_transitions(from).contains(&to);
            prop_assert_eq!(listed, validate_transition(&TaskId::new("t"), from, to).is_ok());
        }

        #[test]
        fn prop_cancel_reachable_from_every_live_state(from in state()) {
            if !from.is_terminal() {
                prop_assert!(allowed_transitions(from).contains(&TaskState::Cancelled));
            }
        }
    }
}
