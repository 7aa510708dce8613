use atl_core::state_machine::{allowed_transitions, is_revision, validate_transition};
use atl_core::{ReviewVerdict, StageKind, TaskStatus};
use atl_test_utils::{create, fast_config, ScriptedExecutor, StubSandbox};
use proptest::prelude::*;
use std::sync::Arc;

fn any_status() -> impl Strategy<Value = TaskStatus> {
    prop_oneof![
        Just(TaskStatus::Pending),
        Just(TaskStatus::PmProcessing),
        Just(TaskStatus::DevProcessing),
        Just(TaskStatus::QaProcessing),
        Just(TaskStatus::SandboxRunning),
        Just(TaskStatus::ReviewProcessing),
        Just(TaskStatus::AwaitingApproval),
        Just(TaskStatus::Approved),
        Just(TaskStatus::Rejected),
        Just(TaskStatus::Completed),
        Just(TaskStatus::Failed),
    ]
}

#[test]
fn test_awaiting_approval_transitions() {
    assert!(validate_transition(TaskStatus::AwaitingApproval, TaskStatus::Approved).is_ok());
    assert!(validate_transition(TaskStatus::AwaitingApproval, TaskStatus::Rejected).is_ok());

    // Only a human decision leaves awaiting_approval
    assert!(validate_transition(TaskStatus::AwaitingApproval, TaskStatus::Failed).is_err());
    assert!(validate_transition(TaskStatus::AwaitingApproval, TaskStatus::DevProcessing).is_err());
}

#[test]
fn test_revision_edge_is_unique() {
    let backward: Vec<_> = TaskStatus::ALL
        .iter()
        .flat_map(|from| allowed_transitions(*from).iter().map(move |to| (*from, *to)))
        .filter(|(from, to)| is_revision(*from, *to))
        .collect();
    assert_eq!(
        backward,
        vec![(TaskStatus::ReviewProcessing, TaskStatus::DevProcessing)]
    );
}

proptest! {
    #[test]
    fn prop_validation_agrees_with_table(from in any_status(), to in any_status()) {
        let allowed = allowed_transitions(from);
        prop_assert_eq!(validate_transition(from, to).is_ok(), allowed.contains(&to));
    }

    #[test]
    fn prop_terminal_states_are_absorbing(from in any_status(), to in any_status()) {
        if from.is_terminal() {
            prop_assert!(validate_transition(from, to).is_err());
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_revision_loop_respects_cap(max in 0u32..=4, revisions in 0usize..7) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (iterations, status, reviews, capped) = runtime.block_on(async move {
            let verdicts = (0..revisions).map(|n| ReviewVerdict::revise(format!("pass {n}")));
            let executor = Arc::new(ScriptedExecutor::with_reviews(verdicts));
            let orch = atl_core::Orchestrator::builder(
                executor.clone(),
                Arc::new(StubSandbox::passing()),
            )
            .config(fast_config().with_max_iterations(max))
            .build()
            .unwrap();
            let id = create(&orch, "capped").await;
            let status = orch.run_until_checkpoint(&id).await.unwrap();
            let task = orch.get_task(&id).await.unwrap();
            let capped = task
                .messages
                .iter()
                .any(|m| m.content.starts_with("Maximum revisions reached"));
            (
                task.iteration_count,
                status,
                executor.calls_for(StageKind::Review).len(),
                capped,
            )
        });

        let expected = u32::try_from(revisions).unwrap().min(max);
        prop_assert_eq!(status, TaskStatus::AwaitingApproval);
        prop_assert_eq!(iterations, expected);
        prop_assert!(iterations <= max);
        prop_assert_eq!(reviews, expected as usize + 1);
        prop_assert_eq!(capped, revisions > max as usize);
    }
}
