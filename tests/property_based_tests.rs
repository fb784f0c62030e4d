mod common;

use common::*;
use flowline_core::models::{Execution, State, Task};
use proptest::prelude::*;

fn outcome_strategy() -> impl Strategy<Value = State> {
    prop_oneof![Just(State::Success), Just(State::Warning), Just(State::Failed)]
}

/// Outcomes for N parallel children plus the order they are reported in.
fn completion_strategy() -> impl Strategy<Value = (Vec<State>, Vec<usize>)> {
    prop::collection::vec(outcome_strategy(), 1..6).prop_flat_map(|outcomes| {
        let order: Vec<usize> = (0..outcomes.len()).collect();
        (Just(outcomes), Just(order).prop_shuffle())
    })
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: a parallel block terminates exactly when its last child
    /// does, with the worst child state, whatever the reporting order
    #[test]
    fn parallel_block_is_order_independent((outcomes, order) in completion_strategy()) {
        let children: Vec<Task> = (0..outcomes.len()).map(|i| hold(&format!("c{i}"))).collect();
        let flow = flow("parallel-prop", vec![Task::parallel("parallel", children)]);

        let (block_states, final_state) = runtime().block_on(async {
            let mut env = TestEnvironment::new(&[flow.clone()]);
            let execution = env.submit(Execution::new_for(&flow)).await;

            let mut block_states = Vec::new();
            for index in &order {
                env.complete_held(&format!("c{index}"), outcomes[*index]).await;
                let snapshot = env.execution(&execution.id).await;
                block_states.push(state_of(&snapshot, "parallel"));
            }
            (block_states, env.execution(&execution.id).await.current_state())
        });

        let expected = State::fold(outcomes.iter().copied());
        let (last, before) = block_states.split_last().unwrap();
        prop_assert!(before.iter().all(|state| *state == State::Running));
        prop_assert_eq!(*last, expected);
        prop_assert_eq!(final_state, expected);
    }

    /// Property: with allow-failure on every child a parallel block never fails
    #[test]
    fn allow_failure_children_never_fail_the_block((outcomes, order) in completion_strategy()) {
        let children: Vec<Task> = (0..outcomes.len())
            .map(|i| hold(&format!("c{i}")).with_allow_failure())
            .collect();
        let flow = flow("parallel-tolerant", vec![Task::parallel("parallel", children)]);

        let final_state = runtime().block_on(async {
            let mut env = TestEnvironment::new(&[flow.clone()]);
            let execution = env.submit(Execution::new_for(&flow)).await;
            for index in &order {
                env.complete_held(&format!("c{index}"), outcomes[*index]).await;
            }
            env.execution(&execution.id).await.current_state()
        });

        prop_assert_ne!(final_state, State::Failed);
        let expected = if outcomes.iter().all(|s| *s == State::Success) {
            State::Success
        } else {
            State::Warning
        };
        prop_assert_eq!(final_state, expected);
    }
}
