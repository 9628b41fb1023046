//! Property-based tests for step ordering.

use std::sync::Arc;

use clap::Command;
use parking_lot::Mutex;
use proptest::prelude::*;
use standout_invoke::{BufferConsole, Pipeline, Priority};

fn run_order(registrations: &[Priority]) -> Vec<(Priority, usize)> {
    let log: Arc<Mutex<Vec<(Priority, usize)>>> = Arc::default();

    let mut builder = Pipeline::builder(Command::new("app"));
    for (index, priority) in registrations.iter().copied().enumerate() {
        let log = Arc::clone(&log);
        builder = builder.add_fn(priority, move |ctx, next| {
            log.lock().push((priority, index));
            Box::pin(async move { next.run(ctx).await })
        });
    }
    let pipeline = builder
        .command_fn("", |_ctx| Box::pin(async { Ok(0) }))
        .unwrap()
        .build();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime
        .block_on(pipeline.invoke_with(["app"], Box::new(BufferConsole::new())))
        .unwrap();

    let recorded = log.lock().clone();
    recorded
}

fn priority_strategy() -> impl Strategy<Value = Priority> {
    (0..Priority::ALL.len()).prop_map(|i| Priority::ALL[i])
}

proptest! {
    /// Steps run in priority order; equal priorities keep registration order.
    #[test]
    fn steps_run_in_stable_priority_order(
        registrations in prop::collection::vec(priority_strategy(), 0..24),
    ) {
        let mut expected: Vec<(Priority, usize)> = registrations
            .iter()
            .copied()
            .enumerate()
            .map(|(index, priority)| (priority, index))
            .collect();
        expected.sort_by_key(|(priority, _)| *priority);

        prop_assert_eq!(run_order(&registrations), expected);
    }

    /// Every registered step runs exactly once per invocation.
    #[test]
    fn every_step_runs_once(
        registrations in prop::collection::vec(priority_strategy(), 0..24),
    ) {
        let order = run_order(&registrations);
        prop_assert_eq!(order.len(), registrations.len());
    }
}
