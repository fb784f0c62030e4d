//! PostgreSQL-backed concurrency counters and delay markers.
//!
//! Run with `DATABASE_URL` pointing at a scratch database and `--ignored`.

use chrono::{Duration, Utc};
use flowline_core::database::{
    ConcurrencyLimitStorage, ExecutionDelayStorage, PgConcurrencyLimitStorage,
    PgExecutionDelayStorage,
};
use flowline_core::models::{
    ConcurrencyLimit, DelayType, Execution, ExecutionDelay, ExecutionQueued, Flow, FlowIdentity,
    Task,
};
use flowline_core::FlowlineError;
use futures::future::join_all;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;

fn limited_flow() -> Flow {
    Flow::new("io.flowline.storage", "limited", vec![Task::runnable("work")])
}

fn take_slot(
    limit: i32,
) -> impl FnOnce(
    &mut flowline_core::database::LimitTransaction,
    ConcurrencyLimit,
) -> flowline_core::FlowlineResult<(bool, ConcurrencyLimit)> {
    move |_, current| {
        if current.running < limit {
            let running = current.running + 1;
            Ok((true, current.with_running(running)))
        } else {
            Ok((false, current))
        }
    }
}

#[sqlx::test(migrator = "flowline_core::database::MIGRATOR")]
#[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
async fn test_first_admission_materializes_counter(pool: PgPool) {
    let storage = PgConcurrencyLimitStorage::new(pool);
    let identity = limited_flow().identity();

    assert!(storage.find_by_id(None, "io.flowline.storage", "limited").await.unwrap().is_none());
    assert!(storage.count_then_process(&identity, take_slot(1)).await.unwrap());
    assert!(!storage.count_then_process(&identity, take_slot(1)).await.unwrap());

    let limit = storage
        .find_by_id(None, "io.flowline.storage", "limited")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(limit.running, 1);
    assert_eq!(limit.tenant_id, None);
}

#[sqlx::test(migrator = "flowline_core::database::MIGRATOR")]
#[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
async fn test_concurrent_first_admissions_share_one_counter(pool: PgPool) {
    let storage = Arc::new(PgConcurrencyLimitStorage::new(pool));
    let identity = limited_flow().identity();

    let admissions = (0..8).map(|_| {
        let storage = Arc::clone(&storage);
        let identity = identity.clone();
        async move { storage.count_then_process(&identity, take_slot(3)).await.unwrap() }
    });
    let admitted = join_all(admissions).await.into_iter().filter(|a| *a).count();

    assert_eq!(admitted, 3);
    let limits = storage.find(None).await.unwrap();
    assert_eq!(limits.len(), 1);
    assert_eq!(limits[0].running, 3);
}

#[sqlx::test(migrator = "flowline_core::database::MIGRATOR")]
#[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
async fn test_release_hands_slot_to_oldest_queued(pool: PgPool) {
    let storage = PgConcurrencyLimitStorage::new(pool);
    let flow = limited_flow();
    let identity = flow.identity();
    let first = Execution::new_for(&flow);
    let second = Execution::new_for(&flow);

    storage.count_then_process(&identity, take_slot(1)).await.unwrap();
    for execution in [first.clone(), second.clone()] {
        storage
            .count_then_process(&identity, move |tx, current| {
                tx.queue(ExecutionQueued::of(execution));
                Ok(((), current))
            })
            .await
            .unwrap();
    }

    let popped = storage.release(&identity).await.unwrap().unwrap();
    assert_eq!(popped.execution.id, first.id);
    let limit = storage.find_by_id(None, "io.flowline.storage", "limited").await.unwrap().unwrap();
    assert_eq!(limit.running, 1);

    assert!(storage.remove_queued(&second.id).await.unwrap());
    assert!(storage.release(&identity).await.unwrap().is_none());
    let limit = storage.find_by_id(None, "io.flowline.storage", "limited").await.unwrap().unwrap();
    assert_eq!(limit.running, 0);
}

#[sqlx::test(migrator = "flowline_core::database::MIGRATOR")]
#[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
async fn test_counter_never_goes_negative(pool: PgPool) {
    let storage = PgConcurrencyLimitStorage::new(pool);
    let identity = FlowIdentity::new(Some("acme"), "io.flowline.storage", "floor");

    assert_eq!(storage.decrement(&identity).await.unwrap(), 0);
    storage.count_then_process(&identity, take_slot(1)).await.unwrap();
    assert_eq!(storage.decrement(&identity).await.unwrap(), 0);
    assert_eq!(storage.decrement(&identity).await.unwrap(), 0);

    let limit = storage
        .find_by_id(Some("acme"), "io.flowline.storage", "floor")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(limit.running, 0);
    assert_eq!(limit.tenant_id.as_deref(), Some("acme"));
}

#[sqlx::test(migrator = "flowline_core::database::MIGRATOR")]
#[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
async fn test_failed_process_rolls_back(pool: PgPool) {
    let storage = PgConcurrencyLimitStorage::new(pool);
    let flow = limited_flow();
    let identity = flow.identity();
    storage.count_then_process(&identity, take_slot(1)).await.unwrap();

    let execution = Execution::new_for(&flow);
    let result = storage
        .count_then_process(&identity, move |tx, current| {
            tx.queue(ExecutionQueued::of(execution));
            Ok(((), current.with_running(-1)))
        })
        .await;

    assert!(result.is_err());
    assert!(storage.pop_queued(&identity).await.unwrap().is_none());
    let limit = storage.find_by_id(None, "io.flowline.storage", "limited").await.unwrap().unwrap();
    assert_eq!(limit.running, 1);
}

#[sqlx::test(migrator = "flowline_core::database::MIGRATOR")]
#[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
async fn test_only_due_delays_are_delivered(pool: PgPool) {
    let storage = PgExecutionDelayStorage::new(pool);
    let execution = Execution::new_for(&limited_flow());
    let due = ExecutionDelay::new(
        &execution,
        None,
        DelayType::ResumeFlow,
        Utc::now() - Duration::minutes(1),
    );
    let later = ExecutionDelay::new(
        &execution,
        None,
        DelayType::RestartFailedTask,
        Utc::now() + Duration::hours(1),
    );
    storage.save(due.clone()).await.unwrap();
    storage.save(later).await.unwrap();

    let mut delivered = Vec::new();
    let consumed = storage
        .get(|delay| {
            delivered.push(delay);
            async { Ok::<(), FlowlineError>(()) }
        })
        .await
        .unwrap();
    assert_eq!(consumed, 1);
    assert_eq!(delivered[0].id, due.id);
    assert_eq!(delivered[0].delay_type, DelayType::ResumeFlow);
    assert_eq!(delivered[0].tenant_id, None);

    assert_eq!(storage.get(|_| async { Ok::<(), FlowlineError>(()) }).await.unwrap(), 0);
    assert_eq!(storage.delete_by_execution(&execution.id).await.unwrap(), 1);
}

#[sqlx::test(migrator = "flowline_core::database::MIGRATOR")]
#[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
async fn test_failed_consumer_keeps_the_delay(pool: PgPool) {
    let storage = PgExecutionDelayStorage::new(pool);
    let execution = Execution::new_for(&limited_flow());
    let due = ExecutionDelay::new(
        &execution,
        None,
        DelayType::RestartFailedTask,
        Utc::now() - Duration::minutes(1),
    );
    storage.save(due.clone()).await.unwrap();

    let rejected = storage
        .get(|delay| async move {
            Err::<(), _>(FlowlineError::ExecutionNotFound(delay.execution_id))
        })
        .await
        .unwrap();
    assert_eq!(rejected, 0);

    let mut redelivered = Vec::new();
    let consumed = storage
        .get(|delay| {
            redelivered.push(delay.id);
            async { Ok::<(), FlowlineError>(()) }
        })
        .await
        .unwrap();
    assert_eq!(consumed, 1);
    assert_eq!(redelivered, vec![due.id]);
    assert_eq!(storage.delete_by_execution(&execution.id).await.unwrap(), 0);
}

#[sqlx::test(migrator = "flowline_core::database::MIGRATOR")]
#[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
async fn test_concurrent_pollers_never_share_a_delay(pool: PgPool) {
    let storage = Arc::new(PgExecutionDelayStorage::new(pool));
    let flow = limited_flow();
    let mut saved = HashSet::new();
    for _ in 0..20 {
        let execution = Execution::new_for(&flow);
        let delay = ExecutionDelay::new(
            &execution,
            None,
            DelayType::ResumeFlow,
            Utc::now() - Duration::seconds(5),
        );
        saved.insert(delay.id);
        storage.save(delay).await.unwrap();
    }

    let pollers = (0..4).map(|_| {
        let storage = Arc::clone(&storage);
        async move {
            let mut ids = Vec::new();
            storage
                .get(|delay| {
                    ids.push(delay.id);
                    async { Ok::<(), FlowlineError>(()) }
                })
                .await
                .unwrap();
            ids
        }
    });
    let delivered: Vec<_> = join_all(pollers).await.into_iter().flatten().collect();

    let unique: HashSet<_> = delivered.iter().copied().collect();
    assert_eq!(unique.len(), delivered.len(), "a delay was delivered twice");
    assert_eq!(unique, saved);
}
