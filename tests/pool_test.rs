//! Integration tests for pool sizing, exhaustion, and lease release.

mod common;

use common::*;
use relstore::{StoreError, TransactionCoordinator};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_pool_exhaustion_surfaces_after_wait_period() {
    let context = context_at(
        &temp_db_path(),
        "?pool.maxsize=1&pool.cangrow=false&pool.waitperiod=1",
        TransactionCoordinator::new(),
    )
    .await;

    let held = context.source().acquire(DATA_SOURCE).await.unwrap();

    let start = Instant::now();
    let second = context.source().acquire(DATA_SOURCE).await;
    let waited = start.elapsed();

    match second {
        Err(StoreError::PoolExhausted { name, waited_ms }) => {
            assert_eq!(name, DATA_SOURCE);
            assert_eq!(waited_ms, 1_000);
        }
        other => panic!("expected PoolExhausted, got {other:?}"),
    }
    // It actually blocked for the configured wait period first.
    assert!(waited >= Duration::from_millis(900));

    context.source().release(held).await;

    // With the lease returned the pool serves again.
    let third = context.source().acquire(DATA_SOURCE).await.unwrap();
    context.source().release(third).await;
}

#[tokio::test]
async fn test_growable_pool_expands_past_maxsize() {
    let context = context_at(
        &temp_db_path(),
        "?pool.maxsize=1&pool.waitperiod=2",
        TransactionCoordinator::new(),
    )
    .await;

    // cangrow defaults to true: a second concurrent lease must be served
    // instead of timing out.
    let first = context.source().acquire(DATA_SOURCE).await.unwrap();
    let second = context.source().acquire(DATA_SOURCE).await.unwrap();

    context.source().release(first).await;
    context.source().release(second).await;
}

#[tokio::test]
async fn test_release_of_open_transaction_rolls_back() {
    let context = sqlite_context().await;
    init_schemas(&context).await;

    let mut lease = context
        .source()
        .acquire_transactional(DATA_SOURCE)
        .await
        .unwrap();
    assert!(lease.in_transaction());
    lease
        .execute_raw(
            "INSERT INTO customers (partition_id, created_at, modified_at, name) \
             VALUES (1, 0, 0, 'orphan')",
        )
        .await
        .unwrap();
    // Dropped without commit: release must swallow this and roll back.
    context.source().release(lease).await;

    let mut lease = context.source().acquire(DATA_SOURCE).await.unwrap();
    let rows = lease
        .execute_raw("DELETE FROM customers WHERE name = 'orphan'")
        .await
        .unwrap();
    assert_eq!(rows, 0, "uncommitted insert must not survive release");
    context.source().release(lease).await;
}

#[tokio::test]
async fn test_acquire_admin_falls_back_to_regular_credentials() {
    let context = sqlite_context().await;
    let lease = context
        .source()
        .acquire_admin(DATA_SOURCE, true)
        .await
        .unwrap();
    context.source().release(lease).await;
}

#[tokio::test]
async fn test_acquire_as_ignores_credentials_on_embedded_engine() {
    let context = sqlite_context().await;
    let mut lease = context
        .source()
        .acquire_as(DATA_SOURCE, "dba", "secret")
        .await
        .unwrap();
    lease.execute_raw("SELECT 1").await.unwrap();
    context.source().release(lease).await;
}

#[tokio::test]
async fn test_commit_implicit_without_transaction_is_noop() {
    let context = sqlite_context().await;
    let mut lease = context.source().acquire(DATA_SOURCE).await.unwrap();
    assert!(!lease.in_transaction());
    context
        .coordinator()
        .commit_implicit(&mut lease)
        .await
        .unwrap();
    context
        .coordinator()
        .rollback_implicit(&mut lease)
        .await
        .unwrap();
    context.source().release(lease).await;
}
