//! End-to-end scenario: an "orders" data source with a bounded pool, a
//! dependent schema pair, generated keys, and an optimistic-concurrency race
//! between two writers.

mod common;

use common::*;
use relstore::records::millis_of;
use relstore::{GenericRecordFactory, SchemaRegistry, StoreError, TransactionCoordinator};
use std::sync::Arc;

#[tokio::test]
async fn test_orders_end_to_end() {
    let context = context_at(
        &temp_db_path(),
        "?pool.maxsize=5&pool.cangrow=false",
        TransactionCoordinator::new(),
    )
    .await;

    // ORDERS depends on CUSTOMERS; init creates CUSTOMERS first, both at
    // version 1.
    let registry = SchemaRegistry::new(Arc::clone(&context));
    registry.add(Arc::new(OrderSchema)).unwrap();
    registry.add(Arc::new(CustomerSchema)).unwrap();
    let mut lease = context
        .source()
        .acquire_transactional(DATA_SOURCE)
        .await
        .unwrap();
    let summary = registry.init(&mut lease, "startup").await.unwrap();
    assert_eq!(summary.created, vec!["CUSTOMERS", "ORDERS"]);
    let versions = registry.load_versions(&mut lease).await.unwrap();
    assert_eq!(versions["CUSTOMERS"].version, 1);
    assert_eq!(versions["ORDERS"].version, 1);
    context.source().release(lease).await;

    let customers = GenericRecordFactory::new(Arc::clone(&context), DATA_SOURCE, CustomerMapping);
    let orders = GenericRecordFactory::new(Arc::clone(&context), DATA_SOURCE, OrderMapping);

    let mut customer = Customer::new(1, "Customer 42");
    customers.create(&mut customer).await.unwrap();

    let mut order = Order::new(1, customer.id, 100);
    orders.create(&mut order).await.unwrap();
    assert!(order.id > 0);
    let t0 = order.modified_at.expect("creation assigns the stamp");

    // Two concurrent editors load the same row.
    let mut editor_a = orders.get(order.id, 1).await.unwrap().unwrap();
    let mut editor_b = editor_a.clone();

    // Editor A wins and advances the stamp to T1 > T0.
    editor_a.amount = 120;
    orders.save(&mut editor_a).await.unwrap();
    let t1 = editor_a.modified_at.unwrap();
    assert!(millis_of(t1) > millis_of(t0));

    // Editor B still holds T0; its save must report a conflict, not a save
    // failure and not a missing row.
    editor_b.amount = 80;
    match orders.save(&mut editor_b).await {
        Err(StoreError::ConcurrentModify { .. }) => {}
        other => panic!("expected ConcurrentModify, got {other:?}"),
    }

    // Editor B reloads and retries; now it succeeds with a stamp past T1.
    let mut reloaded = orders.get(order.id, 1).await.unwrap().unwrap();
    assert_eq!(reloaded.amount, 120);
    reloaded.amount = 80;
    orders.save(&mut reloaded).await.unwrap();
    assert!(millis_of(reloaded.modified_at.unwrap()) > millis_of(t1));
}
