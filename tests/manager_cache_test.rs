//! Integration tests for the resolve-and-cache manager layer.

mod common;

use common::*;
use relstore::{
    DialectKind, GenericRecordFactory, ManagerCache, RecordFactory, SchemaRegistry, StoreError,
};
use std::sync::Arc;

fn cache_with_order_factory(context: &Arc<relstore::PersistenceContext>) -> ManagerCache {
    let cache = ManagerCache::new(Arc::clone(context));
    cache.register_factory(
        "OrderFactory",
        DialectKind::Sqlite,
        Arc::new(|ctx| {
            Ok(Arc::new(GenericRecordFactory::new(ctx, DATA_SOURCE, OrderMapping))
                as Arc<dyn RecordFactory>)
        }),
    );
    cache
}

#[tokio::test]
async fn test_concurrent_resolution_yields_one_instance() {
    let context = sqlite_context().await;
    let cache = Arc::new(cache_with_order_factory(&context));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        handles.push(tokio::spawn(async move {
            cache.resolve_factory("OrderFactory").unwrap()
        }));
    }

    let mut resolved = Vec::new();
    for handle in handles {
        resolved.push(handle.await.unwrap());
    }
    let first = &resolved[0];
    assert!(resolved.iter().all(|f| Arc::ptr_eq(first, f)));
}

#[tokio::test]
async fn test_view_lookup_shares_the_capability_instance() {
    let context = sqlite_context().await;
    let cache = cache_with_order_factory(&context);

    let by_capability = cache.resolve_factory("OrderFactory").unwrap();
    let by_view = cache.factory_for_view("orders").unwrap();
    assert!(Arc::ptr_eq(&by_capability, &by_view));
    assert_eq!(by_view.view_name(), "orders");
}

#[tokio::test]
async fn test_second_implementation_under_same_view_fails() {
    let context = sqlite_context().await;
    let cache = cache_with_order_factory(&context);

    // A different concrete type claiming the "orders" view.
    struct AltOrderMapping;

    impl relstore::RecordMapping for AltOrderMapping {
        type Record = Order;

        fn capability(&self) -> &str {
            "AltOrderFactory"
        }

        fn view_name(&self) -> &str {
            "orders"
        }

        fn entity_name(&self) -> &str {
            "Order"
        }

        fn table(&self) -> &str {
            "orders"
        }

        fn columns(&self) -> Vec<String> {
            OrderMapping.columns()
        }

        fn values(&self, record: &Order) -> Vec<relstore::SqlValue> {
            OrderMapping.values(record)
        }

        fn hydrate(&self, row: &relstore::db::ValueRow) -> relstore::StoreResult<Order> {
            OrderMapping.hydrate(row)
        }
    }

    cache.register_factory(
        "AltOrderFactory",
        DialectKind::Sqlite,
        Arc::new(|ctx| {
            Ok(
                Arc::new(GenericRecordFactory::new(ctx, DATA_SOURCE, AltOrderMapping))
                    as Arc<dyn RecordFactory>,
            )
        }),
    );

    cache.resolve_factory("OrderFactory").unwrap();
    let conflict = cache.resolve_factory("AltOrderFactory");
    assert!(matches!(conflict, Err(StoreError::Configuration { .. })));
}

#[tokio::test]
async fn test_typed_resolution_drives_crud_end_to_end() {
    let context = sqlite_context().await;
    init_schemas(&context).await;
    let cache = cache_with_order_factory(&context);

    let factory: Arc<GenericRecordFactory<OrderMapping>> =
        cache.resolve_factory_as("OrderFactory").unwrap();

    let mut order = Order::new(1, 42, 100);
    factory.create(&mut order).await.unwrap();
    let loaded = factory.get(order.id, 1).await.unwrap().unwrap();
    assert_eq!(loaded.amount, 100);
}

#[tokio::test]
async fn test_schema_resolution_feeds_registry() {
    let context = sqlite_context().await;
    let cache = ManagerCache::new(Arc::clone(&context));
    cache.register_schema(
        "CustomerSchema",
        DialectKind::Sqlite,
        Arc::new(|_| Ok(Arc::new(CustomerSchema) as Arc<dyn relstore::SchemaDefinition>)),
    );
    cache.register_schema(
        "OrderSchema",
        DialectKind::Sqlite,
        Arc::new(|_| Ok(Arc::new(OrderSchema) as Arc<dyn relstore::SchemaDefinition>)),
    );

    let registry = SchemaRegistry::new(Arc::clone(&context));
    for schema in cache.resolve_registered_schemas().unwrap() {
        registry.add(schema).unwrap();
    }

    let mut lease = context
        .source()
        .acquire_transactional(DATA_SOURCE)
        .await
        .unwrap();
    let summary = registry.init(&mut lease, "startup").await.unwrap();
    context.source().release(lease).await;
    assert_eq!(summary.created.len(), 2);

    // Cached: a second resolution returns the same instance.
    let first = cache.resolve_schema("OrderSchema").unwrap();
    let second = cache.resolve_schema("OrderSchema").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}
