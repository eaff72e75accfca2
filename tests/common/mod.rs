//! Shared fixtures for integration tests: a temp-file SQLite data source and
//! a small customers/orders stack with real DDL, mappings, and a
//! child-cleanup hook.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relstore::db::{row_i64, row_opt_i64};
use relstore::records::datetime_of_millis;
use relstore::{
    ConnectionLease, ConnectionSource, DataSourceConfig, Dialect, DialectKind, PersistenceContext,
    Persisted, RecordMapping, SchemaDefinition, SchemaRegistry, SqlValue, StoreError, StoreResult,
    TransactionCoordinator, UNASSIGNED_ID,
};
use relstore::db::ValueRow;
use std::sync::Arc;
use tempfile::NamedTempFile;

pub const DATA_SOURCE: &str = "orders";

/// Opt-in log output while debugging a test run: RELSTORE_TEST_LOG=1.
pub fn init_test_logging() {
    if std::env::var_os("RELSTORE_TEST_LOG").is_some() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("relstore=debug")
            .try_init();
    }
}

/// Path of a fresh temp database file, kept alive for the test's duration.
pub fn temp_db_path() -> String {
    NamedTempFile::new()
        .unwrap()
        .into_temp_path()
        .keep()
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

/// Build a context over an existing database file, with optional URL options
/// and a caller-supplied coordinator.
pub async fn context_at(
    path: &str,
    options: &str,
    coordinator: TransactionCoordinator,
) -> Arc<PersistenceContext> {
    let url = format!("sqlite:{path}{options}");
    let config = DataSourceConfig::parse(DATA_SOURCE, &url).unwrap();
    let source = ConnectionSource::new();
    source.register(config).await.unwrap();
    Arc::new(PersistenceContext::for_kind(
        source,
        coordinator,
        DialectKind::Sqlite,
    ))
}

/// Fresh default context over a fresh temp database.
pub async fn sqlite_context() -> Arc<PersistenceContext> {
    init_test_logging();
    context_at(&temp_db_path(), "", TransactionCoordinator::new()).await
}

/// Register and initialize the customers/orders schemas.
pub async fn init_schemas(context: &Arc<PersistenceContext>) -> SchemaRegistry {
    let registry = SchemaRegistry::new(Arc::clone(context));
    registry.add(Arc::new(OrderSchema)).unwrap();
    registry.add(Arc::new(CustomerSchema)).unwrap();

    let mut lease = context
        .source()
        .acquire_transactional(DATA_SOURCE)
        .await
        .unwrap();
    registry.init(&mut lease, "startup").await.unwrap();
    context.source().release(lease).await;
    registry
}

// =============================================================================
// Customers
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Customer {
    pub id: i64,
    pub partition_id: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub name: String,
}

impl Customer {
    pub fn new(partition_id: i64, name: impl Into<String>) -> Self {
        Self {
            id: UNASSIGNED_ID,
            partition_id,
            created_at: None,
            modified_at: None,
            name: name.into(),
        }
    }
}

impl Persisted for Customer {
    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn partition_id(&self) -> i64 {
        self.partition_id
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.created_at = Some(at);
    }

    fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.modified_at
    }

    fn set_modified_at(&mut self, at: DateTime<Utc>) {
        self.modified_at = Some(at);
    }
}

pub struct CustomerMapping;

impl RecordMapping for CustomerMapping {
    type Record = Customer;

    fn capability(&self) -> &str {
        "CustomerFactory"
    }

    fn view_name(&self) -> &str {
        "customers"
    }

    fn entity_name(&self) -> &str {
        "Customer"
    }

    fn table(&self) -> &str {
        "customers"
    }

    fn columns(&self) -> Vec<String> {
        vec!["name".to_string()]
    }

    fn values(&self, record: &Customer) -> Vec<SqlValue> {
        vec![SqlValue::Text(record.name.clone())]
    }

    fn hydrate(&self, row: &ValueRow) -> StoreResult<Customer> {
        Ok(Customer {
            id: row_i64(row, "id")?,
            partition_id: row_i64(row, "partition_id")?,
            created_at: row_opt_i64(row, "created_at").map(datetime_of_millis),
            modified_at: row_opt_i64(row, "modified_at").map(datetime_of_millis),
            name: relstore::db::row_text(row, "name")?,
        })
    }
}

/// Customers own their orders: deleting a customer removes its order rows
/// first, since the embedded engine is not configured for cascading delete.
pub struct CustomerSchema;

#[async_trait]
impl SchemaDefinition for CustomerSchema {
    fn name(&self) -> &str {
        "CUSTOMERS"
    }

    fn version(&self) -> u32 {
        1
    }

    fn partitioned(&self) -> bool {
        true
    }

    fn tables(&self) -> Vec<String> {
        vec!["customers".to_string()]
    }

    async fn create(
        &self,
        lease: &mut ConnectionLease,
        _dialect: &dyn Dialect,
        _user: &str,
    ) -> StoreResult<()> {
        lease
            .execute_raw(
                "CREATE TABLE customers (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 partition_id BIGINT NOT NULL, \
                 created_at BIGINT NOT NULL, \
                 modified_at BIGINT NOT NULL, \
                 name TEXT NOT NULL)",
            )
            .await?;
        Ok(())
    }

    async fn upgrade(
        &self,
        _lease: &mut ConnectionLease,
        _dialect: &dyn Dialect,
        _user: &str,
        from_version: u32,
    ) -> StoreResult<()> {
        Err(StoreError::configuration(format!(
            "No upgrade path from version {from_version}"
        )))
    }

    async fn delete_related_data(
        &self,
        lease: &mut ConnectionLease,
        id: i64,
        partition: i64,
    ) -> StoreResult<()> {
        let conn = lease.sqlite()?;
        sqlx::query("DELETE FROM orders WHERE customer_id = ?1 AND partition_id = ?2")
            .bind(id)
            .bind(partition)
            .execute(&mut *conn)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: i64,
    pub partition_id: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub customer_id: i64,
    pub amount: i64,
}

impl Order {
    pub fn new(partition_id: i64, customer_id: i64, amount: i64) -> Self {
        Self {
            id: UNASSIGNED_ID,
            partition_id,
            created_at: None,
            modified_at: None,
            customer_id,
            amount,
        }
    }
}

impl Persisted for Order {
    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn partition_id(&self) -> i64 {
        self.partition_id
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.created_at = Some(at);
    }

    fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.modified_at
    }

    fn set_modified_at(&mut self, at: DateTime<Utc>) {
        self.modified_at = Some(at);
    }
}

pub struct OrderMapping;

impl RecordMapping for OrderMapping {
    type Record = Order;

    fn capability(&self) -> &str {
        "OrderFactory"
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
        vec!["customer_id".to_string(), "amount".to_string()]
    }

    fn values(&self, record: &Order) -> Vec<SqlValue> {
        vec![
            SqlValue::Int(record.customer_id),
            SqlValue::Int(record.amount),
        ]
    }

    fn hydrate(&self, row: &ValueRow) -> StoreResult<Order> {
        Ok(Order {
            id: row_i64(row, "id")?,
            partition_id: row_i64(row, "partition_id")?,
            created_at: row_opt_i64(row, "created_at").map(datetime_of_millis),
            modified_at: row_opt_i64(row, "modified_at").map(datetime_of_millis),
            customer_id: row_i64(row, "customer_id")?,
            amount: row_i64(row, "amount")?,
        })
    }
}

pub struct OrderSchema;

#[async_trait]
impl SchemaDefinition for OrderSchema {
    fn name(&self) -> &str {
        "ORDERS"
    }

    fn version(&self) -> u32 {
        1
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["CUSTOMERS".to_string()]
    }

    fn partitioned(&self) -> bool {
        true
    }

    fn tables(&self) -> Vec<String> {
        vec!["orders".to_string()]
    }

    async fn create(
        &self,
        lease: &mut ConnectionLease,
        _dialect: &dyn Dialect,
        _user: &str,
    ) -> StoreResult<()> {
        lease
            .execute_raw(
                "CREATE TABLE orders (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 partition_id BIGINT NOT NULL, \
                 created_at BIGINT NOT NULL, \
                 modified_at BIGINT NOT NULL, \
                 customer_id BIGINT NOT NULL REFERENCES customers(id), \
                 amount BIGINT NOT NULL)",
            )
            .await?;
        Ok(())
    }

    async fn upgrade(
        &self,
        _lease: &mut ConnectionLease,
        _dialect: &dyn Dialect,
        _user: &str,
        from_version: u32,
    ) -> StoreResult<()> {
        Err(StoreError::configuration(format!(
            "No upgrade path from version {from_version}"
        )))
    }
}

/// Version 2 of the orders schema: adds a note column via one upgrade step.
pub struct OrderSchemaV2;

#[async_trait]
impl SchemaDefinition for OrderSchemaV2 {
    fn name(&self) -> &str {
        "ORDERS"
    }

    fn version(&self) -> u32 {
        2
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["CUSTOMERS".to_string()]
    }

    fn partitioned(&self) -> bool {
        true
    }

    fn tables(&self) -> Vec<String> {
        vec!["orders".to_string()]
    }

    async fn create(
        &self,
        lease: &mut ConnectionLease,
        dialect: &dyn Dialect,
        user: &str,
    ) -> StoreResult<()> {
        OrderSchema.create(lease, dialect, user).await?;
        lease
            .execute_raw("ALTER TABLE orders ADD COLUMN note TEXT")
            .await?;
        Ok(())
    }

    async fn upgrade(
        &self,
        lease: &mut ConnectionLease,
        _dialect: &dyn Dialect,
        _user: &str,
        from_version: u32,
    ) -> StoreResult<()> {
        match from_version {
            1 => {
                lease
                    .execute_raw("ALTER TABLE orders ADD COLUMN note TEXT")
                    .await?;
                Ok(())
            }
            other => Err(StoreError::configuration(format!(
                "No upgrade path from version {other}"
            ))),
        }
    }
}
