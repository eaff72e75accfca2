//! relstore: dialect-agnostic relational persistence layer.
//!
//! Application code performs CRUD against relational stores without depending
//! on the specific DBMS's SQL dialect, key-generation strategy, or transaction
//! API. The crate covers connection sourcing and pooling, implicit/ambient
//! transaction reconciliation, per-vendor dialect strategies for generated
//! values, dependency-ordered schema versioning, optimistic concurrency, and
//! a resolve-and-cache manager layer.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod manager;
pub mod records;
pub mod schema;

pub use config::{DataSourceConfig, IsolationLevel, PoolSettings, PropertySource};
pub use context::PersistenceContext;
pub use db::{
    AmbientHandle, AmbientTransactions, ConnectionLease, ConnectionSource, Dialect, DialectKind,
    MaintenancePlan, SqlCommand, SqlValue, TransactionCoordinator, UpdateConflictCheck,
    dialect_for,
};
pub use error::{StoreError, StoreResult};
pub use manager::{FactoryConstructor, ManagerCache, SchemaConstructor};
pub use records::{
    GenericRecordFactory, Persisted, RecordFactory, RecordMapping, UNASSIGNED_ID,
};
pub use schema::{
    InitSummary, SchemaDefinition, SchemaRegistry, SchemaVersionRow, StampConflictCheck,
    UpgradeStep,
};
