//! Database abstraction layer.
//!
//! This module provides the vendor-facing half of the persistence core:
//! - Connection sourcing and pooling per named data source
//! - Implicit/ambient transaction reconciliation
//! - Per-vendor dialect strategies for generated keys and stamps
//! - Backend-agnostic parameter binding and row decoding

pub mod coordinator;
pub mod dialect;
pub mod exec;
pub mod params;
pub mod rows;
pub mod source;

pub use coordinator::{AmbientHandle, AmbientTransactions, TransactionCoordinator};
pub use dialect::{
    Dialect, DialectKind, MaintenancePlan, MySqlDialect, PostgresDialect, SqliteDialect,
    UpdateConflictCheck, dialect_for,
};
pub use exec::{ExecOutcome, SqlCommand};
pub use params::SqlValue;
pub use rows::{RowValues, ValueRow, row_bool, row_f64, row_i64, row_opt_i64, row_opt_text, row_text};
pub use source::{BackendPool, ConnectionLease, ConnectionSource};
