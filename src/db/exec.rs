//! Statement execution against a borrowed lease.
//!
//! Everything above this module works with [`SqlCommand`] (SQL text plus
//! backend-agnostic parameters); the per-backend binding and row decoding
//! happen here, once.

use crate::db::params::{
    SqlValue, bind_mysql_value, bind_postgres_value, bind_sqlite_value,
};
use crate::db::rows::{RowValues, ValueRow};
use crate::db::source::ConnectionLease;
use crate::db::dialect::DialectKind;
use crate::error::StoreResult;
use futures_util::TryStreamExt;
use tracing::debug;

/// A statement with its parameters, ready for any backend.
#[derive(Debug, Clone)]
pub struct SqlCommand {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SqlCommand {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    pub fn push(&mut self, value: SqlValue) {
        self.params.push(value);
    }
}

/// Result of executing a write statement.
#[derive(Debug, Clone, Copy)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    /// Store-generated key, where the backend reports one (MySQL, SQLite).
    pub last_insert_id: Option<i64>,
}

/// Execute a write statement and report affected rows plus any generated key.
pub(crate) async fn execute_command(
    lease: &mut ConnectionLease,
    command: &SqlCommand,
) -> StoreResult<ExecOutcome> {
    debug!(sql = %command.sql, params = command.params.len(), "Executing statement");
    match lease.kind() {
        DialectKind::MySql => {
            let conn = lease.mysql()?;
            let mut query = sqlx::query(&command.sql);
            for value in &command.params {
                query = bind_mysql_value(query, value);
            }
            let result = query.execute(&mut *conn).await?;
            let id = result.last_insert_id();
            Ok(ExecOutcome {
                rows_affected: result.rows_affected(),
                last_insert_id: if id == 0 { None } else { Some(id as i64) },
            })
        }
        DialectKind::Postgres => {
            let conn = lease.postgres()?;
            let mut query = sqlx::query(&command.sql);
            for value in &command.params {
                query = bind_postgres_value(query, value);
            }
            let result = query.execute(&mut *conn).await?;
            Ok(ExecOutcome {
                rows_affected: result.rows_affected(),
                last_insert_id: None,
            })
        }
        DialectKind::Sqlite => {
            let conn = lease.sqlite()?;
            let mut query = sqlx::query(&command.sql);
            for value in &command.params {
                query = bind_sqlite_value(query, value);
            }
            let result = query.execute(&mut *conn).await?;
            let id = result.last_insert_rowid();
            Ok(ExecOutcome {
                rows_affected: result.rows_affected(),
                last_insert_id: if id == 0 { None } else { Some(id) },
            })
        }
    }
}

/// Fetch at most one row as a decoded value map.
pub(crate) async fn fetch_optional(
    lease: &mut ConnectionLease,
    command: &SqlCommand,
) -> StoreResult<Option<ValueRow>> {
    match lease.kind() {
        DialectKind::MySql => {
            let conn = lease.mysql()?;
            let mut query = sqlx::query(&command.sql);
            for value in &command.params {
                query = bind_mysql_value(query, value);
            }
            Ok(query
                .fetch_optional(&mut *conn)
                .await?
                .map(|row| row.to_value_row()))
        }
        DialectKind::Postgres => {
            let conn = lease.postgres()?;
            let mut query = sqlx::query(&command.sql);
            for value in &command.params {
                query = bind_postgres_value(query, value);
            }
            Ok(query
                .fetch_optional(&mut *conn)
                .await?
                .map(|row| row.to_value_row()))
        }
        DialectKind::Sqlite => {
            let conn = lease.sqlite()?;
            let mut query = sqlx::query(&command.sql);
            for value in &command.params {
                query = bind_sqlite_value(query, value);
            }
            Ok(query
                .fetch_optional(&mut *conn)
                .await?
                .map(|row| row.to_value_row()))
        }
    }
}

/// Fetch every matching row as decoded value maps.
pub(crate) async fn fetch_all(
    lease: &mut ConnectionLease,
    command: &SqlCommand,
) -> StoreResult<Vec<ValueRow>> {
    match lease.kind() {
        DialectKind::MySql => {
            let conn = lease.mysql()?;
            let mut query = sqlx::query(&command.sql);
            for value in &command.params {
                query = bind_mysql_value(query, value);
            }
            let rows: Vec<sqlx::mysql::MySqlRow> =
                query.fetch(&mut *conn).try_collect().await?;
            Ok(rows.iter().map(|row| row.to_value_row()).collect())
        }
        DialectKind::Postgres => {
            let conn = lease.postgres()?;
            let mut query = sqlx::query(&command.sql);
            for value in &command.params {
                query = bind_postgres_value(query, value);
            }
            let rows: Vec<sqlx::postgres::PgRow> =
                query.fetch(&mut *conn).try_collect().await?;
            Ok(rows.iter().map(|row| row.to_value_row()).collect())
        }
        DialectKind::Sqlite => {
            let conn = lease.sqlite()?;
            let mut query = sqlx::query(&command.sql);
            for value in &command.params {
                query = bind_sqlite_value(query, value);
            }
            let rows: Vec<sqlx::sqlite::SqliteRow> =
                query.fetch(&mut *conn).try_collect().await?;
            Ok(rows.iter().map(|row| row.to_value_row()).collect())
        }
    }
}
