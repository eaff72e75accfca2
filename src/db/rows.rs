//! Backend-agnostic row decoding.
//!
//! Record factories hydrate entities from a plain column-name → [`SqlValue`]
//! map so mappings never see a backend-specific row type. Decoding is driven
//! by the column's declared type: integers first (ids and epoch-millisecond
//! stamps are the hot path), then floats, booleans, binary, and text.

use crate::db::params::SqlValue;
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo};
use std::collections::HashMap;

/// Decoded row: column name to value.
pub type ValueRow = HashMap<String, SqlValue>;

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeCategory {
    Integer,
    Float,
    Boolean,
    Binary,
    Text,
}

fn categorize(type_name: &str) -> TypeCategory {
    let lower = type_name.to_ascii_lowercase();
    if lower.contains("int") || lower.contains("serial") {
        return TypeCategory::Integer;
    }
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("float")
        || lower.contains("double")
        || lower.contains("numeric")
        || lower.contains("decimal")
        || lower == "real"
    {
        return TypeCategory::Float;
    }
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }
    TypeCategory::Text
}

/// Trait for converting database rows to value maps.
pub trait RowValues {
    fn to_value_row(&self) -> ValueRow;
}

impl RowValues for SqliteRow {
    fn to_value_row(&self) -> ValueRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize(col.type_info().name());
                (col.name().to_string(), sqlite_decode(self, idx, category))
            })
            .collect()
    }
}

impl RowValues for PgRow {
    fn to_value_row(&self) -> ValueRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize(col.type_info().name());
                (col.name().to_string(), pg_decode(self, idx, category))
            })
            .collect()
    }
}

impl RowValues for MySqlRow {
    fn to_value_row(&self) -> ValueRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize(col.type_info().name());
                (col.name().to_string(), mysql_decode(self, idx, category))
            })
            .collect()
    }
}

fn sqlite_decode(row: &SqliteRow, idx: usize, category: TypeCategory) -> SqlValue {
    match category {
        TypeCategory::Integer => match row.try_get::<Option<i64>, _>(idx) {
            Ok(Some(v)) => SqlValue::Int(v),
            _ => SqlValue::Null,
        },
        TypeCategory::Boolean => match row.try_get::<Option<bool>, _>(idx) {
            Ok(Some(v)) => SqlValue::Bool(v),
            _ => SqlValue::Null,
        },
        TypeCategory::Float => match row.try_get::<Option<f64>, _>(idx) {
            Ok(Some(v)) => SqlValue::Float(v),
            _ => SqlValue::Null,
        },
        TypeCategory::Binary => match row.try_get::<Option<Vec<u8>>, _>(idx) {
            Ok(Some(v)) => SqlValue::Bytes(v),
            _ => SqlValue::Null,
        },
        TypeCategory::Text => match row.try_get::<Option<String>, _>(idx) {
            Ok(Some(v)) => SqlValue::Text(v),
            _ => SqlValue::Null,
        },
    }
}

fn pg_decode(row: &PgRow, idx: usize, category: TypeCategory) -> SqlValue {
    match category {
        TypeCategory::Integer => {
            // INT2/INT4/INT8 decode as their own widths.
            if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
                return SqlValue::Int(v);
            }
            if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
                return SqlValue::Int(v as i64);
            }
            if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
                return SqlValue::Int(v as i64);
            }
            SqlValue::Null
        }
        TypeCategory::Boolean => match row.try_get::<Option<bool>, _>(idx) {
            Ok(Some(v)) => SqlValue::Bool(v),
            _ => SqlValue::Null,
        },
        TypeCategory::Float => {
            if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
                return SqlValue::Float(v);
            }
            if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
                return SqlValue::Float(v as f64);
            }
            SqlValue::Null
        }
        TypeCategory::Binary => match row.try_get::<Option<Vec<u8>>, _>(idx) {
            Ok(Some(v)) => SqlValue::Bytes(v),
            _ => SqlValue::Null,
        },
        TypeCategory::Text => match row.try_get::<Option<String>, _>(idx) {
            Ok(Some(v)) => SqlValue::Text(v),
            _ => SqlValue::Null,
        },
    }
}

fn mysql_decode(row: &MySqlRow, idx: usize, category: TypeCategory) -> SqlValue {
    match category {
        TypeCategory::Integer => {
            if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
                return SqlValue::Int(v);
            }
            // BIGINT UNSIGNED on MySQL 8.x
            if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(idx) {
                return SqlValue::Int(v as i64);
            }
            if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
                return SqlValue::Int(v as i64);
            }
            SqlValue::Null
        }
        TypeCategory::Boolean => match row.try_get::<Option<bool>, _>(idx) {
            Ok(Some(v)) => SqlValue::Bool(v),
            _ => SqlValue::Null,
        },
        TypeCategory::Float => {
            if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
                return SqlValue::Float(v);
            }
            if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
                return SqlValue::Float(v as f64);
            }
            SqlValue::Null
        }
        TypeCategory::Binary => match row.try_get::<Option<Vec<u8>>, _>(idx) {
            Ok(Some(v)) => SqlValue::Bytes(v),
            _ => SqlValue::Null,
        },
        TypeCategory::Text => {
            // MySQL may return VARBINARY instead of VARCHAR depending on
            // charset configuration.
            if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
                return SqlValue::Text(v);
            }
            if let Ok(Some(bytes)) = row.try_get::<Option<Vec<u8>>, _>(idx) {
                if let Ok(s) = String::from_utf8(bytes) {
                    return SqlValue::Text(s);
                }
            }
            SqlValue::Null
        }
    }
}

// =============================================================================
// Typed accessors for decoded rows
// =============================================================================

use crate::error::{StoreError, StoreResult};

fn missing(column: &str) -> StoreError {
    StoreError::configuration(format!("Row is missing required column '{column}'"))
}

/// Read a required integer column.
pub fn row_i64(row: &ValueRow, column: &str) -> StoreResult<i64> {
    match row.get(column) {
        Some(SqlValue::Int(v)) => Ok(*v),
        Some(other) => Err(StoreError::configuration(format!(
            "Column '{column}' holds {other:?}, expected an integer"
        ))),
        None => Err(missing(column)),
    }
}

/// Read an optional integer column; NULL and absent both yield `None`.
pub fn row_opt_i64(row: &ValueRow, column: &str) -> Option<i64> {
    match row.get(column) {
        Some(SqlValue::Int(v)) => Some(*v),
        _ => None,
    }
}

/// Read a required text column.
pub fn row_text(row: &ValueRow, column: &str) -> StoreResult<String> {
    match row.get(column) {
        Some(SqlValue::Text(v)) => Ok(v.clone()),
        Some(other) => Err(StoreError::configuration(format!(
            "Column '{column}' holds {other:?}, expected text"
        ))),
        None => Err(missing(column)),
    }
}

/// Read an optional text column.
pub fn row_opt_text(row: &ValueRow, column: &str) -> Option<String> {
    match row.get(column) {
        Some(SqlValue::Text(v)) => Some(v.clone()),
        _ => None,
    }
}

/// Read a required float column. Integer-typed values widen.
pub fn row_f64(row: &ValueRow, column: &str) -> StoreResult<f64> {
    match row.get(column) {
        Some(SqlValue::Float(v)) => Ok(*v),
        Some(SqlValue::Int(v)) => Ok(*v as f64),
        Some(other) => Err(StoreError::configuration(format!(
            "Column '{column}' holds {other:?}, expected a float"
        ))),
        None => Err(missing(column)),
    }
}

/// Read a required boolean column. Integer 0/1 is accepted for engines that
/// store booleans as integers.
pub fn row_bool(row: &ValueRow, column: &str) -> StoreResult<bool> {
    match row.get(column) {
        Some(SqlValue::Bool(v)) => Ok(*v),
        Some(SqlValue::Int(v)) => Ok(*v != 0),
        Some(other) => Err(StoreError::configuration(format!(
            "Column '{column}' holds {other:?}, expected a boolean"
        ))),
        None => Err(missing(column)),
    }
}
