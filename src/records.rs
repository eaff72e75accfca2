//! Persisted records and the generic record factory.
//!
//! Every persisted row carries the same spine: a store-assigned 64-bit id
//! (`-1` until assigned), a partition id scoping visibility to a tenant, a
//! creation stamp set once, and, for updatable records, a modification
//! stamp that strictly increases on every successful save and serves as the
//! optimistic-concurrency token.
//!
//! [`GenericRecordFactory`] implements the whole CRUD contract from a
//! [`RecordMapping`] (table, business columns, value binding, hydration),
//! building vendor-correct statements through the active dialect and routing
//! create/save through its generated-value paths.

use crate::context::PersistenceContext;
use crate::db::dialect::UpdateConflictCheck;
use crate::db::exec::SqlCommand;
use crate::db::params::SqlValue;
use crate::db::rows::ValueRow;
use crate::db::source::ConnectionLease;
use crate::error::{StoreError, StoreResult};
use crate::schema::{SchemaDefinition, StampConflictCheck};
use chrono::{DateTime, Utc};
use std::any::Any;
use std::sync::Arc;
use tracing::debug;

/// Sentinel id of a record that has not been stored yet.
pub const UNASSIGNED_ID: i64 = -1;

/// Canonical column names shared by every managed table.
pub const ID_COLUMN: &str = "id";
pub const PARTITION_COLUMN: &str = "partition_id";
pub const CREATED_COLUMN: &str = "created_at";
pub const MODIFIED_COLUMN: &str = "modified_at";

/// Current time as epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Epoch milliseconds of a timestamp.
pub fn millis_of(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Timestamp from epoch milliseconds.
pub fn datetime_of_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Next modification stamp: strictly greater than the previous one even when
/// the clock has not advanced a full millisecond.
pub fn next_stamp(previous_ms: i64) -> i64 {
    now_millis().max(previous_ms + 1)
}

/// The contract every persisted entity fulfils.
pub trait Persisted: Send + Sync {
    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);
    fn partition_id(&self) -> i64;
    fn created_at(&self) -> Option<DateTime<Utc>>;
    fn set_created_at(&mut self, at: DateTime<Utc>);
    fn modified_at(&self) -> Option<DateTime<Utc>>;
    fn set_modified_at(&mut self, at: DateTime<Utc>);

    /// Whether this entity type supports updates (and therefore carries a
    /// modification stamp).
    fn supports_update(&self) -> bool {
        true
    }
}

/// Mapping between an entity type and its table.
pub trait RecordMapping: Send + Sync + 'static {
    type Record: Persisted + Send;

    /// Name of the abstract factory interface this mapping serves.
    fn capability(&self) -> &str;

    /// Logical view name; several views may share one physical factory.
    fn view_name(&self) -> &str;

    /// Entity name used in error context.
    fn entity_name(&self) -> &str;

    fn table(&self) -> &str;

    /// Whether managed rows carry the partition column.
    fn partitioned(&self) -> bool {
        true
    }

    /// Whether records of this type can be saved after creation.
    fn updatable(&self) -> bool {
        true
    }

    /// Business column names, in binding order.
    fn columns(&self) -> Vec<String>;

    /// Business values for a record, in the same order as [`columns`](Self::columns).
    fn values(&self, record: &Self::Record) -> Vec<SqlValue>;

    /// Build a record from a decoded row (spine columns included).
    fn hydrate(&self, row: &ValueRow) -> StoreResult<Self::Record>;
}

/// Type-erased surface the manager cache stores factories under.
pub trait RecordFactory: Send + Sync + 'static {
    /// The abstract factory interface this instance implements.
    fn capability(&self) -> &str;

    /// The view this instance is published under.
    fn view_name(&self) -> &str;

    /// Concrete implementation type, for view-consistency checks.
    fn implementation_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    /// Shared-ownership downcast support for typed cache lookups.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// SQL-backed record factory driven by a [`RecordMapping`].
pub struct GenericRecordFactory<M: RecordMapping> {
    context: Arc<PersistenceContext>,
    data_source: String,
    mapping: M,
    schema: Option<Arc<dyn SchemaDefinition>>,
    conflict_check: Box<dyn UpdateConflictCheck>,
}

impl<M: RecordMapping> RecordFactory for GenericRecordFactory<M> {
    fn capability(&self) -> &str {
        self.mapping.capability()
    }

    fn view_name(&self) -> &str {
        self.mapping.view_name()
    }

    fn implementation_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<M: RecordMapping> GenericRecordFactory<M> {
    pub fn new(
        context: Arc<PersistenceContext>,
        data_source: impl Into<String>,
        mapping: M,
    ) -> Self {
        let conflict_check = Box::new(StampConflictCheck::new(
            mapping.table(),
            mapping.entity_name(),
            mapping.partitioned(),
        ));
        Self {
            context,
            data_source: data_source.into(),
            mapping,
            schema: None,
            conflict_check,
        }
    }

    /// Attach the owning schema so deletes can clean up dependent child rows
    /// first, for vendors without cascading delete.
    pub fn with_schema(mut self, schema: Arc<dyn SchemaDefinition>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Replace the zero-row-update diagnoser.
    pub fn with_conflict_check(mut self, check: Box<dyn UpdateConflictCheck>) -> Self {
        self.conflict_check = check;
        self
    }

    pub fn mapping(&self) -> &M {
        &self.mapping
    }

    /// Look up one record by id within a partition. Returns `None` when no
    /// row matches; absence is not an error here.
    pub async fn get(&self, id: i64, partition: i64) -> StoreResult<Option<M::Record>> {
        let mut lease = self.context.source().acquire(&self.data_source).await?;
        let result = self.get_with(&mut lease, id, partition).await;
        self.context.source().release(lease).await;
        result
    }

    /// List every record in a partition, ordered by id.
    pub async fn list(&self, partition: i64) -> StoreResult<Vec<M::Record>> {
        let mut lease = self.context.source().acquire(&self.data_source).await?;
        let result = self.list_with(&mut lease, partition).await;
        self.context.source().release(lease).await;
        result
    }

    /// Store a new record. The store assigns the id and stamps; both are
    /// written back onto the record.
    pub async fn create(&self, record: &mut M::Record) -> StoreResult<()> {
        let mut lease = self
            .context
            .source()
            .acquire_transactional(&self.data_source)
            .await?;
        let result = self.create_with(&mut lease, record).await;
        let result = self.finish_unit_of_work(&mut lease, result).await;
        self.context.source().release(lease).await;
        result
    }

    /// Store a batch of new records in one unit of work. Any failure rolls
    /// the whole batch back.
    pub async fn create_batch(&self, records: &mut [M::Record]) -> StoreResult<usize> {
        let mut lease = self
            .context
            .source()
            .acquire_transactional(&self.data_source)
            .await?;

        let mut stored = 0usize;
        let mut outcome: StoreResult<()> = Ok(());
        for record in records.iter_mut() {
            match self.create_with(&mut lease, record).await {
                Ok(()) => stored += 1,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        let outcome = self.finish_unit_of_work(&mut lease, outcome).await;
        self.context.source().release(lease).await;
        outcome.map(|()| stored)
    }

    /// Save a modified record. The stored modification stamp must still match
    /// the record's; a stale stamp surfaces as
    /// [`StoreError::ConcurrentModify`], distinguishable from a deleted row.
    pub async fn save(&self, record: &mut M::Record) -> StoreResult<()> {
        let mut lease = self
            .context
            .source()
            .acquire_transactional(&self.data_source)
            .await?;
        let result = self.save_with(&mut lease, record).await;
        let result = self.finish_unit_of_work(&mut lease, result).await;
        self.context.source().release(lease).await;
        result
    }

    /// Delete a record, removing dependent child rows first when the owning
    /// schema defines a cleanup hook.
    pub async fn delete(&self, id: i64, partition: i64) -> StoreResult<()> {
        let mut lease = self
            .context
            .source()
            .acquire_transactional(&self.data_source)
            .await?;
        let result = self.delete_with(&mut lease, id, partition).await;
        let result = self.finish_unit_of_work(&mut lease, result).await;
        self.context.source().release(lease).await;
        result
    }

    /// Commit on success, roll back on failure. The rollback error, if any,
    /// never masks the original failure.
    async fn finish_unit_of_work(
        &self,
        lease: &mut ConnectionLease,
        result: StoreResult<()>,
    ) -> StoreResult<()> {
        match result {
            Ok(()) => self.context.coordinator().commit_implicit(lease).await,
            Err(e) => {
                if let Err(rollback_err) =
                    self.context.coordinator().rollback_implicit(lease).await
                {
                    debug!(error = %rollback_err, "Rollback after failed operation also failed");
                }
                Err(e)
            }
        }
    }

    async fn get_with(
        &self,
        lease: &mut ConnectionLease,
        id: i64,
        partition: i64,
    ) -> StoreResult<Option<M::Record>> {
        let dialect = self.context.dialect();
        let mut sql = format!(
            "SELECT {} FROM {} WHERE {ID_COLUMN} = {}",
            self.select_columns(),
            self.mapping.table(),
            dialect.placeholder(1),
        );
        let mut params = vec![SqlValue::Int(id)];
        if self.mapping.partitioned() {
            sql.push_str(&format!(
                " AND {PARTITION_COLUMN} = {}",
                dialect.placeholder(2)
            ));
            params.push(SqlValue::Int(partition));
        }

        let row = crate::db::exec::fetch_optional(lease, &SqlCommand::with_params(sql, params))
            .await?;
        match row {
            Some(row) => Ok(Some(self.mapping.hydrate(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_with(
        &self,
        lease: &mut ConnectionLease,
        partition: i64,
    ) -> StoreResult<Vec<M::Record>> {
        let dialect = self.context.dialect();
        let (sql, params) = if self.mapping.partitioned() {
            (
                format!(
                    "SELECT {} FROM {} WHERE {PARTITION_COLUMN} = {} ORDER BY {ID_COLUMN}",
                    self.select_columns(),
                    self.mapping.table(),
                    dialect.placeholder(1),
                ),
                vec![SqlValue::Int(partition)],
            )
        } else {
            (
                format!(
                    "SELECT {} FROM {} ORDER BY {ID_COLUMN}",
                    self.select_columns(),
                    self.mapping.table(),
                ),
                Vec::new(),
            )
        };

        let rows =
            crate::db::exec::fetch_all(lease, &SqlCommand::with_params(sql, params)).await?;
        rows.iter().map(|row| self.mapping.hydrate(row)).collect()
    }

    async fn create_with(
        &self,
        lease: &mut ConnectionLease,
        record: &mut M::Record,
    ) -> StoreResult<()> {
        let table = self.mapping.table();
        if record.id() != UNASSIGNED_ID {
            return Err(StoreError::create(
                table,
                format!("record already has id {}", record.id()),
            ));
        }

        let dialect = self.context.dialect();
        let now = now_millis();

        let mut columns: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        if self.mapping.partitioned() {
            columns.push(PARTITION_COLUMN.to_string());
            params.push(SqlValue::Int(record.partition_id()));
        }
        columns.push(CREATED_COLUMN.to_string());
        params.push(SqlValue::Int(now));
        if self.mapping.updatable() {
            columns.push(MODIFIED_COLUMN.to_string());
            params.push(SqlValue::Int(now));
        }
        columns.extend(self.mapping.columns());
        params.extend(self.mapping.values(record));

        let placeholders: Vec<String> = (1..=params.len())
            .map(|i| dialect.placeholder(i))
            .collect();
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", "),
        );

        dialect
            .insert_and_fetch_generated(
                lease,
                &SqlCommand::with_params(sql, params),
                self.mapping.partitioned(),
                table,
                record,
            )
            .await?;
        debug!(table = %table, id = record.id(), "Created record");
        Ok(())
    }

    async fn save_with(
        &self,
        lease: &mut ConnectionLease,
        record: &mut M::Record,
    ) -> StoreResult<()> {
        let table = self.mapping.table();
        if !self.mapping.updatable() {
            return Err(StoreError::save(table, "records of this type are immutable"));
        }
        if record.id() == UNASSIGNED_ID {
            return Err(StoreError::save(table, "record has not been created yet"));
        }
        let expected = record.modified_at().ok_or_else(|| {
            StoreError::save(table, "record carries no modification stamp; load it first")
        })?;

        let dialect = self.context.dialect();
        let new_stamp = next_stamp(millis_of(expected));

        let mut assignments: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        let mut index = 0usize;
        for (column, value) in self
            .mapping
            .columns()
            .into_iter()
            .zip(self.mapping.values(record))
        {
            index += 1;
            assignments.push(format!("{column} = {}", dialect.placeholder(index)));
            params.push(value);
        }
        index += 1;
        assignments.push(format!("{MODIFIED_COLUMN} = {}", dialect.placeholder(index)));
        params.push(SqlValue::Int(new_stamp));

        index += 1;
        let mut sql = format!(
            "UPDATE {table} SET {} WHERE {ID_COLUMN} = {}",
            assignments.join(", "),
            dialect.placeholder(index),
        );
        params.push(SqlValue::Int(record.id()));
        if self.mapping.partitioned() {
            index += 1;
            sql.push_str(&format!(
                " AND {PARTITION_COLUMN} = {}",
                dialect.placeholder(index)
            ));
            params.push(SqlValue::Int(record.partition_id()));
        }
        index += 1;
        sql.push_str(&format!(
            " AND {MODIFIED_COLUMN} = {}",
            dialect.placeholder(index)
        ));
        params.push(SqlValue::Int(millis_of(expected)));

        dialect
            .update_and_fetch_generated(
                lease,
                &SqlCommand::with_params(sql, params),
                self.mapping.partitioned(),
                table,
                record,
                self.conflict_check.as_ref(),
            )
            .await?;
        debug!(table = %table, id = record.id(), "Saved record");
        Ok(())
    }

    async fn delete_with(
        &self,
        lease: &mut ConnectionLease,
        id: i64,
        partition: i64,
    ) -> StoreResult<()> {
        let table = self.mapping.table();
        if let Some(schema) = &self.schema {
            schema.delete_related_data(lease, id, partition).await?;
        }

        let dialect = self.context.dialect();
        let mut sql = format!(
            "DELETE FROM {table} WHERE {ID_COLUMN} = {}",
            dialect.placeholder(1)
        );
        let mut params = vec![SqlValue::Int(id)];
        if self.mapping.partitioned() {
            sql.push_str(&format!(
                " AND {PARTITION_COLUMN} = {}",
                dialect.placeholder(2)
            ));
            params.push(SqlValue::Int(partition));
        }

        let outcome =
            crate::db::exec::execute_command(lease, &SqlCommand::with_params(sql, params))
                .await
                .map_err(|e| StoreError::delete(table, e.to_string()))?;
        match outcome.rows_affected {
            0 => Err(StoreError::not_found(
                self.mapping.entity_name(),
                id,
                partition,
            )),
            1 => {
                debug!(table = %table, id = id, "Deleted record");
                Ok(())
            }
            n => Err(StoreError::inconsistent(
                table,
                format!("delete matched {n} rows for id {id} in partition {partition}"),
            )),
        }
    }

    fn select_columns(&self) -> String {
        let mut columns: Vec<String> = vec![ID_COLUMN.to_string()];
        if self.mapping.partitioned() {
            columns.push(PARTITION_COLUMN.to_string());
        }
        columns.push(CREATED_COLUMN.to_string());
        if self.mapping.updatable() {
            columns.push(MODIFIED_COLUMN.to_string());
        }
        columns.extend(self.mapping.columns());
        columns.join(", ")
    }
}
