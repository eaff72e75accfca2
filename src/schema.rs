//! Schema lifecycle and versioning.
//!
//! Each module registers the [`SchemaDefinition`]s for the tables it owns;
//! [`SchemaRegistry::init`] then creates or upgrades them against the live
//! database in dependency order, recording applied versions in a bookkeeping
//! table. A dependency's create/upgrade always completes before its
//! dependents', because a schema's own DDL may reference the dependency's
//! tables through foreign keys or stored logic.
//!
//! Failure mid-upgrade rolls back the whole unit of work and is fatal to
//! startup. There is no partial-upgrade recovery: schema DDL is rarely
//! transactional across all target vendors, so half-applied state must never
//! be recorded as success.

use crate::context::PersistenceContext;
use crate::db::dialect::{Dialect, UpdateConflictCheck, placeholder_for};
use crate::db::exec::{self, SqlCommand};
use crate::db::params::SqlValue;
use crate::db::rows::{row_i64, row_opt_i64, row_text};
use crate::db::source::ConnectionLease;
use crate::error::{StoreError, StoreResult};
use crate::records::{
    ID_COLUMN, MODIFIED_COLUMN, PARTITION_COLUMN, Persisted, millis_of, now_millis,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Default name of the bookkeeping table.
pub const DEFAULT_VERSION_TABLE: &str = "schema_versions";

/// One set of interdependent tables owned by a module.
///
/// Definitions are stateless and reentrant: constructed once per process,
/// registered at startup, never destroyed before shutdown.
#[async_trait]
pub trait SchemaDefinition: Send + Sync {
    /// Unique schema name, the bookkeeping key.
    fn name(&self) -> &str;

    /// Version the code expects; the registry upgrades stored schemas one
    /// step at a time until they reach it.
    fn version(&self) -> u32;

    /// Names of schemas that must be created/upgraded strictly before this
    /// one.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether managed tables carry the partition column.
    fn partitioned(&self) -> bool {
        false
    }

    /// Tables owned by this schema, for maintenance statements.
    fn tables(&self) -> Vec<String> {
        Vec::new()
    }

    /// Create the schema's tables at the current version.
    async fn create(
        &self,
        lease: &mut ConnectionLease,
        dialect: &dyn Dialect,
        user: &str,
    ) -> StoreResult<()>;

    /// Upgrade from `from_version` to `from_version + 1`. Called once per
    /// version step.
    async fn upgrade(
        &self,
        lease: &mut ConnectionLease,
        dialect: &dyn Dialect,
        user: &str,
        from_version: u32,
    ) -> StoreResult<()>;

    /// Remove dependent child rows before a parent row is deleted, for
    /// vendors without cascading delete.
    async fn delete_related_data(
        &self,
        lease: &mut ConnectionLease,
        id: i64,
        partition: i64,
    ) -> StoreResult<()> {
        let _ = (lease, id, partition);
        Ok(())
    }
}

/// A row of the bookkeeping table.
#[derive(Debug, Clone)]
pub struct SchemaVersionRow {
    pub name: String,
    pub version: u32,
    pub created_at: i64,
    pub modified_at: i64,
}

/// One completed upgrade, for the init summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeStep {
    pub name: String,
    pub from: u32,
    pub to: u32,
}

/// What `init` actually did, so callers (and tests) can verify idempotence.
#[derive(Debug, Clone, Default)]
pub struct InitSummary {
    pub created: Vec<String>,
    pub upgraded: Vec<UpgradeStep>,
}

impl InitSummary {
    /// Number of schemas that required DDL during this pass.
    pub fn ddl_performed(&self) -> usize {
        self.created.len() + self.upgraded.len()
    }
}

/// Dependency-ordered schema creation and upgrade with version bookkeeping.
pub struct SchemaRegistry {
    context: Arc<PersistenceContext>,
    version_table: String,
    schemas: Mutex<Vec<Arc<dyn SchemaDefinition>>>,
    init_lock: tokio::sync::Mutex<()>,
}

impl SchemaRegistry {
    pub fn new(context: Arc<PersistenceContext>) -> Self {
        Self {
            context,
            version_table: DEFAULT_VERSION_TABLE.to_string(),
            schemas: Mutex::new(Vec::new()),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Use a non-default bookkeeping table name.
    pub fn with_version_table(mut self, table: impl Into<String>) -> Self {
        self.version_table = table.into();
        self
    }

    /// Register a schema. Duplicate names are a configuration error.
    pub fn add(&self, schema: Arc<dyn SchemaDefinition>) -> StoreResult<()> {
        let mut schemas = self.schemas.lock().expect("schema registry lock poisoned");
        if schemas.iter().any(|s| s.name() == schema.name()) {
            return Err(StoreError::configuration(format!(
                "Schema '{}' is already registered",
                schema.name()
            )));
        }
        debug!(schema = %schema.name(), version = schema.version(), "Registered schema");
        schemas.push(schema);
        Ok(())
    }

    /// Names of all registered schemas, in registration order.
    pub fn schema_names(&self) -> Vec<String> {
        let schemas = self.schemas.lock().expect("schema registry lock poisoned");
        schemas.iter().map(|s| s.name().to_string()).collect()
    }

    /// Create or upgrade every registered schema, dependencies first.
    ///
    /// Runs under a coarse process-local lock; concurrent callers queue. A
    /// second invocation after a successful pass performs zero DDL. Any
    /// failure rolls back the lease's unit of work and propagates, fatal to
    /// startup by design.
    pub async fn init(&self, lease: &mut ConnectionLease, user: &str) -> StoreResult<InitSummary> {
        let _guard = self.init_lock.lock().await;

        match self.init_inner(lease, user).await {
            Ok(summary) => {
                self.context.coordinator().commit_implicit(lease).await?;
                info!(
                    created = summary.created.len(),
                    upgraded = summary.upgraded.len(),
                    "Schema initialization complete"
                );
                Ok(summary)
            }
            Err(e) => {
                if let Err(rollback_err) =
                    self.context.coordinator().rollback_implicit(lease).await
                {
                    warn!(error = %rollback_err, "Rollback after failed schema init also failed");
                }
                Err(e)
            }
        }
    }

    async fn init_inner(
        &self,
        lease: &mut ConnectionLease,
        user: &str,
    ) -> StoreResult<InitSummary> {
        let dialect = self.context.dialect();

        lease
            .execute_raw(&dialect.version_table_ddl(&self.version_table))
            .await?;

        let stored = self.load_versions(lease).await?;
        let ordered = {
            let schemas = self.schemas.lock().expect("schema registry lock poisoned");
            topological_order(&schemas)?
        };

        let mut summary = InitSummary::default();
        for schema in ordered {
            let name = schema.name().to_string();
            let declared = schema.version();
            match stored.get(&name).map(|row| row.version) {
                None => {
                    info!(schema = %name, version = declared, user = %user, "Creating schema");
                    schema.create(lease, dialect.as_ref(), user).await?;
                    self.insert_version_row(lease, &name, declared).await?;
                    summary.created.push(name);
                }
                Some(stored_version) if stored_version < declared => {
                    for step in stored_version..declared {
                        info!(
                            schema = %name,
                            from = step,
                            to = step + 1,
                            user = %user,
                            "Upgrading schema"
                        );
                        schema.upgrade(lease, dialect.as_ref(), user, step).await?;
                        self.advance_version_row(lease, &name, step + 1).await?;
                    }
                    summary.upgraded.push(UpgradeStep {
                        name,
                        from: stored_version,
                        to: declared,
                    });
                }
                Some(stored_version) if stored_version > declared => {
                    warn!(
                        schema = %name,
                        stored = stored_version,
                        declared = declared,
                        "Stored schema version is newer than the code; leaving it untouched"
                    );
                }
                Some(_) => {
                    debug!(schema = %name, version = declared, "Schema up to date");
                }
            }
        }
        Ok(summary)
    }

    /// Load every bookkeeping row, keyed by schema name.
    pub async fn load_versions(
        &self,
        lease: &mut ConnectionLease,
    ) -> StoreResult<HashMap<String, SchemaVersionRow>> {
        let sql = format!(
            "SELECT name, version, created_at, modified_at FROM {}",
            self.version_table
        );
        let rows = exec::fetch_all(lease, &SqlCommand::new(sql)).await?;

        let mut versions = HashMap::with_capacity(rows.len());
        for row in &rows {
            let name = row_text(row, "name")?;
            let version = row_i64(row, "version")?;
            versions.insert(
                name.clone(),
                SchemaVersionRow {
                    name,
                    version: version.max(0) as u32,
                    created_at: row_i64(row, "created_at")?,
                    modified_at: row_i64(row, "modified_at")?,
                },
            );
        }
        Ok(versions)
    }

    /// Refresh query-planner statistics for every table the registered
    /// schemas own. Commands that must run outside a transaction commit the
    /// lease's pending implicit work first.
    pub async fn run_maintenance(&self, lease: &mut ConnectionLease) -> StoreResult<usize> {
        let tables: Vec<String> = {
            let schemas = self.schemas.lock().expect("schema registry lock poisoned");
            schemas.iter().flat_map(|s| s.tables()).collect()
        };

        let plan = self.context.dialect().maintenance_statements(&tables);
        if plan.requires_autocommit && lease.in_transaction() {
            debug!("Maintenance requires autocommit; committing pending implicit transaction");
            self.context.coordinator().commit_implicit(lease).await?;
        }
        for statement in &plan.statements {
            lease.execute_raw(statement).await?;
        }
        Ok(plan.statements.len())
    }

    async fn insert_version_row(
        &self,
        lease: &mut ConnectionLease,
        name: &str,
        version: u32,
    ) -> StoreResult<()> {
        let dialect = self.context.dialect();
        let now = now_millis();
        let sql = format!(
            "INSERT INTO {} (name, version, created_at, modified_at) VALUES ({}, {}, {}, {})",
            self.version_table,
            dialect.placeholder(1),
            dialect.placeholder(2),
            dialect.placeholder(3),
            dialect.placeholder(4),
        );
        let command = SqlCommand::with_params(
            sql,
            vec![
                SqlValue::Text(name.to_string()),
                SqlValue::Int(version as i64),
                SqlValue::Int(now),
                SqlValue::Int(now),
            ],
        );
        exec::execute_command(lease, &command).await?;
        Ok(())
    }

    async fn advance_version_row(
        &self,
        lease: &mut ConnectionLease,
        name: &str,
        version: u32,
    ) -> StoreResult<()> {
        let dialect = self.context.dialect();
        let sql = format!(
            "UPDATE {} SET version = {}, modified_at = {} WHERE name = {}",
            self.version_table,
            dialect.placeholder(1),
            dialect.placeholder(2),
            dialect.placeholder(3),
        );
        let command = SqlCommand::with_params(
            sql,
            vec![
                SqlValue::Int(version as i64),
                SqlValue::Int(now_millis()),
                SqlValue::Text(name.to_string()),
            ],
        );
        let outcome = exec::execute_command(lease, &command).await?;
        if outcome.rows_affected != 1 {
            return Err(StoreError::inconsistent(
                self.version_table.clone(),
                format!("bookkeeping row for '{name}' vanished during upgrade"),
            ));
        }
        Ok(())
    }
}

/// Order schemas so every dependency precedes its dependents. Rejects cycles
/// and references to unregistered schemas.
fn topological_order(
    schemas: &[Arc<dyn SchemaDefinition>],
) -> StoreResult<Vec<Arc<dyn SchemaDefinition>>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        name: &str,
        index: &HashMap<&str, &Arc<dyn SchemaDefinition>>,
        marks: &mut HashMap<String, Mark>,
        order: &mut Vec<Arc<dyn SchemaDefinition>>,
    ) -> StoreResult<()> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(StoreError::configuration(format!(
                    "Schema dependency cycle involving '{name}'"
                )));
            }
            None => {}
        }

        let schema = *index.get(name).ok_or_else(|| {
            StoreError::configuration(format!(
                "Schema '{name}' is referenced as a dependency but was never registered"
            ))
        })?;

        marks.insert(name.to_string(), Mark::Visiting);
        for dependency in schema.dependencies() {
            visit(&dependency, index, marks, order)?;
        }
        marks.insert(name.to_string(), Mark::Done);
        order.push(Arc::clone(schema));
        Ok(())
    }

    let index: HashMap<&str, &Arc<dyn SchemaDefinition>> =
        schemas.iter().map(|s| (s.name(), s)).collect();
    let mut marks = HashMap::new();
    let mut order = Vec::with_capacity(schemas.len());
    for schema in schemas {
        visit(schema.name(), &index, &mut marks, &mut order)?;
    }
    Ok(order)
}

/// Default zero-row-update diagnosis: re-select the row's current
/// modification stamp and compare.
///
/// A missing row means the record was deleted (or never visible in this
/// partition); a mismatched stamp means another writer won, and the caller
/// can offer "reload and retry" instead of "record deleted".
pub struct StampConflictCheck {
    table: String,
    entity: String,
    partitioned: bool,
}

impl StampConflictCheck {
    pub fn new(table: impl Into<String>, entity: impl Into<String>, partitioned: bool) -> Self {
        Self {
            table: table.into(),
            entity: entity.into(),
            partitioned,
        }
    }
}

#[async_trait]
impl UpdateConflictCheck for StampConflictCheck {
    async fn diagnose(&self, lease: &mut ConnectionLease, entity: &dyn Persisted) -> StoreError {
        let kind = lease.kind();
        let mut sql = format!(
            "SELECT {MODIFIED_COLUMN} FROM {} WHERE {ID_COLUMN} = {}",
            self.table,
            placeholder_for(kind, 1)
        );
        let mut params = vec![SqlValue::Int(entity.id())];
        if self.partitioned {
            sql.push_str(&format!(
                " AND {PARTITION_COLUMN} = {}",
                placeholder_for(kind, 2)
            ));
            params.push(SqlValue::Int(entity.partition_id()));
        }

        match exec::fetch_optional(lease, &SqlCommand::with_params(sql, params)).await {
            Err(e) => e,
            Ok(None) => {
                StoreError::not_found(self.entity.clone(), entity.id(), entity.partition_id())
            }
            Ok(Some(row)) => match row_opt_i64(&row, MODIFIED_COLUMN) {
                Some(stored) => {
                    let expected = entity.modified_at().map(millis_of).unwrap_or(-1);
                    if stored != expected {
                        StoreError::concurrent_modify(
                            self.entity.clone(),
                            entity.id(),
                            expected,
                            stored,
                        )
                    } else {
                        StoreError::save(
                            self.table.clone(),
                            "update affected no rows although the stamp still matches",
                        )
                    }
                }
                None => StoreError::save(
                    self.table.clone(),
                    "row carries no modification stamp to compare against",
                ),
            },
        }
    }
}
