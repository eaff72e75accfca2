//! Connection sourcing and pooling.
//!
//! One database-specific sqlx pool per registered data source (MySqlPool,
//! PgPool, SqlitePool) to ensure full type support. Pools are built lazily so
//! registering a data source never requires the database to be reachable.
//!
//! Callers borrow a [`ConnectionLease`] and must hand it back through
//! [`ConnectionSource::release`], which never fails: cleanup paths can call it
//! unconditionally.

use crate::config::{DataSourceConfig, IsolationLevel, PoolSettings};
use crate::db::dialect::DialectKind;
use crate::error::{StoreError, StoreResult};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{
    ConnectOptions, Connection, MySql, MySqlConnection, MySqlPool, PgConnection, PgPool, Postgres,
    Sqlite, SqliteConnection, SqlitePool,
};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Database-specific connection pool.
#[derive(Debug, Clone)]
pub enum BackendPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl BackendPool {
    /// Close the connection pool.
    pub async fn close(&self) {
        match self {
            BackendPool::MySql(pool) => pool.close().await,
            BackendPool::Postgres(pool) => pool.close().await,
            BackendPool::Sqlite(pool) => pool.close().await,
        }
    }

    /// Get the dialect kind for this pool.
    pub fn kind(&self) -> DialectKind {
        match self {
            BackendPool::MySql(_) => DialectKind::MySql,
            BackendPool::Postgres(_) => DialectKind::Postgres,
            BackendPool::Sqlite(_) => DialectKind::Sqlite,
        }
    }
}

/// The borrowed connection inside a lease: pooled for ordinary operations,
/// direct for credential-overridden (admin) connections.
enum LeaseConn {
    MySqlPooled(PoolConnection<MySql>),
    MySqlDirect(MySqlConnection),
    PostgresPooled(PoolConnection<Postgres>),
    PostgresDirect(PgConnection),
    SqlitePooled(PoolConnection<Sqlite>),
    SqliteDirect(SqliteConnection),
}

/// A borrowed connection plus the data source it came from.
///
/// A lease must be returned (or closed) exactly once and is never shared
/// across concurrent operations. The `in_transaction` flag tracks an open
/// implicit transaction so release can warn and roll back abandoned work.
pub struct ConnectionLease {
    conn: LeaseConn,
    source_name: String,
    in_transaction: bool,
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("source_name", &self.source_name)
            .field("kind", &self.kind())
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}

impl ConnectionLease {
    fn pooled_mysql(conn: PoolConnection<MySql>, name: &str) -> Self {
        Self {
            conn: LeaseConn::MySqlPooled(conn),
            source_name: name.to_string(),
            in_transaction: false,
        }
    }

    fn pooled_postgres(conn: PoolConnection<Postgres>, name: &str) -> Self {
        Self {
            conn: LeaseConn::PostgresPooled(conn),
            source_name: name.to_string(),
            in_transaction: false,
        }
    }

    fn pooled_sqlite(conn: PoolConnection<Sqlite>, name: &str) -> Self {
        Self {
            conn: LeaseConn::SqlitePooled(conn),
            source_name: name.to_string(),
            in_transaction: false,
        }
    }

    /// The data source this lease was acquired from.
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// The backend kind of the underlying connection.
    pub fn kind(&self) -> DialectKind {
        match self.conn {
            LeaseConn::MySqlPooled(_) | LeaseConn::MySqlDirect(_) => DialectKind::MySql,
            LeaseConn::PostgresPooled(_) | LeaseConn::PostgresDirect(_) => DialectKind::Postgres,
            LeaseConn::SqlitePooled(_) | LeaseConn::SqliteDirect(_) => DialectKind::Sqlite,
        }
    }

    /// Whether an implicit transaction is open on this lease.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub(crate) fn set_in_transaction(&mut self, open: bool) {
        self.in_transaction = open;
    }

    /// Access the underlying MySQL connection.
    pub fn mysql(&mut self) -> StoreResult<&mut MySqlConnection> {
        match &mut self.conn {
            LeaseConn::MySqlPooled(c) => Ok(&mut *c),
            LeaseConn::MySqlDirect(c) => Ok(c),
            _ => Err(wrong_backend(&self.source_name, DialectKind::MySql)),
        }
    }

    /// Access the underlying PostgreSQL connection.
    pub fn postgres(&mut self) -> StoreResult<&mut PgConnection> {
        match &mut self.conn {
            LeaseConn::PostgresPooled(c) => Ok(&mut *c),
            LeaseConn::PostgresDirect(c) => Ok(c),
            _ => Err(wrong_backend(&self.source_name, DialectKind::Postgres)),
        }
    }

    /// Access the underlying SQLite connection.
    pub fn sqlite(&mut self) -> StoreResult<&mut SqliteConnection> {
        match &mut self.conn {
            LeaseConn::SqlitePooled(c) => Ok(&mut *c),
            LeaseConn::SqliteDirect(c) => Ok(c),
            _ => Err(wrong_backend(&self.source_name, DialectKind::Sqlite)),
        }
    }

    /// Execute a statement with no parameters on this lease. The workhorse
    /// for DDL, which takes no bind parameters on any supported vendor.
    pub async fn execute_raw(&mut self, sql: &str) -> StoreResult<u64> {
        let rows = match &mut self.conn {
            LeaseConn::MySqlPooled(c) => {
                sqlx::query(sql).execute(&mut **c).await?.rows_affected()
            }
            LeaseConn::MySqlDirect(c) => {
                sqlx::query(sql).execute(&mut *c).await?.rows_affected()
            }
            LeaseConn::PostgresPooled(c) => {
                sqlx::query(sql).execute(&mut **c).await?.rows_affected()
            }
            LeaseConn::PostgresDirect(c) => {
                sqlx::query(sql).execute(&mut *c).await?.rows_affected()
            }
            LeaseConn::SqlitePooled(c) => {
                sqlx::query(sql).execute(&mut **c).await?.rows_affected()
            }
            LeaseConn::SqliteDirect(c) => {
                sqlx::query(sql).execute(&mut *c).await?.rows_affected()
            }
        };
        Ok(rows)
    }

    /// Tear down the underlying connection. Pooled connections return to
    /// their pool on drop; direct connections are closed explicitly.
    async fn close_inner(self) -> Result<(), sqlx::Error> {
        match self.conn {
            LeaseConn::MySqlDirect(c) => c.close().await,
            LeaseConn::PostgresDirect(c) => c.close().await,
            LeaseConn::SqliteDirect(c) => c.close().await,
            // Dropping a PoolConnection hands it back to the pool.
            _ => Ok(()),
        }
    }
}

fn wrong_backend(source: &str, wanted: DialectKind) -> StoreError {
    StoreError::configuration(format!(
        "Lease from data source '{source}' does not hold a {wanted} connection"
    ))
}

#[derive(Debug)]
struct DataSourceEntry {
    pool: BackendPool,
    config: DataSourceConfig,
}

/// Named data sources and their pools.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSource {
    sources: Arc<RwLock<HashMap<String, DataSourceEntry>>>,
}

impl ConnectionSource {
    /// Create an empty connection source.
    pub fn new() -> Self {
        Self {
            sources: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a data source and build its (lazy) pool.
    pub async fn register(&self, config: DataSourceConfig) -> StoreResult<()> {
        config.pool.validate().map_err(StoreError::configuration)?;

        let pool = build_pool(&config)?;

        let mut sources = self.sources.write().await;
        if sources.contains_key(&config.name) {
            pool.close().await;
            return Err(StoreError::configuration(format!(
                "Data source '{}' is already registered",
                config.name
            )));
        }

        info!(
            data_source = %config.name,
            kind = %config.kind,
            max_size = config.pool.max_size_or_default(),
            can_grow = config.pool.can_grow_or_default(),
            "Registered data source"
        );
        sources.insert(
            config.name.clone(),
            DataSourceEntry { pool, config },
        );
        Ok(())
    }

    /// Look up the backend kind of a registered data source.
    pub async fn kind_of(&self, name: &str) -> StoreResult<DialectKind> {
        let sources = self.sources.read().await;
        sources
            .get(name)
            .map(|entry| entry.pool.kind())
            .ok_or_else(|| StoreError::no_such_data_source(name))
    }

    /// List the names of all registered data sources.
    pub async fn data_source_names(&self) -> Vec<String> {
        let sources = self.sources.read().await;
        sources.keys().cloned().collect()
    }

    /// Acquire a pooled connection lease.
    ///
    /// Blocks up to `pool.waitperiod` when the pool is at capacity; surfaces
    /// [`StoreError::PoolExhausted`] once the wait elapses. Transient driver
    /// failures are retried `pool.retrycount` times with `pool.retryperiod`
    /// spacing; a connection that fails borrow validation is retired by the
    /// pool and the retry hits a fresh one.
    pub async fn acquire(&self, name: &str) -> StoreResult<ConnectionLease> {
        let (pool, settings) = self.pool_and_settings(name).await?;

        let retry_count = settings.retry_count_or_default();
        let retry_period = settings.retry_period();
        let mut attempt = 0;
        loop {
            let result = match &pool {
                BackendPool::MySql(p) => p
                    .acquire()
                    .await
                    .map(|c| ConnectionLease::pooled_mysql(c, name)),
                BackendPool::Postgres(p) => p
                    .acquire()
                    .await
                    .map(|c| ConnectionLease::pooled_postgres(c, name)),
                BackendPool::Sqlite(p) => p
                    .acquire()
                    .await
                    .map(|c| ConnectionLease::pooled_sqlite(c, name)),
            };

            match result {
                Ok(lease) => {
                    debug!(data_source = %name, "Acquired connection");
                    return Ok(lease);
                }
                Err(sqlx::Error::PoolTimedOut) => {
                    return Err(StoreError::pool_exhausted(
                        name,
                        settings.wait_period().as_millis() as u64,
                    ));
                }
                Err(e) if attempt < retry_count && is_transient(&e) => {
                    attempt += 1;
                    warn!(
                        data_source = %name,
                        attempt = attempt,
                        error = %e,
                        "Acquire failed, retrying"
                    );
                    tokio::time::sleep(retry_period).await;
                }
                Err(e) => return Err(StoreError::from(e)),
            }
        }
    }

    /// Acquire a pooled lease with an implicit transaction opened.
    ///
    /// The configured isolation level, if any, is applied to the transaction.
    pub async fn acquire_transactional(&self, name: &str) -> StoreResult<ConnectionLease> {
        let isolation = {
            let sources = self.sources.read().await;
            let entry = sources
                .get(name)
                .ok_or_else(|| StoreError::no_such_data_source(name))?;
            entry.config.isolation
        };

        let mut lease = self.acquire(name).await?;
        if let Err(e) = begin_implicit(&mut lease, isolation).await {
            self.release(lease).await;
            return Err(e);
        }
        lease.set_in_transaction(true);
        debug!(data_source = %name, "Opened implicit transaction");
        Ok(lease)
    }

    /// Acquire a direct (unpooled) connection with overridden credentials.
    ///
    /// The embedded engine has no user authentication; credentials are
    /// ignored there.
    pub async fn acquire_as(
        &self,
        name: &str,
        user: &str,
        password: &str,
    ) -> StoreResult<ConnectionLease> {
        let config = self.config_of(name).await?;
        connect_direct(&config, Some((user, password))).await
    }

    /// Acquire a direct connection with the admin credentials configured for
    /// the data source, for schema-creation work that needs elevated
    /// privilege. Falls back to the regular credentials when no admin
    /// credentials are configured.
    pub async fn acquire_admin(&self, name: &str, for_startup: bool) -> StoreResult<ConnectionLease> {
        let config = self.config_of(name).await?;
        let creds = match (&config.admin_user, &config.admin_password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => config
                .user
                .as_deref()
                .map(|u| (u, config.password.as_deref().unwrap_or(""))),
        };

        match connect_direct(&config, creds).await {
            Ok(lease) => Ok(lease),
            Err(e) if for_startup => Err(StoreError::connection(
                format!("Startup connection to '{name}' failed: {e}"),
                "Verify the data source URL and admin credentials before schema initialization",
            )),
            Err(e) => Err(e),
        }
    }

    /// Return a lease. Never fails: errors are logged and swallowed so this
    /// is safe to call in any cleanup path.
    pub async fn release(&self, mut lease: ConnectionLease) {
        if lease.in_transaction() {
            warn!(
                data_source = %lease.source_name(),
                "Releasing lease with an open implicit transaction; rolling back"
            );
            if let Err(e) = lease.execute_raw("ROLLBACK").await {
                warn!(
                    data_source = %lease.source_name(),
                    error = %e,
                    "Rollback on release failed"
                );
            }
            lease.set_in_transaction(false);
        }

        let name = lease.source_name().to_string();
        if let Err(e) = lease.close_inner().await {
            warn!(data_source = %name, error = %e, "Error returning connection");
        } else {
            debug!(data_source = %name, "Released connection");
        }
    }

    /// Close every pool.
    pub async fn close_all(&self) {
        let mut sources = self.sources.write().await;
        for (name, entry) in sources.drain() {
            info!(data_source = %name, "Closing data source");
            entry.pool.close().await;
        }
    }

    async fn pool_and_settings(&self, name: &str) -> StoreResult<(BackendPool, PoolSettings)> {
        let sources = self.sources.read().await;
        let entry = sources
            .get(name)
            .ok_or_else(|| StoreError::no_such_data_source(name))?;
        Ok((entry.pool.clone(), entry.config.pool.clone()))
    }

    async fn config_of(&self, name: &str) -> StoreResult<DataSourceConfig> {
        let sources = self.sources.read().await;
        sources
            .get(name)
            .map(|entry| entry.config.clone())
            .ok_or_else(|| StoreError::no_such_data_source(name))
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Io(_) | sqlx::Error::Protocol(_))
}

/// Build the lazy pool for a data source.
fn build_pool(config: &DataSourceConfig) -> StoreResult<BackendPool> {
    let settings = &config.pool;
    // sqlx keeps `min_connections` warm in the background; it covers both the
    // initial and the minimum size knobs.
    let min = settings
        .min_size_or_default()
        .max(settings.initial_size_or_default());
    let max = settings.effective_max();
    let wait = settings.wait_period();
    let idle = settings.idle_period();
    let validate = settings.validate_on_borrow_or_default();

    match config.kind {
        DialectKind::MySql => {
            let options = mysql_options(config, None)?;
            let pool = MySqlPoolOptions::new()
                .min_connections(min)
                .max_connections(max)
                .acquire_timeout(wait)
                .idle_timeout(Some(idle))
                .test_before_acquire(validate)
                .connect_lazy_with(options);
            Ok(BackendPool::MySql(pool))
        }
        DialectKind::Postgres => {
            let options = postgres_options(config, None)?;
            let pool = PgPoolOptions::new()
                .min_connections(min)
                .max_connections(max)
                .acquire_timeout(wait)
                .idle_timeout(Some(idle))
                .test_before_acquire(validate)
                .connect_lazy_with(options);
            Ok(BackendPool::Postgres(pool))
        }
        DialectKind::Sqlite => {
            let options = sqlite_options(config)?;
            let pool = SqlitePoolOptions::new()
                .min_connections(min)
                .max_connections(max)
                .acquire_timeout(wait)
                .idle_timeout(Some(idle))
                .test_before_acquire(validate)
                .connect_lazy_with(options);
            Ok(BackendPool::Sqlite(pool))
        }
    }
}

/// Open a direct (unpooled) connection, optionally overriding credentials.
async fn connect_direct(
    config: &DataSourceConfig,
    credentials: Option<(&str, &str)>,
) -> StoreResult<ConnectionLease> {
    let name = config.name.clone();
    let conn = match config.kind {
        DialectKind::MySql => {
            let options = mysql_options(config, credentials)?;
            let conn = options
                .connect()
                .await
                .map_err(|e| connect_error(&name, config.kind, e))?;
            LeaseConn::MySqlDirect(conn)
        }
        DialectKind::Postgres => {
            let options = postgres_options(config, credentials)?;
            let conn = options
                .connect()
                .await
                .map_err(|e| connect_error(&name, config.kind, e))?;
            LeaseConn::PostgresDirect(conn)
        }
        DialectKind::Sqlite => {
            if credentials.is_some() {
                debug!(data_source = %name, "Ignoring credentials for embedded engine");
            }
            let options = sqlite_options(config)?;
            let conn = options
                .connect()
                .await
                .map_err(|e| connect_error(&name, config.kind, e))?;
            LeaseConn::SqliteDirect(conn)
        }
    };

    debug!(data_source = %name, "Opened direct connection");
    Ok(ConnectionLease {
        conn,
        source_name: name,
        in_transaction: false,
    })
}

fn mysql_options(
    config: &DataSourceConfig,
    credentials: Option<(&str, &str)>,
) -> StoreResult<MySqlConnectOptions> {
    let mut options = MySqlConnectOptions::from_str(&config.url)
        .map_err(|e| {
            StoreError::connection(
                format!("Invalid MySQL connection string: {e}"),
                format!(
                    "Expected a URL shaped like {}",
                    DialectKind::MySql.url_example()
                ),
            )
        })?
        .charset("utf8mb4")
        .statement_cache_capacity(config.pool.pstmt_cache_size_or_default() as usize);

    let (user, password) = effective_credentials(config, credentials);
    if let Some(user) = user {
        options = options.username(&user);
    }
    if let Some(password) = password {
        options = options.password(&password);
    }
    Ok(options)
}

fn postgres_options(
    config: &DataSourceConfig,
    credentials: Option<(&str, &str)>,
) -> StoreResult<PgConnectOptions> {
    let mut options = PgConnectOptions::from_str(&config.url)
        .map_err(|e| {
            StoreError::connection(
                format!("Invalid PostgreSQL connection string: {e}"),
                format!(
                    "Expected a URL shaped like {}",
                    DialectKind::Postgres.url_example()
                ),
            )
        })?
        .statement_cache_capacity(config.pool.pstmt_cache_size_or_default() as usize);

    let (user, password) = effective_credentials(config, credentials);
    if let Some(user) = user {
        options = options.username(&user);
    }
    if let Some(password) = password {
        options = options.password(&password);
    }
    Ok(options)
}

fn sqlite_options(config: &DataSourceConfig) -> StoreResult<SqliteConnectOptions> {
    let options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| {
            StoreError::connection(
                format!("Invalid SQLite connection string: {e}"),
                format!(
                    "Expected a URL shaped like {}",
                    DialectKind::Sqlite.url_example()
                ),
            )
        })?
        .create_if_missing(true)
        .statement_cache_capacity(config.pool.pstmt_cache_size_or_default() as usize);
    Ok(options)
}

fn effective_credentials(
    config: &DataSourceConfig,
    overridden: Option<(&str, &str)>,
) -> (Option<String>, Option<String>) {
    match overridden {
        Some((user, password)) => (Some(user.to_string()), Some(password.to_string())),
        None => (config.user.clone(), config.password.clone()),
    }
}

/// Open the implicit transaction on a fresh lease.
async fn begin_implicit(
    lease: &mut ConnectionLease,
    isolation: Option<IsolationLevel>,
) -> StoreResult<()> {
    match lease.kind() {
        DialectKind::Sqlite => {
            lease.execute_raw("BEGIN").await?;
        }
        DialectKind::Postgres => {
            lease.execute_raw("BEGIN").await?;
            if let Some(level) = isolation {
                lease
                    .execute_raw(&format!("SET TRANSACTION ISOLATION LEVEL {}", level.sql()))
                    .await?;
            }
        }
        DialectKind::MySql => {
            // SET TRANSACTION applies to the next transaction only, so it
            // must precede START TRANSACTION.
            if let Some(level) = isolation {
                lease
                    .execute_raw(&format!("SET TRANSACTION ISOLATION LEVEL {}", level.sql()))
                    .await?;
            }
            lease.execute_raw("START TRANSACTION").await?;
        }
    }
    Ok(())
}

/// Fold a driver connect failure into the error taxonomy, naming the data
/// source. The taxonomy's own suggestion survives where it has one; otherwise
/// the hint falls back to the credentials and URL shape, which is what a
/// failed direct connect almost always comes down to.
fn connect_error(name: &str, kind: DialectKind, err: sqlx::Error) -> StoreError {
    let wrapped = StoreError::from(err);
    let suggestion = match wrapped.suggestion() {
        Some(s) => s.to_string(),
        None => format!(
            "Check the credentials for '{name}' and that its URL is shaped like {}",
            kind.url_example()
        ),
    };
    StoreError::connection(
        format!("Cannot open connection to '{name}': {wrapped}"),
        suggestion,
    )
}
