//! Implicit/ambient transaction reconciliation.
//!
//! Callers never know whether a larger, externally-managed transaction is
//! already open around them. [`TransactionCoordinator::commit_implicit`] and
//! [`TransactionCoordinator::rollback_implicit`] are no-ops while an ambient
//! transaction is in progress, so record factories and the schema registry can
//! issue "commit when I'm done" calls unconditionally and still compose inside
//! a caller's larger unit of work.

use crate::db::source::ConnectionLease;
use crate::error::StoreResult;
use std::sync::Arc;
use tracing::{debug, info};

/// Handle for an ambient transaction obtained from the external manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbientHandle {
    id: String,
}

impl AmbientHandle {
    /// Create a handle with a fresh identifier.
    pub fn new() -> Self {
        Self {
            id: format!("txn_{}", uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Default for AmbientHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// The externally-managed transaction boundary, supplied by the host.
pub trait AmbientTransactions: Send + Sync {
    /// Begin (or join) the ambient transaction.
    fn begin(&self) -> StoreResult<AmbientHandle>;

    /// Whether an ambient transaction is currently open.
    fn is_in_progress(&self) -> bool;
}

/// Reconciles local implicit transactions with a possibly larger ambient one.
#[derive(Clone)]
pub struct TransactionCoordinator {
    ambient: Option<Arc<dyn AmbientTransactions>>,
}

impl TransactionCoordinator {
    /// Create a coordinator with no ambient transaction manager.
    ///
    /// The absence is logged, not fatal: the coordinator degrades to
    /// always-commit-directly mode.
    pub fn new() -> Self {
        info!("No ambient transaction manager installed; committing implicit transactions directly");
        Self { ambient: None }
    }

    /// Create a coordinator backed by the host's transaction manager.
    pub fn with_ambient(manager: Arc<dyn AmbientTransactions>) -> Self {
        Self {
            ambient: Some(manager),
        }
    }

    /// Request an ambient transaction. Returns `None` when no transaction
    /// manager is reachable.
    pub fn request_transaction(&self) -> Option<AmbientHandle> {
        match &self.ambient {
            Some(manager) => manager.begin().ok(),
            None => None,
        }
    }

    /// Whether an ambient transaction is currently in progress.
    pub fn is_in_progress(&self) -> bool {
        self.ambient
            .as_ref()
            .is_some_and(|manager| manager.is_in_progress())
    }

    /// Commit the lease's implicit transaction, unless an ambient transaction
    /// is open. In that case the outer transaction retains control and this
    /// is a no-op.
    pub async fn commit_implicit(&self, lease: &mut ConnectionLease) -> StoreResult<()> {
        if self.is_in_progress() {
            debug!(
                data_source = %lease.source_name(),
                "Ambient transaction in progress; skipping implicit commit"
            );
            return Ok(());
        }
        if !lease.in_transaction() {
            return Ok(());
        }
        lease.execute_raw("COMMIT").await?;
        lease.set_in_transaction(false);
        debug!(data_source = %lease.source_name(), "Committed implicit transaction");
        Ok(())
    }

    /// Roll back the lease's implicit transaction, with the same ambient
    /// no-op rule as [`commit_implicit`](Self::commit_implicit).
    pub async fn rollback_implicit(&self, lease: &mut ConnectionLease) -> StoreResult<()> {
        if self.is_in_progress() {
            debug!(
                data_source = %lease.source_name(),
                "Ambient transaction in progress; skipping implicit rollback"
            );
            return Ok(());
        }
        if !lease.in_transaction() {
            return Ok(());
        }
        lease.execute_raw("ROLLBACK").await?;
        lease.set_in_transaction(false);
        debug!(data_source = %lease.source_name(), "Rolled back implicit transaction");
        Ok(())
    }
}

impl Default for TransactionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("has_ambient", &self.ambient.is_some())
            .finish()
    }
}
