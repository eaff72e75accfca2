//! Explicit dependency-injection context.
//!
//! Everything that used to be reachable through global singleton accessors is
//! bundled here and passed to constructors instead, so multiple independent
//! persistence stacks can coexist (one per test, if need be) without hidden
//! startup-order coupling.

use crate::db::coordinator::TransactionCoordinator;
use crate::db::dialect::{Dialect, DialectKind, dialect_for};
use crate::db::source::ConnectionSource;
use std::sync::Arc;

/// Shared collaborators of the persistence core.
pub struct PersistenceContext {
    source: ConnectionSource,
    coordinator: TransactionCoordinator,
    dialect: Arc<dyn Dialect>,
}

impl PersistenceContext {
    pub fn new(
        source: ConnectionSource,
        coordinator: TransactionCoordinator,
        dialect: Arc<dyn Dialect>,
    ) -> Self {
        Self {
            source,
            coordinator,
            dialect,
        }
    }

    /// Build a context with the stock dialect strategy for a backend kind.
    pub fn for_kind(
        source: ConnectionSource,
        coordinator: TransactionCoordinator,
        kind: DialectKind,
    ) -> Self {
        Self::new(source, coordinator, dialect_for(kind))
    }

    pub fn source(&self) -> &ConnectionSource {
        &self.source
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    pub fn dialect_kind(&self) -> DialectKind {
        self.dialect.kind()
    }
}

impl std::fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("dialect", &self.dialect.kind())
            .finish_non_exhaustive()
    }
}
