//! Resolve-and-cache layer for schema definitions and record factories.
//!
//! Concrete implementations are located through an explicit registry (a
//! mapping from (abstract capability name, dialect) to a constructor function
//! populated at process start) rather than by name-pattern guessing. The
//! constructor's return type guarantees the instance implements the expected
//! capability interface.
//!
//! Instances are cached by the capability's name (a string key, stable across
//! loader boundaries, never instance identity). Record factories are
//! additionally published under their view name; publishing two distinct
//! implementation types under one view is a hard configuration error. Caches
//! are read-mostly after warm-up: lookups after the first take only a read
//! lock, first construction is serialized per cache.

use crate::context::PersistenceContext;
use crate::db::dialect::DialectKind;
use crate::error::{StoreError, StoreResult};
use crate::records::RecordFactory;
use crate::schema::SchemaDefinition;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Constructor for a record factory implementation.
pub type FactoryConstructor =
    Arc<dyn Fn(Arc<PersistenceContext>) -> StoreResult<Arc<dyn RecordFactory>> + Send + Sync>;

/// Constructor for a schema definition implementation.
pub type SchemaConstructor =
    Arc<dyn Fn(Arc<PersistenceContext>) -> StoreResult<Arc<dyn SchemaDefinition>> + Send + Sync>;

struct ViewEntry {
    capability: String,
    implementation: &'static str,
}

/// Stateless-singleton resolution and caching for the persistence core.
pub struct ManagerCache {
    context: Arc<PersistenceContext>,
    factory_ctors: RwLock<HashMap<(String, DialectKind), FactoryConstructor>>,
    schema_ctors: RwLock<HashMap<(String, DialectKind), SchemaConstructor>>,
    factories: RwLock<HashMap<String, Arc<dyn RecordFactory>>>,
    schemas: RwLock<HashMap<String, Arc<dyn SchemaDefinition>>>,
    views: RwLock<HashMap<String, ViewEntry>>,
}

impl ManagerCache {
    pub fn new(context: Arc<PersistenceContext>) -> Self {
        Self {
            context,
            factory_ctors: RwLock::new(HashMap::new()),
            schema_ctors: RwLock::new(HashMap::new()),
            factories: RwLock::new(HashMap::new()),
            schemas: RwLock::new(HashMap::new()),
            views: RwLock::new(HashMap::new()),
        }
    }

    /// Register the factory constructor for a capability under one dialect.
    pub fn register_factory(
        &self,
        capability: impl Into<String>,
        kind: DialectKind,
        constructor: FactoryConstructor,
    ) {
        let capability = capability.into();
        debug!(capability = %capability, dialect = %kind, "Registered factory constructor");
        self.factory_ctors
            .write()
            .expect("factory constructor lock poisoned")
            .insert((capability, kind), constructor);
    }

    /// Register the schema constructor for a capability under one dialect.
    pub fn register_schema(
        &self,
        capability: impl Into<String>,
        kind: DialectKind,
        constructor: SchemaConstructor,
    ) {
        let capability = capability.into();
        debug!(capability = %capability, dialect = %kind, "Registered schema constructor");
        self.schema_ctors
            .write()
            .expect("schema constructor lock poisoned")
            .insert((capability, kind), constructor);
    }

    /// Resolve (and on first request, construct and cache) the record factory
    /// for a capability. Two concurrent first requests still yield one shared
    /// instance.
    pub fn resolve_factory(&self, capability: &str) -> StoreResult<Arc<dyn RecordFactory>> {
        {
            let factories = self.factories.read().expect("factory cache lock poisoned");
            if let Some(instance) = factories.get(capability) {
                return Ok(Arc::clone(instance));
            }
        }

        let mut factories = self.factories.write().expect("factory cache lock poisoned");
        if let Some(instance) = factories.get(capability) {
            return Ok(Arc::clone(instance));
        }

        let kind = self.context.dialect_kind();
        let constructor = {
            let ctors = self
                .factory_ctors
                .read()
                .expect("factory constructor lock poisoned");
            ctors
                .get(&(capability.to_string(), kind))
                .cloned()
                .ok_or_else(|| {
                    StoreError::resolution(
                        capability,
                        format!("no factory constructor registered for dialect '{kind}'"),
                    )
                })?
        };

        let instance = constructor(Arc::clone(&self.context))?;
        self.publish_view(capability, &instance)?;
        info!(
            capability = %capability,
            view = %instance.view_name(),
            implementation = instance.implementation_name(),
            "Constructed record factory"
        );
        factories.insert(capability.to_string(), Arc::clone(&instance));
        Ok(instance)
    }

    /// Resolve a factory and downcast it to its concrete type.
    pub fn resolve_factory_as<T: RecordFactory>(&self, capability: &str) -> StoreResult<Arc<T>> {
        let instance = self.resolve_factory(capability)?;
        let implementation = instance.implementation_name();
        instance.as_any_arc().downcast::<T>().map_err(|_| {
            StoreError::resolution(
                capability,
                format!("cached instance is {implementation}, not the requested type"),
            )
        })
    }

    /// Look up the factory serving a view name. The view must have been
    /// published by a prior capability resolution.
    pub fn factory_for_view(&self, view: &str) -> StoreResult<Arc<dyn RecordFactory>> {
        let capability = {
            let views = self.views.read().expect("view index lock poisoned");
            views
                .get(view)
                .map(|entry| entry.capability.clone())
                .ok_or_else(|| {
                    StoreError::resolution(view, "no factory has been published under this view")
                })?
        };
        self.resolve_factory(&capability)
    }

    /// Resolve (and on first request, construct and cache) the schema
    /// definition for a capability.
    pub fn resolve_schema(&self, capability: &str) -> StoreResult<Arc<dyn SchemaDefinition>> {
        {
            let schemas = self.schemas.read().expect("schema cache lock poisoned");
            if let Some(instance) = schemas.get(capability) {
                return Ok(Arc::clone(instance));
            }
        }

        let mut schemas = self.schemas.write().expect("schema cache lock poisoned");
        if let Some(instance) = schemas.get(capability) {
            return Ok(Arc::clone(instance));
        }

        let kind = self.context.dialect_kind();
        let constructor = {
            let ctors = self
                .schema_ctors
                .read()
                .expect("schema constructor lock poisoned");
            ctors
                .get(&(capability.to_string(), kind))
                .cloned()
                .ok_or_else(|| {
                    StoreError::resolution(
                        capability,
                        format!("no schema constructor registered for dialect '{kind}'"),
                    )
                })?
        };

        let instance = constructor(Arc::clone(&self.context))?;
        info!(capability = %capability, schema = %instance.name(), "Constructed schema definition");
        schemas.insert(capability.to_string(), Arc::clone(&instance));
        Ok(instance)
    }

    /// Resolve every schema capability registered for the context's dialect,
    /// for bootstrap code that feeds the schema registry.
    pub fn resolve_registered_schemas(&self) -> StoreResult<Vec<Arc<dyn SchemaDefinition>>> {
        let kind = self.context.dialect_kind();
        let capabilities: Vec<String> = {
            let ctors = self
                .schema_ctors
                .read()
                .expect("schema constructor lock poisoned");
            ctors
                .keys()
                .filter(|(_, k)| *k == kind)
                .map(|(capability, _)| capability.clone())
                .collect()
        };

        capabilities
            .iter()
            .map(|capability| self.resolve_schema(capability))
            .collect()
    }

    fn publish_view(&self, capability: &str, instance: &Arc<dyn RecordFactory>) -> StoreResult<()> {
        let view = instance.view_name().to_string();
        let implementation = instance.implementation_name();
        let mut views = self.views.write().expect("view index lock poisoned");
        match views.get(&view) {
            Some(entry) if entry.implementation != implementation => {
                Err(StoreError::configuration(format!(
                    "View '{view}' is already served by {}; refusing to publish {} for capability '{capability}'",
                    entry.implementation, implementation
                )))
            }
            Some(_) => Ok(()),
            None => {
                views.insert(
                    view,
                    ViewEntry {
                        capability: capability.to_string(),
                        implementation,
                    },
                );
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for ManagerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let factories = self.factories.read().expect("factory cache lock poisoned");
        let schemas = self.schemas.read().expect("schema cache lock poisoned");
        f.debug_struct("ManagerCache")
            .field("cached_factories", &factories.len())
            .field("cached_schemas", &schemas.len())
            .finish_non_exhaustive()
    }
}
