//! Shared runtime handle: compiled schema, store, hooks and transaction settings.

use crate::config::{IncludeDirection, JunctionSide, ResolvedEntity, ResolvedSchema};
use crate::error::AppError;
use crate::service::{
    run_in_transaction, HookPipeline, HookRegistry, JunctionManager, TransactionOptions, UnitOfWork,
};
use crate::store::Store;
use futures::future::BoxFuture;
use std::sync::Arc;

#[derive(Clone)]
pub struct Runtime {
    pub schema: Arc<ResolvedSchema>,
    pub store: Arc<dyn Store>,
    pub hooks: Arc<HookRegistry>,
    pub options: TransactionOptions,
}

impl Runtime {
    /// Hooks registered for names the schema does not know are kept but logged, since they can never fire.
    pub fn new(schema: ResolvedSchema, store: Arc<dyn Store>, hooks: HookRegistry) -> Self {
        for name in hooks.unmatched(|e| schema.entity(e).is_some(), |t| schema.junction(t).is_some()) {
            tracing::warn!(name, "hooks registered for an unknown entity or junction");
        }
        Runtime {
            schema: Arc::new(schema),
            store,
            hooks: Arc::new(hooks),
            options: TransactionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TransactionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn entity(&self, name: &str) -> Result<&ResolvedEntity, AppError> {
        self.schema
            .entity(name)
            .ok_or_else(|| AppError::UnknownEntity(name.to_string()))
    }

    pub fn pipeline(&self) -> HookPipeline {
        HookPipeline::new(self.clone())
    }

    /// Links of the junction materialized for `through`, seen from the entity that declared it first.
    pub fn junction(&self, through: &str) -> Result<JunctionManager, AppError> {
        let j = self
            .schema
            .junction(through)
            .ok_or_else(|| AppError::UnknownEntity(format!("junction '{}'", through)))?;
        Ok(JunctionManager::new(self.clone(), j.id, JunctionSide::Source))
    }

    /// Links behind the many-to-many relationship `include` of `entity`, seen from that entity.
    pub fn relation(&self, entity: &str, include: &str) -> Result<JunctionManager, AppError> {
        let ent = self.entity(entity)?;
        let spec = ent
            .include(include)
            .ok_or_else(|| AppError::BadRequest(format!("{} has no relationship '{}'", entity, include)))?;
        match (spec.direction, spec.junction) {
            (IncludeDirection::ManyToMany, Some((id, side))) => Ok(JunctionManager::new(self.clone(), id, side)),
            _ => Err(AppError::BadRequest(format!(
                "{}.{} is not a many-to-many relationship",
                entity, include
            ))),
        }
    }

    /// Run `work` as one retried unit of work against this runtime's store.
    pub async fn transaction<T, F>(&self, work: F) -> Result<T, AppError>
    where
        F: for<'a> FnMut(&'a mut UnitOfWork) -> BoxFuture<'a, Result<T, AppError>>,
    {
        run_in_transaction(self.store.as_ref(), &self.options, work).await
    }
}
