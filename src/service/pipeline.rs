//! Hook pipeline: validate, pre, operate, post, queue after. Every public operation runs in its
//! own retried transaction; the `*_in` variants join a unit of work the caller already holds.

use crate::error::AppError;
use crate::service::crud::CrudService;
use crate::service::hooks::{
    DeleteInput, EntityHooks, FindOneInput, HookContext, ListQuery, UpdateInput, VerbHooks,
};
use crate::service::retry::UnitOfWork;
use crate::service::validation::RequestValidator;
use crate::state::Runtime;
use crate::store::{key_string, Row};
use serde_json::Value;

/// Names the operation a hook runs for, so its errors can say where they came from.
pub(crate) struct Stage<'s> {
    pub target: &'s str,
    pub verb: &'static str,
}

impl Stage<'_> {
    /// Hook failures become `HookAbort`, except serialization conflicts (so the unit of work
    /// is retried) and aborts raised by nested operations.
    fn abort(&self, stage: &'static str, err: AppError) -> AppError {
        if err.is_retryable() || matches!(err, AppError::HookAbort { .. }) {
            return err;
        }
        AppError::HookAbort {
            target: self.target.to_string(),
            verb: self.verb,
            stage,
            message: err.to_string(),
        }
    }

    /// Run the pre hook. A replaced input goes through `revalidate` before it is used.
    pub(crate) async fn pre<I, O, V>(
        &self,
        hooks: &VerbHooks<I, O>,
        input: I,
        ctx: &mut HookContext,
        uow: &mut UnitOfWork,
        revalidate: V,
    ) -> Result<I, AppError>
    where
        I: Send + Sync,
        V: FnOnce(I) -> Result<I, AppError> + Send,
    {
        let Some(hook) = &hooks.pre else {
            return Ok(input);
        };
        tracing::debug!(target_name = self.target, verb = self.verb, stage = "pre", "running hook");
        let outcome = hook.call(&input, ctx, uow).await.map_err(|e| self.abort("pre", e))?;
        if let Some(patch) = outcome.context {
            ctx.merge(patch);
        }
        match outcome.replace {
            Some(next) => revalidate(next),
            None => Ok(input),
        }
    }

    pub(crate) async fn post<I, O>(
        &self,
        hooks: &VerbHooks<I, O>,
        input: &I,
        output: O,
        ctx: &mut HookContext,
        uow: &mut UnitOfWork,
    ) -> Result<O, AppError>
    where
        I: Send + Sync,
        O: Send + Sync,
    {
        let Some(hook) = &hooks.post else {
            return Ok(output);
        };
        tracing::debug!(target_name = self.target, verb = self.verb, stage = "post", "running hook");
        let outcome = hook
            .call(input, &output, ctx, uow)
            .await
            .map_err(|e| self.abort("post", e))?;
        if let Some(patch) = outcome.context {
            ctx.merge(patch);
        }
        Ok(outcome.replace.unwrap_or(output))
    }

    /// Queue the after hook on the unit of work. It only runs if this attempt commits.
    pub(crate) fn queue_after<I, O>(&self, hooks: &VerbHooks<I, O>, input: I, output: O, ctx: HookContext, uow: &mut UnitOfWork)
    where
        I: Send + Sync + 'static,
        O: Send + Sync + 'static,
    {
        let Some(hook) = hooks.after.clone() else {
            return;
        };
        let target = self.target.to_string();
        let verb = self.verb;
        uow.defer_after(Box::pin(async move {
            tracing::debug!(target_name = %target, verb, stage = "after", "running hook");
            if let Err(e) = hook.call(&input, &output, &ctx).await {
                tracing::warn!(target_name = %target, verb, error = %e, "after hook failed");
            }
        }));
    }
}

/// Entity operations with lifecycle hooks.
#[derive(Clone)]
pub struct HookPipeline {
    rt: Runtime,
}

impl HookPipeline {
    pub fn new(rt: Runtime) -> Self {
        HookPipeline { rt }
    }

    fn hooks(&self, entity: &str) -> EntityHooks {
        self.rt.hooks.entity(entity).cloned().unwrap_or_default()
    }

    pub async fn create(&self, entity: &str, payload: Row, ctx: HookContext) -> Result<Row, AppError> {
        let this = self.clone();
        let entity = entity.to_string();
        self.rt
            .transaction(move |uow| {
                let (this, entity, payload, ctx) = (this.clone(), entity.clone(), payload.clone(), ctx.clone());
                Box::pin(async move { this.create_in(uow, &entity, payload, ctx).await })
            })
            .await
    }

    pub async fn create_in(&self, uow: &mut UnitOfWork, entity: &str, payload: Row, mut ctx: HookContext) -> Result<Row, AppError> {
        let ent = self.rt.entity(entity)?;
        let hooks = self.hooks(entity);
        let stage = Stage { target: &ent.name, verb: "create" };
        let input = RequestValidator::create(ent, payload)?;
        let input = stage
            .pre(&hooks.create, input, &mut ctx, uow, |next| RequestValidator::create(ent, next))
            .await?;
        let row = CrudService::insert(uow.tx(), ent, input.clone()).await?;
        let row = stage.post(&hooks.create, &input, row, &mut ctx, uow).await?;
        stage.queue_after(&hooks.create, input, row.clone(), ctx, uow);
        tracing::debug!(entity = %ent.name, id = %row.get(ent.pk_column()).map(key_string).unwrap_or_default(), "created");
        Ok(row)
    }

    pub async fn update(&self, entity: &str, id: Value, data: Row, ctx: HookContext) -> Result<Row, AppError> {
        let this = self.clone();
        let entity = entity.to_string();
        let input = UpdateInput { id, data };
        self.rt
            .transaction(move |uow| {
                let (this, entity, input, ctx) = (this.clone(), entity.clone(), input.clone(), ctx.clone());
                Box::pin(async move { this.update_in(uow, &entity, input, ctx).await })
            })
            .await
    }

    pub async fn update_in(&self, uow: &mut UnitOfWork, entity: &str, input: UpdateInput, mut ctx: HookContext) -> Result<Row, AppError> {
        let ent = self.rt.entity(entity)?;
        let hooks = self.hooks(entity);
        let stage = Stage { target: &ent.name, verb: "update" };
        let input = RequestValidator::update(ent, input)?;
        let input = stage
            .pre(&hooks.update, input, &mut ctx, uow, |next| RequestValidator::update(ent, next))
            .await?;
        let row = CrudService::update(uow.tx(), ent, &input.id, input.data.clone()).await?;
        let row = stage.post(&hooks.update, &input, row, &mut ctx, uow).await?;
        stage.queue_after(&hooks.update, input, row.clone(), ctx, uow);
        Ok(row)
    }

    /// Delete by id; soft-delete entities are stamped instead of removed.
    pub async fn delete(&self, entity: &str, id: Value, ctx: HookContext) -> Result<Row, AppError> {
        let this = self.clone();
        let entity = entity.to_string();
        self.rt
            .transaction(move |uow| {
                let (this, entity, ctx) = (this.clone(), entity.clone(), ctx.clone());
                let input = DeleteInput { id: id.clone() };
                Box::pin(async move { this.delete_in(uow, &entity, input, ctx).await })
            })
            .await
    }

    pub async fn delete_in(&self, uow: &mut UnitOfWork, entity: &str, input: DeleteInput, mut ctx: HookContext) -> Result<Row, AppError> {
        let ent = self.rt.entity(entity)?;
        let hooks = self.hooks(entity);
        let stage = Stage { target: &ent.name, verb: "delete" };
        let input = RequestValidator::delete(ent, input)?;
        let input = stage
            .pre(&hooks.delete, input, &mut ctx, uow, |next| RequestValidator::delete(ent, next))
            .await?;
        let row = CrudService::delete(uow.tx(), ent, &input.id).await?;
        let row = stage.post(&hooks.delete, &input, row, &mut ctx, uow).await?;
        stage.queue_after(&hooks.delete, input, row.clone(), ctx, uow);
        Ok(row)
    }

    pub async fn find_one(&self, entity: &str, input: FindOneInput, ctx: HookContext) -> Result<Row, AppError> {
        let this = self.clone();
        let entity = entity.to_string();
        self.rt
            .transaction(move |uow| {
                let (this, entity, input, ctx) = (this.clone(), entity.clone(), input.clone(), ctx.clone());
                Box::pin(async move { this.find_one_in(uow, &entity, input, ctx).await })
            })
            .await
    }

    pub async fn find_one_in(&self, uow: &mut UnitOfWork, entity: &str, input: FindOneInput, mut ctx: HookContext) -> Result<Row, AppError> {
        let ent = self.rt.entity(entity)?;
        let hooks = self.hooks(entity);
        let stage = Stage { target: &ent.name, verb: "find_one" };
        let input = RequestValidator::find_one(ent, input)?;
        let input = stage
            .pre(&hooks.find_one, input, &mut ctx, uow, |next| RequestValidator::find_one(ent, next))
            .await?;
        let row = CrudService::find_by_id(uow.tx(), ent, &input.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{} {}", ent.name, key_string(&input.id))))?;
        let mut rows = [row];
        CrudService::attach_includes(uow.tx(), &self.rt.schema, ent, &mut rows, &input.include).await?;
        let [row] = rows;
        let row = stage.post(&hooks.find_one, &input, row, &mut ctx, uow).await?;
        stage.queue_after(&hooks.find_one, input, row.clone(), ctx, uow);
        Ok(row)
    }

    pub async fn find_many(&self, entity: &str, query: ListQuery, ctx: HookContext) -> Result<Vec<Row>, AppError> {
        let this = self.clone();
        let entity = entity.to_string();
        self.rt
            .transaction(move |uow| {
                let (this, entity, query, ctx) = (this.clone(), entity.clone(), query.clone(), ctx.clone());
                Box::pin(async move { this.find_many_in(uow, &entity, query, ctx).await })
            })
            .await
    }

    pub async fn find_many_in(&self, uow: &mut UnitOfWork, entity: &str, query: ListQuery, mut ctx: HookContext) -> Result<Vec<Row>, AppError> {
        let ent = self.rt.entity(entity)?;
        let hooks = self.hooks(entity);
        let stage = Stage { target: &ent.name, verb: "find_many" };
        let query = RequestValidator::list(ent, query)?;
        let query = stage
            .pre(&hooks.find_many, query, &mut ctx, uow, |next| RequestValidator::list(ent, next))
            .await?;
        let mut rows = CrudService::list(uow.tx(), ent, &query).await?;
        CrudService::attach_includes(uow.tx(), &self.rt.schema, ent, &mut rows, &query.include).await?;
        let rows = stage.post(&hooks.find_many, &query, rows, &mut ctx, uow).await?;
        stage.queue_after(&hooks.find_many, query, rows.clone(), ctx, uow);
        Ok(rows)
    }
}
