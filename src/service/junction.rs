//! Many-to-many links. A manager is bound to one junction and to the side the caller stands
//! on; links are stored and handed to hooks in canonical (source, target) orientation, so the
//! same `through` hooks fire whichever side the call came from.

use crate::config::{JunctionId, JunctionSide, JunctionTable};
use crate::error::AppError;
use crate::service::crud::{now_timestamp, CrudService};
use crate::service::hooks::{HookContext, JunctionHooks, JunctionLink};
use crate::service::pipeline::Stage;
use crate::service::retry::UnitOfWork;
use crate::service::validation::RequestValidator;
use crate::state::Runtime;
use crate::store::{key_string, Condition, Row, Selection};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Clone)]
pub struct JunctionManager {
    rt: Runtime,
    junction: JunctionId,
    side: JunctionSide,
}

macro_rules! in_transaction {
    ($self:ident, |$uow:ident| $method:ident($($arg:ident),*)) => {{
        let this = $self.clone();
        $self
            .rt
            .transaction(move |$uow| {
                let this = this.clone();
                $(let $arg = $arg.clone();)*
                Box::pin(async move { this.$method($uow, $($arg),*).await })
            })
            .await
    }};
}

impl JunctionManager {
    pub(crate) fn new(rt: Runtime, junction: JunctionId, side: JunctionSide) -> Self {
        JunctionManager { rt, junction, side }
    }

    pub fn table(&self) -> &JunctionTable {
        self.rt.schema.junction_by_id(self.junction)
    }

    /// Side of the junction the owner ids passed to this manager belong to.
    pub fn side(&self) -> JunctionSide {
        self.side
    }

    fn hooks(&self) -> JunctionHooks {
        self.rt.hooks.junction(&self.table().through).cloned().unwrap_or_default()
    }

    fn canonical(&self, owner: Value, other: Value, extra: Row) -> JunctionLink {
        let (source_id, target_id) = match self.side {
            JunctionSide::Source => (owner, other),
            JunctionSide::Target => (other, owner),
        };
        JunctionLink {
            source_id,
            target_id,
            extra,
        }
    }

    fn link_conditions(j: &JunctionTable, link: &JunctionLink) -> Vec<Condition> {
        vec![
            Condition::eq(&j.source.column, link.source_id.clone()),
            Condition::eq(&j.target.column, link.target_id.clone()),
        ]
    }

    async fn find_link(&self, uow: &mut UnitOfWork, link: &JunctionLink) -> Result<Option<Row>, AppError> {
        let j = self.table();
        let selection = Selection {
            conditions: Self::link_conditions(j, link),
            limit: Some(1),
            offset: None,
        };
        Ok(uow.tx().select(&j.storage, &selection).await?.into_iter().next())
    }

    /// Both participants must exist (and not be soft-deleted).
    async fn ensure_participants(&self, uow: &mut UnitOfWork, link: &JunctionLink) -> Result<(), AppError> {
        let j = self.table();
        for (end, id) in [(&j.source, &link.source_id), (&j.target, &link.target_id)] {
            let entity = self.rt.schema.entity_by_id(end.entity);
            if CrudService::find_by_id(uow.tx(), entity, id).await?.is_none() {
                return Err(AppError::NotFound(format!("{} {}", entity.name, key_string(id))));
            }
        }
        Ok(())
    }

    fn check_owner(&self, owner: &Value) -> Result<(), AppError> {
        let end = self.table().end(self.side);
        let entity = self.rt.schema.entity_by_id(end.entity);
        RequestValidator::key(&entity.name, entity.pk(), owner)
    }

    /// Rows of the other participant linked to `owner`, in link order.
    pub async fn list(&self, owner: Value) -> Result<Vec<Row>, AppError> {
        in_transaction!(self, |uow| list_in(owner))
    }

    pub async fn list_in(&self, uow: &mut UnitOfWork, owner: Value) -> Result<Vec<Row>, AppError> {
        self.check_owner(&owner)?;
        let j = self.table();
        let (ours, theirs) = (j.end(self.side), j.end(self.side.opposite()));
        let links = uow
            .tx()
            .select(&j.storage, &Selection::filter(vec![Condition::eq(&ours.column, owner)]))
            .await?;
        let others: Vec<Value> = links.iter().filter_map(|l| l.get(&theirs.column).cloned()).collect();
        let related = self.rt.schema.entity_by_id(theirs.entity);
        let found = CrudService::fetch_where_column_in(uow.tx(), related, &theirs.references, others.clone()).await?;
        let mut by_key: HashMap<String, Row> = found
            .into_iter()
            .filter_map(|r| r.get(&theirs.references).map(key_string).map(|k| (k, r)))
            .collect();
        Ok(others.iter().filter_map(|k| by_key.remove(&key_string(k))).collect())
    }

    pub async fn has(&self, owner: Value, other: Value) -> Result<bool, AppError> {
        in_transaction!(self, |uow| has_in(owner, other))
    }

    pub async fn has_in(&self, uow: &mut UnitOfWork, owner: Value, other: Value) -> Result<bool, AppError> {
        let link = self.canonical(owner, other, Row::new());
        RequestValidator::link_keys(self.table(), &link)?;
        Ok(self.find_link(uow, &link).await?.is_some())
    }

    /// Link `owner` to `other` with optional payload. Linking an existing pair returns the
    /// stored row and fires no hooks; a pair rewritten by the pre hook onto an existing link
    /// returns that link without post or after hooks.
    pub async fn add_one(&self, owner: Value, other: Value, extra: Row, ctx: HookContext) -> Result<Row, AppError> {
        in_transaction!(self, |uow| add_one_in(owner, other, extra, ctx))
    }

    pub async fn add_one_in(
        &self,
        uow: &mut UnitOfWork,
        owner: Value,
        other: Value,
        extra: Row,
        mut ctx: HookContext,
    ) -> Result<Row, AppError> {
        let j = self.table();
        let hooks = self.hooks();
        let stage = Stage {
            target: &j.through,
            verb: "add",
        };
        let link = RequestValidator::link(j, self.canonical(owner, other, extra))?;
        if let Some(existing) = self.find_link(uow, &link).await? {
            tracing::debug!(through = %j.through, "link already present");
            return Ok(existing);
        }
        let requested = (link.source_id.clone(), link.target_id.clone());
        let link = stage
            .pre(&hooks.add, link, &mut ctx, uow, |next| RequestValidator::link(j, next))
            .await?;
        if (&link.source_id, &link.target_id) != (&requested.0, &requested.1) {
            if let Some(existing) = self.find_link(uow, &link).await? {
                tracing::debug!(through = %j.through, "pre hook moved the link onto an existing pair");
                return Ok(existing);
            }
        }
        self.ensure_participants(uow, &link).await?;

        let mut row = link.extra.clone();
        for f in &j.payload {
            if let Some(default) = &f.default {
                row.entry(f.column.clone()).or_insert_with(|| default.clone());
            }
        }
        row.insert(j.source.column.clone(), link.source_id.clone());
        row.insert(j.target.column.clone(), link.target_id.clone());
        if j.timestamps {
            row.insert("created_at".into(), now_timestamp());
        }
        let row = uow.tx().insert(&j.storage, row).await?;
        let row = stage.post(&hooks.add, &link, row, &mut ctx, uow).await?;
        stage.queue_after(&hooks.add, link, row.clone(), ctx, uow);
        Ok(row)
    }

    /// Link each of `others` in order, with hooks per link.
    pub async fn add_many(&self, owner: Value, others: Vec<Value>, ctx: HookContext) -> Result<Vec<Row>, AppError> {
        in_transaction!(self, |uow| add_many_in(owner, others, ctx))
    }

    pub async fn add_many_in(
        &self,
        uow: &mut UnitOfWork,
        owner: Value,
        others: Vec<Value>,
        ctx: HookContext,
    ) -> Result<Vec<Row>, AppError> {
        let mut out = Vec::with_capacity(others.len());
        for other in others {
            out.push(self.add_one_in(uow, owner.clone(), other, Row::new(), ctx.clone()).await?);
        }
        Ok(out)
    }

    /// Unlink one pair. A pair that is not linked is `NotFound`.
    pub async fn remove_one(&self, owner: Value, other: Value, ctx: HookContext) -> Result<Row, AppError> {
        in_transaction!(self, |uow| remove_one_in(owner, other, ctx))
    }

    pub async fn remove_one_in(
        &self,
        uow: &mut UnitOfWork,
        owner: Value,
        other: Value,
        mut ctx: HookContext,
    ) -> Result<Row, AppError> {
        let j = self.table();
        let hooks = self.hooks();
        let stage = Stage {
            target: &j.through,
            verb: "remove",
        };
        let mut link = self.canonical(owner, other, Row::new());
        RequestValidator::link_keys(j, &link)?;
        let existing = self.find_link(uow, &link).await?.ok_or_else(|| {
            AppError::NotFound(format!(
                "{} link {} -> {}",
                j.through,
                key_string(&link.source_id),
                key_string(&link.target_id)
            ))
        })?;
        link.extra = existing
            .into_iter()
            .filter(|(col, _)| j.payload.iter().any(|f| &f.column == col))
            .collect();
        let link = stage
            .pre(&hooks.remove, link, &mut ctx, uow, |next| {
                RequestValidator::link_keys(j, &next)?;
                Ok(next)
            })
            .await?;
        let row = uow
            .tx()
            .delete(&j.storage, &Self::link_conditions(j, &link))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("{} link", j.through)))?;
        let row = stage.post(&hooks.remove, &link, row, &mut ctx, uow).await?;
        stage.queue_after(&hooks.remove, link, row.clone(), ctx, uow);
        Ok(row)
    }

    /// Unlink each of `others` that is currently linked; the rest are skipped.
    pub async fn remove_many(&self, owner: Value, others: Vec<Value>, ctx: HookContext) -> Result<Vec<Row>, AppError> {
        in_transaction!(self, |uow| remove_many_in(owner, others, ctx))
    }

    pub async fn remove_many_in(
        &self,
        uow: &mut UnitOfWork,
        owner: Value,
        others: Vec<Value>,
        ctx: HookContext,
    ) -> Result<Vec<Row>, AppError> {
        let mut out = Vec::new();
        for other in others {
            if !self.has_in(uow, owner.clone(), other.clone()).await? {
                tracing::debug!(through = %self.table().through, other = %key_string(&other), "not linked, skipping");
                continue;
            }
            out.push(self.remove_one_in(uow, owner.clone(), other, ctx.clone()).await?);
        }
        Ok(out)
    }

    /// Replace every link of `owner` with links to `others`: existing links are removed (with
    /// remove hooks), then `others` are added in order (with add hooks).
    pub async fn set_all(&self, owner: Value, others: Vec<Value>, ctx: HookContext) -> Result<Vec<Row>, AppError> {
        in_transaction!(self, |uow| set_all_in(owner, others, ctx))
    }

    pub async fn set_all_in(
        &self,
        uow: &mut UnitOfWork,
        owner: Value,
        others: Vec<Value>,
        ctx: HookContext,
    ) -> Result<Vec<Row>, AppError> {
        self.check_owner(&owner)?;
        let j = self.table();
        let (ours, theirs) = (j.end(self.side), j.end(self.side.opposite()));
        let current = uow
            .tx()
            .select(&j.storage, &Selection::filter(vec![Condition::eq(&ours.column, owner.clone())]))
            .await?;
        for link in current {
            if let Some(other) = link.get(&theirs.column) {
                self.remove_one_in(uow, owner.clone(), other.clone(), ctx.clone()).await?;
            }
        }
        self.add_many_in(uow, owner, others, ctx).await
    }
}
