//! Generic row operations over an open store transaction.

use crate::config::{IncludeDirection, IncludeSpec, ResolvedEntity, ResolvedSchema, FieldType};
use crate::error::AppError;
use crate::service::hooks::ListQuery;
use crate::store::{key_string, Condition, Row, Selection, StoreTx};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

pub struct CrudService;

pub(crate) fn now_timestamp() -> Value {
    Value::String(chrono::Utc::now().to_rfc3339())
}

impl CrudService {
    /// Rows that are not soft-deleted.
    fn live(entity: &ResolvedEntity) -> Vec<Condition> {
        if entity.soft_delete {
            vec![Condition::is_null("deleted_at")]
        } else {
            Vec::new()
        }
    }

    fn by_id(entity: &ResolvedEntity, id: &Value) -> Vec<Condition> {
        let mut conds = vec![Condition::eq(entity.pk_column(), id.clone())];
        conds.extend(Self::live(entity));
        conds
    }

    /// Insert one validated row. Declared defaults are applied, a missing uuid key is generated
    /// and a missing integer key is left to the store.
    pub async fn insert(tx: &mut dyn StoreTx, entity: &ResolvedEntity, mut row: Row) -> Result<Row, AppError> {
        for f in &entity.fields {
            if let Some(default) = &f.default {
                if !row.contains_key(&f.column) {
                    row.insert(f.column.clone(), default.clone());
                }
            }
        }
        let pk = entity.pk();
        if !row.contains_key(&pk.column) && pk.ty == FieldType::Uuid {
            row.insert(pk.column.clone(), Value::String(uuid::Uuid::new_v4().to_string()));
        }
        if entity.timestamps {
            let now = now_timestamp();
            row.insert("created_at".into(), now.clone());
            row.insert("updated_at".into(), now);
        }
        tx.insert(&entity.storage, row).await
    }

    /// Fetch one live row by primary key.
    pub async fn find_by_id(tx: &mut dyn StoreTx, entity: &ResolvedEntity, id: &Value) -> Result<Option<Row>, AppError> {
        let selection = Selection {
            conditions: Self::by_id(entity, id),
            limit: Some(1),
            offset: None,
        };
        Ok(tx.select(&entity.storage, &selection).await?.into_iter().next())
    }

    /// Update one row by id. Returns the updated row.
    pub async fn update(tx: &mut dyn StoreTx, entity: &ResolvedEntity, id: &Value, mut changes: Row) -> Result<Row, AppError> {
        if entity.timestamps {
            changes.insert("updated_at".into(), now_timestamp());
        }
        tx.update(&entity.storage, &Self::by_id(entity, id), changes)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("{} {}", entity.name, key_string(id))))
    }

    /// Delete one row by id; soft-delete entities get `deleted_at` stamped instead.
    /// Returns the row as it was removed.
    pub async fn delete(tx: &mut dyn StoreTx, entity: &ResolvedEntity, id: &Value) -> Result<Row, AppError> {
        let conds = Self::by_id(entity, id);
        let removed = if entity.soft_delete {
            let mut changes = Row::new();
            changes.insert("deleted_at".into(), now_timestamp());
            tx.update(&entity.storage, &conds, changes).await?
        } else {
            tx.delete(&entity.storage, &conds).await?
        };
        removed
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("{} {}", entity.name, key_string(id))))
    }

    /// List live rows with exact-match filters and paging. Expects a query already
    /// normalized by the validator.
    pub async fn list(tx: &mut dyn StoreTx, entity: &ResolvedEntity, query: &ListQuery) -> Result<Vec<Row>, AppError> {
        let mut conditions: Vec<Condition> = query
            .filters
            .iter()
            .map(|(col, v)| match v {
                Value::Null => Condition::is_null(col),
                _ => Condition::eq(col, v.clone()),
            })
            .collect();
        conditions.extend(Self::live(entity));
        let selection = Selection {
            conditions,
            limit: query.limit,
            offset: query.offset,
        };
        tx.select(&entity.storage, &selection).await
    }

    /// Fetch live rows where `column` is one of `values`. Used for batch-loading related rows.
    pub async fn fetch_where_column_in(
        tx: &mut dyn StoreTx,
        entity: &ResolvedEntity,
        column: &str,
        values: Vec<Value>,
    ) -> Result<Vec<Row>, AppError> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let mut conditions = vec![Condition::is_in(column, values)];
        conditions.extend(Self::live(entity));
        tx.select(&entity.storage, &Selection::filter(conditions)).await
    }

    /// Load each named relationship for all `rows` at once and set it on every row under the
    /// relationship name: an object (or null) for to-one, an array otherwise.
    /// One query per to-one/to-many include, two per many-to-many include.
    pub async fn attach_includes(
        tx: &mut dyn StoreTx,
        schema: &ResolvedSchema,
        entity: &ResolvedEntity,
        rows: &mut [Row],
        include: &[String],
    ) -> Result<(), AppError> {
        if rows.is_empty() {
            return Ok(());
        }
        for name in include {
            let spec = entity
                .include(name)
                .ok_or_else(|| AppError::BadRequest(format!("{} has no relationship '{}'", entity.name, name)))?;
            match spec.direction {
                IncludeDirection::ToOne => Self::attach_to_one(tx, schema, spec, rows).await?,
                IncludeDirection::ToMany => Self::attach_to_many(tx, schema, spec, rows).await?,
                IncludeDirection::ManyToMany => Self::attach_many_to_many(tx, schema, spec, rows).await?,
            }
        }
        Ok(())
    }

    async fn attach_to_one(tx: &mut dyn StoreTx, schema: &ResolvedSchema, spec: &IncludeSpec, rows: &mut [Row]) -> Result<(), AppError> {
        let related = schema.entity_by_id(spec.related);
        let keys = distinct_keys(rows.iter().filter_map(|r| r.get(&spec.our_key)));
        let found = Self::fetch_where_column_in(tx, related, &spec.their_key, keys).await?;
        let by_key: HashMap<String, Row> = found
            .into_iter()
            .filter_map(|r| r.get(&spec.their_key).map(key_string).map(|k| (k, r)))
            .collect();
        for row in rows.iter_mut() {
            let value = row
                .get(&spec.our_key)
                .and_then(|k| by_key.get(&key_string(k)))
                .cloned()
                .map(Value::Object)
                .unwrap_or(Value::Null);
            row.insert(spec.name.clone(), value);
        }
        Ok(())
    }

    async fn attach_to_many(tx: &mut dyn StoreTx, schema: &ResolvedSchema, spec: &IncludeSpec, rows: &mut [Row]) -> Result<(), AppError> {
        let related = schema.entity_by_id(spec.related);
        let keys = distinct_keys(rows.iter().filter_map(|r| r.get(&spec.our_key)));
        let found = Self::fetch_where_column_in(tx, related, &spec.their_key, keys).await?;
        let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();
        for r in found {
            if let Some(k) = r.get(&spec.their_key).map(key_string) {
                grouped.entry(k).or_default().push(Value::Object(r));
            }
        }
        for row in rows.iter_mut() {
            let children = row
                .get(&spec.our_key)
                .and_then(|k| grouped.get(&key_string(k)))
                .cloned()
                .unwrap_or_default();
            row.insert(spec.name.clone(), Value::Array(children));
        }
        Ok(())
    }

    async fn attach_many_to_many(tx: &mut dyn StoreTx, schema: &ResolvedSchema, spec: &IncludeSpec, rows: &mut [Row]) -> Result<(), AppError> {
        let (jid, side) = spec
            .junction
            .ok_or_else(|| AppError::Store(format!("relationship '{}' has no junction", spec.name)))?;
        let junction = schema.junction_by_id(jid);
        let ours = junction.end(side);
        let theirs = junction.end(side.opposite());
        let related = schema.entity_by_id(spec.related);

        let ids = distinct_keys(rows.iter().filter_map(|r| r.get(&spec.our_key)));
        if ids.is_empty() {
            return Ok(());
        }
        let links = tx
            .select(&junction.storage, &Selection::filter(vec![Condition::is_in(&ours.column, ids)]))
            .await?;
        let other_ids = distinct_keys(links.iter().filter_map(|l| l.get(&theirs.column)));
        let found = Self::fetch_where_column_in(tx, related, &theirs.references, other_ids).await?;
        let by_key: HashMap<String, Row> = found
            .into_iter()
            .filter_map(|r| r.get(&theirs.references).map(key_string).map(|k| (k, r)))
            .collect();
        let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();
        for link in &links {
            let (Some(mine), Some(other)) = (link.get(&ours.column), link.get(&theirs.column)) else {
                continue;
            };
            if let Some(r) = by_key.get(&key_string(other)) {
                grouped.entry(key_string(mine)).or_default().push(Value::Object(r.clone()));
            }
        }
        for row in rows.iter_mut() {
            let linked = row
                .get(&spec.our_key)
                .and_then(|k| grouped.get(&key_string(k)))
                .cloned()
                .unwrap_or_default();
            row.insert(spec.name.clone(), Value::Array(linked));
        }
        Ok(())
    }
}

/// Non-null values, first occurrence kept.
fn distinct_keys<'a>(values: impl Iterator<Item = &'a Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    values
        .filter(|v| !v.is_null())
        .filter(|v| seen.insert(key_string(v)))
        .cloned()
        .collect()
}
