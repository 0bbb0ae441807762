//! Request validation from resolved field rules.

use crate::case::object_keys_to_snake_case;
use crate::config::{FieldType, JunctionTable, ResolvedEntity, ResolvedField};
use crate::error::AppError;
use crate::service::hooks::{DeleteInput, FindOneInput, JunctionLink, ListQuery, UpdateInput};
use crate::store::{values_equal, Row};
use regex::Regex;
use serde_json::Value;

pub const DEFAULT_LIST_LIMIT: u32 = 100;
pub const MAX_LIST_LIMIT: u32 = 1000;

pub struct RequestValidator;

impl RequestValidator {
    /// Validate a create payload. Keys are normalized to column names; unknown and runtime-managed
    /// columns are rejected; required fields must be present unless a default or key generator covers them.
    pub fn create(entity: &ResolvedEntity, mut payload: Row) -> Result<Row, AppError> {
        object_keys_to_snake_case(&mut payload);
        check_columns(&entity.name, &payload, |c| entity.field_by_column(c))?;
        for f in &entity.fields {
            if f.is_managed() {
                continue;
            }
            match payload.get(&f.column) {
                None | Some(Value::Null) if f.primary_key => {
                    if !(f.ty == FieldType::Uuid || f.ty.is_integral()) {
                        return Err(AppError::Validation(format!("{}.{} is required", entity.name, f.column)));
                    }
                }
                None if f.required && f.default.is_none() => {
                    return Err(AppError::Validation(format!("{}.{} is required", entity.name, f.column)));
                }
                Some(v) => validate_field(&entity.name, f, v)?,
                None => {}
            }
        }
        if matches!(payload.get(entity.pk_column()), Some(Value::Null)) {
            payload.remove(entity.pk_column());
        }
        Ok(payload)
    }

    /// Validate a partial update. Only present fields are checked; the primary key may be
    /// repeated with its current value but never changed.
    pub fn update(entity: &ResolvedEntity, mut input: UpdateInput) -> Result<UpdateInput, AppError> {
        Self::key(&entity.name, entity.pk(), &input.id)?;
        object_keys_to_snake_case(&mut input.data);
        check_columns(&entity.name, &input.data, |c| entity.field_by_column(c))?;
        if let Some(pk) = input.data.remove(entity.pk_column()) {
            if !values_equal(&pk, &input.id) {
                return Err(AppError::Validation(format!(
                    "{}.{}: primary key cannot be changed",
                    entity.name,
                    entity.pk_column()
                )));
            }
        }
        for (col, v) in &input.data {
            if let Some(f) = entity.field_by_column(col) {
                validate_field(&entity.name, f, v)?;
            }
        }
        Ok(input)
    }

    pub fn delete(entity: &ResolvedEntity, input: DeleteInput) -> Result<DeleteInput, AppError> {
        Self::key(&entity.name, entity.pk(), &input.id)?;
        Ok(input)
    }

    pub fn find_one(entity: &ResolvedEntity, input: FindOneInput) -> Result<FindOneInput, AppError> {
        Self::key(&entity.name, entity.pk(), &input.id)?;
        check_includes(entity, &input.include)?;
        Ok(input)
    }

    /// Normalize filters (unknown columns are ignored), check includes and clamp paging.
    pub fn list(entity: &ResolvedEntity, mut query: ListQuery) -> Result<ListQuery, AppError> {
        object_keys_to_snake_case(&mut query.filters);
        query.filters.retain(|col, _| {
            let known = entity.field_by_column(col).is_some();
            if !known {
                tracing::debug!(entity = %entity.name, column = %col, "ignoring unknown filter");
            }
            known
        });
        check_includes(entity, &query.include)?;
        let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        query.limit = Some(limit.clamp(1, MAX_LIST_LIMIT));
        Ok(query)
    }

    /// Validate a canonical junction link: both ids against their participant key types,
    /// the payload against the junction's payload fields.
    pub fn link(junction: &JunctionTable, mut link: JunctionLink) -> Result<JunctionLink, AppError> {
        Self::link_keys(junction, &link)?;
        object_keys_to_snake_case(&mut link.extra);
        let payload_field = |c: &str| junction.payload.iter().find(|f| f.column == c);
        check_columns(&junction.through, &link.extra, payload_field)?;
        for f in &junction.payload {
            match link.extra.get(&f.column) {
                None if f.required && f.default.is_none() => {
                    return Err(AppError::Validation(format!("{}.{} is required", junction.through, f.column)));
                }
                Some(v) => validate_field(&junction.through, f, v)?,
                None => {}
            }
        }
        Ok(link)
    }

    /// Check only the two participant ids of a link.
    pub fn link_keys(junction: &JunctionTable, link: &JunctionLink) -> Result<(), AppError> {
        let (src, tgt) = (&junction.source, &junction.target);
        check_key(&junction.through, &src.column, &src.ty, &link.source_id)?;
        check_key(&junction.through, &tgt.column, &tgt.ty, &link.target_id)
    }

    /// Check a primary-key value against the key field's type.
    pub fn key(owner: &str, field: &ResolvedField, value: &Value) -> Result<(), AppError> {
        check_key(owner, &field.column, &field.ty, value)
    }
}

fn check_key(owner: &str, column: &str, ty: &FieldType, value: &Value) -> Result<(), AppError> {
    if value.is_null() {
        return Err(AppError::Validation(format!("{}.{}: key may not be null", owner, column)));
    }
    check_type(owner, column, ty, value)
}

fn check_columns<'f>(
    owner: &str,
    payload: &Row,
    field: impl Fn(&str) -> Option<&'f ResolvedField>,
) -> Result<(), AppError> {
    for col in payload.keys() {
        match field(col) {
            None => return Err(AppError::Validation(format!("{}: unknown field '{}'", owner, col))),
            Some(f) if f.is_managed() => {
                return Err(AppError::Validation(format!(
                    "{}.{} is maintained automatically and cannot be set",
                    owner, col
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn check_includes(entity: &ResolvedEntity, include: &[String]) -> Result<(), AppError> {
    for name in include {
        if entity.include(name).is_none() {
            return Err(AppError::BadRequest(format!("{} has no relationship '{}'", entity.name, name)));
        }
    }
    Ok(())
}

fn validate_field(owner: &str, f: &ResolvedField, v: &Value) -> Result<(), AppError> {
    if v.is_null() {
        if f.required || f.primary_key {
            return Err(AppError::Validation(format!("{}.{} may not be null", owner, f.column)));
        }
        return Ok(());
    }
    if f.array {
        let items = v
            .as_array()
            .ok_or_else(|| AppError::Validation(format!("{}.{} must be an array", owner, f.column)))?;
        for item in items {
            validate_scalar(owner, f, item)?;
        }
        return Ok(());
    }
    validate_scalar(owner, f, v)
}

fn validate_scalar(owner: &str, f: &ResolvedField, v: &Value) -> Result<(), AppError> {
    let col = f.column.as_str();
    check_type(owner, col, &f.ty, v)?;
    let rules = &f.constraints;
    if let Some(s) = v.as_str() {
        let len = s.chars().count();
        if let Some(max) = rules.max_length {
            if len > max {
                return Err(AppError::Validation(format!(
                    "{}.{} must be at most {} characters",
                    owner, col, max
                )));
            }
        }
        if let Some(min) = rules.min_length {
            if len < min {
                return Err(AppError::Validation(format!(
                    "{}.{} must be at least {} characters",
                    owner, col, min
                )));
            }
        }
        if let Some(ref pattern) = rules.pattern {
            let re = Regex::new(pattern)
                .map_err(|_| AppError::Validation(format!("invalid pattern for {}.{}", owner, col)))?;
            if !re.is_match(s) {
                return Err(AppError::Validation(format!(
                    "{}.{} does not match required pattern",
                    owner, col
                )));
            }
        }
        if let Some(ref allowed) = rules.enum_values {
            if !allowed.iter().any(|a| a == s) {
                return Err(AppError::Validation(format!(
                    "{}.{} must be one of: {:?}",
                    owner,
                    col,
                    allowed.iter().take(5).collect::<Vec<_>>()
                )));
            }
        }
    }
    if let Some(n) = numeric(v) {
        if let Some(min) = rules.minimum {
            if n < min {
                return Err(AppError::Validation(format!("{}.{} must be at least {}", owner, col, min)));
            }
        }
        if let Some(max) = rules.maximum {
            if n > max {
                return Err(AppError::Validation(format!("{}.{} must be at most {}", owner, col, max)));
            }
        }
    }
    Ok(())
}

/// Numbers, and decimals written as strings.
fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn check_type(owner: &str, col: &str, ty: &FieldType, v: &Value) -> Result<(), AppError> {
    let ok = match ty {
        FieldType::String | FieldType::Text | FieldType::Enum => v.is_string(),
        FieldType::Integer => v
            .as_i64()
            .map(|n| n >= i32::MIN as i64 && n <= i32::MAX as i64)
            .unwrap_or(false),
        FieldType::BigInt => v.as_i64().is_some(),
        FieldType::Float => v.is_number(),
        FieldType::Decimal => {
            v.is_number() || v.as_str().map(|s| s.trim().parse::<f64>().is_ok()).unwrap_or(false)
        }
        FieldType::Boolean => v.is_boolean(),
        FieldType::Uuid => v.as_str().map(|s| uuid::Uuid::parse_str(s).is_ok()).unwrap_or(false),
        FieldType::Date => v
            .as_str()
            .map(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok())
            .unwrap_or(false),
        FieldType::DateTime => v.as_str().map(is_datetime).unwrap_or(false),
        FieldType::Json => true,
        // WKT text or a GeoJSON object.
        FieldType::Point | FieldType::Polygon | FieldType::Geometry => v.is_string() || v.is_object(),
        FieldType::Unknown(_) => true,
    };
    if ok {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "{}.{} must be a valid {}",
            owner,
            col,
            ty.as_str()
        )))
    }
}

fn is_datetime(s: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
        || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").is_ok()
}
