//! Model validation: structural checks, enum rules and referential integrity.
//! Every problem is collected; nothing fails fast.

use crate::case::{DefaultNaming, NamingStrategy};
use crate::config::resolved::ReferentialAction;
use crate::config::{EntityDefinition, FieldDefinition, FieldType, ModelDocument, RelationKind, RelationshipDefinition};
use crate::error::{Diagnostic, Diagnostics};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Validate a whole document. Errors block compilation; warnings are carried into the schema.
pub fn validate(doc: &ModelDocument) -> Diagnostics {
    validate_with(doc, &DefaultNaming)
}

/// Same as [`validate`], deriving column names with `naming` the way the resolver will.
pub fn validate_with(doc: &ModelDocument, naming: &dyn NamingStrategy) -> Diagnostics {
    let mut out = Diagnostics::default();

    let mut enum_names = HashSet::new();
    for e in &doc.enums {
        if e.name.is_empty() {
            out.push(Diagnostic::error(None, None, "enum definition is missing a name"));
            continue;
        }
        if !enum_names.insert(e.name.as_str()) {
            out.push(Diagnostic::error(None, None, format!("duplicate enum '{}'", e.name)));
        }
        check_enum_values(&mut out, None, None, &e.name, &e.values);
    }

    let mut entities_by_name: HashMap<&str, &EntityDefinition> = HashMap::new();
    let mut tables = HashSet::new();
    for entity in &doc.entities {
        if entity.name.is_empty() {
            continue;
        }
        if entities_by_name.insert(entity.name.as_str(), entity).is_some() {
            out.push(Diagnostic::error(
                Some(&entity.name),
                None,
                format!("duplicate entity name '{}'", entity.name),
            ));
        }
        if let Some(table) = entity.table.as_deref().filter(|t| !t.is_empty()) {
            if !tables.insert(table) {
                out.push(Diagnostic::error(
                    Some(&entity.name),
                    None,
                    format!("duplicate table identifier '{}'", table),
                ));
            }
        }
    }

    for (i, entity) in doc.entities.iter().enumerate() {
        validate_entity(&mut out, doc, naming, i, entity, &entities_by_name, &enum_names, &tables);
    }

    out
}

#[allow(clippy::too_many_arguments)]
fn validate_entity(
    out: &mut Diagnostics,
    doc: &ModelDocument,
    naming: &dyn NamingStrategy,
    position: usize,
    entity: &EntityDefinition,
    entities: &HashMap<&str, &EntityDefinition>,
    enum_names: &HashSet<&str>,
    tables: &HashSet<&str>,
) {
    let label = if entity.name.is_empty() {
        format!("#{}", position)
    } else {
        entity.name.clone()
    };
    let ent = Some(label.as_str());

    if entity.name.is_empty() {
        out.push(Diagnostic::error(ent, None, "entity is missing a name"));
    }
    if entity.table.as_deref().map(str::is_empty).unwrap_or(true) {
        out.push(Diagnostic::error(ent, None, "entity is missing a table identifier"));
    }
    if entity.fields.is_empty() {
        out.push(Diagnostic::error(ent, None, "entity declares no fields"));
    }
    match entity.primary_keys().count() {
        0 if !entity.fields.is_empty() => {
            out.push(Diagnostic::error(ent, None, "entity has no primary key"));
        }
        0 | 1 => {}
        n => out.push(Diagnostic::error(
            ent,
            None,
            format!("entity declares {} primary keys; exactly one is required", n),
        )),
    }

    let mut field_names = HashSet::new();
    let mut columns: HashMap<String, &str> = HashMap::new();
    for field in &entity.fields {
        if field.name.is_empty() {
            out.push(Diagnostic::error(ent, None, "field is missing a name"));
            continue;
        }
        if !field_names.insert(field.name.as_str()) {
            out.push(Diagnostic::error(
                ent,
                Some(&field.name),
                format!("duplicate field name '{}'", field.name),
            ));
        } else {
            let column = naming.column_name(&field.name);
            match columns.get(&column) {
                Some(first) => out.push(Diagnostic::error(
                    ent,
                    Some(&field.name),
                    format!("duplicate column '{}' (from fields '{}' and '{}')", column, first, field.name),
                )),
                None => {
                    columns.insert(column, field.name.as_str());
                }
            }
        }
        validate_field(out, ent, field, entities, enum_names);
    }

    let mut rel_names = HashSet::new();
    for rel in &entity.relationships {
        let rel_label = rel.name.clone().unwrap_or_else(|| rel.target.clone());
        let fld = Some(rel_label.as_str());
        if let Some(name) = &rel.name {
            if !rel_names.insert(name.as_str()) {
                out.push(Diagnostic::error(ent, fld, format!("duplicate relationship name '{}'", name)));
            }
            if field_names.contains(name.as_str()) {
                out.push(Diagnostic::error(
                    ent,
                    fld,
                    format!("relationship name '{}' collides with a field", name),
                ));
            }
        }
        if rel.target.is_empty() {
            out.push(Diagnostic::error(ent, fld, "relationship is missing a target"));
        } else if rel.target != entity.name && !entities.contains_key(rel.target.as_str()) {
            out.push(Diagnostic::referential(
                ent,
                fld,
                format!("relationship target '{}' is not a known entity", rel.target),
            ));
        }
        if let Some(action) = &rel.on_delete {
            if ReferentialAction::parse(action).is_none() {
                out.push(Diagnostic::error(ent, fld, format!("unknown onDelete action '{}'", action)));
            }
        }
        match rel.kind {
            RelationKind::ManyToMany => {
                match rel.through.as_deref() {
                    None | Some("") => out.push(Diagnostic::error(
                        ent,
                        fld,
                        "manyToMany relationship requires a non-empty 'through'",
                    )),
                    Some(through) => {
                        if tables.contains(through) {
                            out.push(Diagnostic::error(
                                ent,
                                fld,
                                format!("through '{}' collides with an entity table", through),
                            ));
                        }
                    }
                }
                if let (Some(s), Some(t)) = (&rel.source_key, &rel.target_key) {
                    if s == t {
                        out.push(Diagnostic::error(ent, fld, "sourceKey and targetKey must differ"));
                    }
                }
                let mut payload_names = HashSet::new();
                for f in &rel.fields {
                    if f.primary_key {
                        out.push(Diagnostic::error(
                            ent,
                            Some(&f.name),
                            "junction payload fields cannot be primary keys",
                        ));
                    }
                    if !payload_names.insert(f.name.as_str()) {
                        out.push(Diagnostic::error(ent, Some(&f.name), "duplicate junction payload field"));
                    }
                    validate_field(out, ent, f, entities, enum_names);
                }
            }
            _ => {
                if rel.through.is_some() {
                    out.push(Diagnostic::warning(
                        ent,
                        fld,
                        format!("'through' is ignored on {} relationships", rel.kind.as_str()),
                    ));
                }
                if !rel.fields.is_empty() {
                    out.push(Diagnostic::warning(
                        ent,
                        fld,
                        "payload fields are only used by manyToMany relationships",
                    ));
                }
            }
        }
    }

    for idx in &entity.indexes {
        if idx.fields.is_empty() {
            out.push(Diagnostic::error(ent, None, "index declares no fields"));
        }
        for f in &idx.fields {
            let column = naming.column_name(f);
            if !columns.contains_key(&column) && !implied_column(doc, naming, entity, &column) {
                out.push(Diagnostic::error(
                    ent,
                    Some(f),
                    format!("index refers to unknown field '{}'", f),
                ));
            }
        }
    }
}

/// Indexes may name columns the resolver adds (foreign keys, timestamps).
fn implied_column(doc: &ModelDocument, naming: &dyn NamingStrategy, entity: &EntityDefinition, column: &str) -> bool {
    if entity.timestamps && (column == "created_at" || column == "updated_at") {
        return true;
    }
    if entity.soft_delete && column == "deleted_at" {
        return true;
    }
    let declared_key = |rel: &RelationshipDefinition| rel.foreign_key.as_deref().map(|k| naming.column_name(k));
    doc.entities
        .iter()
        .flat_map(|e| e.relationships.iter().map(move |r| (e, r)))
        .any(|(owner, rel)| match rel.kind {
            RelationKind::OneToMany if rel.target == entity.name => {
                declared_key(rel).unwrap_or_else(|| naming.foreign_key(&owner.name)) == column
            }
            RelationKind::ManyToOne if owner.name == entity.name => {
                declared_key(rel).unwrap_or_else(|| naming.foreign_key(&rel.target)) == column
            }
            _ => false,
        })
}

fn validate_field(
    out: &mut Diagnostics,
    ent: Option<&str>,
    field: &FieldDefinition,
    entities: &HashMap<&str, &EntityDefinition>,
    enum_names: &HashSet<&str>,
) {
    let fld = Some(field.name.as_str());

    if let FieldType::Unknown(t) = &field.type_ {
        out.push(Diagnostic::error(ent, fld, format!("unknown field type '{}'", t)));
    }

    if field.primary_key {
        if !field.type_.is_key_type() && !matches!(field.type_, FieldType::Unknown(_)) {
            out.push(Diagnostic::error(
                ent,
                fld,
                format!("type '{}' cannot be a primary key", field.type_.as_str()),
            ));
        }
        if field.array {
            out.push(Diagnostic::error(ent, fld, "array fields cannot be primary keys"));
        }
    }

    match field.type_ {
        FieldType::Enum => match (&field.enum_ref, &field.values) {
            (Some(_), Some(_)) => out.push(Diagnostic::error(
                ent,
                fld,
                "enum field must declare either a named enum or inline values, not both",
            )),
            (None, None) => out.push(Diagnostic::error(
                ent,
                fld,
                "enum field must declare a named enum or inline values",
            )),
            (Some(name), None) => {
                if !enum_names.contains(name.as_str()) {
                    out.push(Diagnostic::referential(
                        ent,
                        fld,
                        format!("enum '{}' is not defined", name),
                    ));
                }
            }
            (None, Some(values)) => check_enum_values(out, ent, fld, &field.name, values),
        },
        _ => {
            if field.enum_ref.is_some() || field.values.is_some() {
                out.push(Diagnostic::warning(ent, fld, "enum values are ignored on non-enum fields"));
            }
        }
    }

    for (key, raw) in [("maxLength", &field.max_length), ("minLength", &field.min_length)] {
        if let Some(v) = raw {
            if positive_length(v).is_none() {
                out.push(Diagnostic::warning(
                    ent,
                    fld,
                    format!("{} is not a positive integer: {}", key, v),
                ));
            } else if !field.type_.is_textual() {
                out.push(Diagnostic::warning(
                    ent,
                    fld,
                    format!("{} only applies to string fields", key),
                ));
            }
        }
    }

    if let Some(pattern) = &field.pattern {
        if regex::Regex::new(pattern).is_err() {
            out.push(Diagnostic::error(ent, fld, format!("invalid pattern '{}'", pattern)));
        }
    }

    if let (Some(min), Some(max)) = (field.minimum, field.maximum) {
        if min > max {
            out.push(Diagnostic::warning(ent, fld, "minimum is greater than maximum"));
        }
    }

    if let Some(default) = &field.default {
        if !default_matches_type(default, &field.type_) {
            out.push(Diagnostic::warning(
                ent,
                fld,
                format!("default {} does not match type '{}'", default, field.type_.as_str()),
            ));
        }
    }

    if let Some(r) = &field.references {
        match entities.get(r.entity.as_str()) {
            None if Some(r.entity.as_str()) != ent => out.push(Diagnostic::referential(
                ent,
                fld,
                format!("references unknown entity '{}'", r.entity),
            )),
            None => {}
            Some(target) => {
                if let Some(tf) = &r.field {
                    if target.field(tf).is_none() {
                        out.push(Diagnostic::referential(
                            ent,
                            fld,
                            format!("references unknown field '{}.{}'", r.entity, tf),
                        ));
                    }
                }
            }
        }
        for (key, action) in [("onDelete", &r.on_delete), ("onUpdate", &r.on_update)] {
            if let Some(a) = action {
                match ReferentialAction::parse(a) {
                    None => out.push(Diagnostic::error(ent, fld, format!("unknown {} action '{}'", key, a))),
                    Some(ReferentialAction::SetNull) if field.required => out.push(Diagnostic::warning(
                        ent,
                        fld,
                        format!("{} SET NULL on a required field", key),
                    )),
                    Some(_) => {}
                }
            }
        }
    }
}

fn check_enum_values(out: &mut Diagnostics, ent: Option<&str>, fld: Option<&str>, name: &str, values: &[String]) {
    if values.is_empty() {
        out.push(Diagnostic::error(ent, fld, format!("enum '{}' has no values", name)));
        return;
    }
    let mut seen = HashSet::new();
    for v in values {
        if !seen.insert(v.as_str()) {
            out.push(Diagnostic::error(ent, fld, format!("enum '{}' repeats value '{}'", name, v)));
        }
    }
}

/// Parse a length constraint; `None` when it is not a positive integer.
pub(crate) fn positive_length(v: &Value) -> Option<usize> {
    match v {
        Value::Number(n) => n.as_u64().filter(|n| *n > 0).map(|n| n as usize),
        Value::String(s) => s.trim().parse::<usize>().ok().filter(|n| *n > 0),
        _ => None,
    }
}

fn default_matches_type(v: &Value, ty: &FieldType) -> bool {
    match (ty, v) {
        (_, Value::Null) => true,
        (FieldType::String | FieldType::Text | FieldType::Enum | FieldType::Uuid, Value::String(_)) => true,
        (FieldType::Date | FieldType::DateTime, Value::String(_)) => true,
        (FieldType::Integer | FieldType::BigInt, Value::Number(n)) => n.is_i64() || n.is_u64(),
        (FieldType::Float | FieldType::Decimal, Value::Number(_)) => true,
        (FieldType::Decimal, Value::String(s)) => s.parse::<f64>().is_ok(),
        (FieldType::Boolean, Value::Bool(_)) => true,
        (FieldType::Json, _) => true,
        (t, _) if t.is_spatial() => true,
        (FieldType::Unknown(_), _) => true,
        _ => false,
    }
}
