//! Build the resolved schema: declared fields, inferred foreign keys, junction tables,
//! one-to-one ownership and includes. Ordering is delegated to `order`.

use crate::case::{DefaultNaming, NamingStrategy};
use crate::config::order::dependency_order;
use crate::config::resolved::*;
use crate::config::validator::{positive_length, validate_with};
use crate::config::{EntityDefinition, FieldDefinition, FieldType, ModelDocument, RelationKind, RelationshipDefinition};
use crate::error::{ConfigError, Diagnostic, Diagnostics};
use std::collections::HashMap;

/// Validate, resolve and order a model document with the default naming strategy.
pub fn resolve(doc: &ModelDocument) -> Result<ResolvedSchema, ConfigError> {
    resolve_with(doc, &DefaultNaming)
}

/// Same as [`resolve`] with an injected naming strategy.
/// Any fatal diagnostic aborts; no partial schema is returned.
pub fn resolve_with(doc: &ModelDocument, naming: &dyn NamingStrategy) -> Result<ResolvedSchema, ConfigError> {
    let mut diagnostics = validate_with(doc, naming);
    if diagnostics.has_errors() {
        return Err(ConfigError::Invalid(diagnostics));
    }

    let mut resolver = Resolver::new(doc, naming);
    resolver.declare_entities();
    resolver.resolve_relationships(&mut diagnostics);
    if diagnostics.has_errors() {
        return Err(ConfigError::Invalid(diagnostics));
    }

    let mut schema = resolver.finish();
    let ordering = dependency_order(&schema.entities);
    schema.order = ordering.order;
    schema.deferred = ordering
        .dropped
        .iter()
        .map(|edge| {
            let entity = &schema.entities[edge.from];
            let field = &entity.fields[edge.field];
            let target = &schema.entities[edge.to];
            let reference = field.reference.as_ref();
            DeferredConstraint {
                entity: edge.from,
                table: entity.table_name.clone(),
                column: field.column.clone(),
                target: edge.to,
                target_table: target.table_name.clone(),
                target_column: reference
                    .map(|r| r.target_column.clone())
                    .unwrap_or_else(|| target.pk_column().to_string()),
                on_delete: reference.map(|r| r.on_delete).unwrap_or_default(),
                on_update: reference.map(|r| r.on_update).unwrap_or_default(),
                constraint_name: naming.foreign_key_constraint(&entity.table_name, &field.column),
            }
        })
        .collect();

    for w in diagnostics.warnings() {
        tracing::warn!("{}", w);
    }
    tracing::info!(
        entities = schema.entities.len(),
        junctions = schema.junctions.len(),
        deferred = schema.deferred.len(),
        "schema resolved"
    );
    schema.warnings = diagnostics;
    Ok(schema)
}

/// A oneToOne declaration and whether the declaring side owns the key.
struct OneToOneDecl {
    from: EntityId,
    to: EntityId,
    owns: bool,
    name: String,
}

struct Resolver<'a> {
    doc: &'a ModelDocument,
    naming: &'a dyn NamingStrategy,
    entities: Vec<ResolvedEntity>,
    by_name: HashMap<String, EntityId>,
    junctions: Vec<JunctionTable>,
    junction_by_through: HashMap<String, JunctionId>,
    enums: HashMap<&'a str, &'a [String]>,
    one_to_one: Vec<OneToOneDecl>,
}

impl<'a> Resolver<'a> {
    fn new(doc: &'a ModelDocument, naming: &'a dyn NamingStrategy) -> Self {
        let by_name = doc
            .entities
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();
        let enums = doc.enums.iter().map(|e| (e.name.as_str(), e.values.as_slice())).collect();
        Resolver {
            doc,
            naming,
            entities: Vec::with_capacity(doc.entities.len()),
            by_name,
            junctions: Vec::new(),
            junction_by_through: HashMap::new(),
            enums,
            one_to_one: Vec::new(),
        }
    }

    /// Declared fields, declared references, timestamp columns and declared indexes.
    fn declare_entities(&mut self) {
        for (id, def) in self.doc.entities.iter().enumerate() {
            let table_name = def.table.clone().unwrap_or_default();
            let mut fields: Vec<ResolvedField> = def
                .fields
                .iter()
                .map(|f| {
                    let mut rf = self.declared_field(f);
                    rf.reference = f.references.as_ref().and_then(|r| {
                        let target = *self.by_name.get(&r.entity)?;
                        let target_def = &self.doc.entities[target];
                        let target_column = match &r.field {
                            Some(tf) => self.naming.column_name(tf),
                            None => self.pk_column_of(target_def),
                        };
                        Some(ResolvedReference {
                            target,
                            target_entity: r.entity.clone(),
                            target_column,
                            on_delete: r.on_delete.as_deref().and_then(ReferentialAction::parse).unwrap_or_default(),
                            on_update: r.on_update.as_deref().and_then(ReferentialAction::parse).unwrap_or_default(),
                        })
                    });
                    rf
                })
                .collect();
            let pk_index = fields.iter().position(|f| f.primary_key).unwrap_or(0);

            if def.timestamps {
                for name in ["created_at", "updated_at"] {
                    if !fields.iter().any(|f| f.column == name) {
                        fields.push(managed_field(name, FieldType::DateTime, true, FieldOrigin::Timestamp));
                    }
                }
            }
            if def.soft_delete && !fields.iter().any(|f| f.column == "deleted_at") {
                fields.push(managed_field("deleted_at", FieldType::DateTime, false, FieldOrigin::SoftDelete));
            }

            let indexes = def
                .indexes
                .iter()
                .map(|idx| {
                    let columns: Vec<String> = idx.fields.iter().map(|f| self.naming.column_name(f)).collect();
                    IndexSpec {
                        name: idx
                            .name
                            .clone()
                            .unwrap_or_else(|| self.naming.index_name(&table_name, &columns)),
                        columns,
                        unique: idx.unique,
                    }
                })
                .collect();

            self.entities.push(ResolvedEntity {
                id,
                name: def.name.clone(),
                table_name: table_name.clone(),
                fields,
                indexes,
                includes: Vec::new(),
                timestamps: def.timestamps,
                soft_delete: def.soft_delete,
                pk_index,
                storage: TableSpec {
                    name: table_name,
                    primary_key: Vec::new(),
                    columns: Vec::new(),
                },
            });
        }
    }

    fn declared_field(&self, f: &FieldDefinition) -> ResolvedField {
        let enum_values = match (&f.enum_ref, &f.values) {
            (Some(name), _) => self.enums.get(name.as_str()).map(|v| v.to_vec()),
            (None, Some(values)) => Some(values.clone()),
            (None, None) => None,
        };
        ResolvedField {
            name: f.name.clone(),
            column: self.naming.column_name(&f.name),
            ty: f.type_.clone(),
            required: f.required || f.primary_key,
            unique: f.unique,
            primary_key: f.primary_key,
            array: f.array,
            indexed: f.index,
            default: f.default.clone(),
            reference: None,
            constraints: FieldConstraints {
                max_length: f.max_length.as_ref().and_then(positive_length),
                min_length: f.min_length.as_ref().and_then(positive_length),
                pattern: f.pattern.clone(),
                minimum: f.minimum,
                maximum: f.maximum,
                enum_values,
            },
            origin: FieldOrigin::Declared,
        }
    }

    fn pk_column_of(&self, def: &EntityDefinition) -> String {
        def.primary_keys()
            .next()
            .map(|f| self.naming.column_name(&f.name))
            .unwrap_or_else(|| "id".to_string())
    }

    fn pk_type(&self, id: EntityId) -> FieldType {
        self.entities[id].pk().ty.clone()
    }

    fn resolve_relationships(&mut self, out: &mut Diagnostics) {
        let doc = self.doc;
        for (from, def) in doc.entities.iter().enumerate() {
            for rel in &def.relationships {
                let Some(&to) = self.by_name.get(&rel.target) else {
                    // Unknown targets were reported by the validator.
                    continue;
                };
                match rel.kind {
                    RelationKind::OneToMany => self.one_to_many(out, from, to, rel),
                    RelationKind::ManyToOne => self.many_to_one(out, from, to, rel),
                    RelationKind::OneToOne => self.one_to_one(out, from, to, rel),
                    RelationKind::ManyToMany => self.many_to_many(out, from, to, rel),
                }
            }
        }
        self.check_one_to_one_ownership(out);
    }

    fn include_name(&self, rel: &RelationshipDefinition, to_many: bool) -> String {
        match &rel.name {
            Some(n) => n.clone(),
            None if to_many => self.naming.collection_name(&rel.target),
            None => crate::case::to_snake_case(&rel.target),
        }
    }

    /// A declares many B: B gets `<fk>` pointing at A's primary key.
    fn one_to_many(&mut self, out: &mut Diagnostics, from: EntityId, to: EntityId, rel: &RelationshipDefinition) {
        let from_name = self.entities[from].name.clone();
        let fk = rel
            .foreign_key
            .as_deref()
            .map(|k| self.naming.column_name(k))
            .unwrap_or_else(|| self.naming.foreign_key(&from_name));
        let name = self.include_name(rel, true);
        let action = rel.on_delete.as_deref().and_then(ReferentialAction::parse).unwrap_or_default();
        self.ensure_foreign_key(out, to, &fk, from, action, &from_name, &name);
        let our_key = self.entities[from].pk_column().to_string();
        self.entities[from].includes.push(IncludeSpec {
            name,
            direction: IncludeDirection::ToMany,
            related: to,
            our_key,
            their_key: fk,
            junction: None,
        });
    }

    /// A declares one B and holds the key.
    fn many_to_one(&mut self, out: &mut Diagnostics, from: EntityId, to: EntityId, rel: &RelationshipDefinition) {
        let to_name = self.entities[to].name.clone();
        let from_name = self.entities[from].name.clone();
        let fk = rel
            .foreign_key
            .as_deref()
            .map(|k| self.naming.column_name(k))
            .unwrap_or_else(|| self.naming.foreign_key(&to_name));
        let name = self.include_name(rel, false);
        let action = rel.on_delete.as_deref().and_then(ReferentialAction::parse).unwrap_or_default();
        self.ensure_foreign_key(out, from, &fk, to, action, &from_name, &name);
        let their_key = self.entities[to].pk_column().to_string();
        self.entities[from].includes.push(IncludeSpec {
            name,
            direction: IncludeDirection::ToOne,
            related: to,
            our_key: fk,
            their_key,
            junction: None,
        });
    }

    /// The side that already has the key column owns it; otherwise the declaration is the inverse view.
    fn one_to_one(&mut self, out: &mut Diagnostics, from: EntityId, to: EntityId, rel: &RelationshipDefinition) {
        let to_name = self.entities[to].name.clone();
        let from_name = self.entities[from].name.clone();
        let fk = rel
            .foreign_key
            .as_deref()
            .map(|k| self.naming.column_name(k))
            .unwrap_or_else(|| self.naming.foreign_key(&to_name));
        let name = self.include_name(rel, false);
        let owns = self.entities[from]
            .fields
            .iter()
            .any(|f| f.column == fk && f.origin == FieldOrigin::Declared);

        let include = if owns {
            let action = rel.on_delete.as_deref().and_then(ReferentialAction::parse).unwrap_or_default();
            self.ensure_foreign_key(out, from, &fk, to, action, &from_name, &name);
            if let Some(field) = self.entities[from].fields.iter_mut().find(|f| f.column == fk) {
                field.unique = true;
            }
            IncludeSpec {
                name: name.clone(),
                direction: IncludeDirection::ToOne,
                related: to,
                our_key: fk,
                their_key: self.entities[to].pk_column().to_string(),
                junction: None,
            }
        } else {
            let their_key = rel
                .foreign_key
                .as_deref()
                .map(|k| self.naming.column_name(k))
                .unwrap_or_else(|| self.naming.foreign_key(&from_name));
            IncludeSpec {
                name: name.clone(),
                direction: IncludeDirection::ToOne,
                related: to,
                our_key: self.entities[from].pk_column().to_string(),
                their_key,
                junction: None,
            }
        };
        self.entities[from].includes.push(include);
        self.one_to_one.push(OneToOneDecl { from, to, owns, name });
    }

    fn check_one_to_one_ownership(&self, out: &mut Diagnostics) {
        for decl in self.one_to_one.iter().filter(|d| !d.owns) {
            let from = &self.entities[decl.from];
            let to = &self.entities[decl.to];
            let owned_by_target = to
                .fields
                .iter()
                .any(|f| f.reference.as_ref().map(|r| r.target == decl.from).unwrap_or(false));
            if !owned_by_target {
                out.push(Diagnostic::warning(
                    Some(&from.name),
                    Some(&decl.name),
                    format!("oneToOne with '{}' has no owning side; no key column exists on either entity", to.name),
                ));
            }
        }
        for decl in self.one_to_one.iter().filter(|d| d.owns && d.from != d.to) {
            let both = self
                .one_to_one
                .iter()
                .any(|other| other.owns && other.from == decl.to && other.to == decl.from);
            if both && decl.from < decl.to {
                out.push(Diagnostic::error(
                    Some(&self.entities[decl.from].name),
                    Some(&decl.name),
                    format!(
                        "oneToOne between '{}' and '{}' is owned by both sides; exactly one may hold the key",
                        self.entities[decl.from].name, self.entities[decl.to].name
                    ),
                ));
            }
        }
    }

    /// Make `entity.column` a foreign key to `target`'s primary key, synthesizing the column if absent.
    #[allow(clippy::too_many_arguments)]
    fn ensure_foreign_key(
        &mut self,
        out: &mut Diagnostics,
        entity: EntityId,
        column: &str,
        target: EntityId,
        on_delete: ReferentialAction,
        declared_by: &str,
        relationship: &str,
    ) {
        let target_pk_type = self.pk_type(target);
        let target_pk = self.entities[target].pk_column().to_string();
        let target_name = self.entities[target].name.clone();
        let reference = ResolvedReference {
            target,
            target_entity: target_name.clone(),
            target_column: target_pk,
            on_delete,
            on_update: ReferentialAction::NoAction,
        };
        let owner = &mut self.entities[entity];
        if let Some(field) = owner.fields.iter_mut().find(|f| f.column == column) {
            if field.ty != target_pk_type {
                out.push(Diagnostic::error(
                    Some(&owner.name),
                    Some(column),
                    format!(
                        "foreign key '{}' is {} but {}'s primary key is {}",
                        column,
                        field.ty.as_str(),
                        target_name,
                        target_pk_type.as_str()
                    ),
                ));
                return;
            }
            match &field.reference {
                Some(existing) if existing.target != target => {
                    out.push(Diagnostic::error(
                        Some(&owner.name),
                        Some(column),
                        format!(
                            "'{}' already references '{}'; relationship '{}' expects '{}'",
                            column, existing.target_entity, relationship, target_name
                        ),
                    ));
                }
                Some(_) => {}
                None => field.reference = Some(reference),
            }
            field.indexed = true;
            return;
        }
        let mut field = managed_field(column, target_pk_type, false, FieldOrigin::InferredForeignKey {
            declared_by: declared_by.to_string(),
            relationship: relationship.to_string(),
        });
        field.indexed = true;
        field.reference = Some(reference);
        owner.fields.push(field);
    }

    fn many_to_many(&mut self, out: &mut Diagnostics, from: EntityId, to: EntityId, rel: &RelationshipDefinition) {
        let Some(through) = rel.through.clone() else { return };
        let from_name = self.entities[from].name.clone();
        let name = self.include_name(rel, true);

        let (junction, side) = match self.junction_by_through.get(&through).copied() {
            Some(jid) => {
                let j = &self.junctions[jid];
                let side = if j.is_self_referential() && from == to && j.source.entity == from {
                    // A second declaration on a self-referential junction is its inverse view.
                    JunctionSide::Target
                } else if j.source.entity == from && j.target.entity == to {
                    JunctionSide::Source
                } else if j.target.entity == from && j.source.entity == to {
                    JunctionSide::Target
                } else {
                    out.push(Diagnostic::error(
                        Some(&from_name),
                        Some(&name),
                        format!(
                            "through '{}' already joins '{}' and '{}'; cannot join '{}' and '{}'",
                            through, j.source.entity_name, j.target.entity_name, from_name, rel.target
                        ),
                    ));
                    return;
                };
                let ours = &j.end(side).column;
                let theirs = &j.end(side.opposite()).column;
                let mismatched = rel
                    .source_key
                    .as_deref()
                    .map(|k| self.naming.column_name(k) != *ours)
                    .unwrap_or(false)
                    || rel
                        .target_key
                        .as_deref()
                        .map(|k| self.naming.column_name(k) != *theirs)
                        .unwrap_or(false);
                if mismatched {
                    out.push(Diagnostic::error(
                        Some(&from_name),
                        Some(&name),
                        format!("keys for through '{}' disagree with its first declaration", through),
                    ));
                    return;
                }
                tracing::debug!(through = %through, entity = %from_name, "junction re-registered");
                (jid, side)
            }
            None => match self.materialize_junction(out, from, to, rel, &through) {
                Some(jid) => (jid, JunctionSide::Source),
                None => return,
            },
        };

        let our_key = self.entities[from].pk_column().to_string();
        let their_key = self.entities[to].pk_column().to_string();
        self.entities[from].includes.push(IncludeSpec {
            name,
            direction: IncludeDirection::ManyToMany,
            related: to,
            our_key,
            their_key,
            junction: Some((junction, side)),
        });
    }

    fn materialize_junction(
        &mut self,
        out: &mut Diagnostics,
        from: EntityId,
        to: EntityId,
        rel: &RelationshipDefinition,
        through: &str,
    ) -> Option<JunctionId> {
        let from_e = &self.entities[from];
        let to_e = &self.entities[to];
        let source_column = rel
            .source_key
            .as_deref()
            .map(|k| self.naming.column_name(k))
            .unwrap_or_else(|| self.naming.foreign_key(&from_e.name));
        let target_column = rel
            .target_key
            .as_deref()
            .map(|k| self.naming.column_name(k))
            .unwrap_or_else(|| {
                if from == to {
                    self.naming.self_junction_key(&to_e.name)
                } else {
                    self.naming.foreign_key(&to_e.name)
                }
            });
        if source_column == target_column {
            out.push(Diagnostic::error(
                Some(&from_e.name),
                rel.name.as_deref(),
                format!("junction '{}' would have two columns named '{}'", through, source_column),
            ));
            return None;
        }

        let source = JunctionEnd {
            entity: from,
            entity_name: from_e.name.clone(),
            column: source_column,
            ty: from_e.pk().ty.clone(),
            references: from_e.pk_column().to_string(),
        };
        let target = JunctionEnd {
            entity: to,
            entity_name: to_e.name.clone(),
            column: target_column,
            ty: to_e.pk().ty.clone(),
            references: to_e.pk_column().to_string(),
        };
        let payload: Vec<ResolvedField> = rel.fields.iter().map(|f| self.declared_field(f)).collect();
        for p in &payload {
            if p.column == source.column || p.column == target.column {
                out.push(Diagnostic::error(
                    Some(&from_e.name),
                    Some(&p.name),
                    format!("junction payload field '{}' collides with a key column", p.name),
                ));
                return None;
            }
        }

        let id = self.junctions.len();
        let table_name = self.naming.junction_table(through);
        tracing::debug!(through = %through, table = %table_name, "junction materialized");
        self.junctions.push(JunctionTable {
            id,
            through: through.to_string(),
            table_name: table_name.clone(),
            source,
            target,
            payload,
            timestamps: rel.timestamps,
            indexes: Vec::new(),
            storage: TableSpec {
                name: table_name,
                primary_key: Vec::new(),
                columns: Vec::new(),
            },
        });
        self.junction_by_through.insert(through.to_string(), id);
        Some(id)
    }

    /// Storage specs and implied indexes, once every column is known.
    fn finish(mut self) -> ResolvedSchema {
        for entity in &mut self.entities {
            let mut implied = Vec::new();
            for f in entity.fields.iter().filter(|f| f.indexed && !f.primary_key && !f.unique) {
                let covered = entity
                    .indexes
                    .iter()
                    .any(|i| i.columns.first().map(|c| *c == f.column).unwrap_or(false));
                if !covered {
                    let columns = vec![f.column.clone()];
                    implied.push(IndexSpec {
                        name: self.naming.index_name(&entity.table_name, &columns),
                        columns,
                        unique: false,
                    });
                }
            }
            entity.indexes.extend(implied);
            entity.storage = TableSpec {
                name: entity.table_name.clone(),
                primary_key: vec![entity.pk_column().to_string()],
                columns: entity
                    .fields
                    .iter()
                    .map(|f| ColumnSpec {
                        name: f.column.clone(),
                        ty: f.ty.clone(),
                        array: f.array,
                    })
                    .collect(),
            };
        }
        for j in &mut self.junctions {
            let mut columns = vec![
                ColumnSpec {
                    name: j.source.column.clone(),
                    ty: j.source.ty.clone(),
                    array: false,
                },
                ColumnSpec {
                    name: j.target.column.clone(),
                    ty: j.target.ty.clone(),
                    array: false,
                },
            ];
            columns.extend(j.payload.iter().map(|f| ColumnSpec {
                name: f.column.clone(),
                ty: f.ty.clone(),
                array: f.array,
            }));
            if j.timestamps {
                columns.push(ColumnSpec {
                    name: "created_at".into(),
                    ty: FieldType::DateTime,
                    array: false,
                });
            }
            let target_column = vec![j.target.column.clone()];
            j.indexes = vec![IndexSpec {
                name: self.naming.index_name(&j.table_name, &target_column),
                columns: target_column,
                unique: false,
            }];
            j.storage = TableSpec {
                name: j.table_name.clone(),
                primary_key: vec![j.source.column.clone(), j.target.column.clone()],
                columns,
            };
        }
        ResolvedSchema {
            entities: self.entities,
            order: Vec::new(),
            junctions: self.junctions,
            deferred: Vec::new(),
            warnings: Diagnostics::default(),
            by_name: self.by_name,
            junction_by_through: self.junction_by_through,
        }
    }
}

fn managed_field(column: &str, ty: FieldType, required: bool, origin: FieldOrigin) -> ResolvedField {
    ResolvedField {
        name: column.to_string(),
        column: column.to_string(),
        ty,
        required,
        unique: false,
        primary_key: false,
        array: false,
        indexed: false,
        default: None,
        reference: None,
        constraints: FieldConstraints::default(),
        origin,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(v: serde_json::Value) -> Result<ResolvedSchema, ConfigError> {
        resolve(&ModelDocument::from_value(v).unwrap())
    }

    #[test]
    fn one_to_many_synthesizes_foreign_key_on_target() {
        let schema = compile(json!({
            "entities": [
                { "name": "Customer", "table": "customers",
                  "fields": [{ "name": "id", "type": "uuid", "primaryKey": true }],
                  "relationships": [{ "kind": "oneToMany", "target": "Order" }] },
                { "name": "Order", "table": "orders",
                  "fields": [{ "name": "id", "type": "integer", "primaryKey": true }] }
            ]
        }))
        .unwrap();
        let order = schema.entity("Order").unwrap();
        let fk = order.field_by_column("customer_id").unwrap();
        assert_eq!(fk.ty, FieldType::Uuid);
        assert!(!fk.required);
        assert!(fk.indexed);
        assert_eq!(fk.reference.as_ref().unwrap().target_entity, "Customer");
        assert!(matches!(fk.origin, FieldOrigin::InferredForeignKey { .. }));
        assert!(order.indexes.iter().any(|i| i.columns == vec!["customer_id".to_string()]));

        let customer = schema.entity("Customer").unwrap();
        let inc = customer.include("orders").unwrap();
        assert_eq!(inc.direction, IncludeDirection::ToMany);
        assert_eq!(inc.their_key, "customer_id");
    }

    #[test]
    fn foreign_key_override_and_existing_field() {
        let schema = compile(json!({
            "entities": [
                { "name": "Author", "table": "authors",
                  "fields": [{ "name": "id", "type": "integer", "primaryKey": true }],
                  "relationships": [{ "name": "books", "kind": "oneToMany", "target": "Book", "foreignKey": "writtenBy" }] },
                { "name": "Book", "table": "books",
                  "fields": [
                    { "name": "id", "type": "integer", "primaryKey": true },
                    { "name": "writtenBy", "type": "integer" }
                  ] }
            ]
        }))
        .unwrap();
        let book = schema.entity("Book").unwrap();
        assert_eq!(book.fields.len(), 2);
        let fk = book.field_by_column("written_by").unwrap();
        assert_eq!(fk.origin, FieldOrigin::Declared);
        assert_eq!(fk.reference.as_ref().unwrap().target_entity, "Author");
    }

    #[test]
    fn synthesized_key_type_clash_is_fatal() {
        let err = compile(json!({
            "entities": [
                { "name": "Author", "table": "authors",
                  "fields": [{ "name": "id", "type": "uuid", "primaryKey": true }],
                  "relationships": [{ "kind": "oneToMany", "target": "Book" }] },
                { "name": "Book", "table": "books",
                  "fields": [
                    { "name": "id", "type": "integer", "primaryKey": true },
                    { "name": "author_id", "type": "integer" }
                  ] }
            ]
        }))
        .unwrap_err();
        let diags = err.diagnostics().unwrap();
        assert!(diags.errors().any(|d| d.message.contains("author_id")));
    }

    #[test]
    fn one_junction_per_through_from_either_side() {
        let schema = compile(json!({
            "entities": [
                { "name": "Employee", "table": "employees",
                  "fields": [{ "name": "id", "type": "integer", "primaryKey": true }],
                  "relationships": [{ "name": "skills", "kind": "manyToMany", "target": "Skill", "through": "employee_skill" }] },
                { "name": "Skill", "table": "skills",
                  "fields": [{ "name": "id", "type": "uuid", "primaryKey": true }],
                  "relationships": [{ "name": "employees", "kind": "manyToMany", "target": "Employee", "through": "employee_skill" }] }
            ]
        }))
        .unwrap();
        assert_eq!(schema.junctions.len(), 1);
        let j = schema.junction("employee_skill").unwrap();
        assert_eq!(j.source.column, "employee_id");
        assert_eq!(j.source.ty, FieldType::Integer);
        assert_eq!(j.target.column, "skill_id");
        assert_eq!(j.target.ty, FieldType::Uuid);
        assert_eq!(j.storage.primary_key, vec!["employee_id".to_string(), "skill_id".to_string()]);

        let from_employee = schema.entity("Employee").unwrap().include("skills").unwrap();
        let from_skill = schema.entity("Skill").unwrap().include("employees").unwrap();
        assert_eq!(from_employee.junction, Some((j.id, JunctionSide::Source)));
        assert_eq!(from_skill.junction, Some((j.id, JunctionSide::Target)));
    }

    #[test]
    fn incompatible_through_reuse_is_rejected() {
        let err = compile(json!({
            "entities": [
                { "name": "A", "table": "a", "fields": [{ "name": "id", "type": "integer", "primaryKey": true }],
                  "relationships": [{ "kind": "manyToMany", "target": "B", "through": "link" }] },
                { "name": "B", "table": "b", "fields": [{ "name": "id", "type": "integer", "primaryKey": true }] },
                { "name": "C", "table": "c", "fields": [{ "name": "id", "type": "integer", "primaryKey": true }],
                  "relationships": [{ "kind": "manyToMany", "target": "A", "through": "link" }] }
            ]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("through 'link' already joins"));
    }

    #[test]
    fn self_referential_many_to_many() {
        let schema = compile(json!({
            "entities": [
                { "name": "User", "table": "users", "fields": [{ "name": "id", "type": "integer", "primaryKey": true }],
                  "relationships": [
                    { "name": "following", "kind": "manyToMany", "target": "User", "through": "follows" },
                    { "name": "followers", "kind": "manyToMany", "target": "User", "through": "follows" }
                  ] }
            ]
        }))
        .unwrap();
        let j = schema.junction("follows").unwrap();
        assert_eq!(j.source.column, "user_id");
        assert_eq!(j.target.column, "related_user_id");
        let user = schema.entity("User").unwrap();
        assert_eq!(user.include("following").unwrap().junction.unwrap().1, JunctionSide::Source);
        assert_eq!(user.include("followers").unwrap().junction.unwrap().1, JunctionSide::Target);
    }

    #[test]
    fn one_to_one_ownership_is_detected() {
        let schema = compile(json!({
            "entities": [
                { "name": "User", "table": "users", "fields": [{ "name": "id", "type": "integer", "primaryKey": true }],
                  "relationships": [{ "name": "profile", "kind": "oneToOne", "target": "Profile" }] },
                { "name": "Profile", "table": "profiles",
                  "fields": [
                    { "name": "id", "type": "integer", "primaryKey": true },
                    { "name": "user_id", "type": "integer" }
                  ],
                  "relationships": [{ "name": "user", "kind": "oneToOne", "target": "User" }] }
            ]
        }))
        .unwrap();
        let user = schema.entity("User").unwrap();
        assert!(user.field_by_column("profile_id").is_none());
        let inverse = user.include("profile").unwrap();
        assert_eq!(inverse.our_key, "id");
        assert_eq!(inverse.their_key, "user_id");

        let profile = schema.entity("Profile").unwrap();
        let fk = profile.field_by_column("user_id").unwrap();
        assert!(fk.unique);
        assert_eq!(fk.reference.as_ref().unwrap().target_entity, "User");
        assert_eq!(schema.warnings.warnings().count(), 0);
    }

    #[test]
    fn one_to_one_without_owner_warns() {
        let schema = compile(json!({
            "entities": [
                { "name": "User", "table": "users", "fields": [{ "name": "id", "type": "integer", "primaryKey": true }],
                  "relationships": [{ "kind": "oneToOne", "target": "Passport" }] },
                { "name": "Passport", "table": "passports", "fields": [{ "name": "id", "type": "integer", "primaryKey": true }] }
            ]
        }))
        .unwrap();
        assert_eq!(schema.warnings.warnings().count(), 1);
    }

    #[test]
    fn timestamps_and_soft_delete_columns() {
        let schema = compile(json!({
            "entities": [{ "name": "Post", "table": "posts", "timestamps": true, "softDelete": true,
                "fields": [{ "name": "id", "type": "uuid", "primaryKey": true }] }]
        }))
        .unwrap();
        let post = schema.entity("Post").unwrap();
        let cols: Vec<&str> = post.storage.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(cols, vec!["id", "created_at", "updated_at", "deleted_at"]);
        assert!(post.field_by_column("deleted_at").unwrap().is_managed());
    }
}
