//! Resolved schema: entities with synthesized keys, junction tables and a dependency-safe order.
//! Entities live in an arena and refer to each other by index.

use crate::config::FieldType;
use crate::error::Diagnostics;
use serde_json::Value;
use std::collections::HashMap;

/// Index into `ResolvedSchema::entities`.
pub type EntityId = usize;
/// Index into `ResolvedSchema::junctions`.
pub type JunctionId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    /// Accepts "cascade", "CASCADE", "set null", "setNull", "SET_NULL"...
    pub fn parse(s: &str) -> Option<Self> {
        let norm: String = s
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .collect::<String>()
            .to_lowercase();
        match norm.as_str() {
            "noaction" => Some(ReferentialAction::NoAction),
            "restrict" => Some(ReferentialAction::Restrict),
            "cascade" => Some(ReferentialAction::Cascade),
            "setnull" => Some(ReferentialAction::SetNull),
            "setdefault" => Some(ReferentialAction::SetDefault),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }
}

/// Who put a field on the entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldOrigin {
    Declared,
    /// Foreign key synthesized for a relationship declared by `declared_by`.
    InferredForeignKey { declared_by: String, relationship: String },
    Timestamp,
    SoftDelete,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedReference {
    pub target: EntityId,
    pub target_entity: String,
    pub target_column: String,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

/// Payload constraints checked by the runtime validator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldConstraints {
    pub max_length: Option<usize>,
    pub min_length: Option<usize>,
    pub pattern: Option<String>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub enum_values: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedField {
    /// Declared name (may be camelCase).
    pub name: String,
    /// Storage column; payload and row keys use this.
    pub column: String,
    pub ty: FieldType,
    pub required: bool,
    pub unique: bool,
    pub primary_key: bool,
    pub array: bool,
    pub indexed: bool,
    pub default: Option<Value>,
    pub reference: Option<ResolvedReference>,
    pub constraints: FieldConstraints,
    pub origin: FieldOrigin,
}

impl ResolvedField {
    /// Maintained by the runtime (timestamps, soft-delete marker); never accepted from payloads.
    pub fn is_managed(&self) -> bool {
        matches!(self.origin, FieldOrigin::Timestamp | FieldOrigin::SoftDelete)
    }
}

/// Storage-facing view of a table: what a `Store` needs to read and write rows.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub ty: FieldType,
    pub array: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TableSpec {
    pub name: String,
    pub primary_key: Vec<String>,
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncludeDirection {
    /// We hold the key to them (or they hold the only key to us, one-to-one inverse).
    ToOne,
    /// They hold a key to us.
    ToMany,
    /// Linked through a junction table.
    ManyToMany,
}

/// Which participant column of a junction refers to a given entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JunctionSide {
    Source,
    Target,
}

impl JunctionSide {
    pub fn opposite(self) -> Self {
        match self {
            JunctionSide::Source => JunctionSide::Target,
            JunctionSide::Target => JunctionSide::Source,
        }
    }
}

/// A declared relationship as the runtime uses it for includes and junction access.
#[derive(Clone, Debug, PartialEq)]
pub struct IncludeSpec {
    pub name: String,
    pub direction: IncludeDirection,
    pub related: EntityId,
    /// Our column used in the join (our FK for to-one, our PK for to-many and many-to-many).
    pub our_key: String,
    /// Their column used in the join (their PK for to-one, their FK for to-many and many-to-many).
    pub their_key: String,
    /// Junction and the side the declaring entity sits on.
    pub junction: Option<(JunctionId, JunctionSide)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IndexSpec {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedEntity {
    pub id: EntityId,
    pub name: String,
    pub table_name: String,
    pub fields: Vec<ResolvedField>,
    pub indexes: Vec<IndexSpec>,
    pub includes: Vec<IncludeSpec>,
    pub timestamps: bool,
    pub soft_delete: bool,
    /// Index of the primary-key field in `fields`.
    pub pk_index: usize,
    pub storage: TableSpec,
}

impl ResolvedEntity {
    pub fn pk(&self) -> &ResolvedField {
        &self.fields[self.pk_index]
    }

    pub fn pk_column(&self) -> &str {
        &self.fields[self.pk_index].column
    }

    pub fn field_by_column(&self, column: &str) -> Option<&ResolvedField> {
        self.fields.iter().find(|f| f.column == column)
    }

    pub fn include(&self, name: &str) -> Option<&IncludeSpec> {
        self.includes.iter().find(|i| i.name == name)
    }

    /// Entities this one references through its own columns (self-references excluded).
    pub fn references(&self) -> impl Iterator<Item = (&ResolvedField, &ResolvedReference)> {
        self.fields
            .iter()
            .filter_map(|f| f.reference.as_ref().map(|r| (f, r)))
            .filter(move |(_, r)| r.target != self.id)
    }
}

/// One participant column of a junction table.
#[derive(Clone, Debug, PartialEq)]
pub struct JunctionEnd {
    pub entity: EntityId,
    pub entity_name: String,
    pub column: String,
    pub ty: FieldType,
    /// Referenced column (the participant's primary key).
    pub references: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JunctionTable {
    pub id: JunctionId,
    /// The `through` identifier this junction was materialized for.
    pub through: String,
    pub table_name: String,
    pub source: JunctionEnd,
    pub target: JunctionEnd,
    pub payload: Vec<ResolvedField>,
    pub timestamps: bool,
    /// Secondary indexes; the composite key already covers lookups by source.
    pub indexes: Vec<IndexSpec>,
    pub storage: TableSpec,
}

impl JunctionTable {
    pub fn end(&self, side: JunctionSide) -> &JunctionEnd {
        match side {
            JunctionSide::Source => &self.source,
            JunctionSide::Target => &self.target,
        }
    }

    pub fn is_self_referential(&self) -> bool {
        self.source.entity == self.target.entity
    }

    pub fn key_columns(&self) -> [&str; 2] {
        [&self.source.column, &self.target.column]
    }
}

/// Foreign key attached after every table exists, because its edge closed a cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct DeferredConstraint {
    pub entity: EntityId,
    pub table: String,
    pub column: String,
    pub target: EntityId,
    pub target_table: String,
    pub target_column: String,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
    pub constraint_name: String,
}

#[derive(Clone, Debug, Default)]
pub struct ResolvedSchema {
    /// Arena in declaration order; `EntityId` indexes into it.
    pub entities: Vec<ResolvedEntity>,
    /// Creation order: every entity after the entities it references, unless the edge is deferred.
    pub order: Vec<EntityId>,
    pub junctions: Vec<JunctionTable>,
    pub deferred: Vec<DeferredConstraint>,
    /// Non-fatal diagnostics collected while compiling.
    pub warnings: Diagnostics,
    pub(crate) by_name: HashMap<String, EntityId>,
    pub(crate) junction_by_through: HashMap<String, JunctionId>,
}

impl ResolvedSchema {
    pub fn entity(&self, name: &str) -> Option<&ResolvedEntity> {
        self.by_name.get(name).map(|id| &self.entities[*id])
    }

    pub fn entity_by_id(&self, id: EntityId) -> &ResolvedEntity {
        &self.entities[id]
    }

    pub fn junction(&self, through: &str) -> Option<&JunctionTable> {
        self.junction_by_through.get(through).map(|id| &self.junctions[*id])
    }

    pub fn junction_by_id(&self, id: JunctionId) -> &JunctionTable {
        &self.junctions[id]
    }

    /// Entities in creation order.
    pub fn ordered(&self) -> impl Iterator<Item = &ResolvedEntity> {
        self.order.iter().map(|id| &self.entities[*id])
    }

    pub fn creation_order(&self) -> Vec<&str> {
        self.ordered().map(|e| e.name.as_str()).collect()
    }

    /// Tables in teardown order: junctions first (newest first), then entities in reverse creation order.
    pub fn drop_order(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.junctions.iter().rev().map(|j| j.table_name.as_str()).collect();
        out.extend(self.order.iter().rev().map(|id| self.entities[*id].table_name.as_str()));
        out
    }

    pub fn is_deferred(&self, entity: EntityId, column: &str) -> bool {
        self.deferred.iter().any(|d| d.entity == entity && d.column == column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referential_action_parsing() {
        let cases = [
            ("cascade", Some(ReferentialAction::Cascade)),
            ("SET NULL", Some(ReferentialAction::SetNull)),
            ("setNull", Some(ReferentialAction::SetNull)),
            ("no_action", Some(ReferentialAction::NoAction)),
            ("Restrict", Some(ReferentialAction::Restrict)),
            ("explode", None),
        ];
        for (input, want) in cases {
            assert_eq!(ReferentialAction::parse(input), want, "input {}", input);
        }
    }
}
