//! Two-phase migration plan derived from a resolved schema: tables and indexes in
//! dependency order, then the foreign keys that had to wait for a cycle to close.
//! Steps are dialect-neutral; rendering them to DDL is left to an emitter.

use crate::config::{FieldType, ReferentialAction, ResolvedSchema};
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlannedColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub nullable: bool,
    pub unique: bool,
    pub array: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Inline reference, present only when the constraint is not deferred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<PlannedReference>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlannedReference {
    pub table: String,
    pub column: String,
    pub on_delete: &'static str,
    pub on_update: &'static str,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "camelCase")]
pub enum MigrationStep {
    CreateTable {
        table: String,
        columns: Vec<PlannedColumn>,
        primary_key: Vec<String>,
    },
    CreateIndex {
        table: String,
        name: String,
        columns: Vec<String>,
        unique: bool,
    },
    AddForeignKey {
        table: String,
        name: String,
        column: String,
        references: PlannedReference,
    },
    DropForeignKey {
        table: String,
        name: String,
    },
    DropTable {
        table: String,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MigrationPlan {
    /// Phase one: entity tables in creation order, then junction tables, each followed by its indexes.
    pub create: Vec<MigrationStep>,
    /// Phase two: deferred foreign keys.
    pub constrain: Vec<MigrationStep>,
    /// Teardown: deferred keys, junctions, then entities in reverse creation order.
    pub teardown: Vec<MigrationStep>,
}

impl MigrationPlan {
    /// Forward steps in execution order.
    pub fn forward(&self) -> impl Iterator<Item = &MigrationStep> {
        self.create.iter().chain(self.constrain.iter())
    }
}

pub fn plan_migrations(schema: &ResolvedSchema) -> MigrationPlan {
    let mut plan = MigrationPlan::default();

    for entity in schema.ordered() {
        let columns = entity
            .fields
            .iter()
            .map(|f| PlannedColumn {
                name: f.column.clone(),
                ty: column_type(&f.ty),
                nullable: !f.required && !f.primary_key,
                unique: f.unique && !f.primary_key,
                array: f.array,
                default: f.default.clone(),
                references: f
                    .reference
                    .as_ref()
                    .filter(|_| !schema.is_deferred(entity.id, &f.column))
                    .map(|r| PlannedReference {
                        table: schema.entity_by_id(r.target).table_name.clone(),
                        column: r.target_column.clone(),
                        on_delete: r.on_delete.as_str(),
                        on_update: r.on_update.as_str(),
                    }),
            })
            .collect();
        plan.create.push(MigrationStep::CreateTable {
            table: entity.table_name.clone(),
            columns,
            primary_key: entity.storage.primary_key.clone(),
        });
        for idx in &entity.indexes {
            plan.create.push(MigrationStep::CreateIndex {
                table: entity.table_name.clone(),
                name: idx.name.clone(),
                columns: idx.columns.clone(),
                unique: idx.unique,
            });
        }
    }

    for j in &schema.junctions {
        let mut columns: Vec<PlannedColumn> = [&j.source, &j.target]
            .into_iter()
            .map(|end| PlannedColumn {
                name: end.column.clone(),
                ty: column_type(&end.ty),
                nullable: false,
                unique: false,
                array: false,
                default: None,
                references: Some(PlannedReference {
                    table: schema.entity_by_id(end.entity).table_name.clone(),
                    column: end.references.clone(),
                    on_delete: ReferentialAction::Cascade.as_str(),
                    on_update: ReferentialAction::NoAction.as_str(),
                }),
            })
            .collect();
        columns.extend(j.payload.iter().map(|f| PlannedColumn {
            name: f.column.clone(),
            ty: column_type(&f.ty),
            nullable: !f.required,
            unique: f.unique,
            array: f.array,
            default: f.default.clone(),
            references: None,
        }));
        if j.timestamps {
            columns.push(PlannedColumn {
                name: "created_at".into(),
                ty: column_type(&FieldType::DateTime),
                nullable: false,
                unique: false,
                array: false,
                default: None,
                references: None,
            });
        }
        plan.create.push(MigrationStep::CreateTable {
            table: j.table_name.clone(),
            columns,
            primary_key: j.storage.primary_key.clone(),
        });
        for idx in &j.indexes {
            plan.create.push(MigrationStep::CreateIndex {
                table: j.table_name.clone(),
                name: idx.name.clone(),
                columns: idx.columns.clone(),
                unique: idx.unique,
            });
        }
    }

    for d in &schema.deferred {
        plan.constrain.push(MigrationStep::AddForeignKey {
            table: d.table.clone(),
            name: d.constraint_name.clone(),
            column: d.column.clone(),
            references: PlannedReference {
                table: d.target_table.clone(),
                column: d.target_column.clone(),
                on_delete: d.on_delete.as_str(),
                on_update: d.on_update.as_str(),
            },
        });
        plan.teardown.push(MigrationStep::DropForeignKey {
            table: d.table.clone(),
            name: d.constraint_name.clone(),
        });
    }
    for table in schema.drop_order() {
        plan.teardown.push(MigrationStep::DropTable { table: table.to_string() });
    }

    tracing::debug!(
        create = plan.create.len(),
        constrain = plan.constrain.len(),
        teardown = plan.teardown.len(),
        "migration plan built"
    );
    plan
}

/// Neutral type tag; an emitter maps it to its dialect.
fn column_type(ty: &FieldType) -> String {
    ty.as_str().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::NamingStrategy;
    use crate::config::{resolve, resolve_with, ModelDocument};
    use serde_json::json;

    fn model() -> ModelDocument {
        ModelDocument::from_value(json!({
            "entities": [
                { "name": "Department", "table": "departments",
                  "fields": [
                    { "name": "id", "type": "integer", "primaryKey": true },
                    { "name": "managerId", "type": "integer", "references": { "entity": "Employee" } }
                  ] },
                { "name": "Employee", "table": "employees",
                  "fields": [
                    { "name": "id", "type": "integer", "primaryKey": true },
                    { "name": "departmentId", "type": "integer", "required": true,
                      "references": { "entity": "Department", "onDelete": "cascade" } }
                  ],
                  "relationships": [{ "name": "skills", "kind": "manyToMany", "target": "Skill", "through": "employee_skill",
                                      "fields": [{ "name": "level", "type": "integer" }], "timestamps": true }] },
                { "name": "Skill", "table": "skills", "fields": [{ "name": "id", "type": "uuid", "primaryKey": true }] }
            ]
        }))
        .unwrap()
    }

    fn schema() -> ResolvedSchema {
        resolve(&model()).unwrap()
    }

    fn table_names(steps: &[MigrationStep]) -> Vec<&str> {
        steps
            .iter()
            .filter_map(|s| match s {
                MigrationStep::CreateTable { table, .. } | MigrationStep::DropTable { table } => Some(table.as_str()),
                _ => None,
            })
            .collect()
    }

    fn columns_of<'a>(plan: &'a MigrationPlan, name: &str) -> &'a Vec<PlannedColumn> {
        plan.create
            .iter()
            .find_map(|s| match s {
                MigrationStep::CreateTable { table, columns, .. } if table == name => Some(columns),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn cycle_is_split_into_two_phases() {
        let plan = plan_migrations(&schema());
        assert_eq!(table_names(&plan.create), vec!["employees", "departments", "skills", "employee_skill"]);

        // employees.department_id closes the cycle and is attached afterwards.
        let dept = columns_of(&plan, "employees").iter().find(|c| c.name == "department_id").unwrap();
        assert!(dept.references.is_none());
        assert!(!dept.nullable);

        assert_eq!(plan.constrain.len(), 1);
        match &plan.constrain[0] {
            MigrationStep::AddForeignKey { table, column, references, name } => {
                assert_eq!(table, "employees");
                assert_eq!(column, "department_id");
                assert_eq!(name, "fk_employees_department_id");
                assert_eq!(references.table, "departments");
                assert_eq!(references.on_delete, "CASCADE");
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn inline_references_point_at_earlier_tables() {
        let plan = plan_migrations(&schema());
        let manager = columns_of(&plan, "departments").iter().find(|c| c.name == "manager_id").unwrap();
        assert!(manager.nullable);
        let r = manager.references.as_ref().unwrap();
        assert_eq!(r.table, "employees");
        assert_eq!(r.column, "id");
        assert_eq!(r.on_delete, "NO ACTION");
    }

    #[test]
    fn junction_table_has_composite_key_and_payload() {
        let plan = plan_migrations(&schema());
        let (columns, pk) = plan
            .create
            .iter()
            .find_map(|s| match s {
                MigrationStep::CreateTable { table, columns, primary_key } if table == "employee_skill" => Some((columns, primary_key)),
                _ => None,
            })
            .unwrap();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["employee_id", "skill_id", "level", "created_at"]);
        assert_eq!(pk, &vec!["employee_id".to_string(), "skill_id".to_string()]);
        assert_eq!(columns[1].ty, "uuid");
    }

    #[test]
    fn teardown_reverses_creation() {
        let plan = plan_migrations(&schema());
        assert!(matches!(plan.teardown[0], MigrationStep::DropForeignKey { .. }));
        assert_eq!(table_names(&plan.teardown), vec!["employee_skill", "skills", "departments", "employees"]);
        let text = serde_json::to_value(&plan.teardown[0]).unwrap();
        assert_eq!(text["step"], "dropForeignKey");
    }

    struct DoubleUnderscore;

    impl NamingStrategy for DoubleUnderscore {
        fn pluralize(&self, word: &str) -> String {
            format!("{}s", word)
        }

        fn index_name(&self, table: &str, columns: &[String]) -> String {
            format!("{}__{}", table, columns.join("__"))
        }
    }

    #[test]
    fn junction_index_is_named_by_the_strategy() {
        let plan = plan_migrations(&resolve_with(&model(), &DoubleUnderscore).unwrap());
        let names: Vec<&str> = plan
            .create
            .iter()
            .filter_map(|s| match s {
                MigrationStep::CreateIndex { table, name, .. } if table == "employee_skill" => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["employee_skill__skill_id"]);

        let default = plan_migrations(&schema());
        assert!(default.create.iter().any(|s| matches!(
            s,
            MigrationStep::CreateIndex { name, .. } if name == "idx_employee_skill_skill_id"
        )));
    }
}
