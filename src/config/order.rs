//! Dependency ordering: referenced entities before the entities that reference them.
//! Edges that would close a cycle are dropped from the graph and reported, so the
//! caller can attach those constraints once every table exists.

use crate::config::resolved::{EntityId, ResolvedEntity};

/// A reference edge removed from the graph: `entities[from].fields[field]` points at `to`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DroppedEdge {
    pub from: EntityId,
    pub field: usize,
    pub to: EntityId,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DependencyOrder {
    pub order: Vec<EntityId>,
    pub dropped: Vec<DroppedEdge>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Depth-first topological sort over field references, visiting roots in declaration order.
/// Self-references are not edges. An edge to an entity still on the DFS stack is dropped.
pub fn dependency_order(entities: &[ResolvedEntity]) -> DependencyOrder {
    let mut marks = vec![Mark::Unvisited; entities.len()];
    let mut out = DependencyOrder {
        order: Vec::with_capacity(entities.len()),
        dropped: Vec::new(),
    };
    for id in 0..entities.len() {
        if marks[id] == Mark::Unvisited {
            visit(id, entities, &mut marks, &mut out);
        }
    }
    if !out.dropped.is_empty() {
        tracing::debug!(dropped = out.dropped.len(), "reference cycles broken");
    }
    out
}

fn visit(id: EntityId, entities: &[ResolvedEntity], marks: &mut [Mark], out: &mut DependencyOrder) {
    marks[id] = Mark::InProgress;
    for (field, f) in entities[id].fields.iter().enumerate() {
        let Some(r) = &f.reference else { continue };
        if r.target == id {
            continue;
        }
        match marks[r.target] {
            Mark::Done => {}
            Mark::InProgress => out.dropped.push(DroppedEdge {
                from: id,
                field,
                to: r.target,
            }),
            Mark::Unvisited => visit(r.target, entities, marks, out),
        }
    }
    marks[id] = Mark::Done;
    out.order.push(id);
}

#[cfg(test)]
mod tests {
    use crate::config::{resolve, EntityDefinition, FieldDefinition, FieldType, ModelDocument, ReferenceDefinition};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;

    fn entity(name: &str, refs: &[&str]) -> EntityDefinition {
        let mut e = EntityDefinition::new(name, &name.to_lowercase());
        let mut id = FieldDefinition::new("id", FieldType::Integer);
        id.primary_key = true;
        e.fields.push(id);
        for target in refs {
            let mut f = FieldDefinition::new(&format!("{}_ref", target.to_lowercase()), FieldType::Integer);
            f.references = Some(ReferenceDefinition {
                entity: target.to_string(),
                field: None,
                on_delete: None,
                on_update: None,
            });
            e.fields.push(f);
        }
        e
    }

    fn position(order: &[&str], name: &str) -> usize {
        order.iter().position(|n| *n == name).unwrap()
    }

    #[test]
    fn referenced_entities_come_first() {
        let doc = ModelDocument {
            entities: vec![entity("Order", &["Customer"]), entity("Customer", &[]), entity("Line", &["Order", "Product"]), entity("Product", &[])],
            enums: vec![],
        };
        let schema = resolve(&doc).unwrap();
        let order = schema.creation_order();
        assert_eq!(order, vec!["Customer", "Order", "Product", "Line"]);
        assert!(schema.deferred.is_empty());
    }

    #[test]
    fn relationship_keys_are_edges() {
        let schema = resolve(
            &ModelDocument::from_value(json!({
                "entities": [
                    { "name": "Customer", "table": "customers",
                      "fields": [{ "name": "id", "type": "integer", "primaryKey": true }],
                      "relationships": [{ "kind": "oneToMany", "target": "Order" }] },
                    { "name": "Order", "table": "orders",
                      "fields": [{ "name": "id", "type": "integer", "primaryKey": true }] },
                    { "name": "Product", "table": "products",
                      "fields": [{ "name": "id", "type": "integer", "primaryKey": true }],
                      "relationships": [{ "kind": "manyToMany", "target": "Order", "through": "order_product" }] }
                ]
            }))
            .unwrap(),
        )
        .unwrap();
        let order = schema.creation_order();
        assert!(position(&order, "Customer") < position(&order, "Order"));
        assert_eq!(schema.drop_order(), vec!["order_product", "products", "orders", "customers"]);
    }

    #[test]
    fn two_cycle_defers_exactly_one_edge() {
        let doc = ModelDocument {
            entities: vec![entity("A", &["B"]), entity("B", &["A"])],
            enums: vec![],
        };
        let schema = resolve(&doc).unwrap();
        assert_eq!(schema.creation_order(), vec!["B", "A"]);
        assert_eq!(schema.deferred.len(), 1);
        let d = &schema.deferred[0];
        assert_eq!(d.table, "b");
        assert_eq!(d.column, "a_ref");
        assert_eq!(d.target_table, "a");
        assert_eq!(d.constraint_name, "fk_b_a_ref");
        assert!(schema.is_deferred(d.entity, "a_ref"));
    }

    #[test]
    fn self_reference_is_not_an_edge() {
        let doc = ModelDocument {
            entities: vec![entity("Node", &["Node"])],
            enums: vec![],
        };
        let schema = resolve(&doc).unwrap();
        assert_eq!(schema.creation_order(), vec!["Node"]);
        assert!(schema.deferred.is_empty());
    }

    #[test]
    fn random_graphs_respect_every_kept_edge() {
        let mut rng = StdRng::seed_from_u64(7);
        for round in 0..200 {
            let n = rng.gen_range(1..9);
            let names: Vec<String> = (0..n).map(|i| format!("E{}", i)).collect();
            let acyclic = round % 2 == 0;
            let entities = (0..n)
                .map(|i| {
                    let refs: Vec<&str> = (0..n)
                        .filter(|&j| if acyclic { j < i } else { j != i })
                        .filter(|_| rng.gen_bool(0.35))
                        .map(|j| names[j].as_str())
                        .collect();
                    entity(&names[i], &refs)
                })
                .collect();
            let schema = resolve(&ModelDocument { entities, enums: vec![] }).unwrap();
            let order = schema.creation_order();
            assert_eq!(order.len(), n);
            if acyclic {
                assert!(schema.deferred.is_empty(), "round {}", round);
            }
            for e in &schema.entities {
                for (f, r) in e.references() {
                    if schema.is_deferred(e.id, &f.column) {
                        continue;
                    }
                    assert!(
                        position(&order, &schema.entities[r.target].name) < position(&order, &e.name),
                        "round {}: {} before {}",
                        round,
                        schema.entities[r.target].name,
                        e.name
                    );
                }
            }
        }
    }
}
