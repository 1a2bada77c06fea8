use std::collections::HashSet;

use serde::Serialize;

use super::types::{EntityDefinition, PermissionKind, RewriteRule, Schema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Entity,
    Relation,
    Attribute,
    Permission,
    Action,
    Rule,
    Logic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    /// Set when the target is subtracted or negated by `from`.
    pub exclusion: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl Graph {
    fn add_node(&mut self, id: String, node_type: NodeType, label: &str) -> String {
        if !self.nodes.iter().any(|n| n.id == id) {
            self.nodes.push(Node {
                id: id.clone(),
                node_type,
                label: label.to_string(),
            });
        }
        id
    }

    fn add_edge(&mut self, from: &str, to: &str, exclusion: bool) {
        self.edges.push(Edge {
            from: from.to_string(),
            to: to.to_string(),
            exclusion,
        });
    }
}

fn entity_id(entity: &str) -> String {
    format!("entity:{entity}")
}

/// Relations and permissions share one id space so edges can target either.
fn member_id(entity: &str, member: &str) -> String {
    format!("entity:{entity}:permission:{member}")
}

fn attribute_id(entity: &str, attribute: &str) -> String {
    format!("entity:{entity}:attribute:{attribute}")
}

fn rule_id(rule: &str) -> String {
    format!("rule:{rule}")
}

/// Projects the compiled schema into a node/edge graph for visualization.
pub fn schema_to_graph(schema: &Schema) -> Graph {
    let mut graph = Graph::default();

    for rule in &schema.rules {
        graph.add_node(rule_id(&rule.name), NodeType::Rule, &rule.name);
    }

    for entity in &schema.entities {
        let en = graph.add_node(entity_id(&entity.name), NodeType::Entity, &entity.name);

        for relation in &entity.relations {
            let rel = graph.add_node(
                member_id(&entity.name, &relation.name),
                NodeType::Relation,
                &relation.name,
            );
            graph.add_edge(&en, &rel, false);
            for subject in &relation.subject_types {
                let target = match &subject.relation {
                    Some(r) => member_id(&subject.type_name, r),
                    None => entity_id(&subject.type_name),
                };
                graph.add_edge(&rel, &target, false);
            }
        }

        for attribute in &entity.attributes {
            let attr = graph.add_node(
                attribute_id(&entity.name, &attribute.name),
                NodeType::Attribute,
                &attribute.name,
            );
            graph.add_edge(&en, &attr, false);
        }

        for permission in &entity.permissions {
            let node_type = match permission.kind {
                PermissionKind::Permission => NodeType::Permission,
                PermissionKind::Action => NodeType::Action,
            };
            let perm = graph.add_node(
                member_id(&entity.name, &permission.name),
                node_type,
                &permission.name,
            );
            graph.add_edge(&en, &perm, false);
            let mut counter = 0;
            add_rule(&mut graph, schema, entity, &perm, &permission.rule, false, &mut counter);
        }
    }

    dedup_edges(&mut graph);
    graph
}

fn add_rule(
    graph: &mut Graph,
    schema: &Schema,
    entity: &EntityDefinition,
    from: &str,
    rule: &RewriteRule,
    exclusion: bool,
    counter: &mut usize,
) {
    let mut operator = |graph: &mut Graph, label: &str| {
        let id = format!("{from}:{label}:{counter}");
        *counter += 1;
        let id = graph.add_node(id, NodeType::Logic, label);
        graph.add_edge(from, &id, exclusion);
        id
    };

    match rule {
        RewriteRule::Relation(name) | RewriteRule::Permission(name) => {
            graph.add_edge(from, &member_id(&entity.name, name), exclusion);
        }
        RewriteRule::Attribute(name) => {
            graph.add_edge(from, &attribute_id(&entity.name, name), exclusion);
        }
        RewriteRule::Arrow { tupleset, computed } => {
            let targets = entity
                .get_relation(tupleset)
                .map(|r| r.subject_types.clone())
                .unwrap_or_default();
            for target in targets {
                let declares = schema
                    .get_entity(&target.type_name)
                    .is_some_and(|e| e.member_kind(computed).is_some());
                if declares {
                    graph.add_edge(from, &member_id(&target.type_name, computed), exclusion);
                }
            }
        }
        RewriteRule::Call { rule, .. } => {
            graph.add_edge(from, &rule_id(rule), exclusion);
        }
        RewriteRule::Union(children) | RewriteRule::Intersection(children) => {
            let label = if matches!(rule, RewriteRule::Union(_)) {
                "union"
            } else {
                "intersection"
            };
            let op = operator(graph, label);
            for child in children {
                add_rule(graph, schema, entity, &op, child, false, counter);
            }
        }
        RewriteRule::Exclusion(base, excluded) => {
            let op = operator(graph, "exclusion");
            add_rule(graph, schema, entity, &op, base, false, counter);
            add_rule(graph, schema, entity, &op, excluded, true, counter);
        }
        RewriteRule::Negation(inner) => {
            let op = operator(graph, "negation");
            add_rule(graph, schema, entity, &op, inner, true, counter);
        }
    }
}

fn dedup_edges(graph: &mut Graph) {
    let mut seen = HashSet::new();
    graph
        .edges
        .retain(|e| seen.insert((e.from.clone(), e.to.clone(), e.exclusion)));
}
