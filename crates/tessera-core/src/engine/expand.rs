use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;

use crate::attribute::AttributeValue;
use crate::context::Context;
use crate::schema::types::{EntityDefinition, MemberKind, RewriteRule, Schema};
use crate::tuple::{EntityRef, SnapshotToken, SubjectRef, TupleFilter};

use super::{CheckError, DataReader, EngineConfig, Overlay};

#[derive(Debug, Clone)]
pub struct ExpandRequest {
    pub entity: EntityRef,
    pub permission: String,
    pub context: Context,
    pub snapshot: Option<SnapshotToken>,
    pub depth: Option<u32>,
}

/// Permission expression with every leaf resolved against stored data.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpandTree {
    Leaf {
        subject: SubjectRef,
    },
    Relation {
        entity: EntityRef,
        relation: String,
        children: Vec<ExpandTree>,
    },
    Attribute {
        entity: EntityRef,
        attribute: String,
        value: AttributeValue,
    },
    Call {
        entity: EntityRef,
        rule: String,
        arguments: BTreeMap<String, AttributeValue>,
    },
    Union {
        children: Vec<ExpandTree>,
    },
    Intersection {
        children: Vec<ExpandTree>,
    },
    Exclusion {
        base: Box<ExpandTree>,
        excluded: Box<ExpandTree>,
    },
    Negation {
        child: Box<ExpandTree>,
    },
    Arrow {
        entity: EntityRef,
        tupleset: String,
        computed: String,
        children: Vec<ExpandTree>,
    },
}

type BoxFuture<'a> = Pin<Box<dyn Future<Output = Result<ExpandTree, CheckError>> + Send + 'a>>;

/// Members currently being expanded; revisiting one yields a leaf instead of recursing.
type Path = [(EntityRef, String)];

pub struct ExpandEngine<R: DataReader> {
    reader: Arc<R>,
    schema: Arc<Schema>,
    config: EngineConfig,
}

impl<R: DataReader> ExpandEngine<R> {
    pub fn new(reader: Arc<R>, schema: Arc<Schema>, config: EngineConfig) -> Self {
        Self {
            reader,
            schema,
            config,
        }
    }

    pub async fn expand(&self, request: &ExpandRequest) -> Result<ExpandTree, CheckError> {
        let def = self.entity_def(&request.entity.entity_type)?;
        if def.member_kind(&request.permission).is_none() {
            return Err(CheckError::PermissionNotFound {
                entity: request.entity.entity_type.clone(),
                permission: request.permission.clone(),
            });
        }

        let overlay = Overlay::new(self.reader.as_ref(), &request.context, request.snapshot);
        let depth = self.config.effective_depth(request.depth);
        self.expand_member(&overlay, &request.entity, &request.permission, &[], depth)
            .await
    }

    fn entity_def(&self, entity_type: &str) -> Result<&EntityDefinition, CheckError> {
        self.schema
            .get_entity(entity_type)
            .ok_or_else(|| CheckError::EntityNotFound(entity_type.to_string()))
    }

    fn expand_member<'a>(
        &'a self,
        overlay: &'a Overlay<'a, R>,
        entity: &'a EntityRef,
        name: &'a str,
        path: &'a Path,
        depth: u32,
    ) -> BoxFuture<'a> {
        Box::pin(async move {
            if depth == 0 {
                return Err(CheckError::DepthExceeded(self.config.max_depth));
            }
            if path.iter().any(|(e, n)| e == entity && n == name) {
                return Ok(ExpandTree::Leaf {
                    subject: SubjectRef::userset(&entity.entity_type, &entity.entity_id, name),
                });
            }

            let mut path = path.to_vec();
            path.push((entity.clone(), name.to_string()));

            let def = self.entity_def(&entity.entity_type)?;
            match def.member_kind(name) {
                Some(MemberKind::Relation) => {
                    self.expand_relation(overlay, entity, name, &path, depth).await
                }
                Some(MemberKind::Permission) => {
                    let Some(permission) = def.get_permission(name) else {
                        return Err(CheckError::PermissionNotFound {
                            entity: entity.entity_type.clone(),
                            permission: name.to_string(),
                        });
                    };
                    self.expand_rule(overlay, def, &permission.rule, entity, &path, depth)
                        .await
                }
                Some(MemberKind::Attribute) => {
                    let value = self.attribute_value(overlay, def, entity, name).await?;
                    Ok(ExpandTree::Attribute {
                        entity: entity.clone(),
                        attribute: name.to_string(),
                        value,
                    })
                }
                None => Err(CheckError::PermissionNotFound {
                    entity: entity.entity_type.clone(),
                    permission: name.to_string(),
                }),
            }
        })
    }

    fn expand_rule<'a>(
        &'a self,
        overlay: &'a Overlay<'a, R>,
        def: &'a EntityDefinition,
        rule: &'a RewriteRule,
        entity: &'a EntityRef,
        path: &'a Path,
        depth: u32,
    ) -> BoxFuture<'a> {
        Box::pin(async move {
            match rule {
                RewriteRule::Relation(name) | RewriteRule::Permission(name) => {
                    self.expand_member(overlay, entity, name, path, depth - 1).await
                }
                RewriteRule::Attribute(name) => {
                    let value = self.attribute_value(overlay, def, entity, name).await?;
                    Ok(ExpandTree::Attribute {
                        entity: entity.clone(),
                        attribute: name.clone(),
                        value,
                    })
                }
                RewriteRule::Arrow { tupleset, computed } => {
                    self.expand_arrow(overlay, entity, tupleset, computed, path, depth)
                        .await
                }
                RewriteRule::Call { rule, arguments } => {
                    let mut values = BTreeMap::new();
                    let parameters = self
                        .schema
                        .get_rule(rule)
                        .map(|r| r.parameters.as_slice())
                        .unwrap_or_default();
                    for (param, argument) in parameters.iter().zip(arguments) {
                        let value = self.attribute_value(overlay, def, entity, argument).await?;
                        values.insert(param.name.clone(), value);
                    }
                    Ok(ExpandTree::Call {
                        entity: entity.clone(),
                        rule: rule.clone(),
                        arguments: values,
                    })
                }
                RewriteRule::Union(children) => {
                    let mut expanded = Vec::new();
                    for child in children {
                        expanded.push(self.expand_rule(overlay, def, child, entity, path, depth).await?);
                    }
                    Ok(ExpandTree::Union { children: expanded })
                }
                RewriteRule::Intersection(children) => {
                    let mut expanded = Vec::new();
                    for child in children {
                        expanded.push(self.expand_rule(overlay, def, child, entity, path, depth).await?);
                    }
                    Ok(ExpandTree::Intersection { children: expanded })
                }
                RewriteRule::Exclusion(base, excluded) => {
                    let base = self.expand_rule(overlay, def, base, entity, path, depth).await?;
                    let excluded = self
                        .expand_rule(overlay, def, excluded, entity, path, depth)
                        .await?;
                    Ok(ExpandTree::Exclusion {
                        base: Box::new(base),
                        excluded: Box::new(excluded),
                    })
                }
                RewriteRule::Negation(inner) => {
                    let child = self.expand_rule(overlay, def, inner, entity, path, depth).await?;
                    Ok(ExpandTree::Negation {
                        child: Box::new(child),
                    })
                }
            }
        })
    }

    async fn expand_relation(
        &self,
        overlay: &Overlay<'_, R>,
        entity: &EntityRef,
        relation: &str,
        path: &Path,
        depth: u32,
    ) -> Result<ExpandTree, CheckError> {
        let filter = TupleFilter {
            entity_type: Some(entity.entity_type.clone()),
            entity_id: Some(entity.entity_id.clone()),
            relation: Some(relation.to_string()),
            ..Default::default()
        };
        let tuples = overlay.tuples(&filter).await?;

        let mut children = Vec::with_capacity(tuples.len());
        for tuple in &tuples {
            match tuple.subject.subject_relation {
                Some(ref subject_relation) => {
                    let userset = tuple.subject.entity();
                    children.push(
                        self.expand_member(overlay, &userset, subject_relation, path, depth - 1)
                            .await?,
                    );
                }
                None => children.push(ExpandTree::Leaf {
                    subject: tuple.subject.clone(),
                }),
            }
        }

        Ok(ExpandTree::Relation {
            entity: entity.clone(),
            relation: relation.to_string(),
            children,
        })
    }

    async fn expand_arrow(
        &self,
        overlay: &Overlay<'_, R>,
        entity: &EntityRef,
        tupleset: &str,
        computed: &str,
        path: &Path,
        depth: u32,
    ) -> Result<ExpandTree, CheckError> {
        let filter = TupleFilter {
            entity_type: Some(entity.entity_type.clone()),
            entity_id: Some(entity.entity_id.clone()),
            relation: Some(tupleset.to_string()),
            ..Default::default()
        };
        let tuples = overlay.tuples(&filter).await?;

        let mut children = Vec::new();
        for tuple in &tuples {
            let declares = self
                .schema
                .get_entity(&tuple.subject.subject_type)
                .is_some_and(|d| d.member_kind(computed).is_some());
            if !declares {
                continue;
            }
            let target = tuple.subject.entity();
            children.push(
                self.expand_member(overlay, &target, computed, path, depth - 1)
                    .await?,
            );
        }

        Ok(ExpandTree::Arrow {
            entity: entity.clone(),
            tupleset: tupleset.to_string(),
            computed: computed.to_string(),
            children,
        })
    }

    async fn attribute_value(
        &self,
        overlay: &Overlay<'_, R>,
        def: &EntityDefinition,
        entity: &EntityRef,
        name: &str,
    ) -> Result<AttributeValue, CheckError> {
        let Some(declared) = def.get_attribute(name) else {
            return Err(CheckError::InvalidArgument(format!(
                "attribute '{name}' is not declared on entity '{}'",
                def.name
            )));
        };
        Ok(overlay
            .attribute(entity, name)
            .await?
            .filter(|v| v.attribute_type() == declared.attribute_type)
            .unwrap_or_else(|| declared.attribute_type.zero_value()))
    }
}
