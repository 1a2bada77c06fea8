use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value, json};

use crate::attribute::AttributeValue;
use crate::context::Context;
use crate::rule;
use crate::schema::types::{EntityDefinition, MemberKind, RewriteRule, Schema};
use crate::tuple::{EntityRef, SnapshotToken, SubjectRef, TupleFilter};

use super::{CheckError, DataReader, EngineConfig, Overlay};

#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub entity: EntityRef,
    pub permission: String,
    pub subject: SubjectRef,
    pub context: Context,
    pub snapshot: Option<SnapshotToken>,
    /// Overrides the configured depth budget when lower.
    pub depth: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub allowed: bool,
}

#[derive(Debug, Clone)]
pub struct SubjectPermissionRequest {
    pub entity: EntityRef,
    pub subject: SubjectRef,
    pub context: Context,
    pub snapshot: Option<SnapshotToken>,
    pub depth: Option<u32>,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CheckError>> + Send + 'a>>;

struct Evaluation<'a, R: DataReader> {
    overlay: Overlay<'a, R>,
    subject: &'a SubjectRef,
}

pub struct CheckEngine<R: DataReader> {
    reader: Arc<R>,
    schema: Arc<Schema>,
    config: EngineConfig,
}

impl<R: DataReader> Clone for CheckEngine<R> {
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
            schema: Arc::clone(&self.schema),
            config: self.config.clone(),
        }
    }
}

impl<R: DataReader> CheckEngine<R> {
    pub fn new(reader: Arc<R>, schema: Arc<Schema>, config: EngineConfig) -> Self {
        Self {
            reader,
            schema,
            config,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn reader(&self) -> &R {
        &self.reader
    }

    pub async fn check(&self, request: &CheckRequest) -> Result<CheckResult, CheckError> {
        let def = self.entity_def(&request.entity.entity_type)?;
        if def.member_kind(&request.permission).is_none() {
            return Err(CheckError::PermissionNotFound {
                entity: request.entity.entity_type.clone(),
                permission: request.permission.clone(),
            });
        }

        let ev = Evaluation {
            overlay: Overlay::new(self.reader.as_ref(), &request.context, request.snapshot),
            subject: &request.subject,
        };
        let depth = self.config.effective_depth(request.depth);
        let allowed = self
            .check_member(&ev, &request.entity, &request.permission, depth)
            .await?;

        tracing::debug!(
            entity = %request.entity,
            permission = %request.permission,
            subject = %request.subject,
            allowed,
            "check evaluated"
        );
        Ok(CheckResult { allowed })
    }

    /// Evaluates every permission and action of the entity's type for one subject.
    pub async fn subject_permission(
        &self,
        request: &SubjectPermissionRequest,
    ) -> Result<BTreeMap<String, bool>, CheckError> {
        let def = self.entity_def(&request.entity.entity_type)?;
        let ev = Evaluation {
            overlay: Overlay::new(self.reader.as_ref(), &request.context, request.snapshot),
            subject: &request.subject,
        };
        let depth = self.config.effective_depth(request.depth);

        let mut results = BTreeMap::new();
        for permission in &def.permissions {
            let allowed = self
                .check_member(&ev, &request.entity, &permission.name, depth)
                .await?;
            results.insert(permission.name.clone(), allowed);
        }
        Ok(results)
    }

    fn entity_def(&self, entity_type: &str) -> Result<&EntityDefinition, CheckError> {
        self.schema
            .get_entity(entity_type)
            .ok_or_else(|| CheckError::EntityNotFound(entity_type.to_string()))
    }

    /// One hop of evaluation; every call spends one unit of depth.
    fn check_member<'a>(
        &'a self,
        ev: &'a Evaluation<'a, R>,
        entity: &'a EntityRef,
        name: &'a str,
        depth: u32,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            if depth == 0 {
                return Err(CheckError::DepthExceeded(self.config.max_depth));
            }

            if let Some(ref rel) = ev.subject.subject_relation
                && rel == name
                && ev.subject.subject_type == entity.entity_type
                && ev.subject.subject_id == entity.entity_id
            {
                return Ok(true);
            }

            let def = self.entity_def(&entity.entity_type)?;
            match def.member_kind(name) {
                Some(MemberKind::Relation) => self.evaluate_relation(ev, entity, name, depth).await,
                Some(MemberKind::Permission) => {
                    let rule = def
                        .get_permission(name)
                        .map(|p| &p.rule)
                        .ok_or_else(|| permission_not_found(entity, name))?;
                    self.evaluate_rule(ev, def, rule, entity, depth).await
                }
                Some(MemberKind::Attribute) => self.evaluate_attribute(ev, def, entity, name).await,
                None => Err(permission_not_found(entity, name)),
            }
        })
    }

    fn evaluate_rule<'a>(
        &'a self,
        ev: &'a Evaluation<'a, R>,
        def: &'a EntityDefinition,
        rule: &'a RewriteRule,
        entity: &'a EntityRef,
        depth: u32,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            match rule {
                RewriteRule::Relation(name) => self.evaluate_relation(ev, entity, name, depth).await,
                RewriteRule::Permission(name) => {
                    self.check_member(ev, entity, name, depth - 1).await
                }
                RewriteRule::Attribute(name) => self.evaluate_attribute(ev, def, entity, name).await,
                RewriteRule::Arrow { tupleset, computed } => {
                    self.evaluate_arrow(ev, entity, tupleset, computed, depth).await
                }
                RewriteRule::Call { rule, arguments } => {
                    self.evaluate_call(ev, def, entity, rule, arguments).await
                }
                RewriteRule::Union(children) => {
                    for child in children {
                        if self.evaluate_rule(ev, def, child, entity, depth).await? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                RewriteRule::Intersection(children) => {
                    for child in children {
                        if !self.evaluate_rule(ev, def, child, entity, depth).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                RewriteRule::Exclusion(base, excluded) => {
                    if !self.evaluate_rule(ev, def, base, entity, depth).await? {
                        return Ok(false);
                    }
                    let excluded = self.evaluate_rule(ev, def, excluded, entity, depth).await?;
                    Ok(!excluded)
                }
                RewriteRule::Negation(inner) => {
                    let inner = self.evaluate_rule(ev, def, inner, entity, depth).await?;
                    Ok(!inner)
                }
            }
        })
    }

    async fn evaluate_relation(
        &self,
        ev: &Evaluation<'_, R>,
        entity: &EntityRef,
        relation: &str,
        depth: u32,
    ) -> Result<bool, CheckError> {
        let filter = TupleFilter {
            entity_type: Some(entity.entity_type.clone()),
            entity_id: Some(entity.entity_id.clone()),
            relation: Some(relation.to_string()),
            ..Default::default()
        };
        let tuples = ev.overlay.tuples(&filter).await?;

        if tuples.iter().any(|t| &t.subject == ev.subject) {
            return Ok(true);
        }

        for tuple in &tuples {
            let Some(ref subject_relation) = tuple.subject.subject_relation else {
                continue;
            };
            let userset = tuple.subject.entity();
            if self
                .check_member(ev, &userset, subject_relation, depth - 1)
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn evaluate_arrow(
        &self,
        ev: &Evaluation<'_, R>,
        entity: &EntityRef,
        tupleset: &str,
        computed: &str,
        depth: u32,
    ) -> Result<bool, CheckError> {
        let filter = TupleFilter {
            entity_type: Some(entity.entity_type.clone()),
            entity_id: Some(entity.entity_id.clone()),
            relation: Some(tupleset.to_string()),
            ..Default::default()
        };
        let tuples = ev.overlay.tuples(&filter).await?;

        for tuple in &tuples {
            let declares = self
                .schema
                .get_entity(&tuple.subject.subject_type)
                .is_some_and(|d| d.member_kind(computed).is_some());
            if !declares {
                continue;
            }
            let target = tuple.subject.entity();
            if self.check_member(ev, &target, computed, depth - 1).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn evaluate_attribute(
        &self,
        ev: &Evaluation<'_, R>,
        def: &EntityDefinition,
        entity: &EntityRef,
        name: &str,
    ) -> Result<bool, CheckError> {
        let value = self.attribute_value(ev, def, entity, name).await?;
        value.as_bool().ok_or_else(|| {
            CheckError::InvalidArgument(format!(
                "attribute '{}${name}' is {}, not boolean",
                entity.entity_type,
                value.attribute_type()
            ))
        })
    }

    async fn evaluate_call(
        &self,
        ev: &Evaluation<'_, R>,
        def: &EntityDefinition,
        entity: &EntityRef,
        rule_name: &str,
        arguments: &[String],
    ) -> Result<bool, CheckError> {
        let rule_def = self
            .schema
            .get_rule(rule_name)
            .ok_or_else(|| CheckError::RuleNotFound(rule_name.to_string()))?;

        let mut scope = Map::new();
        for (param, argument) in rule_def.parameters.iter().zip(arguments) {
            let value = self.attribute_value(ev, def, entity, argument).await?;
            scope.insert(param.name.clone(), value.to_json());
        }
        scope.insert(
            "context".to_string(),
            json!({ "data": Value::Object(ev.overlay.data().clone()) }),
        );

        Ok(rule::evaluate(&rule_def.expression, &Value::Object(scope))?)
    }

    /// Stored or contextual value, falling back to the declared type's zero value.
    async fn attribute_value(
        &self,
        ev: &Evaluation<'_, R>,
        def: &EntityDefinition,
        entity: &EntityRef,
        name: &str,
    ) -> Result<AttributeValue, CheckError> {
        let declared = def.get_attribute(name).ok_or_else(|| {
            CheckError::InvalidArgument(format!(
                "attribute '{name}' is not declared on entity '{}'",
                def.name
            ))
        })?;
        Ok(ev
            .overlay
            .attribute(entity, name)
            .await?
            .filter(|v| v.attribute_type() == declared.attribute_type)
            .unwrap_or_else(|| declared.attribute_type.zero_value()))
    }
}

fn permission_not_found(entity: &EntityRef, name: &str) -> CheckError {
    CheckError::PermissionNotFound {
        entity: entity.entity_type.clone(),
        permission: name.to_string(),
    }
}
