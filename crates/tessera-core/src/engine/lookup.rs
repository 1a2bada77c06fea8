use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::context::Context;
use crate::schema::types::{MemberKind, RewriteRule, Schema};
use crate::tuple::{EntityRef, RelationReference, SnapshotToken, SubjectRef, TupleFilter};

use super::{CheckEngine, CheckError, CheckRequest, DataReader, EngineConfig, Overlay};

#[derive(Debug, Clone)]
pub struct LookupEntityRequest {
    pub entity_type: String,
    pub permission: String,
    pub subject: SubjectRef,
    pub context: Context,
    pub snapshot: Option<SnapshotToken>,
    pub depth: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct LookupSubjectRequest {
    pub entity: EntityRef,
    pub permission: String,
    /// Subject type, optionally narrowed to a userset relation.
    pub subject_reference: RelationReference,
    pub context: Context,
    pub snapshot: Option<SnapshotToken>,
    pub depth: Option<u32>,
}

/// Candidate generation followed by an exact Check per candidate.
///
/// Candidates come from walking stored tuples near the query's fixed end. Permissions whose
/// grant does not require a tuple path (attributes, rule calls, negation) widen the candidate
/// set to every known id of the target type.
pub struct LookupEngine<R: DataReader> {
    checker: CheckEngine<R>,
}

impl<R: DataReader> LookupEngine<R> {
    pub fn new(reader: Arc<R>, schema: Arc<Schema>, config: EngineConfig) -> Self {
        Self {
            checker: CheckEngine::new(reader, schema, config),
        }
    }

    /// Ids of `entity_type` on which the subject holds the permission, sorted and unique.
    pub async fn lookup_entity(&self, request: &LookupEntityRequest) -> Result<Vec<String>, CheckError> {
        self.ensure_member(&request.entity_type, &request.permission)?;
        let overlay = Overlay::new(
            self.checker.reader(),
            &request.context,
            request.snapshot,
        );
        let levels = self.checker.config().effective_depth(request.depth);

        let mut candidates = BTreeSet::new();
        if request.subject.subject_type == request.entity_type {
            candidates.insert(request.subject.subject_id.clone());
        }

        let origin = request.subject.entity();
        let mut visited = HashSet::from([origin.clone()]);
        let mut frontier = vec![origin];
        for _ in 0..levels {
            if frontier.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for reached in &frontier {
                let filter = TupleFilter {
                    subject_type: Some(reached.entity_type.clone()),
                    subject_id: Some(reached.entity_id.clone()),
                    ..Default::default()
                };
                for tuple in overlay.tuples(&filter).await? {
                    if tuple.entity.entity_type == request.entity_type {
                        candidates.insert(tuple.entity.entity_id.clone());
                    }
                    if visited.insert(tuple.entity.clone()) {
                        next.push(tuple.entity);
                    }
                }
            }
            frontier = next;
        }

        if self.requires_enumeration(&request.entity_type, &request.permission) {
            candidates.extend(overlay.entity_ids(&request.entity_type).await?);
        }

        let mut allowed = Vec::new();
        for id in candidates {
            let check = CheckRequest {
                entity: EntityRef::new(request.entity_type.clone(), id),
                permission: request.permission.clone(),
                subject: request.subject.clone(),
                context: request.context.clone(),
                snapshot: request.snapshot,
                depth: request.depth,
            };
            if self.checker.check(&check).await?.allowed {
                allowed.push(check.entity.entity_id);
            }
        }

        tracing::debug!(
            entity_type = %request.entity_type,
            permission = %request.permission,
            subject = %request.subject,
            matched = allowed.len(),
            "lookup entity evaluated"
        );
        Ok(allowed)
    }

    /// Ids of the referenced subject type holding the permission on the entity, sorted and unique.
    pub async fn lookup_subject(&self, request: &LookupSubjectRequest) -> Result<Vec<String>, CheckError> {
        self.ensure_member(&request.entity.entity_type, &request.permission)?;
        let subject_type = &request.subject_reference.entity_type;
        if self.checker.schema().get_entity(subject_type).is_none() {
            return Err(CheckError::EntityNotFound(subject_type.clone()));
        }
        let overlay = Overlay::new(
            self.checker.reader(),
            &request.context,
            request.snapshot,
        );
        let levels = self.checker.config().effective_depth(request.depth);

        let mut candidates = BTreeSet::new();
        if &request.entity.entity_type == subject_type {
            candidates.insert(request.entity.entity_id.clone());
        }

        let mut visited = HashSet::from([request.entity.clone()]);
        let mut frontier = vec![request.entity.clone()];
        for _ in 0..levels {
            if frontier.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for reached in &frontier {
                let filter = TupleFilter {
                    entity_type: Some(reached.entity_type.clone()),
                    entity_id: Some(reached.entity_id.clone()),
                    ..Default::default()
                };
                for tuple in overlay.tuples(&filter).await? {
                    if &tuple.subject.subject_type == subject_type {
                        candidates.insert(tuple.subject.subject_id.clone());
                    }
                    let target = tuple.subject.entity();
                    if visited.insert(target.clone()) {
                        next.push(target);
                    }
                }
            }
            frontier = next;
        }

        if self.requires_enumeration(&request.entity.entity_type, &request.permission) {
            candidates.extend(overlay.entity_ids(subject_type).await?);
        }

        let mut allowed = Vec::new();
        for id in candidates {
            let subject = SubjectRef {
                subject_type: subject_type.clone(),
                subject_id: id,
                subject_relation: request.subject_reference.relation.clone(),
            };
            let check = CheckRequest {
                entity: request.entity.clone(),
                permission: request.permission.clone(),
                subject,
                context: request.context.clone(),
                snapshot: request.snapshot,
                depth: request.depth,
            };
            if self.checker.check(&check).await?.allowed {
                allowed.push(check.subject.subject_id);
            }
        }

        tracing::debug!(
            entity = %request.entity,
            permission = %request.permission,
            subject_reference = %request.subject_reference,
            matched = allowed.len(),
            "lookup subject evaluated"
        );
        Ok(allowed)
    }

    fn ensure_member(&self, entity_type: &str, permission: &str) -> Result<(), CheckError> {
        let def = self
            .checker
            .schema()
            .get_entity(entity_type)
            .ok_or_else(|| CheckError::EntityNotFound(entity_type.to_string()))?;
        if def.member_kind(permission).is_none() {
            return Err(CheckError::PermissionNotFound {
                entity: entity_type.to_string(),
                permission: permission.to_string(),
            });
        }
        Ok(())
    }

    fn requires_enumeration(&self, entity_type: &str, member: &str) -> bool {
        requires_enumeration(
            self.checker.schema(),
            entity_type,
            member,
            &mut HashSet::new(),
        )
    }
}

/// Whether `entity_type#member` can grant without any tuple linking the two ends.
fn requires_enumeration(
    schema: &Schema,
    entity_type: &str,
    member: &str,
    visiting: &mut HashSet<(String, String)>,
) -> bool {
    if !visiting.insert((entity_type.to_string(), member.to_string())) {
        return false;
    }
    let Some(def) = schema.get_entity(entity_type) else {
        return false;
    };
    match def.member_kind(member) {
        Some(MemberKind::Attribute) => true,
        Some(MemberKind::Relation) => def.get_relation(member).is_some_and(|rel| {
            rel.subject_types.iter().any(|st| {
                st.relation
                    .as_deref()
                    .is_some_and(|r| requires_enumeration(schema, &st.type_name, r, visiting))
            })
        }),
        Some(MemberKind::Permission) => def
            .get_permission(member)
            .is_some_and(|p| rule_requires_enumeration(schema, entity_type, &p.rule, visiting)),
        None => false,
    }
}

fn rule_requires_enumeration(
    schema: &Schema,
    entity_type: &str,
    rule: &RewriteRule,
    visiting: &mut HashSet<(String, String)>,
) -> bool {
    match rule {
        RewriteRule::Relation(name) | RewriteRule::Permission(name) => {
            requires_enumeration(schema, entity_type, name, visiting)
        }
        RewriteRule::Attribute(_) | RewriteRule::Call { .. } | RewriteRule::Negation(_) => true,
        RewriteRule::Arrow { tupleset, computed } => {
            let targets: Vec<String> = schema
                .get_entity(entity_type)
                .and_then(|d| d.get_relation(tupleset))
                .map(|r| r.subject_types.iter().map(|st| st.type_name.clone()).collect())
                .unwrap_or_default();
            targets
                .iter()
                .any(|t| requires_enumeration(schema, t, computed, visiting))
        }
        RewriteRule::Union(children) => children
            .iter()
            .any(|c| rule_requires_enumeration(schema, entity_type, c, visiting)),
        RewriteRule::Intersection(children) => children
            .iter()
            .all(|c| rule_requires_enumeration(schema, entity_type, c, visiting)),
        RewriteRule::Exclusion(base, _) => {
            rule_requires_enumeration(schema, entity_type, base, visiting)
        }
    }
}
