use serde::{Deserialize, Serialize};

use crate::attribute::AttributeType;
use crate::rule::Expr;
use crate::tuple::SubjectRef;

/// A compiled, fully validated authorization model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    pub entities: Vec<EntityDefinition>,
    pub rules: Vec<RuleDefinition>,
}

impl Schema {
    pub fn get_entity(&self, name: &str) -> Option<&EntityDefinition> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn get_rule(&self, name: &str) -> Option<&RuleDefinition> {
        self.rules.iter().find(|r| r.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberKind {
    Relation,
    Attribute,
    Permission,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub name: String,
    pub relations: Vec<RelationDef>,
    pub attributes: Vec<AttributeDef>,
    pub permissions: Vec<PermissionDef>,
}

impl EntityDefinition {
    pub fn get_relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn get_attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn get_permission(&self, name: &str) -> Option<&PermissionDef> {
        self.permissions.iter().find(|p| p.name == name)
    }

    /// Relations, attributes and permissions share one namespace per entity.
    pub fn member_kind(&self, name: &str) -> Option<MemberKind> {
        if self.get_relation(name).is_some() {
            Some(MemberKind::Relation)
        } else if self.get_permission(name).is_some() {
            Some(MemberKind::Permission)
        } else if self.get_attribute(name).is_some() {
            Some(MemberKind::Attribute)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDef {
    pub name: String,
    pub subject_types: Vec<SubjectTypeRef>,
}

impl RelationDef {
    /// Whether `subject` may be written under this relation.
    pub fn allows(&self, subject: &SubjectRef) -> bool {
        self.subject_types
            .iter()
            .any(|st| st.type_name == subject.subject_type && st.relation == subject.subject_relation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectTypeRef {
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
}

impl std::fmt::Display for SubjectTypeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.type_name)?;
        if let Some(ref rel) = self.relation {
            write!(f, "#{rel}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    pub attribute_type: AttributeType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    Permission,
    Action,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDef {
    pub name: String,
    pub kind: PermissionKind,
    pub rule: RewriteRule,
}

/// Permission expression tree with every leaf resolved to its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteRule {
    Relation(String),
    Permission(String),
    Attribute(String),
    /// `tupleset.computed`: follow `tupleset` tuples and evaluate `computed` on each subject.
    Arrow {
        tupleset: String,
        computed: String,
    },
    Call {
        rule: String,
        arguments: Vec<String>,
    },
    Union(Vec<RewriteRule>),
    Intersection(Vec<RewriteRule>),
    Exclusion(Box<RewriteRule>, Box<RewriteRule>),
    Negation(Box<RewriteRule>),
}

impl RewriteRule {
    pub fn children(&self) -> Vec<&RewriteRule> {
        match self {
            Self::Union(children) | Self::Intersection(children) => children.iter().collect(),
            Self::Exclusion(base, excluded) => vec![base.as_ref(), excluded.as_ref()],
            Self::Negation(inner) => vec![inner.as_ref()],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleParameter {
    pub name: String,
    pub parameter_type: AttributeType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub name: String,
    pub parameters: Vec<RuleParameter>,
    pub body: String,
    pub expression: Expr,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> EntityDefinition {
        EntityDefinition {
            name: "doc".into(),
            relations: vec![RelationDef {
                name: "viewer".into(),
                subject_types: vec![
                    SubjectTypeRef {
                        type_name: "user".into(),
                        relation: None,
                    },
                    SubjectTypeRef {
                        type_name: "group".into(),
                        relation: Some("member".into()),
                    },
                ],
            }],
            attributes: vec![AttributeDef {
                name: "is_public".into(),
                attribute_type: AttributeType::Boolean,
            }],
            permissions: vec![PermissionDef {
                name: "view".into(),
                kind: PermissionKind::Permission,
                rule: RewriteRule::Relation("viewer".into()),
            }],
        }
    }

    #[test]
    fn member_kind_resolves_each_namespace() {
        let doc = doc();

        assert_eq!(doc.member_kind("viewer"), Some(MemberKind::Relation));
        assert_eq!(doc.member_kind("is_public"), Some(MemberKind::Attribute));
        assert_eq!(doc.member_kind("view"), Some(MemberKind::Permission));
        assert_eq!(doc.member_kind("edit"), None);
    }

    #[test]
    fn relation_allows_only_declared_subject_shapes() {
        let doc = doc();
        let viewer = doc.get_relation("viewer").unwrap();

        assert!(viewer.allows(&SubjectRef::direct("user", "1")));
        assert!(viewer.allows(&SubjectRef::userset("group", "eng", "member")));
        assert!(!viewer.allows(&SubjectRef::direct("group", "eng")));
        assert!(!viewer.allows(&SubjectRef::userset("user", "1", "friend")));
    }

    #[test]
    fn exclusion_children_are_base_then_excluded() {
        let rule = RewriteRule::Exclusion(
            Box::new(RewriteRule::Relation("a".into())),
            Box::new(RewriteRule::Relation("b".into())),
        );

        assert_eq!(
            rule.children(),
            vec![&RewriteRule::Relation("a".into()), &RewriteRule::Relation("b".into())]
        );
    }
}
