use std::fmt;

use serde::Serialize;

use super::types::{Schema, SubjectTypeRef};
use crate::error::ErrorCode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaLimits {
    pub max_entities: usize,
    pub max_relations_per_entity: usize,
    pub max_permissions_per_entity: usize,
    pub max_source_bytes: usize,
}

impl Default for SchemaLimits {
    fn default() -> Self {
        Self {
            max_entities: 100,
            max_relations_per_entity: 50,
            max_permissions_per_entity: 50,
            max_source_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("schema source is {size} bytes, limit is {limit}")]
    SourceTooLarge { size: usize, limit: usize },
    #[error("too many entities: {count} exceeds limit of {limit}")]
    TooManyEntities { count: usize, limit: usize },
    #[error("too many relations in entity '{entity}': {count} exceeds limit of {limit}")]
    TooManyRelations {
        entity: String,
        count: usize,
        limit: usize,
    },
    #[error("too many permissions in entity '{entity}': {count} exceeds limit of {limit}")]
    TooManyPermissions {
        entity: String,
        count: usize,
        limit: usize,
    },
}

impl ValidationError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::SchemaLimitExceeded
    }
}

/// A change that could strand stored relationships or attributes. Whether it does
/// depends on the data held when the new schema is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BreakingChange {
    EntityRemoved { entity: String },
    RelationRemoved { entity: String, relation: String },
    SubjectTypesChanged {
        entity: String,
        relation: String,
        removed: Vec<SubjectTypeRef>,
    },
    AttributeRemoved { entity: String, attribute: String },
    AttributeTypeChanged { entity: String, attribute: String },
}

impl fmt::Display for BreakingChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntityRemoved { entity } => write!(f, "entity '{entity}' removed"),
            Self::RelationRemoved { entity, relation } => {
                write!(f, "relation '{entity}#{relation}' removed")
            }
            Self::SubjectTypesChanged { entity, relation, .. } => {
                write!(f, "subject types of '{entity}#{relation}' narrowed")
            }
            Self::AttributeRemoved { entity, attribute } => {
                write!(f, "attribute '{entity}${attribute}' removed")
            }
            Self::AttributeTypeChanged { entity, attribute } => {
                write!(f, "type of attribute '{entity}${attribute}' changed")
            }
        }
    }
}

pub fn validate_source_size(source: &str, limits: &SchemaLimits) -> Result<(), ValidationError> {
    if source.len() > limits.max_source_bytes {
        return Err(ValidationError::SourceTooLarge {
            size: source.len(),
            limit: limits.max_source_bytes,
        });
    }
    Ok(())
}

pub fn validate_schema_limits(
    schema: &Schema,
    limits: &SchemaLimits,
) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if schema.entities.len() > limits.max_entities {
        errors.push(ValidationError::TooManyEntities {
            count: schema.entities.len(),
            limit: limits.max_entities,
        });
    }

    for entity in &schema.entities {
        if entity.relations.len() > limits.max_relations_per_entity {
            errors.push(ValidationError::TooManyRelations {
                entity: entity.name.clone(),
                count: entity.relations.len(),
                limit: limits.max_relations_per_entity,
            });
        }
        if entity.permissions.len() > limits.max_permissions_per_entity {
            errors.push(ValidationError::TooManyPermissions {
                entity: entity.name.clone(),
                count: entity.permissions.len(),
                limit: limits.max_permissions_per_entity,
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Structural differences between `old` and `new` that can strand stored data.
pub fn detect_breaking_changes(old: &Schema, new: &Schema) -> Vec<BreakingChange> {
    let mut changes = Vec::new();

    for old_entity in &old.entities {
        let Some(new_entity) = new.get_entity(&old_entity.name) else {
            changes.push(BreakingChange::EntityRemoved {
                entity: old_entity.name.clone(),
            });
            continue;
        };

        for old_rel in &old_entity.relations {
            match new_entity.get_relation(&old_rel.name) {
                None => changes.push(BreakingChange::RelationRemoved {
                    entity: old_entity.name.clone(),
                    relation: old_rel.name.clone(),
                }),
                // Widening is safe; dropping an allowed subject type is not.
                Some(new_rel) => {
                    let removed: Vec<SubjectTypeRef> = old_rel
                        .subject_types
                        .iter()
                        .filter(|st| !new_rel.subject_types.contains(st))
                        .cloned()
                        .collect();
                    if !removed.is_empty() {
                        changes.push(BreakingChange::SubjectTypesChanged {
                            entity: old_entity.name.clone(),
                            relation: old_rel.name.clone(),
                            removed,
                        });
                    }
                }
            }
        }

        for old_attr in &old_entity.attributes {
            match new_entity.get_attribute(&old_attr.name) {
                None => changes.push(BreakingChange::AttributeRemoved {
                    entity: old_entity.name.clone(),
                    attribute: old_attr.name.clone(),
                }),
                Some(new_attr) if new_attr.attribute_type != old_attr.attribute_type => {
                    changes.push(BreakingChange::AttributeTypeChanged {
                        entity: old_entity.name.clone(),
                        attribute: old_attr.name.clone(),
                    })
                }
                Some(_) => {}
            }
        }
    }

    changes
}
