use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable machine-readable error vocabulary shared by every layer.
///
/// Callers pattern-match on these strings, so variants must never be renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SchemaCompile,
    SchemaNotFound,
    SchemaLimitExceeded,
    SchemaBreakingChange,
    NoEntityReferencesFoundInSchema,
    DuplicatedEntityReference,
    DuplicatedRelationReference,
    DuplicatedRuleReference,
    EntityDefinitionNotFound,
    RelationDefinitionNotFound,
    PermissionNotFound,
    AttributeDefinitionNotFound,
    UndefinedRelationReference,
    UndefinedRuleReference,
    RelationReferenceNotFoundInEntityReferences,
    NotSupportedRelationWalk,
    InvalidRuleReference,
    InvalidRuleExpression,
    CircularPermissionReference,
    SubjectTypeNotFound,
    EntityAndSubjectCannotBeEqual,
    AttributeTypeMismatch,
    InvalidArgument,
    InvalidTuple,
    InvalidAttribute,
    InvalidEntity,
    InvalidSubject,
    DepthNotEnough,
    RuleEvaluation,
    Timeout,
    Unauthenticated,
    Storage,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SchemaCompile => "SCHEMA_COMPILE",
            Self::SchemaNotFound => "SCHEMA_NOT_FOUND",
            Self::SchemaLimitExceeded => "SCHEMA_LIMIT_EXCEEDED",
            Self::SchemaBreakingChange => "SCHEMA_BREAKING_CHANGE",
            Self::NoEntityReferencesFoundInSchema => "NO_ENTITY_REFERENCES_FOUND_IN_SCHEMA",
            Self::DuplicatedEntityReference => "DUPLICATED_ENTITY_REFERENCE",
            Self::DuplicatedRelationReference => "DUPLICATED_RELATION_REFERENCE",
            Self::DuplicatedRuleReference => "DUPLICATED_RULE_REFERENCE",
            Self::EntityDefinitionNotFound => "ENTITY_DEFINITION_NOT_FOUND",
            Self::RelationDefinitionNotFound => "RELATION_DEFINITION_NOT_FOUND",
            Self::PermissionNotFound => "PERMISSION_NOT_FOUND",
            Self::AttributeDefinitionNotFound => "ATTRIBUTE_DEFINITION_NOT_FOUND",
            Self::UndefinedRelationReference => "UNDEFINED_RELATION_REFERENCE",
            Self::UndefinedRuleReference => "UNDEFINED_RULE_REFERENCE",
            Self::RelationReferenceNotFoundInEntityReferences => {
                "RELATION_REFERENCE_NOT_FOUND_IN_ENTITY_REFERENCES"
            }
            Self::NotSupportedRelationWalk => "NOT_SUPPORTED_RELATION_WALK",
            Self::InvalidRuleReference => "INVALID_RULE_REFERENCE",
            Self::InvalidRuleExpression => "INVALID_RULE_EXPRESSION",
            Self::CircularPermissionReference => "CIRCULAR_PERMISSION_REFERENCE",
            Self::SubjectTypeNotFound => "SUBJECT_TYPE_NOT_FOUND",
            Self::EntityAndSubjectCannotBeEqual => "ENTITY_AND_SUBJECT_CANNOT_BE_EQUAL",
            Self::AttributeTypeMismatch => "ATTRIBUTE_TYPE_MISMATCH",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::InvalidTuple => "INVALID_TUPLE",
            Self::InvalidAttribute => "INVALID_ATTRIBUTE",
            Self::InvalidEntity => "INVALID_ENTITY",
            Self::InvalidSubject => "INVALID_SUBJECT",
            Self::DepthNotEnough => "DEPTH_NOT_ENOUGH",
            Self::RuleEvaluation => "RULE_EVALUATION",
            Self::Timeout => "TIMEOUT",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Storage => "STORAGE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_serde_name() {
        let codes = [
            ErrorCode::SchemaCompile,
            ErrorCode::UndefinedRelationReference,
            ErrorCode::RelationReferenceNotFoundInEntityReferences,
            ErrorCode::DepthNotEnough,
            ErrorCode::EntityAndSubjectCannotBeEqual,
        ];

        for code in codes {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{code}\""));
        }
    }

    #[test]
    fn codes_are_upper_snake_case() {
        let code = ErrorCode::NoEntityReferencesFoundInSchema.as_str();

        assert!(code.chars().all(|c| c.is_ascii_uppercase() || c == '_'));
        assert_eq!(code.replace('_', " "), "NO ENTITY REFERENCES FOUND IN SCHEMA");
    }
}
