use tessera_core::attribute::Attribute;
use tessera_core::error::ErrorCode;
use tessera_core::schema::types::{EntityDefinition, Schema};
use tessera_core::tuple::Tuple;

use crate::error::ItemError;

/// Why a single relationship or attribute cannot be written under the active schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Violation {
    pub code: ErrorCode,
    pub message: String,
}

impl Violation {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn at(self, index: usize) -> ItemError {
        ItemError {
            index,
            code: self.code,
            message: self.message,
        }
    }
}

fn entity_definition<'a>(schema: &'a Schema, entity_type: &str) -> Result<&'a EntityDefinition, Violation> {
    schema.get_entity(entity_type).ok_or_else(|| {
        Violation::new(
            ErrorCode::EntityDefinitionNotFound,
            format!("entity type '{entity_type}' is not defined"),
        )
    })
}

pub fn validate_tuple(schema: &Schema, tuple: &Tuple) -> Result<(), Violation> {
    let subject = &tuple.subject;
    if tuple.entity.entity_type == subject.subject_type
        && tuple.entity.entity_id == subject.subject_id
        && subject.subject_relation.as_deref() == Some(tuple.relation.as_str())
    {
        return Err(Violation::new(
            ErrorCode::EntityAndSubjectCannotBeEqual,
            format!("'{tuple}' relates an entity to itself"),
        ));
    }

    let definition = entity_definition(schema, &tuple.entity.entity_type)?;
    let relation = definition.get_relation(&tuple.relation).ok_or_else(|| {
        Violation::new(
            ErrorCode::RelationDefinitionNotFound,
            format!(
                "relation '{}' is not defined on entity '{}'",
                tuple.relation, tuple.entity.entity_type
            ),
        )
    })?;

    if !relation.allows(subject) {
        let allowed = relation
            .subject_types
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let given = match &subject.subject_relation {
            Some(rel) => format!("{}#{rel}", subject.subject_type),
            None => subject.subject_type.clone(),
        };
        return Err(Violation::new(
            ErrorCode::SubjectTypeNotFound,
            format!(
                "subject type '{given}' is not allowed on '{}#{}' (allowed: {allowed})",
                tuple.entity.entity_type, tuple.relation
            ),
        ));
    }
    Ok(())
}

pub fn validate_attribute(schema: &Schema, attribute: &Attribute) -> Result<(), Violation> {
    let definition = entity_definition(schema, &attribute.entity.entity_type)?;
    let declared = definition.get_attribute(&attribute.attribute).ok_or_else(|| {
        Violation::new(
            ErrorCode::AttributeDefinitionNotFound,
            format!(
                "attribute '{}' is not defined on entity '{}'",
                attribute.attribute, attribute.entity.entity_type
            ),
        )
    })?;

    let given = attribute.value.attribute_type();
    if given != declared.attribute_type {
        return Err(Violation::new(
            ErrorCode::AttributeTypeMismatch,
            format!(
                "attribute '{}${}' is declared {}, got {given}",
                attribute.entity.entity_type, attribute.attribute, declared.attribute_type
            ),
        ));
    }
    Ok(())
}

/// Validates every item, returning all failures with their positions.
pub fn validate_all<T>(
    items: &[T],
    check: impl Fn(&T) -> Result<(), Violation>,
) -> Result<(), Vec<ItemError>> {
    let errors: Vec<ItemError> = items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| check(item).err().map(|v| v.at(index)))
        .collect();
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::schema::compile_schema;

    const SCHEMA: &str = r#"
        entity user {}

        entity team {
            relation member @user
        }

        entity folder {
            relation parent @folder
            relation viewer @user @team#member
            attribute public boolean
            attribute tags string[]
            permission view = viewer or parent.view
        }
    "#;

    fn schema() -> Schema {
        compile_schema(SCHEMA).unwrap()
    }

    fn tuple(s: &str) -> Tuple {
        s.parse().unwrap()
    }

    fn attribute(s: &str) -> Attribute {
        s.parse().unwrap()
    }

    // --- Relationships ---

    #[test]
    fn accepts_direct_and_userset_subjects() {
        let schema = schema();

        assert!(validate_tuple(&schema, &tuple("folder:1#viewer@user:alice")).is_ok());
        assert!(validate_tuple(&schema, &tuple("folder:1#viewer@team:eng#member")).is_ok());
        assert!(validate_tuple(&schema, &tuple("folder:1#parent@folder:root")).is_ok());
    }

    #[test]
    fn rejects_unknown_entity_type() {
        let err = validate_tuple(&schema(), &tuple("repo:1#viewer@user:alice")).unwrap_err();
        assert_eq!(err.code, ErrorCode::EntityDefinitionNotFound);
        assert!(err.message.contains("repo"));
    }

    #[test]
    fn rejects_unknown_relation_and_permissions() {
        let schema = schema();

        let err = validate_tuple(&schema, &tuple("folder:1#owner@user:alice")).unwrap_err();
        assert_eq!(err.code, ErrorCode::RelationDefinitionNotFound);

        let err = validate_tuple(&schema, &tuple("folder:1#view@user:alice")).unwrap_err();
        assert_eq!(err.code, ErrorCode::RelationDefinitionNotFound);
    }

    #[test]
    fn rejects_subject_type_not_listed() {
        let schema = schema();

        let err = validate_tuple(&schema, &tuple("folder:1#viewer@folder:2")).unwrap_err();
        assert_eq!(err.code, ErrorCode::SubjectTypeNotFound);
        assert!(err.message.contains("team#member"), "got: {}", err.message);

        let err = validate_tuple(&schema, &tuple("folder:1#viewer@team:eng")).unwrap_err();
        assert_eq!(err.code, ErrorCode::SubjectTypeNotFound);
    }

    #[test]
    fn rejects_entity_related_to_itself() {
        let err = validate_tuple(&schema(), &tuple("folder:1#parent@folder:1#parent")).unwrap_err();
        assert_eq!(err.code, ErrorCode::EntityAndSubjectCannotBeEqual);
    }

    // --- Attributes ---

    #[test]
    fn accepts_declared_attribute_of_matching_type() {
        let schema = schema();

        assert!(validate_attribute(&schema, &attribute("folder:1$public|boolean:true")).is_ok());
        assert!(validate_attribute(&schema, &attribute("folder:1$tags|string[]:a,b")).is_ok());
    }

    #[test]
    fn rejects_undeclared_attribute() {
        let err = validate_attribute(&schema(), &attribute("folder:1$color|string:red")).unwrap_err();
        assert_eq!(err.code, ErrorCode::AttributeDefinitionNotFound);
    }

    #[test]
    fn rejects_attribute_type_mismatch() {
        let err = validate_attribute(&schema(), &attribute("folder:1$public|string:yes")).unwrap_err();
        assert_eq!(err.code, ErrorCode::AttributeTypeMismatch);
        assert!(err.message.contains("boolean"));
    }

    // --- Batches ---

    #[test]
    fn validate_all_reports_every_failing_index() {
        let schema = schema();
        let tuples = vec![
            tuple("folder:1#viewer@user:alice"),
            tuple("folder:1#owner@user:alice"),
            tuple("folder:1#viewer@user:bob"),
            tuple("nope:1#viewer@user:bob"),
        ];

        let errors = validate_all(&tuples, |t| validate_tuple(&schema, t)).unwrap_err();

        let indices: Vec<usize> = errors.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![1, 3]);
        assert_eq!(errors[1].code, ErrorCode::EntityDefinitionNotFound);
    }
}
