use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;

/// Subject relation written by clients to mean "the subject itself".
pub const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantId(Uuid);

impl TenantId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TupleParseError {
    #[error("invalid entity '{0}': expected type:id")]
    Entity(String),
    #[error("invalid subject '{0}': expected type:id or type:id#relation")]
    Subject(String),
    #[error("invalid tuple '{0}': expected entity#relation@subject")]
    Tuple(String),
    #[error("invalid relation reference '{0}': expected type or type#relation")]
    Reference(String),
}

impl TupleParseError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Entity(_) => ErrorCode::InvalidEntity,
            Self::Subject(_) | Self::Reference(_) => ErrorCode::InvalidSubject,
            Self::Tuple(_) => ErrorCode::InvalidTuple,
        }
    }
}

fn valid_segment(s: &str) -> bool {
    !s.is_empty() && !s.contains([':', '#', '@', '$', '|'])
}

fn normalize_relation(relation: Option<String>) -> Option<String> {
    relation.filter(|r| !r.is_empty() && r != ELLIPSIS)
}

fn deserialize_relation<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(normalize_relation)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(rename = "id")]
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

impl FromStr for EntityRef {
    type Err = TupleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (entity_type, entity_id) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| TupleParseError::Entity(s.to_string()))?;
        if !valid_segment(entity_type) || !valid_segment(entity_id) {
            return Err(TupleParseError::Entity(s.to_string()));
        }
        Ok(Self::new(entity_type, entity_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectRef {
    #[serde(rename = "type")]
    pub subject_type: String,
    #[serde(rename = "id")]
    pub subject_id: String,
    #[serde(
        rename = "relation",
        default,
        deserialize_with = "deserialize_relation",
        skip_serializing_if = "Option::is_none"
    )]
    pub subject_relation: Option<String>,
}

impl SubjectRef {
    pub fn direct(subject_type: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            subject_type: subject_type.into(),
            subject_id: subject_id.into(),
            subject_relation: None,
        }
    }

    pub fn userset(
        subject_type: impl Into<String>,
        subject_id: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            subject_type: subject_type.into(),
            subject_id: subject_id.into(),
            subject_relation: normalize_relation(Some(relation.into())),
        }
    }

    pub fn is_userset(&self) -> bool {
        self.subject_relation.is_some()
    }

    /// The object this subject points at, ignoring any relation.
    pub fn entity(&self) -> EntityRef {
        EntityRef::new(&self.subject_type, &self.subject_id)
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject_type, self.subject_id)?;
        if let Some(ref rel) = self.subject_relation {
            write!(f, "#{rel}")?;
        }
        Ok(())
    }
}

impl FromStr for SubjectRef {
    type Err = TupleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (object, relation) = match trimmed.split_once('#') {
            Some((object, relation)) => (object, Some(relation)),
            None => (trimmed, None),
        };
        let entity: EntityRef = object
            .parse()
            .map_err(|_| TupleParseError::Subject(s.to_string()))?;
        match relation {
            Some(rel) if rel != ELLIPSIS && !valid_segment(rel) => {
                Err(TupleParseError::Subject(s.to_string()))
            }
            Some(rel) => Ok(Self::userset(entity.entity_type, entity.entity_id, rel)),
            None => Ok(Self::direct(entity.entity_type, entity.entity_id)),
        }
    }
}

impl From<EntityRef> for SubjectRef {
    fn from(entity: EntityRef) -> Self {
        Self::direct(entity.entity_type, entity.entity_id)
    }
}

/// A subject type with an optional relation, e.g. `user` or `group#member`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationReference {
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(
        default,
        deserialize_with = "deserialize_relation",
        skip_serializing_if = "Option::is_none"
    )]
    pub relation: Option<String>,
}

impl RelationReference {
    pub fn new(entity_type: impl Into<String>, relation: Option<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            relation: normalize_relation(relation),
        }
    }
}

impl fmt::Display for RelationReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.entity_type)?;
        if let Some(ref rel) = self.relation {
            write!(f, "#{rel}")?;
        }
        Ok(())
    }
}

impl FromStr for RelationReference {
    type Err = TupleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (entity_type, relation) = match trimmed.split_once('#') {
            Some((t, r)) => (t, Some(r)),
            None => (trimmed, None),
        };
        if !valid_segment(entity_type) || relation.is_some_and(|r| r.is_empty()) {
            return Err(TupleParseError::Reference(s.to_string()));
        }
        Ok(Self::new(entity_type, relation.map(str::to_string)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tuple {
    pub entity: EntityRef,
    pub relation: String,
    pub subject: SubjectRef,
}

impl Tuple {
    pub fn new(entity: EntityRef, relation: impl Into<String>, subject: SubjectRef) -> Self {
        Self {
            entity,
            relation: relation.into(),
            subject,
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.entity, self.relation, self.subject)
    }
}

impl FromStr for Tuple {
    type Err = TupleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TupleParseError::Tuple(s.to_string());
        let (left, subject) = s.trim().split_once('@').ok_or_else(invalid)?;
        let (entity, relation) = left.split_once('#').ok_or_else(invalid)?;
        if !valid_segment(relation) {
            return Err(invalid());
        }
        let entity: EntityRef = entity.parse().map_err(|_| invalid())?;
        let subject: SubjectRef = subject.parse().map_err(|_| invalid())?;
        Ok(Self::new(entity, relation, subject))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TupleFilter {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub relation: Option<String>,
    pub subject_type: Option<String>,
    pub subject_id: Option<String>,
    /// `Some(None)` restricts to direct subjects.
    pub subject_relation: Option<Option<String>>,
}

impl TupleFilter {
    /// Filter that selects exactly this tuple.
    pub fn exact(tuple: &Tuple) -> Self {
        Self {
            entity_type: Some(tuple.entity.entity_type.clone()),
            entity_id: Some(tuple.entity.entity_id.clone()),
            relation: Some(tuple.relation.clone()),
            subject_type: Some(tuple.subject.subject_type.clone()),
            subject_id: Some(tuple.subject.subject_id.clone()),
            subject_relation: Some(tuple.subject.subject_relation.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn matches(&self, tuple: &Tuple) -> bool {
        if let Some(ref et) = self.entity_type
            && et != &tuple.entity.entity_type
        {
            return false;
        }
        if let Some(ref ei) = self.entity_id
            && ei != &tuple.entity.entity_id
        {
            return false;
        }
        if let Some(ref r) = self.relation
            && r != &tuple.relation
        {
            return false;
        }
        if let Some(ref st) = self.subject_type
            && st != &tuple.subject.subject_type
        {
            return false;
        }
        if let Some(ref si) = self.subject_id
            && si != &tuple.subject.subject_id
        {
            return false;
        }
        if let Some(ref sr) = self.subject_relation
            && sr != &tuple.subject.subject_relation
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotToken(u64);

impl SnapshotToken {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- TenantId ---

    #[test]
    fn tenant_id_display_matches_uuid() {
        let uuid = Uuid::new_v4();
        let tenant_id = TenantId::new(uuid);

        assert_eq!(tenant_id.to_string(), uuid.to_string());
        assert_eq!(*tenant_id.as_uuid(), uuid);
    }

    // --- EntityRef ---

    #[test]
    fn entity_ref_parses_type_and_id() {
        let entity: EntityRef = "document:readme".parse().unwrap();

        assert_eq!(entity, EntityRef::new("document", "readme"));
        assert_eq!(entity.to_string(), "document:readme");
    }

    #[test]
    fn entity_ref_rejects_missing_id() {
        let err = "document".parse::<EntityRef>().unwrap_err();

        assert_eq!(err.code(), ErrorCode::InvalidEntity);
        assert!("document:".parse::<EntityRef>().is_err());
        assert!(":1".parse::<EntityRef>().is_err());
    }

    // --- SubjectRef ---

    #[test]
    fn direct_subject_display() {
        let subject = SubjectRef::direct("user", "john");

        assert_eq!(subject.to_string(), "user:john");
        assert!(!subject.is_userset());
    }

    #[test]
    fn userset_subject_display() {
        let subject = SubjectRef::userset("group", "engineering", "member");

        assert_eq!(subject.to_string(), "group:engineering#member");
        assert_eq!(subject.subject_relation, Some("member".to_string()));
    }

    #[test]
    fn ellipsis_relation_means_direct_subject() {
        let parsed: SubjectRef = "user:1#...".parse().unwrap();

        assert_eq!(parsed, SubjectRef::direct("user", "1"));
        assert_eq!(SubjectRef::userset("user", "1", "..."), SubjectRef::direct("user", "1"));
    }

    #[test]
    fn subject_deserializes_empty_relation_as_direct() {
        let subject: SubjectRef =
            serde_json::from_str(r#"{"type":"user","id":"1","relation":""}"#).unwrap();

        assert_eq!(subject, SubjectRef::direct("user", "1"));
    }

    #[test]
    fn subject_serializes_without_relation_when_direct() {
        let json = serde_json::to_value(SubjectRef::direct("user", "1")).unwrap();

        assert_eq!(json, serde_json::json!({"type": "user", "id": "1"}));
    }

    // --- RelationReference ---

    #[test]
    fn relation_reference_parses_with_and_without_relation() {
        let plain: RelationReference = "user".parse().unwrap();
        let userset: RelationReference = "group#member".parse().unwrap();

        assert_eq!(plain, RelationReference::new("user", None));
        assert_eq!(userset.relation.as_deref(), Some("member"));
        assert_eq!(userset.to_string(), "group#member");
        assert!("group#".parse::<RelationReference>().is_err());
    }

    // --- Tuple ---

    #[test]
    fn tuple_display_userset_subject() {
        let tuple = Tuple::new(
            EntityRef::new("doc", "readme"),
            "viewer",
            SubjectRef::userset("group", "engineering", "member"),
        );

        assert_eq!(tuple.to_string(), "doc:readme#viewer@group:engineering#member");
    }

    #[test]
    fn tuple_parses_text_form() {
        let tuple: Tuple = "doc:1#owner@user:1".parse().unwrap();

        assert_eq!(
            tuple,
            Tuple::new(EntityRef::new("doc", "1"), "owner", SubjectRef::direct("user", "1"))
        );
    }

    #[test]
    fn tuple_parse_round_trips_display() {
        let text = "organization:acme#member@group:eng#member";
        let tuple: Tuple = text.parse().unwrap();

        assert_eq!(tuple.to_string(), text);
    }

    #[test]
    fn tuple_rejects_malformed_text() {
        for bad in ["doc:1#owner", "doc:1@user:1", "doc#owner@user:1", "doc:1#@user:1"] {
            let err = bad.parse::<Tuple>().unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidTuple, "input: {bad}");
        }
    }

    // --- TupleFilter ---

    #[test]
    fn empty_filter_matches_everything() {
        let filter = TupleFilter::default();
        let tuple: Tuple = "doc:readme#viewer@user:john".parse().unwrap();

        assert!(filter.is_empty());
        assert!(filter.matches(&tuple));
    }

    #[test]
    fn filter_by_entity_type() {
        let filter = TupleFilter {
            entity_type: Some("doc".to_string()),
            ..Default::default()
        };
        let matching: Tuple = "doc:readme#viewer@user:john".parse().unwrap();
        let non_matching: Tuple = "folder:docs#viewer@user:john".parse().unwrap();

        assert!(filter.matches(&matching));
        assert!(!filter.matches(&non_matching));
    }

    #[test]
    fn filter_by_subject_relation_none_matches_direct_only() {
        let filter = TupleFilter {
            subject_relation: Some(None),
            ..Default::default()
        };
        let direct: Tuple = "doc:readme#viewer@user:john".parse().unwrap();
        let userset: Tuple = "doc:readme#viewer@group:eng#member".parse().unwrap();

        assert!(filter.matches(&direct));
        assert!(!filter.matches(&userset));
    }

    #[test]
    fn exact_filter_selects_only_that_tuple() {
        let tuple: Tuple = "doc:1#viewer@group:eng#member".parse().unwrap();
        let filter = TupleFilter::exact(&tuple);
        let other: Tuple = "doc:1#viewer@group:eng#admin".parse().unwrap();

        assert!(filter.matches(&tuple));
        assert!(!filter.matches(&other));
    }

    // --- SnapshotToken ---

    #[test]
    fn snapshot_token_ordering() {
        let a = SnapshotToken::new(1);
        let b = SnapshotToken::new(2);

        assert!(a < b);
        assert_eq!(b.value(), 2);
        assert_eq!(SnapshotToken::new(3).to_string(), "3");
    }
}
