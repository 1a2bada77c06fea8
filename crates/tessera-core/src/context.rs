use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::attribute::{Attribute, AttributeParseError};
use crate::tuple::{EntityRef, Tuple, TupleFilter, TupleParseError};

/// Request-scoped facts layered over the stores for a single evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Context {
    pub tuples: Vec<Tuple>,
    pub attributes: Vec<Attribute>,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContextParseError {
    #[error(transparent)]
    Tuple(#[from] TupleParseError),
    #[error(transparent)]
    Attribute(#[from] AttributeParseError),
}

impl Context {
    /// Builds a context from the text forms used by bundles.
    pub fn from_text(
        tuples: &[String],
        attributes: &[String],
        data: Map<String, Value>,
    ) -> Result<Self, ContextParseError> {
        Ok(Self {
            tuples: tuples
                .iter()
                .map(|t| Tuple::from_str(t))
                .collect::<Result<_, _>>()?,
            attributes: attributes
                .iter()
                .map(|a| Attribute::from_str(a))
                .collect::<Result<_, _>>()?,
            data,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty() && self.attributes.is_empty() && self.data.is_empty()
    }

    pub fn matching_tuples<'a>(&'a self, filter: &'a TupleFilter) -> impl Iterator<Item = &'a Tuple> {
        self.tuples.iter().filter(move |t| filter.matches(t))
    }

    pub fn attribute(&self, entity: &EntityRef, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .rev()
            .find(|a| &a.entity == entity && a.attribute == name)
    }

    /// Ids of `entity_type` mentioned anywhere in the contextual facts.
    pub fn entity_ids<'a>(&'a self, entity_type: &'a str) -> impl Iterator<Item = &'a str> {
        let from_tuples = self.tuples.iter().flat_map(move |t| {
            let entity = (t.entity.entity_type == entity_type).then_some(t.entity.entity_id.as_str());
            let subject =
                (t.subject.subject_type == entity_type).then_some(t.subject.subject_id.as_str());
            entity.into_iter().chain(subject)
        });
        let from_attributes = self
            .attributes
            .iter()
            .filter(move |a| a.entity.entity_type == entity_type)
            .map(|a| a.entity.entity_id.as_str());
        from_tuples.chain(from_attributes)
    }
}
