mod check;
mod expand;
mod lookup;

pub use check::{CheckEngine, CheckRequest, CheckResult, SubjectPermissionRequest};
pub use expand::{ExpandEngine, ExpandRequest, ExpandTree};
pub use lookup::{LookupEngine, LookupEntityRequest, LookupSubjectRequest};

use std::collections::BTreeSet;
use std::future::Future;

use crate::attribute::{AttributeFilter, AttributeValue, Attribute};
use crate::context::Context;
use crate::error::ErrorCode;
use crate::rule::RuleError;
use crate::tuple::{EntityRef, SnapshotToken, Tuple, TupleFilter};

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("entity type not found: {0}")]
    EntityNotFound(String),

    #[error("permission '{permission}' not found on entity '{entity}'")]
    PermissionNotFound { entity: String, permission: String },

    #[error("relation '{relation}' not found on entity '{entity}'")]
    RelationNotFound { entity: String, relation: String },

    #[error("rule not found: {0}")]
    RuleNotFound(String),

    #[error("depth limit of {0} reached before evaluation finished")]
    DepthExceeded(u32),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error("storage error: {0}")]
    StorageError(String),
}

impl CheckError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::EntityNotFound(_) => ErrorCode::EntityDefinitionNotFound,
            Self::PermissionNotFound { .. } => ErrorCode::PermissionNotFound,
            Self::RelationNotFound { .. } => ErrorCode::RelationDefinitionNotFound,
            Self::RuleNotFound(_) => ErrorCode::UndefinedRuleReference,
            Self::DepthExceeded(_) => ErrorCode::DepthNotEnough,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Rule(e) => e.code(),
            Self::StorageError(_) => ErrorCode::Storage,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on recursive hops for a single evaluation.
    pub max_depth: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_depth: 50 }
    }
}

impl EngineConfig {
    /// Requested depth clamped to the configured maximum.
    pub fn effective_depth(&self, requested: Option<u32>) -> u32 {
        requested.map_or(self.max_depth, |d| d.min(self.max_depth))
    }
}

/// Read access to persisted relationships and attributes.
pub trait DataReader: Send + Sync {
    fn read_tuples(
        &self,
        filter: &TupleFilter,
        snapshot: Option<SnapshotToken>,
    ) -> impl Future<Output = Result<Vec<Tuple>, CheckError>> + Send;

    fn read_attributes(
        &self,
        filter: &AttributeFilter,
        snapshot: Option<SnapshotToken>,
    ) -> impl Future<Output = Result<Vec<Attribute>, CheckError>> + Send;

    /// Every id of `entity_type` known to the store, on either side of a tuple or with attributes.
    fn list_entity_ids(
        &self,
        entity_type: &str,
        snapshot: Option<SnapshotToken>,
    ) -> impl Future<Output = Result<Vec<String>, CheckError>> + Send;
}

/// Store reads with the request context merged in.
pub(crate) struct Overlay<'a, R: DataReader> {
    reader: &'a R,
    context: &'a Context,
    snapshot: Option<SnapshotToken>,
}

impl<'a, R: DataReader> Overlay<'a, R> {
    pub(crate) fn new(reader: &'a R, context: &'a Context, snapshot: Option<SnapshotToken>) -> Self {
        Self {
            reader,
            context,
            snapshot,
        }
    }

    pub(crate) fn data(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.context.data
    }

    pub(crate) async fn tuples(&self, filter: &TupleFilter) -> Result<Vec<Tuple>, CheckError> {
        let mut tuples = self.reader.read_tuples(filter, self.snapshot).await?;
        for extra in self.context.matching_tuples(filter) {
            if !tuples.contains(extra) {
                tuples.push(extra.clone());
            }
        }
        Ok(tuples)
    }

    /// Contextual values take precedence over stored ones.
    pub(crate) async fn attribute(
        &self,
        entity: &EntityRef,
        name: &str,
    ) -> Result<Option<AttributeValue>, CheckError> {
        if let Some(attr) = self.context.attribute(entity, name) {
            return Ok(Some(attr.value.clone()));
        }
        let stored = self
            .reader
            .read_attributes(&AttributeFilter::exact(entity, name), self.snapshot)
            .await?;
        Ok(stored.into_iter().next().map(|a| a.value))
    }

    pub(crate) async fn entity_ids(&self, entity_type: &str) -> Result<BTreeSet<String>, CheckError> {
        let mut ids: BTreeSet<String> = self
            .reader
            .list_entity_ids(entity_type, self.snapshot)
            .await?
            .into_iter()
            .collect();
        ids.extend(self.context.entity_ids(entity_type).map(str::to_string));
        Ok(ids)
    }
}
