use std::future::Future;
use std::sync::Arc;

use tessera_core::attribute::{Attribute, AttributeFilter};
use tessera_core::error::ErrorCode;
use tessera_core::schema::types::Schema;
use tessera_core::tuple::{SnapshotToken, TenantId, Tuple, TupleFilter};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("delete filter must have at least one field set")]
    EmptyDeleteFilter,
    #[error("snapshot {requested} is ahead of current {current}")]
    SnapshotAhead { requested: u64, current: u64 },
    #[error("schema version {0} not found")]
    SchemaVersionNotFound(u64),
    #[error("internal storage error: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::EmptyDeleteFilter | Self::SnapshotAhead { .. } => ErrorCode::InvalidArgument,
            Self::SchemaVersionNotFound(_) => ErrorCode::SchemaNotFound,
            Self::Internal(_) => ErrorCode::Storage,
        }
    }
}

/// A compiled schema together with the source it was compiled from.
#[derive(Debug, Clone)]
pub struct StoredSchema {
    pub version: u64,
    pub source: String,
    pub schema: Arc<Schema>,
    /// Transaction that committed this version.
    pub written_at: SnapshotToken,
}

pub trait RelationshipStore: Send + Sync {
    /// Applies `deletes` then `writes` as one transaction. Writing a live tuple again is a no-op.
    fn write_relationships(
        &self,
        writes: &[Tuple],
        deletes: &[TupleFilter],
    ) -> impl Future<Output = Result<SnapshotToken, StorageError>> + Send;

    fn delete_relationships(
        &self,
        filter: &TupleFilter,
    ) -> impl Future<Output = Result<SnapshotToken, StorageError>> + Send;

    fn read_relationships(
        &self,
        filter: &TupleFilter,
        snapshot: Option<SnapshotToken>,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<Tuple>, StorageError>> + Send;

    fn snapshot(&self) -> impl Future<Output = Result<SnapshotToken, StorageError>> + Send;

    /// Ids of `entity_type` appearing in a live tuple (either side) or attribute, sorted.
    fn list_entity_ids(
        &self,
        entity_type: &str,
        snapshot: Option<SnapshotToken>,
    ) -> impl Future<Output = Result<Vec<String>, StorageError>> + Send;
}

pub trait AttributeStore: Send + Sync {
    /// Upserts by `(entity, attribute)`; `deletes` are applied first.
    fn write_attributes(
        &self,
        writes: &[Attribute],
        deletes: &[AttributeFilter],
    ) -> impl Future<Output = Result<SnapshotToken, StorageError>> + Send;

    fn read_attributes(
        &self,
        filter: &AttributeFilter,
        snapshot: Option<SnapshotToken>,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<Attribute>, StorageError>> + Send;
}

pub trait SchemaStore: Send + Sync {
    fn write_schema(
        &self,
        source: &str,
        schema: Arc<Schema>,
    ) -> impl Future<Output = Result<u64, StorageError>> + Send;

    /// The given version, or the latest when `version` is `None`.
    fn read_schema(
        &self,
        version: Option<u64>,
    ) -> impl Future<Output = Result<Option<StoredSchema>, StorageError>> + Send;

    /// The version in force at `snapshot`, i.e. the last one written at or before it.
    fn schema_at(
        &self,
        snapshot: SnapshotToken,
    ) -> impl Future<Output = Result<Option<StoredSchema>, StorageError>> + Send;
}

pub trait Compaction: Send + Sync {
    /// Physically removes rows deleted at or before `before`. Returns the count removed.
    fn prune_deleted(
        &self,
        before: SnapshotToken,
    ) -> impl Future<Output = Result<usize, StorageError>> + Send;
}

pub trait StoreFactory: Send + Sync {
    type Store: RelationshipStore + AttributeStore + SchemaStore + Compaction + Clone + 'static;

    fn for_tenant(&self, tenant_id: &TenantId) -> Self::Store;

    fn tenants(&self) -> Vec<TenantId>;
}
