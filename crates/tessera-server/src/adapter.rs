use std::sync::Arc;

use tessera_core::attribute::{Attribute, AttributeFilter};
use tessera_core::engine::{CheckError, DataReader};
use tessera_core::tuple::{SnapshotToken, Tuple, TupleFilter};
use tessera_storage::{AttributeStore, RelationshipStore, StorageError};

/// Exposes a tenant store to the evaluation engines.
pub struct StoreDataReader<S> {
    store: Arc<S>,
}

impl<S> StoreDataReader<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

fn storage_to_check(e: StorageError) -> CheckError {
    CheckError::StorageError(e.to_string())
}

impl<S: RelationshipStore + AttributeStore> DataReader for StoreDataReader<S> {
    async fn read_tuples(
        &self,
        filter: &TupleFilter,
        snapshot: Option<SnapshotToken>,
    ) -> Result<Vec<Tuple>, CheckError> {
        self.store
            .read_relationships(filter, snapshot, None)
            .await
            .map_err(storage_to_check)
    }

    async fn read_attributes(
        &self,
        filter: &AttributeFilter,
        snapshot: Option<SnapshotToken>,
    ) -> Result<Vec<Attribute>, CheckError> {
        self.store
            .read_attributes(filter, snapshot, None)
            .await
            .map_err(storage_to_check)
    }

    async fn list_entity_ids(
        &self,
        entity_type: &str,
        snapshot: Option<SnapshotToken>,
    ) -> Result<Vec<String>, CheckError> {
        self.store
            .list_entity_ids(entity_type, snapshot)
            .await
            .map_err(storage_to_check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_storage::InMemoryStore;

    #[tokio::test]
    async fn adapter_reads_tuples_from_store() {
        let store = Arc::new(InMemoryStore::new());
        store
            .write_relationships(&["document:readme#viewer@user:alice".parse().unwrap()], &[])
            .await
            .unwrap();

        let adapter = StoreDataReader::new(Arc::clone(&store));
        let filter = TupleFilter {
            entity_type: Some("document".to_string()),
            ..Default::default()
        };
        let tuples = adapter.read_tuples(&filter, None).await.unwrap();

        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0].entity.entity_type, "document");
        assert_eq!(tuples[0].subject.subject_id, "alice");
    }

    #[tokio::test]
    async fn adapter_reads_attributes_from_store() {
        let store = Arc::new(InMemoryStore::new());
        store
            .write_attributes(&["document:readme$public|boolean:true".parse().unwrap()], &[])
            .await
            .unwrap();

        let adapter = StoreDataReader::new(Arc::clone(&store));
        let attributes = adapter
            .read_attributes(&AttributeFilter::default(), None)
            .await
            .unwrap();

        assert_eq!(attributes.len(), 1);
        assert_eq!(attributes[0].attribute, "public");
    }

    #[tokio::test]
    async fn adapter_lists_ids_from_both_stores() {
        let store = Arc::new(InMemoryStore::new());
        store
            .write_relationships(&["document:a#viewer@user:alice".parse().unwrap()], &[])
            .await
            .unwrap();
        store
            .write_attributes(&["document:b$public|boolean:true".parse().unwrap()], &[])
            .await
            .unwrap();

        let adapter = StoreDataReader::new(Arc::clone(&store));
        let ids = adapter.list_entity_ids("document", None).await.unwrap();

        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn adapter_maps_storage_error_to_check_error() {
        let store = Arc::new(InMemoryStore::new());
        let adapter = StoreDataReader::new(Arc::clone(&store));

        let result = adapter
            .read_tuples(&TupleFilter::default(), Some(SnapshotToken::new(999)))
            .await;

        let err = result.unwrap_err();
        assert!(
            matches!(err, CheckError::StorageError(ref msg) if msg.contains("ahead")),
            "expected StorageError with 'ahead', got: {err}"
        );
    }

    #[tokio::test]
    async fn adapter_passes_snapshot_token() {
        let store = Arc::new(InMemoryStore::new());
        let token = store
            .write_relationships(&["document:readme#viewer@user:alice".parse().unwrap()], &[])
            .await
            .unwrap();
        store
            .write_relationships(&["document:readme#editor@user:bob".parse().unwrap()], &[])
            .await
            .unwrap();

        let adapter = StoreDataReader::new(Arc::clone(&store));
        let tuples = adapter
            .read_tuples(&TupleFilter::default(), Some(token))
            .await
            .unwrap();

        assert_eq!(tuples.len(), 1, "should only see tuples at snapshot");
        assert_eq!(tuples[0].subject.subject_id, "alice");
    }
}
