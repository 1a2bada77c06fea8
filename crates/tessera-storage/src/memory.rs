use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::RwLock;

use tessera_core::attribute::{Attribute, AttributeFilter};
use tessera_core::schema::types::Schema;
use tessera_core::tuple::{SnapshotToken, TenantId, Tuple, TupleFilter};

use crate::traits::{
    AttributeStore, Compaction, RelationshipStore, SchemaStore, StorageError, StoreFactory,
    StoredSchema,
};

const ACTIVE_TX_ID: u64 = u64::MAX;

/// A row stamped with the transactions that created and deleted it.
#[derive(Debug, Clone)]
struct Versioned<T> {
    value: T,
    created_tx_id: u64,
    deleted_tx_id: u64,
}

impl<T> Versioned<T> {
    fn new(value: T, tx_id: u64) -> Self {
        Self {
            value,
            created_tx_id: tx_id,
            deleted_tx_id: ACTIVE_TX_ID,
        }
    }

    fn is_active(&self) -> bool {
        self.deleted_tx_id == ACTIVE_TX_ID
    }

    fn visible_at(&self, snapshot: u64) -> bool {
        self.created_tx_id <= snapshot && self.deleted_tx_id > snapshot
    }
}

#[derive(Debug, Default)]
struct InnerState {
    current_tx: u64,
    tuples: Vec<Versioned<Tuple>>,
    attributes: Vec<Versioned<Attribute>>,
    schemas: Vec<StoredSchema>,
}

impl InnerState {
    fn resolve(&self, snapshot: Option<SnapshotToken>) -> Result<u64, StorageError> {
        match snapshot {
            Some(token) if token.value() > self.current_tx => Err(StorageError::SnapshotAhead {
                requested: token.value(),
                current: self.current_tx,
            }),
            Some(token) => Ok(token.value()),
            None => Ok(self.current_tx),
        }
    }

    fn next_tx(&mut self) -> u64 {
        self.current_tx += 1;
        self.current_tx
    }

    fn delete_tuples(&mut self, filter: &TupleFilter, tx_id: u64) {
        for row in &mut self.tuples {
            if row.is_active() && filter.matches(&row.value) {
                row.deleted_tx_id = tx_id;
            }
        }
    }
}

/// MVCC store: readers share the lock and see a consistent snapshot, writers are serialized.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<InnerState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RelationshipStore for InMemoryStore {
    async fn write_relationships(
        &self,
        writes: &[Tuple],
        deletes: &[TupleFilter],
    ) -> Result<SnapshotToken, StorageError> {
        if deletes.iter().any(TupleFilter::is_empty) {
            return Err(StorageError::EmptyDeleteFilter);
        }

        let mut state = self.state.write().await;
        let tx_id = state.next_tx();

        for filter in deletes {
            state.delete_tuples(filter, tx_id);
        }

        for tuple in writes {
            let live = state
                .tuples
                .iter()
                .any(|row| row.is_active() && &row.value == tuple);
            if !live {
                state.tuples.push(Versioned::new(tuple.clone(), tx_id));
            }
        }

        tracing::debug!(
            tx_id,
            writes = writes.len(),
            deletes = deletes.len(),
            "relationships written"
        );
        Ok(SnapshotToken::new(tx_id))
    }

    async fn delete_relationships(&self, filter: &TupleFilter) -> Result<SnapshotToken, StorageError> {
        if filter.is_empty() {
            return Err(StorageError::EmptyDeleteFilter);
        }

        let mut state = self.state.write().await;
        let tx_id = state.next_tx();
        state.delete_tuples(filter, tx_id);
        Ok(SnapshotToken::new(tx_id))
    }

    async fn read_relationships(
        &self,
        filter: &TupleFilter,
        snapshot: Option<SnapshotToken>,
        limit: Option<usize>,
    ) -> Result<Vec<Tuple>, StorageError> {
        let state = self.state.read().await;
        let snap = state.resolve(snapshot)?;

        Ok(state
            .tuples
            .iter()
            .filter(|row| row.visible_at(snap) && filter.matches(&row.value))
            .map(|row| row.value.clone())
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn snapshot(&self) -> Result<SnapshotToken, StorageError> {
        let state = self.state.read().await;
        Ok(SnapshotToken::new(state.current_tx))
    }

    async fn list_entity_ids(
        &self,
        entity_type: &str,
        snapshot: Option<SnapshotToken>,
    ) -> Result<Vec<String>, StorageError> {
        let state = self.state.read().await;
        let snap = state.resolve(snapshot)?;

        let mut ids = BTreeSet::new();
        for row in state.tuples.iter().filter(|row| row.visible_at(snap)) {
            let tuple = &row.value;
            if tuple.entity.entity_type == entity_type {
                ids.insert(tuple.entity.entity_id.clone());
            }
            if tuple.subject.subject_type == entity_type {
                ids.insert(tuple.subject.subject_id.clone());
            }
        }
        for row in state.attributes.iter().filter(|row| row.visible_at(snap)) {
            if row.value.entity.entity_type == entity_type {
                ids.insert(row.value.entity.entity_id.clone());
            }
        }
        Ok(ids.into_iter().collect())
    }
}

impl AttributeStore for InMemoryStore {
    async fn write_attributes(
        &self,
        writes: &[Attribute],
        deletes: &[AttributeFilter],
    ) -> Result<SnapshotToken, StorageError> {
        if deletes.iter().any(AttributeFilter::is_empty) {
            return Err(StorageError::EmptyDeleteFilter);
        }

        let mut state = self.state.write().await;
        let tx_id = state.next_tx();

        for filter in deletes {
            for row in &mut state.attributes {
                if row.is_active() && filter.matches(&row.value) {
                    row.deleted_tx_id = tx_id;
                }
            }
        }

        for attribute in writes {
            let mut unchanged = false;
            for row in &mut state.attributes {
                if row.is_active() && row.value.key() == attribute.key() {
                    if row.value.value == attribute.value {
                        unchanged = true;
                    } else {
                        row.deleted_tx_id = tx_id;
                    }
                }
            }
            if !unchanged {
                state.attributes.push(Versioned::new(attribute.clone(), tx_id));
            }
        }

        tracing::debug!(
            tx_id,
            writes = writes.len(),
            deletes = deletes.len(),
            "attributes written"
        );
        Ok(SnapshotToken::new(tx_id))
    }

    async fn read_attributes(
        &self,
        filter: &AttributeFilter,
        snapshot: Option<SnapshotToken>,
        limit: Option<usize>,
    ) -> Result<Vec<Attribute>, StorageError> {
        let state = self.state.read().await;
        let snap = state.resolve(snapshot)?;

        Ok(state
            .attributes
            .iter()
            .filter(|row| row.visible_at(snap) && filter.matches(&row.value))
            .map(|row| row.value.clone())
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }
}

impl SchemaStore for InMemoryStore {
    async fn write_schema(&self, source: &str, schema: Arc<Schema>) -> Result<u64, StorageError> {
        let mut state = self.state.write().await;
        let tx_id = state.next_tx();
        let version = state.schemas.len() as u64 + 1;
        state.schemas.push(StoredSchema {
            version,
            source: source.to_string(),
            schema,
            written_at: SnapshotToken::new(tx_id),
        });
        tracing::debug!(tx_id, version, "schema written");
        Ok(version)
    }

    async fn read_schema(&self, version: Option<u64>) -> Result<Option<StoredSchema>, StorageError> {
        let state = self.state.read().await;
        match version {
            None => Ok(state.schemas.last().cloned()),
            Some(v) => state
                .schemas
                .iter()
                .find(|s| s.version == v)
                .cloned()
                .map(Some)
                .ok_or(StorageError::SchemaVersionNotFound(v)),
        }
    }

    async fn schema_at(&self, snapshot: SnapshotToken) -> Result<Option<StoredSchema>, StorageError> {
        let state = self.state.read().await;
        state.resolve(Some(snapshot))?;
        Ok(state
            .schemas
            .iter()
            .rev()
            .find(|s| s.written_at <= snapshot)
            .cloned())
    }
}

impl Compaction for InMemoryStore {
    async fn prune_deleted(&self, before: SnapshotToken) -> Result<usize, StorageError> {
        let mut state = self.state.write().await;
        let cutoff = before.value();
        let keep = |deleted_tx_id: u64| deleted_tx_id == ACTIVE_TX_ID || deleted_tx_id > cutoff;

        let tuples_before = state.tuples.len();
        state.tuples.retain(|row| keep(row.deleted_tx_id));
        let attributes_before = state.attributes.len();
        state.attributes.retain(|row| keep(row.deleted_tx_id));

        Ok((tuples_before - state.tuples.len()) + (attributes_before - state.attributes.len()))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStoreFactory {
    stores: Mutex<HashMap<TenantId, InMemoryStore>>,
}

impl InMemoryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreFactory for InMemoryStoreFactory {
    type Store = InMemoryStore;

    fn for_tenant(&self, tenant_id: &TenantId) -> InMemoryStore {
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        stores.entry(tenant_id.clone()).or_default().clone()
    }

    fn tenants(&self) -> Vec<TenantId> {
        let stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        stores.keys().cloned().collect()
    }
}
