use tessera_core::attribute::AttributeFilter;
use tessera_core::schema::types::Schema;
use tessera_core::tuple::{SnapshotToken, TupleFilter};

use crate::traits::{AttributeStore, Compaction, RelationshipStore, SchemaStore, StorageError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub orphaned: usize,
    pub pruned: usize,
}

/// Deletes tuples and attributes that no longer fit `schema`.
pub async fn prune_orphans<S: RelationshipStore + AttributeStore>(
    store: &S,
    schema: &Schema,
) -> Result<usize, StorageError> {
    let tuples = store
        .read_relationships(&TupleFilter::default(), None, None)
        .await?;
    let orphan_tuples: Vec<TupleFilter> = tuples
        .iter()
        .filter(|t| {
            schema
                .get_entity(&t.entity.entity_type)
                .is_none_or(|e| e.get_relation(&t.relation).is_none())
        })
        .map(TupleFilter::exact)
        .collect();

    let attributes = store
        .read_attributes(&AttributeFilter::default(), None, None)
        .await?;
    let orphan_attributes: Vec<AttributeFilter> = attributes
        .iter()
        .filter(|a| {
            schema
                .get_entity(&a.entity.entity_type)
                .is_none_or(|e| e.get_attribute(&a.attribute).is_none())
        })
        .map(|a| AttributeFilter::exact(&a.entity, &a.attribute))
        .collect();

    if !orphan_tuples.is_empty() {
        store.write_relationships(&[], &orphan_tuples).await?;
    }
    if !orphan_attributes.is_empty() {
        store.write_attributes(&[], &orphan_attributes).await?;
    }

    Ok(orphan_tuples.len() + orphan_attributes.len())
}

/// Removes orphans under the latest schema, then compacts tombstones older than
/// `retain_snapshots` transactions.
pub async fn run_gc_cycle<S>(store: &S, retain_snapshots: u64) -> Result<GcReport, StorageError>
where
    S: RelationshipStore + AttributeStore + SchemaStore + Compaction,
{
    let orphaned = match store.read_schema(None).await? {
        Some(stored) => prune_orphans(store, &stored.schema).await?,
        None => 0,
    };

    let current = store.snapshot().await?.value();
    let before = SnapshotToken::new(current.saturating_sub(retain_snapshots));
    let pruned = store.prune_deleted(before).await?;

    if orphaned > 0 || pruned > 0 {
        tracing::info!(orphaned, pruned, "gc cycle completed");
    }
    Ok(GcReport { orphaned, pruned })
}
