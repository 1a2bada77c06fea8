pub mod gc;
pub mod memory;
pub mod traits;

pub use gc::{GcReport, prune_orphans, run_gc_cycle};
pub use memory::{InMemoryStore, InMemoryStoreFactory};
pub use traits::{
    AttributeStore, Compaction, RelationshipStore, SchemaStore, StorageError, StoreFactory,
    StoredSchema,
};
