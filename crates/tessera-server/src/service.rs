use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tessera_core::attribute::{Attribute, AttributeFilter};
use tessera_core::engine::{
    CheckEngine, CheckError, CheckRequest, EngineConfig, ExpandEngine, ExpandRequest, ExpandTree,
    LookupEngine, LookupEntityRequest, LookupSubjectRequest, SubjectPermissionRequest,
};
use tessera_core::schema::types::Schema;
use tessera_core::schema::{
    BreakingChange, Graph, SchemaLimits, compile_schema, detect_breaking_changes, schema_to_graph,
    validate_schema_limits, validate_source_size,
};
use tessera_core::tuple::{SnapshotToken, TenantId, Tuple, TupleFilter};
use tessera_storage::{
    AttributeStore, GcReport, RelationshipStore, SchemaStore, StorageError, StoreFactory,
    StoredSchema, run_gc_cycle,
};
use tokio::sync::Mutex;

use crate::adapter::StoreDataReader;
use crate::audit;
use crate::error::ApiError;
use crate::metrics::Metrics;
use crate::validation::{validate_all, validate_attribute, validate_tuple};

const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct WriteSchemaOutput {
    pub version: u64,
    pub breaking_changes_overridden: bool,
}

#[derive(Debug)]
pub struct CheckOutput {
    pub allowed: bool,
    /// The snapshot the evaluation was pinned to.
    pub snapshot: SnapshotToken,
}

/// Engines bound to one tenant's store, schema, and snapshot.
struct Prepared<S> {
    reader: Arc<StoreDataReader<S>>,
    schema: Arc<Schema>,
    snapshot: SnapshotToken,
}

pub struct AuthzService<F: StoreFactory> {
    factory: Arc<F>,
    engine_config: EngineConfig,
    schema_limits: SchemaLimits,
    check_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
    schema_write_lock: Mutex<()>,
}

impl<F: StoreFactory> AuthzService<F> {
    pub fn new(factory: Arc<F>, engine_config: EngineConfig, schema_limits: SchemaLimits) -> Self {
        Self {
            factory,
            engine_config,
            schema_limits,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            metrics: None,
            schema_write_lock: Mutex::new(()),
        }
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine_config
    }

    pub fn schema_limits(&self) -> &SchemaLimits {
        &self.schema_limits
    }

    pub fn check_timeout(&self) -> Duration {
        self.check_timeout
    }

    // --- Schema ---

    /// Compiles and stores a new schema version. Readers keep the previous
    /// `Arc<Schema>` until they finish.
    pub async fn write_schema(
        &self,
        tenant_id: &TenantId,
        source: &str,
        force: bool,
    ) -> Result<WriteSchemaOutput, ApiError> {
        validate_source_size(source, &self.schema_limits).map_err(|e| ApiError::Limits(vec![e]))?;
        let schema = compile_schema(source)?;
        validate_schema_limits(&schema, &self.schema_limits).map_err(ApiError::Limits)?;

        let store = self.factory.for_tenant(tenant_id);
        let _guard = self.schema_write_lock.lock().await;

        let mut breaking_changes_overridden = false;
        if let Some(previous) = store.read_schema(None).await? {
            let mut breaking = Vec::new();
            for change in detect_breaking_changes(&previous.schema, &schema) {
                if strands_data(&store, &change).await? {
                    breaking.push(change);
                }
            }
            if !breaking.is_empty() {
                if !force {
                    return Err(ApiError::BreakingChanges(breaking));
                }
                tracing::warn!(
                    tenant_id = %tenant_id,
                    changes = breaking.len(),
                    "breaking schema changes overridden"
                );
                breaking_changes_overridden = true;
            }
        }

        let version = store.write_schema(source, Arc::new(schema)).await?;

        audit::audit_schema_write(tenant_id, version, force, breaking_changes_overridden);
        if let Some(m) = &self.metrics {
            m.record_schema_write();
        }
        Ok(WriteSchemaOutput {
            version,
            breaking_changes_overridden,
        })
    }

    /// The given version, or the latest when `version` is `None`.
    pub async fn read_schema(
        &self,
        tenant_id: &TenantId,
        version: Option<u64>,
    ) -> Result<StoredSchema, ApiError> {
        let store = self.factory.for_tenant(tenant_id);
        store
            .read_schema(version)
            .await?
            .ok_or(ApiError::SchemaNotFound)
    }

    pub async fn read_schema_graph(&self, tenant_id: &TenantId) -> Result<Graph, ApiError> {
        let stored = self.read_schema(tenant_id, None).await?;
        Ok(schema_to_graph(&stored.schema))
    }

    // --- Relationships ---

    /// Validates every write against the active schema, then applies deletes and
    /// writes as one transaction. Nothing is written if any item is rejected.
    pub async fn write_relationships(
        &self,
        tenant_id: &TenantId,
        writes: &[Tuple],
        deletes: &[TupleFilter],
    ) -> Result<SnapshotToken, ApiError> {
        let store = self.factory.for_tenant(tenant_id);
        let schema = current_schema(&store).await?;
        validate_all(writes, |t| validate_tuple(&schema, t)).map_err(ApiError::InvalidItems)?;

        let token = store.write_relationships(writes, deletes).await?;

        audit::audit_relationship_write(tenant_id, writes.len(), deletes.len(), &token);
        if let Some(m) = &self.metrics {
            m.record_write();
        }
        Ok(token)
    }

    pub async fn delete_relationships(
        &self,
        tenant_id: &TenantId,
        filter: &TupleFilter,
    ) -> Result<SnapshotToken, ApiError> {
        let store = self.factory.for_tenant(tenant_id);
        let token = store.delete_relationships(filter).await?;

        audit::audit_relationship_write(tenant_id, 0, 1, &token);
        if let Some(m) = &self.metrics {
            m.record_write();
        }
        Ok(token)
    }

    pub async fn read_relationships(
        &self,
        tenant_id: &TenantId,
        filter: &TupleFilter,
        snapshot: Option<SnapshotToken>,
        limit: Option<usize>,
    ) -> Result<Vec<Tuple>, ApiError> {
        let store = self.factory.for_tenant(tenant_id);
        Ok(store.read_relationships(filter, snapshot, limit).await?)
    }

    // --- Attributes ---

    pub async fn write_attributes(
        &self,
        tenant_id: &TenantId,
        writes: &[Attribute],
        deletes: &[AttributeFilter],
    ) -> Result<SnapshotToken, ApiError> {
        let store = self.factory.for_tenant(tenant_id);
        let schema = current_schema(&store).await?;
        validate_all(writes, |a| validate_attribute(&schema, a)).map_err(ApiError::InvalidItems)?;

        let token = store.write_attributes(writes, deletes).await?;

        audit::audit_attribute_write(tenant_id, writes.len(), deletes.len(), &token);
        if let Some(m) = &self.metrics {
            m.record_write();
        }
        Ok(token)
    }

    pub async fn delete_attributes(
        &self,
        tenant_id: &TenantId,
        filter: &AttributeFilter,
    ) -> Result<SnapshotToken, ApiError> {
        let store = self.factory.for_tenant(tenant_id);
        let token = store
            .write_attributes(&[], std::slice::from_ref(filter))
            .await?;

        audit::audit_attribute_write(tenant_id, 0, 1, &token);
        if let Some(m) = &self.metrics {
            m.record_write();
        }
        Ok(token)
    }

    pub async fn read_attributes(
        &self,
        tenant_id: &TenantId,
        filter: &AttributeFilter,
        snapshot: Option<SnapshotToken>,
        limit: Option<usize>,
    ) -> Result<Vec<Attribute>, ApiError> {
        let store = self.factory.for_tenant(tenant_id);
        Ok(store.read_attributes(filter, snapshot, limit).await?)
    }

    // --- Permissions ---

    pub async fn check(
        &self,
        tenant_id: &TenantId,
        mut request: CheckRequest,
    ) -> Result<CheckOutput, ApiError> {
        let prepared = self.prepare(tenant_id, request.snapshot).await?;
        request.snapshot = Some(prepared.snapshot);
        let engine = CheckEngine::new(
            prepared.reader,
            prepared.schema,
            self.engine_config.clone(),
        );

        let result = self.timed(engine.check(&request)).await?;
        if let Some(m) = &self.metrics {
            m.record_check(result.allowed);
        }
        Ok(CheckOutput {
            allowed: result.allowed,
            snapshot: prepared.snapshot,
        })
    }

    pub async fn expand(
        &self,
        tenant_id: &TenantId,
        mut request: ExpandRequest,
    ) -> Result<ExpandTree, ApiError> {
        let prepared = self.prepare(tenant_id, request.snapshot).await?;
        request.snapshot = Some(prepared.snapshot);
        let engine = ExpandEngine::new(
            prepared.reader,
            prepared.schema,
            self.engine_config.clone(),
        );

        self.timed(engine.expand(&request)).await
    }

    pub async fn lookup_entity(
        &self,
        tenant_id: &TenantId,
        mut request: LookupEntityRequest,
    ) -> Result<Vec<String>, ApiError> {
        let prepared = self.prepare(tenant_id, request.snapshot).await?;
        request.snapshot = Some(prepared.snapshot);
        let engine = LookupEngine::new(
            prepared.reader,
            prepared.schema,
            self.engine_config.clone(),
        );

        let ids = self.timed(engine.lookup_entity(&request)).await?;
        if let Some(m) = &self.metrics {
            m.record_lookup();
        }
        Ok(ids)
    }

    pub async fn lookup_subject(
        &self,
        tenant_id: &TenantId,
        mut request: LookupSubjectRequest,
    ) -> Result<Vec<String>, ApiError> {
        let prepared = self.prepare(tenant_id, request.snapshot).await?;
        request.snapshot = Some(prepared.snapshot);
        let engine = LookupEngine::new(
            prepared.reader,
            prepared.schema,
            self.engine_config.clone(),
        );

        let ids = self.timed(engine.lookup_subject(&request)).await?;
        if let Some(m) = &self.metrics {
            m.record_lookup();
        }
        Ok(ids)
    }

    pub async fn subject_permission(
        &self,
        tenant_id: &TenantId,
        mut request: SubjectPermissionRequest,
    ) -> Result<BTreeMap<String, bool>, ApiError> {
        let prepared = self.prepare(tenant_id, request.snapshot).await?;
        request.snapshot = Some(prepared.snapshot);
        let engine = CheckEngine::new(
            prepared.reader,
            prepared.schema,
            self.engine_config.clone(),
        );

        self.timed(engine.subject_permission(&request)).await
    }

    // --- Maintenance ---

    /// Runs one garbage collection cycle over every tenant.
    pub async fn collect_garbage(&self, retain_snapshots: u64) -> Result<GcReport, ApiError> {
        let mut total = GcReport::default();
        for tenant_id in self.factory.tenants() {
            let store = self.factory.for_tenant(&tenant_id);
            let report = run_gc_cycle(&store, retain_snapshots).await?;
            total.orphaned += report.orphaned;
            total.pruned += report.pruned;
        }
        Ok(total)
    }

    async fn prepare(
        &self,
        tenant_id: &TenantId,
        requested: Option<SnapshotToken>,
    ) -> Result<Prepared<F::Store>, ApiError> {
        let store = Arc::new(self.factory.for_tenant(tenant_id));

        let current = store.snapshot().await?;
        let snapshot = match requested {
            Some(token) if token > current => {
                return Err(StorageError::SnapshotAhead {
                    requested: token.value(),
                    current: current.value(),
                }
                .into());
            }
            Some(token) => token,
            None => current,
        };
        let schema = store
            .schema_at(snapshot)
            .await?
            .map(|stored| stored.schema)
            .ok_or(ApiError::SchemaNotFound)?;

        Ok(Prepared {
            reader: Arc::new(StoreDataReader::new(store)),
            schema,
            snapshot,
        })
    }

    async fn timed<T>(
        &self,
        evaluation: impl Future<Output = Result<T, CheckError>>,
    ) -> Result<T, ApiError> {
        match tokio::time::timeout(self.check_timeout, evaluation).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                if let Some(m) = &self.metrics {
                    m.record_timeout();
                }
                Err(ApiError::Timeout(self.check_timeout.as_millis() as u64))
            }
        }
    }
}

/// Whether the store holds data that `change` would leave without a definition.
async fn strands_data<S>(store: &S, change: &BreakingChange) -> Result<bool, StorageError>
where
    S: RelationshipStore + AttributeStore,
{
    let tuples = |entity: &str, relation: Option<&str>| TupleFilter {
        entity_type: Some(entity.to_string()),
        relation: relation.map(str::to_string),
        ..TupleFilter::default()
    };
    let attributes = |entity: &str, attribute: Option<&str>| AttributeFilter {
        entity_type: Some(entity.to_string()),
        attribute: attribute.map(str::to_string),
        ..AttributeFilter::default()
    };

    match change {
        BreakingChange::EntityRemoved { entity } => {
            Ok(any_tuple(store, &tuples(entity.as_str(), None)).await?
                || any_attribute(store, &attributes(entity.as_str(), None)).await?)
        }
        BreakingChange::RelationRemoved { entity, relation } => {
            any_tuple(store, &tuples(entity.as_str(), Some(relation.as_str()))).await
        }
        BreakingChange::SubjectTypesChanged {
            entity,
            relation,
            removed,
        } => {
            for subject_type in removed {
                let filter = TupleFilter {
                    subject_type: Some(subject_type.type_name.clone()),
                    subject_relation: Some(subject_type.relation.clone()),
                    ..tuples(entity.as_str(), Some(relation.as_str()))
                };
                if any_tuple(store, &filter).await? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        BreakingChange::AttributeRemoved { entity, attribute }
        | BreakingChange::AttributeTypeChanged { entity, attribute } => {
            any_attribute(store, &attributes(entity.as_str(), Some(attribute.as_str()))).await
        }
    }
}

async fn any_tuple<S: RelationshipStore>(store: &S, filter: &TupleFilter) -> Result<bool, StorageError> {
    Ok(!store.read_relationships(filter, None, Some(1)).await?.is_empty())
}

async fn any_attribute<S: AttributeStore>(
    store: &S,
    filter: &AttributeFilter,
) -> Result<bool, StorageError> {
    Ok(!store.read_attributes(filter, None, Some(1)).await?.is_empty())
}

async fn current_schema<S: SchemaStore>(store: &S) -> Result<Arc<Schema>, ApiError> {
    store
        .read_schema(None)
        .await?
        .map(|stored| stored.schema)
        .ok_or(ApiError::SchemaNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::context::Context;
    use tessera_core::error::ErrorCode;
    use tessera_core::tuple::{EntityRef, RelationReference, SubjectRef};
    use tessera_storage::InMemoryStoreFactory;

    const SCHEMA: &str = r#"
        entity user {}

        entity document {
            relation owner @user
            relation editor @user
            relation viewer @user

            attribute public boolean

            permission edit = owner or editor
            permission view = edit or viewer or public
        }
    "#;

    fn make_service() -> (AuthzService<InMemoryStoreFactory>, TenantId) {
        let factory = Arc::new(InMemoryStoreFactory::new());
        let service = AuthzService::new(
            Arc::clone(&factory),
            EngineConfig::default(),
            SchemaLimits::default(),
        );
        let tenant_id = TenantId::new(uuid::Uuid::new_v4());
        (service, tenant_id)
    }

    async fn setup_schema(service: &AuthzService<InMemoryStoreFactory>, tenant_id: &TenantId) {
        service
            .write_schema(tenant_id, SCHEMA, false)
            .await
            .unwrap();
    }

    async fn write_tuple(
        service: &AuthzService<InMemoryStoreFactory>,
        tenant_id: &TenantId,
        tuple: &str,
    ) -> SnapshotToken {
        service
            .write_relationships(tenant_id, &[tuple.parse().unwrap()], &[])
            .await
            .unwrap()
    }

    fn check_request(entity: &str, permission: &str, subject: &str) -> CheckRequest {
        CheckRequest {
            entity: entity.parse().unwrap(),
            permission: permission.to_string(),
            subject: subject.parse().unwrap(),
            context: Context::default(),
            snapshot: None,
            depth: None,
        }
    }

    // --- Schema ---

    #[tokio::test]
    async fn write_schema_stores_and_reads() {
        let (service, tenant_id) = make_service();

        let output = service
            .write_schema(&tenant_id, SCHEMA, false)
            .await
            .unwrap();

        assert_eq!(output.version, 1);
        let stored = service.read_schema(&tenant_id, None).await.unwrap();
        assert_eq!(stored.version, 1);
        assert!(stored.source.contains("document"));
        assert!(stored.schema.get_entity("document").is_some());
    }

    #[tokio::test]
    async fn write_schema_returns_positional_compile_error() {
        let (service, tenant_id) = make_service();

        let result = service
            .write_schema(
                &tenant_id,
                "entity user {}\nentity doc {\n  permission edit = nonexistent\n}",
                false,
            )
            .await;

        let Err(ApiError::Compile(err)) = result else {
            panic!("expected compile error");
        };
        assert_eq!(err.code, ErrorCode::UndefinedRelationReference);
        assert_eq!(err.position.map(|p| p.line), Some(3));
        assert!(err.to_string().contains("nonexistent"));
    }

    #[tokio::test]
    async fn failed_schema_write_keeps_previous_version() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;

        let result = service
            .write_schema(&tenant_id, "entity broken {", false)
            .await;

        assert!(result.is_err());
        let stored = service.read_schema(&tenant_id, None).await.unwrap();
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn write_schema_enforces_limits() {
        let factory = Arc::new(InMemoryStoreFactory::new());
        let limits = SchemaLimits {
            max_entities: 1,
            ..SchemaLimits::default()
        };
        let service = AuthzService::new(factory, EngineConfig::default(), limits);
        let tenant_id = TenantId::new(uuid::Uuid::new_v4());

        let result = service.write_schema(&tenant_id, SCHEMA, false).await;

        assert!(
            matches!(result, Err(ApiError::Limits(_))),
            "expected Limits error, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn write_schema_rejects_breaking_changes_without_force() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;
        write_tuple(&service, &tenant_id, "document:1#owner@user:alice").await;

        let result = service
            .write_schema(&tenant_id, "entity user {}", false)
            .await;

        match result {
            Err(ApiError::BreakingChanges(changes)) => {
                assert_eq!(
                    changes,
                    vec![BreakingChange::EntityRemoved {
                        entity: "document".to_string()
                    }]
                );
            }
            other => panic!("expected BreakingChanges error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn removing_unused_members_is_not_breaking() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;
        write_tuple(&service, &tenant_id, "document:1#owner@user:alice").await;

        let without_viewer = SCHEMA
            .replace("relation viewer @user", "")
            .replace("attribute public boolean", "")
            .replace(" or viewer or public", "");
        let output = service
            .write_schema(&tenant_id, &without_viewer, false)
            .await
            .unwrap();

        assert_eq!(output.version, 2);
        assert!(!output.breaking_changes_overridden);
    }

    #[tokio::test]
    async fn removing_relation_with_tuples_is_breaking() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;
        write_tuple(&service, &tenant_id, "document:1#viewer@user:alice").await;

        let without_viewer = SCHEMA
            .replace("relation viewer @user", "")
            .replace(" or viewer", "");
        let result = service
            .write_schema(&tenant_id, &without_viewer, false)
            .await;

        match result {
            Err(ApiError::BreakingChanges(changes)) => {
                assert_eq!(
                    changes,
                    vec![BreakingChange::RelationRemoved {
                        entity: "document".to_string(),
                        relation: "viewer".to_string(),
                    }]
                );
            }
            other => panic!("expected BreakingChanges error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn narrowing_subject_types_checks_only_removed_subjects() {
        let (service, tenant_id) = make_service();
        let wide = r#"
            entity user {}
            entity group { relation member @user }
            entity document { relation viewer @user @group#member }
        "#;
        let narrow = r#"
            entity user {}
            entity group { relation member @user }
            entity document { relation viewer @user }
        "#;
        service.write_schema(&tenant_id, wide, false).await.unwrap();
        write_tuple(&service, &tenant_id, "document:1#viewer@user:alice").await;

        service.write_schema(&tenant_id, narrow, false).await.unwrap();
        service.write_schema(&tenant_id, wide, false).await.unwrap();
        write_tuple(&service, &tenant_id, "document:1#viewer@group:eng#member").await;

        let result = service.write_schema(&tenant_id, narrow, false).await;
        assert!(
            matches!(result, Err(ApiError::BreakingChanges(_))),
            "expected BreakingChanges error, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn write_schema_accepts_breaking_changes_with_force() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;
        write_tuple(&service, &tenant_id, "document:1#owner@user:alice").await;

        let result = service
            .write_schema(&tenant_id, "entity user {}", true)
            .await
            .unwrap();

        assert!(result.breaking_changes_overridden);
        assert_eq!(result.version, 2);
        let stored = service.read_schema(&tenant_id, None).await.unwrap();
        assert!(!stored.source.contains("document"));
        let first = service.read_schema(&tenant_id, Some(1)).await.unwrap();
        assert!(first.source.contains("document"));
    }

    #[tokio::test]
    async fn read_schema_without_any_version_is_not_found() {
        let (service, tenant_id) = make_service();

        let result = service.read_schema(&tenant_id, None).await;
        assert!(matches!(result, Err(ApiError::SchemaNotFound)));
    }

    #[tokio::test]
    async fn schema_graph_reflects_latest_version() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;
        let before = service.read_schema_graph(&tenant_id).await.unwrap();

        service
            .write_schema(
                &tenant_id,
                &format!("{SCHEMA}\nentity folder {{ relation owner @user }}"),
                false,
            )
            .await
            .unwrap();
        let after = service.read_schema_graph(&tenant_id).await.unwrap();

        assert!(!before.nodes.iter().any(|n| n.id == "entity:folder"));
        assert!(after.nodes.iter().any(|n| n.id == "entity:folder"));
    }

    // --- Relationships ---

    #[tokio::test]
    async fn write_relationships_requires_schema() {
        let (service, tenant_id) = make_service();

        let result = service
            .write_relationships(&tenant_id, &["document:1#owner@user:1".parse().unwrap()], &[])
            .await;

        assert!(matches!(result, Err(ApiError::SchemaNotFound)));
    }

    #[tokio::test]
    async fn write_relationships_rejects_batch_with_invalid_items() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;

        let result = service
            .write_relationships(
                &tenant_id,
                &[
                    "document:1#owner@user:1".parse().unwrap(),
                    "document:1#admin@user:1".parse().unwrap(),
                ],
                &[],
            )
            .await;

        let Err(ApiError::InvalidItems(items)) = result else {
            panic!("expected per-item errors");
        };
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].index, 1);
        assert_eq!(items[0].code, ErrorCode::RelationDefinitionNotFound);

        let stored = service
            .read_relationships(&tenant_id, &TupleFilter::default(), None, None)
            .await
            .unwrap();
        assert!(stored.is_empty(), "nothing should be written");
    }

    #[tokio::test]
    async fn write_and_read_relationships_round_trip() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;

        let token = write_tuple(&service, &tenant_id, "document:readme#viewer@user:alice").await;

        let filter = TupleFilter {
            entity_type: Some("document".to_string()),
            ..Default::default()
        };
        let tuples = service
            .read_relationships(&tenant_id, &filter, None, None)
            .await
            .unwrap();

        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0].subject.subject_id, "alice");
        assert!(token.value() > 0);
    }

    #[tokio::test]
    async fn read_relationships_respects_snapshot() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;

        let token = write_tuple(&service, &tenant_id, "document:readme#viewer@user:alice").await;
        write_tuple(&service, &tenant_id, "document:readme#editor@user:bob").await;

        let tuples = service
            .read_relationships(&tenant_id, &TupleFilter::default(), Some(token), None)
            .await
            .unwrap();

        assert_eq!(tuples.len(), 1, "should only see tuples at snapshot");
    }

    #[tokio::test]
    async fn delete_relationships_by_filter() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;
        write_tuple(&service, &tenant_id, "document:1#viewer@user:alice").await;
        write_tuple(&service, &tenant_id, "document:1#owner@user:alice").await;

        let filter = TupleFilter {
            relation: Some("viewer".to_string()),
            ..Default::default()
        };
        service
            .delete_relationships(&tenant_id, &filter)
            .await
            .unwrap();

        let remaining = service
            .read_relationships(&tenant_id, &TupleFilter::default(), None, None)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].relation, "owner");
    }

    #[tokio::test]
    async fn delete_relationships_rejects_empty_filter() {
        let (service, tenant_id) = make_service();

        let result = service
            .delete_relationships(&tenant_id, &TupleFilter::default())
            .await;

        assert!(matches!(
            result,
            Err(ApiError::Storage(StorageError::EmptyDeleteFilter))
        ));
    }

    // --- Attributes ---

    #[tokio::test]
    async fn write_attributes_validates_type() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;

        let result = service
            .write_attributes(&tenant_id, &["document:1$public|string:yes".parse().unwrap()], &[])
            .await;

        let Err(ApiError::InvalidItems(items)) = result else {
            panic!("expected per-item errors");
        };
        assert_eq!(items[0].code, ErrorCode::AttributeTypeMismatch);
    }

    #[tokio::test]
    async fn attribute_write_upserts_and_delete_removes() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;

        service
            .write_attributes(&tenant_id, &["document:1$public|boolean:true".parse().unwrap()], &[])
            .await
            .unwrap();
        service
            .write_attributes(&tenant_id, &["document:1$public|boolean:false".parse().unwrap()], &[])
            .await
            .unwrap();

        let stored = service
            .read_attributes(&tenant_id, &AttributeFilter::default(), None, None)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].value.as_bool(), Some(false));

        service
            .delete_attributes(
                &tenant_id,
                &AttributeFilter::exact(&EntityRef::new("document", "1"), "public"),
            )
            .await
            .unwrap();
        let stored = service
            .read_attributes(&tenant_id, &AttributeFilter::default(), None, None)
            .await
            .unwrap();
        assert!(stored.is_empty());
    }

    // --- Permissions ---

    #[tokio::test]
    async fn check_grants_direct_relation_and_pins_snapshot() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;
        let token = write_tuple(&service, &tenant_id, "document:readme#viewer@user:alice").await;

        let result = service
            .check(&tenant_id, check_request("document:readme", "view", "user:alice"))
            .await
            .unwrap();

        assert!(result.allowed);
        assert_eq!(result.snapshot, token);
    }

    #[tokio::test]
    async fn check_denies_when_no_relation() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;

        let result = service
            .check(&tenant_id, check_request("document:readme", "view", "user:alice"))
            .await
            .unwrap();

        assert!(!result.allowed);
    }

    #[tokio::test]
    async fn check_at_earlier_snapshot_ignores_later_writes() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;
        let before = write_tuple(&service, &tenant_id, "document:other#viewer@user:bob").await;
        write_tuple(&service, &tenant_id, "document:readme#owner@user:alice").await;

        let mut request = check_request("document:readme", "edit", "user:alice");
        request.snapshot = Some(before);
        let result = service.check(&tenant_id, request).await.unwrap();

        assert!(!result.allowed);
    }

    #[tokio::test]
    async fn check_rejects_snapshot_from_the_future() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;

        let mut request = check_request("document:readme", "edit", "user:alice");
        request.snapshot = Some(SnapshotToken::new(999));
        let result = service.check(&tenant_id, request).await;

        assert!(matches!(
            result,
            Err(ApiError::Storage(StorageError::SnapshotAhead { .. }))
        ));
    }

    #[tokio::test]
    async fn pinned_snapshot_evaluates_with_schema_of_that_snapshot() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;
        let token = write_tuple(&service, &tenant_id, "document:readme#owner@user:alice").await;

        let editors_only =
            SCHEMA.replace("permission edit = owner or editor", "permission edit = editor");
        service
            .write_schema(&tenant_id, &editors_only, true)
            .await
            .unwrap();

        let mut pinned = check_request("document:readme", "edit", "user:alice");
        pinned.snapshot = Some(token);
        let old = service.check(&tenant_id, pinned).await.unwrap();
        let now = service
            .check(&tenant_id, check_request("document:readme", "edit", "user:alice"))
            .await
            .unwrap();

        assert!(old.allowed, "owner grants edit under the schema in force at the token");
        assert_eq!(old.snapshot, token);
        assert!(!now.allowed);
        assert!(now.snapshot > token);
    }

    #[tokio::test]
    async fn snapshot_before_first_schema_has_no_schema() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;

        let mut request = check_request("document:readme", "edit", "user:alice");
        request.snapshot = Some(SnapshotToken::new(0));
        let result = service.check(&tenant_id, request).await;

        assert!(matches!(result, Err(ApiError::SchemaNotFound)), "got: {result:?}");
    }

    #[tokio::test]
    async fn check_unknown_type_returns_error() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;

        let result = service
            .check(&tenant_id, check_request("nonexistent:x", "view", "user:alice"))
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.code(), ErrorCode::EntityDefinitionNotFound);
    }

    #[tokio::test]
    async fn check_without_schema_returns_error() {
        let (service, tenant_id) = make_service();

        let result = service
            .check(&tenant_id, check_request("document:readme", "view", "user:alice"))
            .await;

        assert!(
            matches!(result, Err(ApiError::SchemaNotFound)),
            "expected SchemaNotFound, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn check_uses_contextual_attributes() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;

        let mut request = check_request("document:readme", "view", "user:alice");
        request.context.attributes = vec!["document:readme$public|boolean:true".parse().unwrap()];
        let result = service.check(&tenant_id, request).await.unwrap();

        assert!(result.allowed);
    }

    #[tokio::test]
    async fn check_times_out() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;
        let service = service.with_check_timeout(Duration::ZERO);

        let result = service
            .check(&tenant_id, check_request("document:readme", "view", "user:alice"))
            .await;

        // A zero budget may still complete when the evaluation never yields.
        if let Err(err) = result {
            assert!(matches!(err, ApiError::Timeout(0)), "got: {err:?}");
        }
    }

    #[tokio::test]
    async fn expand_returns_union_tree() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;
        write_tuple(&service, &tenant_id, "document:readme#viewer@user:alice").await;

        let tree = service
            .expand(
                &tenant_id,
                ExpandRequest {
                    entity: EntityRef::new("document", "readme"),
                    permission: "view".to_string(),
                    context: Context::default(),
                    snapshot: None,
                    depth: None,
                },
            )
            .await
            .unwrap();

        assert!(matches!(tree, ExpandTree::Union { .. }));
    }

    #[tokio::test]
    async fn lookup_entity_matches_checks() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;
        write_tuple(&service, &tenant_id, "document:readme#viewer@user:alice").await;
        write_tuple(&service, &tenant_id, "document:design#owner@user:alice").await;
        write_tuple(&service, &tenant_id, "document:secret#viewer@user:bob").await;

        let ids = service
            .lookup_entity(
                &tenant_id,
                LookupEntityRequest {
                    entity_type: "document".to_string(),
                    permission: "view".to_string(),
                    subject: SubjectRef::direct("user", "alice"),
                    context: Context::default(),
                    snapshot: None,
                    depth: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(ids, vec!["design".to_string(), "readme".to_string()]);
    }

    #[tokio::test]
    async fn lookup_subject_returns_sorted_unique_ids() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;
        write_tuple(&service, &tenant_id, "document:readme#viewer@user:carol").await;
        write_tuple(&service, &tenant_id, "document:readme#owner@user:alice").await;
        write_tuple(&service, &tenant_id, "document:readme#editor@user:alice").await;

        let ids = service
            .lookup_subject(
                &tenant_id,
                LookupSubjectRequest {
                    entity: EntityRef::new("document", "readme"),
                    permission: "edit".to_string(),
                    subject_reference: RelationReference::new("user", None),
                    context: Context::default(),
                    snapshot: None,
                    depth: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(ids, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn subject_permission_lists_every_permission() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;
        write_tuple(&service, &tenant_id, "document:readme#viewer@user:alice").await;

        let results = service
            .subject_permission(
                &tenant_id,
                SubjectPermissionRequest {
                    entity: EntityRef::new("document", "readme"),
                    subject: SubjectRef::direct("user", "alice"),
                    context: Context::default(),
                    snapshot: None,
                    depth: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(results.get("edit"), Some(&false));
        assert_eq!(results.get("view"), Some(&true));
    }

    // --- Maintenance ---

    #[tokio::test]
    async fn collect_garbage_prunes_orphans_after_forced_schema_change() {
        let (service, tenant_id) = make_service();
        setup_schema(&service, &tenant_id).await;
        write_tuple(&service, &tenant_id, "document:1#viewer@user:alice").await;
        service
            .write_schema(
                &tenant_id,
                "entity user {} entity document { relation owner @user }",
                true,
            )
            .await
            .unwrap();

        let report = service.collect_garbage(1_000).await.unwrap();

        assert_eq!(report.orphaned, 1);
        let remaining = service
            .read_relationships(&tenant_id, &TupleFilter::default(), None, None)
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }
}
