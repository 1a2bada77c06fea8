use std::str::FromStr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use tessera_core::attribute::{Attribute, AttributeParseError};
use tessera_core::context::Context;
use tessera_core::engine::{
    CheckRequest, ExpandRequest, LookupEntityRequest, LookupSubjectRequest,
    SubjectPermissionRequest,
};
use tessera_core::error::ErrorCode;
use tessera_core::schema::Graph;
use tessera_core::tuple::{TenantId, Tuple, TupleFilter, TupleParseError};
use tessera_storage::StoreFactory;

use crate::development::{BundleContext, context_error_code};
use crate::error::{ApiError, ItemError};

use super::AppState;
use super::types::*;

trait ParseCode {
    fn code(&self) -> ErrorCode;
}

impl ParseCode for TupleParseError {
    fn code(&self) -> ErrorCode {
        TupleParseError::code(self)
    }
}

impl ParseCode for AttributeParseError {
    fn code(&self) -> ErrorCode {
        AttributeParseError::code(self)
    }
}

fn parse<T>(text: &str) -> Result<T, ApiError>
where
    T: FromStr,
    T::Err: ParseCode + std::fmt::Display,
{
    text.parse()
        .map_err(|e: T::Err| ApiError::bad_request(e.code(), e.to_string()))
}

/// Parses every item, reporting all malformed ones by position.
fn parse_all<T>(items: &[String]) -> Result<Vec<T>, ApiError>
where
    T: FromStr,
    T::Err: ParseCode + std::fmt::Display,
{
    let mut parsed = Vec::with_capacity(items.len());
    let mut errors = Vec::new();
    for (index, text) in items.iter().enumerate() {
        match text.parse::<T>() {
            Ok(item) => parsed.push(item),
            Err(e) => errors.push(ItemError {
                index,
                code: e.code(),
                message: e.to_string(),
            }),
        }
    }
    if errors.is_empty() {
        Ok(parsed)
    } else {
        Err(ApiError::InvalidItems(errors))
    }
}

fn parse_context(context: &BundleContext) -> Result<Context, ApiError> {
    context
        .parse()
        .map_err(|e| ApiError::bad_request(context_error_code(&e), e.to_string()))
}

// --- Schema ---

pub async fn write_schema<F: StoreFactory + 'static>(
    State(state): State<AppState<F>>,
    Extension(tenant_id): Extension<TenantId>,
    Json(req): Json<WriteSchemaRequest>,
) -> Result<Json<WriteSchemaResponse>, ApiError> {
    let output = state
        .service
        .write_schema(&tenant_id, &req.schema, req.force)
        .await?;
    Ok(Json(WriteSchemaResponse {
        version: output.version,
        breaking_changes_overridden: output.breaking_changes_overridden,
    }))
}

pub async fn read_schema<F: StoreFactory + 'static>(
    State(state): State<AppState<F>>,
    Extension(tenant_id): Extension<TenantId>,
    req: Option<Json<ReadSchemaRequest>>,
) -> Result<Json<ReadSchemaResponse>, ApiError> {
    let version = req.and_then(|Json(r)| r.version);
    let stored = state.service.read_schema(&tenant_id, version).await?;
    Ok(Json(ReadSchemaResponse {
        version: stored.version,
        schema: stored.source,
        definition: (*stored.schema).clone(),
    }))
}

pub async fn read_schema_graph<F: StoreFactory + 'static>(
    State(state): State<AppState<F>>,
    Extension(tenant_id): Extension<TenantId>,
) -> Result<Json<Graph>, ApiError> {
    Ok(Json(state.service.read_schema_graph(&tenant_id).await?))
}

// --- Relationships ---

pub async fn write_relationships<F: StoreFactory + 'static>(
    State(state): State<AppState<F>>,
    Extension(tenant_id): Extension<TenantId>,
    Json(req): Json<WriteRelationshipsRequest>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    let tuples: Vec<Tuple> = parse_all(&req.tuples)?;
    let snapshot = state
        .service
        .write_relationships(&tenant_id, &tuples, &req.deletes)
        .await?;
    Ok(Json(SnapshotResponse { snapshot }))
}

pub async fn read_relationships<F: StoreFactory + 'static>(
    State(state): State<AppState<F>>,
    Extension(tenant_id): Extension<TenantId>,
    Json(req): Json<ReadRelationshipsRequest>,
) -> Result<Json<ReadRelationshipsResponse>, ApiError> {
    let tuples = state
        .service
        .read_relationships(&tenant_id, &req.filter, req.snapshot, req.limit)
        .await?;
    Ok(Json(ReadRelationshipsResponse {
        tuples: tuples.iter().map(ToString::to_string).collect(),
    }))
}

pub async fn delete_relationships<F: StoreFactory + 'static>(
    State(state): State<AppState<F>>,
    Extension(tenant_id): Extension<TenantId>,
    Json(req): Json<DeleteRelationshipsRequest>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    let snapshot = match (req.filter, req.tuples.is_empty()) {
        (Some(filter), true) => {
            state
                .service
                .delete_relationships(&tenant_id, &filter)
                .await?
        }
        (None, false) => {
            let tuples: Vec<Tuple> = parse_all(&req.tuples)?;
            let filters: Vec<TupleFilter> = tuples.iter().map(TupleFilter::exact).collect();
            state
                .service
                .write_relationships(&tenant_id, &[], &filters)
                .await?
        }
        _ => {
            return Err(ApiError::bad_request(
                ErrorCode::InvalidArgument,
                "provide either a filter or a list of tuples",
            ));
        }
    };
    Ok(Json(SnapshotResponse { snapshot }))
}

// --- Attributes ---

pub async fn write_attributes<F: StoreFactory + 'static>(
    State(state): State<AppState<F>>,
    Extension(tenant_id): Extension<TenantId>,
    Json(req): Json<WriteAttributesRequest>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    let attributes: Vec<Attribute> = parse_all(&req.attributes)?;
    let snapshot = state
        .service
        .write_attributes(&tenant_id, &attributes, &req.deletes)
        .await?;
    Ok(Json(SnapshotResponse { snapshot }))
}

pub async fn read_attributes<F: StoreFactory + 'static>(
    State(state): State<AppState<F>>,
    Extension(tenant_id): Extension<TenantId>,
    Json(req): Json<ReadAttributesRequest>,
) -> Result<Json<ReadAttributesResponse>, ApiError> {
    let attributes = state
        .service
        .read_attributes(&tenant_id, &req.filter, req.snapshot, req.limit)
        .await?;
    Ok(Json(ReadAttributesResponse {
        attributes: attributes.iter().map(ToString::to_string).collect(),
    }))
}

pub async fn delete_attributes<F: StoreFactory + 'static>(
    State(state): State<AppState<F>>,
    Extension(tenant_id): Extension<TenantId>,
    Json(req): Json<DeleteAttributesRequest>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    if req.filter.is_empty() {
        return Err(ApiError::bad_request(
            ErrorCode::InvalidArgument,
            "delete filter must not be empty",
        ));
    }
    let snapshot = state
        .service
        .delete_attributes(&tenant_id, &req.filter)
        .await?;
    Ok(Json(SnapshotResponse { snapshot }))
}

// --- Permissions ---

pub async fn check<F: StoreFactory + 'static>(
    State(state): State<AppState<F>>,
    Extension(tenant_id): Extension<TenantId>,
    Json(req): Json<CheckRequestBody>,
) -> Result<Json<CheckResponse>, ApiError> {
    let request = CheckRequest {
        entity: parse(&req.entity)?,
        permission: req.permission,
        subject: parse(&req.subject)?,
        context: parse_context(&req.context)?,
        snapshot: req.snapshot,
        depth: req.depth,
    };
    let output = state.service.check(&tenant_id, request).await?;
    Ok(Json(CheckResponse {
        allowed: output.allowed,
        snapshot: output.snapshot,
    }))
}

pub async fn expand<F: StoreFactory + 'static>(
    State(state): State<AppState<F>>,
    Extension(tenant_id): Extension<TenantId>,
    Json(req): Json<ExpandRequestBody>,
) -> Result<Json<ExpandResponse>, ApiError> {
    let request = ExpandRequest {
        entity: parse(&req.entity)?,
        permission: req.permission,
        context: parse_context(&req.context)?,
        snapshot: req.snapshot,
        depth: req.depth,
    };
    let tree = state.service.expand(&tenant_id, request).await?;
    Ok(Json(ExpandResponse { tree }))
}

pub async fn lookup_entity<F: StoreFactory + 'static>(
    State(state): State<AppState<F>>,
    Extension(tenant_id): Extension<TenantId>,
    Json(req): Json<LookupEntityRequestBody>,
) -> Result<Json<LookupEntityResponse>, ApiError> {
    let request = LookupEntityRequest {
        entity_type: req.entity_type,
        permission: req.permission,
        subject: parse(&req.subject)?,
        context: parse_context(&req.context)?,
        snapshot: req.snapshot,
        depth: req.depth,
    };
    let entity_ids = state.service.lookup_entity(&tenant_id, request).await?;
    Ok(Json(LookupEntityResponse { entity_ids }))
}

pub async fn lookup_subject<F: StoreFactory + 'static>(
    State(state): State<AppState<F>>,
    Extension(tenant_id): Extension<TenantId>,
    Json(req): Json<LookupSubjectRequestBody>,
) -> Result<Json<LookupSubjectResponse>, ApiError> {
    let request = LookupSubjectRequest {
        entity: parse(&req.entity)?,
        permission: req.permission,
        subject_reference: parse(&req.subject_reference)?,
        context: parse_context(&req.context)?,
        snapshot: req.snapshot,
        depth: req.depth,
    };
    let subject_ids = state.service.lookup_subject(&tenant_id, request).await?;
    Ok(Json(LookupSubjectResponse { subject_ids }))
}

pub async fn subject_permission<F: StoreFactory + 'static>(
    State(state): State<AppState<F>>,
    Extension(tenant_id): Extension<TenantId>,
    Json(req): Json<SubjectPermissionRequestBody>,
) -> Result<Json<SubjectPermissionResponse>, ApiError> {
    let request = SubjectPermissionRequest {
        entity: parse(&req.entity)?,
        subject: parse(&req.subject)?,
        context: parse_context(&req.context)?,
        snapshot: req.snapshot,
        depth: req.depth,
    };
    let results = state
        .service
        .subject_permission(&tenant_id, request)
        .await?;
    Ok(Json(SubjectPermissionResponse { results }))
}

// --- Development ---

pub async fn run<F: StoreFactory + 'static>(
    State(state): State<AppState<F>>,
    Json(bundle): Json<serde_json::Value>,
) -> Json<RunResponse> {
    let errors = state.development.run(bundle).await;
    Json(RunResponse { errors })
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}
