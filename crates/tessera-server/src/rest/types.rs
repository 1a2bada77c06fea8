use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tessera_core::attribute::AttributeFilter;
use tessera_core::engine::ExpandTree;
use tessera_core::schema::types::Schema;
use tessera_core::tuple::{SnapshotToken, TupleFilter};

use crate::development::{BundleContext, RunError};

#[derive(Debug, Deserialize)]
pub struct WriteSchemaRequest {
    pub schema: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct WriteSchemaResponse {
    pub version: u64,
    pub breaking_changes_overridden: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReadSchemaRequest {
    pub version: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ReadSchemaResponse {
    pub version: u64,
    /// Source text as written.
    pub schema: String,
    pub definition: Schema,
}

#[derive(Debug, Deserialize)]
pub struct WriteRelationshipsRequest {
    /// Text form, `entity:id#relation@subject:id[#relation]`.
    pub tuples: Vec<String>,
    #[serde(default)]
    pub deletes: Vec<TupleFilter>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReadRelationshipsRequest {
    pub filter: TupleFilter,
    pub snapshot: Option<SnapshotToken>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ReadRelationshipsResponse {
    pub tuples: Vec<String>,
}

/// Either a filter or an explicit list of tuples, not both.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeleteRelationshipsRequest {
    pub filter: Option<TupleFilter>,
    pub tuples: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct WriteAttributesRequest {
    /// Text form, `entity:id$attribute|type:value`.
    pub attributes: Vec<String>,
    #[serde(default)]
    pub deletes: Vec<AttributeFilter>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReadAttributesRequest {
    pub filter: AttributeFilter,
    pub snapshot: Option<SnapshotToken>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ReadAttributesResponse {
    pub attributes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteAttributesRequest {
    pub filter: AttributeFilter,
}

#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub snapshot: SnapshotToken,
}

#[derive(Debug, Deserialize)]
pub struct CheckRequestBody {
    pub entity: String,
    pub permission: String,
    pub subject: String,
    #[serde(default)]
    pub context: BundleContext,
    #[serde(default)]
    pub depth: Option<u32>,
    #[serde(default)]
    pub snapshot: Option<SnapshotToken>,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub allowed: bool,
    pub snapshot: SnapshotToken,
}

#[derive(Debug, Deserialize)]
pub struct ExpandRequestBody {
    pub entity: String,
    pub permission: String,
    #[serde(default)]
    pub context: BundleContext,
    #[serde(default)]
    pub depth: Option<u32>,
    #[serde(default)]
    pub snapshot: Option<SnapshotToken>,
}

#[derive(Debug, Serialize)]
pub struct ExpandResponse {
    pub tree: ExpandTree,
}

#[derive(Debug, Deserialize)]
pub struct LookupEntityRequestBody {
    pub entity_type: String,
    pub permission: String,
    pub subject: String,
    #[serde(default)]
    pub context: BundleContext,
    #[serde(default)]
    pub depth: Option<u32>,
    #[serde(default)]
    pub snapshot: Option<SnapshotToken>,
}

#[derive(Debug, Serialize)]
pub struct LookupEntityResponse {
    pub entity_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct LookupSubjectRequestBody {
    pub entity: String,
    pub permission: String,
    /// `type` or `type#relation`.
    pub subject_reference: String,
    #[serde(default)]
    pub context: BundleContext,
    #[serde(default)]
    pub depth: Option<u32>,
    #[serde(default)]
    pub snapshot: Option<SnapshotToken>,
}

#[derive(Debug, Serialize)]
pub struct LookupSubjectResponse {
    pub subject_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubjectPermissionRequestBody {
    pub entity: String,
    pub subject: String,
    #[serde(default)]
    pub context: BundleContext,
    #[serde(default)]
    pub depth: Option<u32>,
    #[serde(default)]
    pub snapshot: Option<SnapshotToken>,
}

#[derive(Debug, Serialize)]
pub struct SubjectPermissionResponse {
    pub results: BTreeMap<String, bool>,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub errors: Vec<RunError>,
}
