use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tessera_core::attribute::{Attribute, AttributeFilter};
use tessera_core::context::{Context, ContextParseError};
use tessera_core::engine::{
    CheckRequest, EngineConfig, LookupEntityRequest, LookupSubjectRequest,
};
use tessera_core::error::ErrorCode;
use tessera_core::schema::SchemaLimits;
use tessera_core::tuple::{
    EntityRef, RelationReference, SubjectRef, TenantId, Tuple, TupleFilter, TupleParseError,
};
use tessera_storage::InMemoryStoreFactory;

use crate::error::ApiError;
use crate::service::AuthzService;

/// A complete authorization shape: schema, shared facts, and assertions.
#[derive(Debug, Clone, Deserialize)]
pub struct Bundle {
    pub schema: String,
    #[serde(default)]
    pub relationships: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Facts visible only while this scenario runs.
    #[serde(default)]
    pub relationships: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub checks: Vec<Check>,
    #[serde(default)]
    pub entity_filters: Vec<EntityFilter>,
    #[serde(default)]
    pub subject_filters: Vec<SubjectFilter>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Check {
    pub entity: String,
    pub subject: String,
    #[serde(default)]
    pub context: BundleContext,
    pub assertions: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityFilter {
    pub entity_type: String,
    pub subject: String,
    #[serde(default)]
    pub context: BundleContext,
    pub assertions: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubjectFilter {
    pub subject_reference: String,
    pub entity: String,
    #[serde(default)]
    pub context: BundleContext,
    pub assertions: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BundleContext {
    pub tuples: Vec<String>,
    pub attributes: Vec<String>,
    pub data: Map<String, Value>,
}

impl BundleContext {
    pub fn parse(&self) -> Result<Context, ContextParseError> {
        Context::from_text(&self.tuples, &self.attributes, self.data.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    FileValidation,
    Schema,
    Relationships,
    Attributes,
    Scenarios,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ErrorKey {
    Text(String),
    Index(usize),
}

/// One independent failure found while running a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<ErrorKey>,
    pub message: String,
}

impl RunError {
    fn new(kind: ErrorKind, key: Option<ErrorKey>, message: impl Into<String>) -> Self {
        Self {
            kind,
            key,
            message: message.into(),
        }
    }

    fn scenario(index: usize, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Scenarios, Some(ErrorKey::Index(index)), message)
    }
}

fn render(err: &ApiError) -> String {
    match err {
        ApiError::Compile(e) => e.to_string(),
        ApiError::InvalidItems(items) => items
            .iter()
            .map(|item| format!("{}: {}", item.code, item.message))
            .collect::<Vec<_>>()
            .join("; "),
        other => format!("{}: {other}", other.code()),
    }
}

fn render_parse(err: &TupleParseError) -> String {
    format!("{}: {err}", err.code())
}

pub(crate) fn context_error_code(err: &ContextParseError) -> ErrorCode {
    match err {
        ContextParseError::Tuple(e) => e.code(),
        ContextParseError::Attribute(e) => e.code(),
    }
}

fn render_context(err: &ContextParseError) -> String {
    format!("{}: {err}", context_error_code(err))
}

fn same_set(expected: &[String], actual: &[String]) -> bool {
    expected.iter().collect::<BTreeSet<_>>() == actual.iter().collect::<BTreeSet<_>>()
}

/// Facts a scenario added, and what to put back once it finishes.
#[derive(Default)]
struct ScenarioUndo {
    tuples: Vec<TupleFilter>,
    restored_attributes: Vec<Attribute>,
    removed_attributes: Vec<AttributeFilter>,
}

/// Runs bundles against a private in-memory store.
pub struct Development {
    engine_config: EngineConfig,
    schema_limits: SchemaLimits,
    check_timeout: Duration,
}

impl Development {
    pub fn new(engine_config: EngineConfig, schema_limits: SchemaLimits, check_timeout: Duration) -> Self {
        Self {
            engine_config,
            schema_limits,
            check_timeout,
        }
    }

    /// Evaluates a bundle and reports every failure. An empty result means every
    /// fact was accepted and every assertion held.
    pub async fn run(&self, bundle: Value) -> Vec<RunError> {
        let bundle: Bundle = match serde_json::from_value(bundle) {
            Ok(bundle) => bundle,
            Err(e) => {
                return vec![RunError::new(
                    ErrorKind::FileValidation,
                    None,
                    format!("{}: {e}", ErrorCode::InvalidArgument),
                )];
            }
        };
        self.run_bundle(&bundle).await
    }

    pub async fn run_bundle(&self, bundle: &Bundle) -> Vec<RunError> {
        // Each run gets its own factory so nothing leaks between runs.
        let service = AuthzService::new(
            Arc::new(InMemoryStoreFactory::new()),
            self.engine_config.clone(),
            self.schema_limits.clone(),
        )
        .with_check_timeout(self.check_timeout);
        let tenant_id = TenantId::new(uuid::Uuid::nil());

        let mut errors = Vec::new();
        if let Err(e) = service.write_schema(&tenant_id, &bundle.schema, false).await {
            errors.push(RunError::new(ErrorKind::Schema, None, render(&e)));
            return errors;
        }

        let mut runner = Runner {
            service: &service,
            tenant_id: &tenant_id,
            errors,
        };

        for text in &bundle.relationships {
            runner.write_relationship(text).await;
        }
        for text in &bundle.attributes {
            runner.write_attribute(text, None).await;
        }

        for (index, scenario) in bundle.scenarios.iter().enumerate() {
            tracing::debug!(index, name = %scenario.name, "running scenario");
            runner.run_scenario(index, scenario).await;
        }

        tracing::info!(
            scenarios = bundle.scenarios.len(),
            errors = runner.errors.len(),
            "bundle run finished"
        );
        runner.errors
    }
}

struct Runner<'a> {
    service: &'a AuthzService<InMemoryStoreFactory>,
    tenant_id: &'a TenantId,
    errors: Vec<RunError>,
}

impl Runner<'_> {
    fn fail(&mut self, kind: ErrorKind, key: &str, message: String) {
        self.errors
            .push(RunError::new(kind, Some(ErrorKey::Text(key.to_string())), message));
    }

    /// Returns the tuple when it was newly written.
    async fn write_relationship(&mut self, text: &str) -> Option<Tuple> {
        let tuple: Tuple = match text.parse() {
            Ok(t) => t,
            Err(e) => {
                self.fail(ErrorKind::Relationships, text, render_parse(&e));
                return None;
            }
        };

        let already_live = match self
            .service
            .read_relationships(self.tenant_id, &TupleFilter::exact(&tuple), None, Some(1))
            .await
        {
            Ok(existing) => !existing.is_empty(),
            Err(e) => {
                self.fail(ErrorKind::Relationships, text, render(&e));
                return None;
            }
        };

        match self
            .service
            .write_relationships(self.tenant_id, std::slice::from_ref(&tuple), &[])
            .await
        {
            Ok(_) if already_live => None,
            Ok(_) => Some(tuple),
            Err(e) => {
                self.fail(ErrorKind::Relationships, text, render(&e));
                None
            }
        }
    }

    /// Writes an attribute, recording in `undo` how to reverse it.
    async fn write_attribute(&mut self, text: &str, undo: Option<&mut ScenarioUndo>) {
        let attribute: Attribute = match text.parse() {
            Ok(a) => a,
            Err(e) => {
                self.fail(ErrorKind::Attributes, text, format!("{}: {e}", e.code()));
                return;
            }
        };

        let filter = AttributeFilter::exact(&attribute.entity, &attribute.attribute);
        let previous = match self
            .service
            .read_attributes(self.tenant_id, &filter, None, Some(1))
            .await
        {
            Ok(mut existing) => existing.pop(),
            Err(e) => {
                self.fail(ErrorKind::Attributes, text, render(&e));
                return;
            }
        };

        if let Err(e) = self
            .service
            .write_attributes(self.tenant_id, std::slice::from_ref(&attribute), &[])
            .await
        {
            self.fail(ErrorKind::Attributes, text, render(&e));
            return;
        }

        if let Some(undo) = undo {
            match previous {
                Some(prior) => undo.restored_attributes.push(prior),
                None => undo.removed_attributes.push(filter),
            }
        }
    }

    async fn run_scenario(&mut self, index: usize, scenario: &Scenario) {
        let mut undo = ScenarioUndo::default();
        for text in &scenario.relationships {
            if let Some(tuple) = self.write_relationship(text).await {
                undo.tuples.push(TupleFilter::exact(&tuple));
            }
        }
        for text in &scenario.attributes {
            self.write_attribute(text, Some(&mut undo)).await;
        }

        for check in &scenario.checks {
            self.run_check(index, check).await;
        }
        for filter in &scenario.entity_filters {
            self.run_entity_filter(index, filter).await;
        }
        for filter in &scenario.subject_filters {
            self.run_subject_filter(index, filter).await;
        }

        self.undo(index, undo).await;
    }

    async fn run_check(&mut self, index: usize, check: &Check) {
        let entity: EntityRef = match check.entity.parse() {
            Ok(e) => e,
            Err(e) => return self.errors.push(RunError::scenario(index, render_parse(&e))),
        };
        let subject: SubjectRef = match check.subject.parse() {
            Ok(s) => s,
            Err(e) => return self.errors.push(RunError::scenario(index, render_parse(&e))),
        };
        let context = match check.context.parse() {
            Ok(c) => c,
            Err(e) => return self.errors.push(RunError::scenario(index, render_context(&e))),
        };

        for (permission, expected) in &check.assertions {
            let request = CheckRequest {
                entity: entity.clone(),
                permission: permission.clone(),
                subject: subject.clone(),
                context: context.clone(),
                snapshot: None,
                depth: None,
            };
            match self.service.check(self.tenant_id, request).await {
                Ok(output) if output.allowed != *expected => {
                    self.errors.push(RunError::scenario(
                        index,
                        format!(
                            "Query: {subject} {permission} {entity}, Expected: {expected}, Actual: {}",
                            output.allowed
                        ),
                    ));
                }
                Ok(_) => {}
                Err(e) => self.errors.push(RunError::scenario(index, render(&e))),
            }
        }
    }

    async fn run_entity_filter(&mut self, index: usize, filter: &EntityFilter) {
        let subject: SubjectRef = match filter.subject.parse() {
            Ok(s) => s,
            Err(e) => return self.errors.push(RunError::scenario(index, render_parse(&e))),
        };
        let context = match filter.context.parse() {
            Ok(c) => c,
            Err(e) => return self.errors.push(RunError::scenario(index, render_context(&e))),
        };

        for (permission, expected) in &filter.assertions {
            let request = LookupEntityRequest {
                entity_type: filter.entity_type.clone(),
                permission: permission.clone(),
                subject: subject.clone(),
                context: context.clone(),
                snapshot: None,
                depth: None,
            };
            match self.service.lookup_entity(self.tenant_id, request).await {
                Ok(actual) if !same_set(expected, &actual) => {
                    self.errors.push(RunError::scenario(
                        index,
                        format!(
                            "Query: {subject} {permission} {}, Expected: [{}], Actual: [{}]",
                            filter.entity_type,
                            expected.join(", "),
                            actual.join(", ")
                        ),
                    ));
                }
                Ok(_) => {}
                Err(e) => self.errors.push(RunError::scenario(index, render(&e))),
            }
        }
    }

    async fn run_subject_filter(&mut self, index: usize, filter: &SubjectFilter) {
        let reference: RelationReference = match filter.subject_reference.parse() {
            Ok(r) => r,
            Err(e) => return self.errors.push(RunError::scenario(index, render_parse(&e))),
        };
        let entity: EntityRef = match filter.entity.parse() {
            Ok(e) => e,
            Err(e) => return self.errors.push(RunError::scenario(index, render_parse(&e))),
        };
        let context = match filter.context.parse() {
            Ok(c) => c,
            Err(e) => return self.errors.push(RunError::scenario(index, render_context(&e))),
        };

        for (permission, expected) in &filter.assertions {
            let request = LookupSubjectRequest {
                entity: entity.clone(),
                permission: permission.clone(),
                subject_reference: reference.clone(),
                context: context.clone(),
                snapshot: None,
                depth: None,
            };
            match self.service.lookup_subject(self.tenant_id, request).await {
                Ok(actual) if !same_set(expected, &actual) => {
                    self.errors.push(RunError::scenario(
                        index,
                        format!(
                            "Query: {entity} {permission} {reference}, Expected: [{}], Actual: [{}]",
                            expected.join(", "),
                            actual.join(", ")
                        ),
                    ));
                }
                Ok(_) => {}
                Err(e) => self.errors.push(RunError::scenario(index, render(&e))),
            }
        }
    }

    async fn undo(&mut self, index: usize, undo: ScenarioUndo) {
        if !undo.tuples.is_empty()
            && let Err(e) = self
                .service
                .write_relationships(self.tenant_id, &[], &undo.tuples)
                .await
        {
            self.errors.push(RunError::scenario(index, render(&e)));
        }

        if (!undo.restored_attributes.is_empty() || !undo.removed_attributes.is_empty())
            && let Err(e) = self
                .service
                .write_attributes(
                    self.tenant_id,
                    &undo.restored_attributes,
                    &undo.removed_attributes,
                )
                .await
        {
            self.errors.push(RunError::scenario(index, render(&e)));
        }
    }
}
