mod handlers;
mod types;

use std::sync::Arc;

use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::middleware;
use axum::response::Response;
use axum::routing::{get, post};
use tessera_storage::StoreFactory;

use crate::development::Development;
use crate::metrics::{Metrics, metrics_handler};
use crate::middleware::auth::{AuthState, rest_auth_middleware};
use crate::service::AuthzService;

pub struct AppState<F: StoreFactory> {
    pub service: Arc<AuthzService<F>>,
    pub metrics: Arc<Metrics>,
    pub development: Arc<Development>,
}

impl<F: StoreFactory> Clone for AppState<F> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            metrics: self.metrics.clone(),
            development: self.development.clone(),
        }
    }
}

async fn metrics_middleware<F: StoreFactory>(
    State(state): State<AppState<F>>,
    request: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> Response {
    state.metrics.record_request();

    let path = request.uri().path().to_string();
    let start = std::time::Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    if status.is_success() {
        state.metrics.record_success();
    } else {
        state.metrics.record_error();
    }
    tracing::debug!(
        path = %path,
        status = status.as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request handled"
    );

    response
}

pub fn create_router<F>(state: AppState<F>, auth: AuthState, max_body_bytes: usize) -> Router
where
    F: StoreFactory + 'static,
{
    let metrics = Arc::clone(&state.metrics);
    Router::new()
        .route("/v1/schemas/write", post(handlers::write_schema))
        .route("/v1/schemas/read", post(handlers::read_schema))
        .route("/v1/schemas/graph", post(handlers::read_schema_graph))
        .route(
            "/v1/relationships/write",
            post(handlers::write_relationships),
        )
        .route("/v1/relationships/read", post(handlers::read_relationships))
        .route(
            "/v1/relationships/delete",
            post(handlers::delete_relationships),
        )
        .route("/v1/attributes/write", post(handlers::write_attributes))
        .route("/v1/attributes/read", post(handlers::read_attributes))
        .route("/v1/attributes/delete", post(handlers::delete_attributes))
        .route("/v1/permissions/check", post(handlers::check))
        .route("/v1/permissions/expand", post(handlers::expand))
        .route(
            "/v1/permissions/lookup-entity",
            post(handlers::lookup_entity),
        )
        .route(
            "/v1/permissions/lookup-subject",
            post(handlers::lookup_subject),
        )
        .route(
            "/v1/permissions/subject-permission",
            post(handlers::subject_permission),
        )
        .route("/v1/run", post(handlers::run))
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(metrics_handler).with_state(metrics))
        .layer(middleware::from_fn_with_state(auth, rest_auth_middleware))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            metrics_middleware,
        ))
        .with_state(state)
}
