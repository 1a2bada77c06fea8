use std::collections::HashSet;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tessera_core::tuple::TenantId;

use crate::audit;
use crate::error::ApiError;

/// Preshared bearer keys. Every accepted key acts on the same tenant.
#[derive(Clone)]
pub struct AuthState {
    keys: Option<Arc<HashSet<String>>>,
    tenant_id: TenantId,
}

impl AuthState {
    pub fn disabled(tenant_id: TenantId) -> Self {
        Self {
            keys: None,
            tenant_id,
        }
    }

    pub fn with_keys(keys: impl IntoIterator<Item = String>, tenant_id: TenantId) -> Self {
        Self {
            keys: Some(Arc::new(keys.into_iter().collect())),
            tenant_id,
        }
    }

    fn authenticate(&self, header: Option<&str>) -> Result<(), &'static str> {
        let Some(keys) = &self.keys else {
            return Ok(());
        };
        let header = header.ok_or("missing authorization header")?;
        let key = header
            .strip_prefix("Bearer ")
            .ok_or("invalid authorization format")?;
        if keys.contains(key) {
            Ok(())
        } else {
            Err("invalid api key")
        }
    }
}

fn skip_auth(path: &str) -> bool {
    matches!(path, "/healthz" | "/metrics")
}

fn key_hint(header: &str) -> &str {
    let key = header.strip_prefix("Bearer ").unwrap_or(header);
    let start = key
        .char_indices()
        .rev()
        .nth(3)
        .map_or(0, |(index, _)| index);
    &key[start..]
}

pub async fn rest_auth_middleware(
    State(auth_state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if skip_auth(request.uri().path()) {
        return next.run(request).await;
    }

    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match auth_state.authenticate(header.as_deref()) {
        Ok(()) => {
            if auth_state.keys.is_some()
                && let Some(header) = &header
            {
                audit::audit_auth_success(&auth_state.tenant_id, key_hint(header));
            }
            request
                .extensions_mut()
                .insert(auth_state.tenant_id.clone());
            next.run(request).await
        }
        Err(reason) => {
            audit::audit_auth_failure(reason);
            ApiError::Unauthenticated(reason.to_string()).into_response()
        }
    }
}
