use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tessera_core::engine::CheckError;
use tessera_core::error::ErrorCode;
use tessera_core::schema::{BreakingChange, CompileError, ValidationError};
use tessera_storage::StorageError;

/// A rejected element of a batch write, addressed by its position in the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
    pub index: usize,
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Check(#[from] CheckError),

    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Compile(#[from] CompileError),

    #[error("schema exceeds limits: {}", join(.0))]
    Limits(Vec<ValidationError>),

    #[error("breaking schema changes detected (use force=true to override): {}", join(.0))]
    BreakingChanges(Vec<BreakingChange>),

    #[error("no schema has been written")]
    SchemaNotFound,

    #[error("{} invalid item(s): {}", .0.len(), join_items(.0))]
    InvalidItems(Vec<ItemError>),

    #[error("{message}")]
    BadRequest { code: ErrorCode, message: String },

    #[error("evaluation did not finish within {0} ms")]
    Timeout(u64),

    #[error("{0}")]
    Unauthenticated(String),
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_items(items: &[ItemError]) -> String {
    items
        .iter()
        .map(|e| format!("#{}: {}", e.index, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ApiError {
    pub fn bad_request(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Check(e) => e.code(),
            Self::Storage(e) => e.code(),
            Self::Compile(e) => e.code,
            Self::Limits(_) => ErrorCode::SchemaLimitExceeded,
            Self::BreakingChanges(_) => ErrorCode::SchemaBreakingChange,
            Self::SchemaNotFound => ErrorCode::SchemaNotFound,
            Self::InvalidItems(items) => items
                .first()
                .map_or(ErrorCode::InvalidArgument, |item| item.code),
            Self::BadRequest { code, .. } => *code,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Unauthenticated(_) => ErrorCode::Unauthenticated,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::BreakingChanges(_) => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => status_for(self.code()),
        }
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::SchemaNotFound
        | ErrorCode::EntityDefinitionNotFound
        | ErrorCode::RelationDefinitionNotFound
        | ErrorCode::PermissionNotFound
        | ErrorCode::UndefinedRuleReference => StatusCode::NOT_FOUND,
        ErrorCode::DepthNotEnough => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::Storage | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: ErrorCode,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<&'a [ItemError]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    breaking_changes: Option<&'a [BreakingChange]>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, code = %self.code(), "request failed");
        } else {
            tracing::warn!(error = %self, code = %self.code(), "request rejected");
        }

        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
            errors: match &self {
                Self::InvalidItems(items) => Some(items),
                _ => None,
            },
            breaking_changes: match &self {
                Self::BreakingChanges(changes) => Some(changes),
                _ => None,
            },
        };
        (status, Json(body)).into_response()
    }
}
