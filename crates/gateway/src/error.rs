//! Gateway and admin API error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use secretary_shared::{BackendId, StorageError, ValidationError};
use serde_json::json;

use crate::mcp::backend::{BackendError, ConnectionState};
use crate::mcp::namespace::NamespaceError;
use crate::mcp::types::JsonRpcError;

/// Orchestration-level error type
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    // Configuration errors
    #[error("Invalid task configuration: {0}")]
    Config(#[from] ValidationError),

    #[error(transparent)]
    Namespace(#[from] NamespaceError),

    // Connection and transport errors
    #[error("Backend {id} failed: {source}")]
    Backend {
        id: BackendId,
        #[source]
        source: BackendError,
    },

    #[error("Backend {id} is not available (state: {state})")]
    NotAvailable { id: BackendId, state: ConnectionState },

    #[error("Secretary {0} is not permitted for this caller")]
    Forbidden(String),

    // Server lifecycle errors
    #[error("Failed to open upstream transport: {0}")]
    UpstreamTransport(String),

    #[error("Proxy server is not initialized")]
    NotInitialized,

    #[error("Proxy server cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl GatewayError {
    pub fn backend(id: &BackendId, source: BackendError) -> Self {
        GatewayError::Backend {
            id: id.clone(),
            source,
        }
    }

    /// JSON-RPC error object surfaced to the upstream caller
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            GatewayError::Namespace(NamespaceError::NotFound(name)) => {
                JsonRpcError::invalid_params(format!("Unknown tool: {}", name))
            }
            GatewayError::Backend { .. } | GatewayError::NotAvailable { .. } => {
                JsonRpcError::backend_unavailable(self.to_string())
            }
            GatewayError::Forbidden(_) => JsonRpcError::forbidden(self.to_string()),
            _ => JsonRpcError::internal_error(self.to_string()),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Admin HTTP surface error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Resource not found")]
    NotFound,
    #[error("Backend unavailable: {0}")]
    BadGateway(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "BACKEND_UNAVAILABLE", msg.clone()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type alias for admin handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tool_maps_to_invalid_params() {
        let err = GatewayError::Namespace(NamespaceError::NotFound("S1.T1.nope".to_string()));
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, JsonRpcError::INVALID_PARAMS);
        assert!(rpc.message.contains("S1.T1.nope"));
    }

    #[test]
    fn test_not_available_maps_to_backend_unavailable() {
        let err = GatewayError::NotAvailable {
            id: BackendId::new("s", "t"),
            state: ConnectionState::Failed,
        };
        assert_eq!(err.to_rpc_error().code, JsonRpcError::BACKEND_UNAVAILABLE);
    }
}
