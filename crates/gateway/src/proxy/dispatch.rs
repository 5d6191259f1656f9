//! Upstream request dispatch
//!
//! Shared by both upstream transports. `initialize`, `ping` and the list
//! methods are answered locally; `tools/call` is resolved through the
//! registry and forwarded to the owning backend.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use secretary_shared::{BackendId, GeneralConfig};
use serde_json::{json, Value};
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;

use crate::error::GatewayError;
use crate::mcp::backend::BackendConnection;
use crate::mcp::registry::BackendRegistry;
use crate::mcp::types::{
    Implementation, InitializeResult, JsonRpcError, JsonRpcId, JsonRpcRequest, JsonRpcResponse,
    ToolCallParams, ToolsListResult, PROTOCOL_VERSION,
};
use crate::mcp::BackendError;
use crate::users::CallerScope;

/// Methods the gateway understands on its upstream side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpMethod {
    Initialize,
    Ping,
    ToolsList,
    ToolsCall,
    ResourcesList,
    PromptsList,
    Notification,
    Unknown,
}

impl McpMethod {
    pub fn from_name(method: &str) -> Self {
        match method {
            "initialize" => McpMethod::Initialize,
            "ping" => McpMethod::Ping,
            "tools/list" => McpMethod::ToolsList,
            "tools/call" => McpMethod::ToolsCall,
            "resources/list" => McpMethod::ResourcesList,
            "prompts/list" => McpMethod::PromptsList,
            m if m.starts_with("notifications/") => McpMethod::Notification,
            _ => McpMethod::Unknown,
        }
    }
}

pub struct McpDispatcher {
    registry: Arc<BackendRegistry>,
}

impl McpDispatcher {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self { registry }
    }

    /// Parse and handle one raw upstream message
    pub async fn handle_raw(&self, raw: &str, scope: &CallerScope) -> Option<JsonRpcResponse> {
        match serde_json::from_str::<JsonRpcRequest>(raw) {
            Ok(request) => self.handle(request, scope).await,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable upstream message");
                Some(JsonRpcResponse::error(
                    Some(JsonRpcId::Null),
                    JsonRpcError::parse_error(format!("Parse error: {}", e)),
                ))
            }
        }
    }

    /// Handle one request. Notifications never produce a response.
    pub async fn handle(&self, request: JsonRpcRequest, scope: &CallerScope) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            tracing::debug!(method = %request.method, "Upstream notification");
            return None;
        }
        let id = request.id.clone();

        if request.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request("jsonrpc must be \"2.0\""),
            ));
        }

        let response = match McpMethod::from_name(&request.method) {
            McpMethod::Initialize => JsonRpcResponse::success(id, initialize_result()),
            McpMethod::Ping => JsonRpcResponse::success(id, json!({})),
            McpMethod::ToolsList => {
                let tools = self.registry.list_tools(scope).await;
                let result = ToolsListResult {
                    tools,
                    next_cursor: None,
                };
                match serde_json::to_value(result) {
                    Ok(value) => JsonRpcResponse::success(id, value),
                    Err(e) => JsonRpcResponse::error(id, JsonRpcError::internal_error(e.to_string())),
                }
            }
            McpMethod::ToolsCall => self.call_tool(id, request.params, scope).await,
            McpMethod::ResourcesList => JsonRpcResponse::success(id, json!({ "resources": [] })),
            McpMethod::PromptsList => JsonRpcResponse::success(id, json!({ "prompts": [] })),
            McpMethod::Notification | McpMethod::Unknown => {
                JsonRpcResponse::error(id, JsonRpcError::method_not_found(&request.method))
            }
        };
        Some(response)
    }

    async fn call_tool(
        &self,
        id: Option<JsonRpcId>,
        params: Option<Value>,
        scope: &CallerScope,
    ) -> JsonRpcResponse {
        let params: ToolCallParams = match params.map(serde_json::from_value) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                return JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params(format!("Invalid tools/call params: {}", e)),
                )
            }
            None => {
                return JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params("Missing tools/call params"),
                )
            }
        };

        if let Some(secretary) = self.registry.namespace().secretary_of(&params.name).await {
            if !scope.allows(&secretary) {
                tracing::warn!(tool = %params.name, secretary = %secretary, "Tool call outside caller scope");
                return JsonRpcResponse::error(id, GatewayError::Forbidden(secretary).to_rpc_error());
            }
        }

        let (connection, local_name) = match self.registry.route(&params.name).await {
            Ok(routed) => routed,
            Err(e) => {
                tracing::debug!(tool = %params.name, error = %e, "Tool call not routed");
                return JsonRpcResponse::error(id, e.to_rpc_error());
            }
        };

        let arguments = match params.arguments {
            Value::Null => json!({}),
            other => other,
        };

        match invoke_with_retry(&connection, &local_name, arguments).await {
            Ok(response) => response.with_id(id),
            Err(e) => {
                tracing::warn!(tool = %params.name, backend = %connection.id(), error = %e, "Tool call failed");
                JsonRpcResponse::error(id, GatewayError::backend(connection.id(), e).to_rpc_error())
            }
        }
    }
}

/// Forward a tools/call, retrying only when the request never left the gateway
async fn invoke_with_retry(
    connection: &BackendConnection,
    local_name: &str,
    arguments: Value,
) -> Result<JsonRpcResponse, BackendError> {
    retry_unsent(connection.limits(), connection.id(), || {
        connection.invoke(local_name, arguments.clone())
    })
    .await
}

/// Run `attempt`, retrying transient failures with the backend's retry settings
async fn retry_unsent<T, F, Fut>(
    limits: &GeneralConfig,
    backend: &BackendId,
    mut attempt: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let strategy = FixedInterval::new(Duration::from_secs(limits.retry_delay_seconds))
        .take(limits.retry_count as usize);

    Retry::spawn(strategy, || {
        let call = attempt();
        async move {
            let result = call.await;

            match &result {
                Ok(_) => Ok(result),
                Err(e) if e.is_transient() => {
                    tracing::debug!(backend = %backend, error = %e, "Request not sent - will retry");
                    Err(result)
                }
                Err(e) => {
                    tracing::debug!(backend = %backend, error = %e, "Permanent error - will not retry");
                    Ok(result)
                }
            }
        }
    })
    .await
    .unwrap_or_else(|e| e)
}

fn initialize_result() -> Value {
    let result = InitializeResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: json!({
            "tools": { "listChanged": false }
        }),
        server_info: Implementation::gateway(),
        instructions: Some(
            "Tools are named {secretary}.{task}.{tool}; each call is routed to the task that provides it."
                .to_string(),
        ),
    };
    serde_json::to_value(result).unwrap_or_else(|_| json!({}))
}
