//! Shared fixtures for gateway integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use chrono::Utc;
use futures::{stream, StreamExt};
use secretary_gateway::mcp::types::{JsonRpcRequest, JsonRpcResponse};
use secretary_gateway::proxy::dispatch::McpDispatcher;
use secretary_gateway::CallerScope;
use secretary_shared::{
    ConnectionProfile, GeneralConfig, RemoteTask, SseConfig, StdioConfig, TaskStatus,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

pub const ECHO_TOOL: &str = env!("CARGO_BIN_EXE_echo-tool");

/// Limits tuned for fast tests
pub fn fast_limits() -> GeneralConfig {
    GeneralConfig {
        connect_timeout_seconds: 5,
        timeout_seconds: 5,
        retry_count: 0,
        retry_delay_seconds: 0,
        max_concurrent_calls: None,
        log_level: None,
    }
}

fn task(
    secretary: (&str, &str),
    task: (&str, &str),
    mut profile: ConnectionProfile,
) -> RemoteTask {
    profile.general_config = fast_limits();
    RemoteTask {
        id: task.0.to_string(),
        name: task.1.to_string(),
        secretary_id: secretary.0.to_string(),
        secretary_name: secretary.1.to_string(),
        template_id: "echo".to_string(),
        status: TaskStatus::Active,
        connection_profile: profile,
        config: HashMap::new(),
        customizable_params: Vec::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// A task running the echo-tool binary with extra environment
pub fn echo_task(
    secretary: (&str, &str),
    task_ids: (&str, &str),
    env: &[(&str, &str)],
) -> RemoteTask {
    let profile = ConnectionProfile::stdio(StdioConfig {
        command: ECHO_TOOL.to_string(),
        env: env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ..Default::default()
    });
    task(secretary, task_ids, profile)
}

pub fn broken_task(secretary: (&str, &str), task_ids: (&str, &str)) -> RemoteTask {
    let profile = ConnectionProfile::stdio(StdioConfig {
        command: "/nonexistent/secretary-gateway-backend".to_string(),
        ..Default::default()
    });
    task(secretary, task_ids, profile)
}

pub fn sse_task(
    secretary: (&str, &str),
    task_ids: (&str, &str),
    server_url: String,
    bearer_token: Option<&str>,
) -> RemoteTask {
    let profile = ConnectionProfile::sse(SseConfig {
        server_url,
        bearer_token: bearer_token.map(str::to_string),
    });
    task(secretary, task_ids, profile)
}

pub fn call_request(id: i64, tool: &str, message: &str) -> JsonRpcRequest {
    JsonRpcRequest::new(
        id,
        "tools/call",
        Some(json!({ "name": tool, "arguments": { "message": message } })),
    )
}

pub async fn call_tool(dispatcher: &McpDispatcher, tool: &str, message: &str) -> JsonRpcResponse {
    dispatcher
        .handle(call_request(1, tool, message), &CallerScope::unrestricted())
        .await
        .expect("tools/call always answers")
}

/// Text of the first content item of a tools/call result
pub fn result_text(response: &JsonRpcResponse) -> Option<String> {
    response.result.as_ref()?["content"][0]["text"]
        .as_str()
        .map(str::to_string)
}

// =============================================================================
// Mock MCP server on the HTTP+SSE transport
// =============================================================================

#[derive(Clone)]
struct MockState {
    sessions: Arc<RwLock<HashMap<Uuid, mpsc::Sender<Value>>>>,
    bearer_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    session_id: Uuid,
}

fn authorized(state: &MockState, headers: &HeaderMap) -> bool {
    let Some(expected) = &state.bearer_token else {
        return true;
    };
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", expected))
        .unwrap_or(false)
}

async fn open_stream(State(state): State<MockState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel::<Value>(16);
    state.sessions.write().await.insert(id, tx);

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/message?sessionId={}", id));
    let messages = ReceiverStream::new(rx)
        .map(|value| Ok::<_, Infallible>(Event::default().event("message").data(value.to_string())));

    Sse::new(stream::once(async move { Ok(endpoint) }).chain(messages)).into_response()
}

/// Two pages of tools: `echo` then `reverse`
fn mock_reply(request: &Value) -> Option<Value> {
    let id = request.get("id")?.clone();
    let method = request.get("method")?.as_str()?;
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    let result = match method {
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "mock-sse", "version": "0.1.0" }
        }),
        "ping" => json!({}),
        "tools/list" if params.get("cursor").is_none() => json!({
            "tools": [{ "name": "echo", "inputSchema": { "type": "object" } }],
            "nextCursor": "page-2"
        }),
        "tools/list" => json!({
            "tools": [{ "name": "reverse", "inputSchema": { "type": "object" } }]
        }),
        "tools/call" => {
            let tool = params["name"].as_str().unwrap_or_default();
            let message = params["arguments"]["message"].as_str().unwrap_or_default();
            let text = match tool {
                "reverse" => message.chars().rev().collect(),
                _ => message.to_string(),
            };
            json!({ "content": [{ "type": "text", "text": text }] })
        }
        other => {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("Method not found: {}", other) }
            }))
        }
    };
    Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

async fn post_message(
    State(state): State<MockState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    let Some(tx) = state.sessions.read().await.get(&query.session_id).cloned() else {
        return StatusCode::NOT_FOUND;
    };
    let Ok(request) = serde_json::from_str::<Value>(&body) else {
        return StatusCode::BAD_REQUEST;
    };
    if let Some(reply) = mock_reply(&request) {
        let _ = tx.send(reply).await;
    }
    StatusCode::ACCEPTED
}

/// Serve the mock on an ephemeral port; returns its `/sse` URL
pub async fn spawn_mock_sse_server(bearer_token: Option<&str>) -> String {
    let state = MockState {
        sessions: Arc::new(RwLock::new(HashMap::new())),
        bearer_token: bearer_token.map(str::to_string),
    };
    let app = Router::new()
        .route("/sse", get(open_stream))
        .route("/message", post(post_message))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    // Give the accept loop a moment to start
    tokio::time::sleep(Duration::from_millis(20)).await;
    format!("http://{}/sse", addr)
}
