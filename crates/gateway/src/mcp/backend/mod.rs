//! Backend connections
//!
//! One [`BackendConnection`] per remote task. It owns the transport (a child
//! process or an SSE stream), drives the MCP handshake, caches the backend's
//! tool list and tracks its lifecycle:
//!
//! ```text
//! Created -> Connecting -> Handshaking -> Ready <-> Degraded
//!                 |              |           |          |
//!                 +--> Failed <--+           +-> Closing -> Closed
//! ```
//!
//! Only `Ready` and `Degraded` connections accept tool calls. A routable
//! connection whose transport is gone (process exited, stream ended) is
//! `Failed` the next time anything reads its state.

mod rpc;
pub mod sse;
pub mod stdio;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secretary_shared::{BackendId, ConnectionType, GeneralConfig, RemoteTask};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{RwLock, Semaphore};

use super::health::HealthTracker;
use super::types::{
    Implementation, InitializeParams, InitializeResult, JsonRpcResponse, Tool, ToolsListResult,
    PROTOCOL_VERSION,
};
use sse::SseBackend;
use stdio::StdioBackend;

/// Upper bound on tools/list pages fetched during a handshake
const MAX_TOOL_PAGES: usize = 100;

/// Backend transport and protocol errors
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Request timed out")]
    Timeout,

    #[error("Request not sent: {0}")]
    NotSent(String),

    #[error("Spawn failed: {0}")]
    Spawn(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Event stream error: {0}")]
    Stream(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Cannot {1} while {0}")]
    InvalidState(ConnectionState, &'static str),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl BackendError {
    /// Check if this error is worth retrying. Only failures where the
    /// request never reached the backend qualify; a timed-out call may
    /// already have run.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::NotSent(_))
    }

    /// Errors that mean the transport itself is broken
    fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable(_)
                | BackendError::NotSent(_)
                | BackendError::Timeout
                | BackendError::Io(_)
                | BackendError::Http(_)
                | BackendError::Stream(_)
        )
    }
}

/// Lifecycle state of one backend connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Created,
    Connecting,
    Handshaking,
    Ready,
    Degraded,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    /// States in which tool calls are forwarded
    pub fn is_routable(self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::Degraded)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Created => "created",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Ready => "ready",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

enum BackendKind {
    Stdio(StdioBackend),
    Sse(SseBackend),
}

/// Point-in-time view of a connection for status reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub secretary_id: String,
    pub task_id: String,
    pub label: String,
    pub kind: ConnectionType,
    pub state: ConnectionState,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Implementation>,
    pub last_healthy: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

pub struct BackendConnection {
    id: BackendId,
    label: String,
    connection_type: ConnectionType,
    limits: GeneralConfig,
    state: RwLock<ConnectionState>,
    tools: RwLock<Vec<Tool>>,
    server_info: RwLock<Option<Implementation>>,
    health: HealthTracker,
    call_permits: Option<Semaphore>,
    kind: BackendKind,
}

impl BackendConnection {
    /// Build an unconnected backend from a task definition
    pub fn from_task(task: &RemoteTask) -> Result<Self, BackendError> {
        let profile = &task.connection_profile;
        profile
            .validate()
            .map_err(|e| BackendError::Config(e.to_string()))?;

        let label = format!("{}/{}", task.secretary_name, task.display_name());
        let limits = profile.general_config.clone();

        let kind = match (&profile.stdio_config, &profile.sse_config, profile.connection_type) {
            (Some(stdio), _, ConnectionType::Stdio) => BackendKind::Stdio(StdioBackend::new(
                label.clone(),
                stdio.clone(),
                task.config_env(),
                limits.log_level.as_deref(),
            )),
            (_, Some(sse), ConnectionType::Sse) => {
                BackendKind::Sse(SseBackend::new(label.clone(), sse.clone()))
            }
            _ => {
                return Err(BackendError::Config(
                    "connection profile has no matching transport config".to_string(),
                ))
            }
        };

        Ok(Self {
            id: task.backend_id(),
            label,
            connection_type: profile.connection_type,
            call_permits: limits.max_concurrent_calls.map(Semaphore::new),
            limits,
            state: RwLock::new(ConnectionState::Created),
            tools: RwLock::new(Vec::new()),
            server_info: RwLock::new(None),
            health: HealthTracker::default(),
            kind,
        })
    }

    pub fn id(&self) -> &BackendId {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limits(&self) -> &GeneralConfig {
        &self.limits
    }

    pub async fn state(&self) -> ConnectionState {
        let state = *self.state.read().await;
        if state.is_routable() && self.transport_lost().await {
            return self.mark_lost().await;
        }
        state
    }

    async fn transport_lost(&self) -> bool {
        match &self.kind {
            BackendKind::Stdio(stdio) => !stdio.is_alive().await,
            BackendKind::Sse(sse) => sse.is_closed().await,
        }
    }

    async fn mark_lost(&self) -> ConnectionState {
        let mut state = self.state.write().await;
        if state.is_routable() {
            tracing::warn!(backend = %self.label, from = %*state, "Backend transport lost");
            *state = ConnectionState::Failed;
        }
        *state
    }

    pub async fn tools(&self) -> Vec<Tool> {
        self.tools.read().await.clone()
    }

    pub async fn server_info(&self) -> Option<Implementation> {
        self.server_info.read().await.clone()
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.timeout_seconds)
    }

    /// Move from `from` to `to`, failing if the current state differs
    async fn transition(
        &self,
        from: ConnectionState,
        to: ConnectionState,
        action: &'static str,
    ) -> Result<(), BackendError> {
        let mut state = self.state.write().await;
        if *state != from {
            return Err(BackendError::InvalidState(*state, action));
        }
        tracing::debug!(backend = %self.label, from = %from, to = %to, "State transition");
        *state = to;
        Ok(())
    }

    async fn set_state(&self, to: ConnectionState) {
        let mut state = self.state.write().await;
        if *state != to {
            tracing::debug!(backend = %self.label, from = %*state, to = %to, "State transition");
            *state = to;
        }
    }

    /// Establish the transport (spawn the process or open the stream)
    pub async fn connect(&self) -> Result<(), BackendError> {
        self.transition(ConnectionState::Created, ConnectionState::Connecting, "connect")
            .await?;

        let budget = Duration::from_secs(self.limits.connect_timeout_seconds);
        let opened = match &self.kind {
            BackendKind::Stdio(stdio) => match tokio::time::timeout(budget, stdio.open()).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::ConnectTimeout(budget)),
            },
            // Bounded per attempt inside, across retries
            BackendKind::Sse(sse) => sse.open(&self.limits).await,
        };

        if let Err(e) = opened {
            tracing::error!(backend = %self.label, error = %e, "Failed to connect backend");
            self.set_state(ConnectionState::Failed).await;
            return Err(e);
        }
        Ok(())
    }

    /// Run initialize, the initialized notification and tools/list
    pub async fn handshake(&self) -> Result<(), BackendError> {
        self.transition(
            ConnectionState::Connecting,
            ConnectionState::Handshaking,
            "handshake",
        )
        .await?;

        match self.run_handshake().await {
            Ok(tools) => {
                tracing::info!(
                    backend = %self.label,
                    tool_count = tools.len(),
                    "Backend ready"
                );
                *self.tools.write().await = tools;
                self.health.record_success().await;
                self.set_state(ConnectionState::Ready).await;
                Ok(())
            }
            Err(e) => {
                tracing::error!(backend = %self.label, error = %e, "Backend handshake failed");
                self.set_state(ConnectionState::Failed).await;
                Err(e)
            }
        }
    }

    async fn run_handshake(&self) -> Result<Vec<Tool>, BackendError> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: Implementation::gateway(),
        };
        let response = self
            .request("initialize", Some(serde_json::to_value(&params)?))
            .await?;
        let result = into_result(response, "initialize")
            .map_err(|e| BackendError::Handshake(e.to_string()))?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| BackendError::Handshake(format!("Malformed initialize result: {}", e)))?;

        if init.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                backend = %self.label,
                server_version = %init.protocol_version,
                "Backend negotiated a different protocol version"
            );
        }
        tracing::debug!(
            backend = %self.label,
            server = %init.server_info.name,
            version = %init.server_info.version,
            "Backend initialized"
        );
        *self.server_info.write().await = Some(init.server_info);

        self.notify("notifications/initialized", None).await?;
        self.fetch_tools().await
    }

    /// Follow `nextCursor` until the backend stops paginating
    async fn fetch_tools(&self) -> Result<Vec<Tool>, BackendError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let response = self.request("tools/list", params).await?;
            let page: ToolsListResult = serde_json::from_value(into_result(response, "tools/list")?)
                .map_err(|e| BackendError::InvalidResponse(format!("Malformed tools/list: {}", e)))?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        tracing::warn!(backend = %self.label, "tools/list pagination limit reached");
        Ok(tools)
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, BackendError> {
        let timeout = self.request_timeout();
        match &self.kind {
            BackendKind::Stdio(stdio) => stdio.request(method, params, timeout).await,
            BackendKind::Sse(sse) => sse.request(method, params, timeout).await,
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), BackendError> {
        match &self.kind {
            BackendKind::Stdio(stdio) => stdio.notify(method, params).await,
            BackendKind::Sse(sse) => sse.notify(method, params).await,
        }
    }

    /// Forward one tools/call under the backend's local tool name.
    ///
    /// The backend's JSON-RPC response is returned as-is (including error
    /// responses); `Err` means no response arrived.
    pub async fn invoke(&self, local_name: &str, arguments: Value) -> Result<JsonRpcResponse, BackendError> {
        let state = self.state().await;
        if !state.is_routable() {
            return Err(BackendError::InvalidState(state, "invoke"));
        }

        let _permit = match &self.call_permits {
            Some(permits) => Some(
                permits
                    .acquire()
                    .await
                    .map_err(|_| BackendError::Unavailable("connection closing".to_string()))?,
            ),
            None => None,
        };

        tracing::debug!(backend = %self.label, tool = %local_name, "Forwarding tool call");
        let params = json!({ "name": local_name, "arguments": arguments });
        let result = self.request("tools/call", Some(params)).await;

        if let Err(e) = &result {
            if e.is_transport_failure() {
                self.demote(&e.to_string()).await;
            }
        }
        result
    }

    async fn demote(&self, reason: &str) {
        if self.transport_lost().await {
            self.mark_lost().await;
            return;
        }
        let mut state = self.state.write().await;
        if *state == ConnectionState::Ready {
            tracing::warn!(backend = %self.label, reason = %reason, "Backend degraded");
            *state = ConnectionState::Degraded;
        }
    }

    /// Check liveness. A lost transport fails the connection at once;
    /// repeated failed checks demote a ready one and a success restores a
    /// degraded one.
    pub async fn health_check(&self) -> bool {
        let state = self.state().await;
        if !state.is_routable() {
            return false;
        }

        let alive = match &self.kind {
            BackendKind::Stdio(stdio) => stdio.is_alive().await,
            BackendKind::Sse(sse) => sse.is_alive().await,
        };

        if alive {
            self.health.record_success().await;
            let mut state = self.state.write().await;
            if *state == ConnectionState::Degraded {
                tracing::info!(backend = %self.label, "Backend recovered");
                *state = ConnectionState::Ready;
            }
        } else if self.transport_lost().await {
            self.health.record_failure();
            self.mark_lost().await;
        } else if self.health.record_failure() {
            self.demote(&format!(
                "{} consecutive failed health checks",
                self.health.consecutive_failures()
            ))
            .await;
        }
        alive
    }

    /// Release the transport. Always ends `Closed`, whatever the outcome.
    pub async fn close(&self, timeout: Duration) {
        let previous = {
            let mut state = self.state.write().await;
            let previous = *state;
            if previous == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closing;
            previous
        };
        tracing::debug!(backend = %self.label, from = %previous, "Closing backend");

        if let Some(permits) = &self.call_permits {
            permits.close();
        }

        let closing = async {
            match &self.kind {
                BackendKind::Stdio(stdio) => stdio.close(timeout).await,
                BackendKind::Sse(sse) => sse.close().await,
            }
        };
        // Slack for the stdio kill path, which already spends `timeout`
        if tokio::time::timeout(timeout + Duration::from_secs(1), closing)
            .await
            .is_err()
        {
            tracing::warn!(backend = %self.label, "Backend close exceeded its budget");
        }

        self.set_state(ConnectionState::Closed).await;
        tracing::info!(backend = %self.label, "Backend closed");
    }

    pub async fn status(&self) -> BackendStatus {
        BackendStatus {
            secretary_id: self.id.secretary_id.clone(),
            task_id: self.id.task_id.clone(),
            label: self.label.clone(),
            kind: self.connection_type,
            state: self.state().await,
            tool_count: self.tools.read().await.len(),
            server_info: self.server_info().await,
            last_healthy: self.health.last_healthy().await,
            consecutive_failures: self.health.consecutive_failures(),
        }
    }
}

/// Unwrap a successful result, turning a JSON-RPC error into `InvalidResponse`
fn into_result(response: JsonRpcResponse, method: &str) -> Result<Value, BackendError> {
    if let Some(error) = response.error {
        return Err(BackendError::InvalidResponse(format!(
            "{} returned error {}: {}",
            method, error.code, error.message
        )));
    }
    response
        .result
        .ok_or_else(|| BackendError::InvalidResponse(format!("{} returned no result", method)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mcp::types::{JsonRpcError, JsonRpcId};
    use secretary_shared::{ConnectionProfile, Secretary, SseConfig, StdioConfig, TaskStatus};

    fn task(profile: ConnectionProfile) -> RemoteTask {
        let secretary = Secretary::new("sec-1", "S1");
        RemoteTask {
            id: "task-1".to_string(),
            name: "T1".to_string(),
            secretary_id: secretary.id.clone(),
            secretary_name: secretary.name.clone(),
            template_id: String::new(),
            status: TaskStatus::Active,
            connection_profile: profile,
            config: Default::default(),
            customizable_params: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_only_ready_and_degraded_are_routable() {
        assert!(ConnectionState::Ready.is_routable());
        assert!(ConnectionState::Degraded.is_routable());
        for state in [
            ConnectionState::Created,
            ConnectionState::Connecting,
            ConnectionState::Handshaking,
            ConnectionState::Closing,
            ConnectionState::Closed,
            ConnectionState::Failed,
        ] {
            assert!(!state.is_routable(), "{} should not route", state);
        }
    }

    #[test]
    fn test_only_unsent_requests_are_transient() {
        assert!(BackendError::NotSent("connection refused".into()).is_transient());
        assert!(!BackendError::Timeout.is_transient());
        assert!(!BackendError::Spawn("x".into()).is_transient());
        assert!(!BackendError::Unavailable("x".into()).is_transient());
    }

    #[test]
    fn test_from_task_rejects_invalid_profile() {
        let profile = ConnectionProfile::stdio(StdioConfig::default());
        assert!(matches!(
            BackendConnection::from_task(&task(profile)),
            Err(BackendError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_new_connection_starts_created() {
        let profile = ConnectionProfile::sse(SseConfig {
            server_url: "http://127.0.0.1:9/sse".to_string(),
            bearer_token: None,
        });
        let conn = BackendConnection::from_task(&task(profile)).unwrap();
        assert_eq!(conn.state().await, ConnectionState::Created);
        assert_eq!(conn.label(), "S1/T1");
        assert_eq!(conn.id(), &BackendId::new("sec-1", "task-1"));
    }

    #[tokio::test]
    async fn test_invoke_refused_before_ready() {
        let profile = ConnectionProfile::stdio(StdioConfig {
            command: "cat".to_string(),
            ..Default::default()
        });
        let conn = BackendConnection::from_task(&task(profile)).unwrap();
        let err = conn.invoke("echo", json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            BackendError::InvalidState(ConnectionState::Created, "invoke")
        ));
    }

    #[tokio::test]
    async fn test_handshake_requires_connect_first() {
        let profile = ConnectionProfile::stdio(StdioConfig {
            command: "cat".to_string(),
            ..Default::default()
        });
        let conn = BackendConnection::from_task(&task(profile)).unwrap();
        assert!(matches!(
            conn.handshake().await,
            Err(BackendError::InvalidState(ConnectionState::Created, "handshake"))
        ));
    }

    #[tokio::test]
    async fn test_failed_spawn_ends_failed_then_closed() {
        let profile = ConnectionProfile::stdio(StdioConfig {
            command: "definitely-not-a-real-binary-4f2a".to_string(),
            ..Default::default()
        });
        let conn = BackendConnection::from_task(&task(profile)).unwrap();
        assert!(conn.connect().await.is_err());
        assert_eq!(conn.state().await, ConnectionState::Failed);

        conn.close(Duration::from_millis(100)).await;
        assert_eq!(conn.state().await, ConnectionState::Closed);
    }

    #[test]
    fn test_into_result_surfaces_rpc_errors() {
        let err = into_result(
            JsonRpcResponse::error(
                Some(JsonRpcId::Number(1)),
                JsonRpcError::method_not_found("tools/list"),
            ),
            "tools/list",
        )
        .unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse(_)));
    }
}
