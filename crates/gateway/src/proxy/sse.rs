//! SSE upstream: MCP over HTTP with server-sent events
//!
//! `GET {ssePath}` opens a session stream. Its first event is `endpoint`,
//! carrying `{messagePath}?sessionId=<uuid>`; clients POST JSON-RPC messages
//! there and receive the replies as `message` events on their stream.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::dispatch::McpDispatcher;
use super::{CallTracker, ProxyCore, ProxyServer};
use crate::admin::{self, AdminState};
use crate::error::{GatewayError, GatewayResult};
use crate::mcp::types::JsonRpcResponse;
use crate::users::UserSecretaryRegistry;

/// Undelivered responses buffered per session
const SESSION_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct SseServerConfig {
    pub bind_address: SocketAddr,
    pub sse_path: String,
    pub message_path: String,
}

struct Session {
    user_id: Option<String>,
    tx: mpsc::Sender<JsonRpcResponse>,
}

type Sessions = Arc<RwLock<HashMap<Uuid, Session>>>;

#[derive(Clone)]
struct SseState {
    dispatcher: Arc<McpDispatcher>,
    users: Arc<UserSecretaryRegistry>,
    calls: CallTracker,
    sessions: Sessions,
    message_path: String,
}

pub struct SseProxyServer {
    core: ProxyCore,
    config: SseServerConfig,
    sessions: Sessions,
    listener: Mutex<Option<TcpListener>>,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl SseProxyServer {
    pub fn new(
        users: Arc<UserSecretaryRegistry>,
        config: SseServerConfig,
        health_interval: Duration,
    ) -> Self {
        Self {
            core: ProxyCore::new(users, health_interval),
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            listener: Mutex::new(None),
            local_addr: RwLock::new(None),
        }
    }

    /// Address actually bound, once initialized
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn open_transport(&self) -> GatewayResult<()> {
        let listener = TcpListener::bind(self.config.bind_address)
            .await
            .map_err(|e| {
                GatewayError::UpstreamTransport(format!(
                    "Failed to bind {}: {}",
                    self.config.bind_address, e
                ))
            })?;
        let addr = listener
            .local_addr()
            .map_err(|e| GatewayError::UpstreamTransport(e.to_string()))?;

        tracing::info!(
            addr = %addr,
            sse_path = %self.config.sse_path,
            message_path = %self.config.message_path,
            "SSE upstream transport bound"
        );
        *self.local_addr.write().await = Some(addr);
        *self.listener.lock().await = Some(listener);
        Ok(())
    }

    /// MCP routes merged with the admin surface
    pub fn router(&self) -> Router {
        let state = SseState {
            dispatcher: Arc::clone(self.core.dispatcher()),
            users: Arc::clone(self.core.users()),
            calls: self.core.calls().clone(),
            sessions: Arc::clone(&self.sessions),
            message_path: self.config.message_path.clone(),
        };

        let mcp_routes = Router::new()
            .route(&self.config.sse_path, get(open_session))
            .route(&self.config.message_path, post(post_message))
            .with_state(state);

        let admin_routes = admin::router(AdminState {
            registry: Arc::clone(self.core.registry()),
            users: Arc::clone(self.core.users()),
            tasks: self.core.task_list(),
        });

        Router::new()
            .merge(mcp_routes)
            .merge(admin_routes)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }
}

#[async_trait]
impl ProxyServer for SseProxyServer {
    async fn initialize(&self) -> GatewayResult<()> {
        self.core.initialize(|| self.open_transport()).await
    }

    async fn run(&self) -> GatewayResult<()> {
        self.core.begin_run().await?;
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or(GatewayError::NotInitialized)?;

        let mut shutdown = self.core.shutdown_signal();
        let app = self.router();
        let addr = self.local_addr().await;
        tracing::info!(addr = ?addr, "Serving MCP over SSE");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| GatewayError::UpstreamTransport(e.to_string()))
    }

    async fn is_healthy(&self) -> bool {
        self.core.is_healthy().await
    }

    async fn shutdown(&self, timeout: Duration) {
        if self.core.shutdown(timeout).await {
            // Dropping the senders ends every open stream
            let closed = {
                let mut sessions = self.sessions.write().await;
                let count = sessions.len();
                sessions.clear();
                count
            };
            if closed > 0 {
                tracing::info!(sessions = closed, "Closed upstream sessions");
            }
            self.listener.lock().await.take();
            self.core.finish_shutdown().await;
        }
    }

    fn core(&self) -> &ProxyCore {
        &self.core
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageQuery {
    session_id: Uuid,
}

/// Removes its session when the client's stream is dropped
struct SessionGuard {
    id: Uuid,
    sessions: Sessions,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let id = self.id;
        let sessions = Arc::clone(&self.sessions);
        runtime.spawn(async move {
            if sessions.write().await.remove(&id).is_some() {
                tracing::debug!(session_id = %id, "Upstream session closed");
            }
        });
    }
}

async fn open_session(
    State(state): State<SseState>,
    Query(query): Query<SessionQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(SESSION_QUEUE);
    state.sessions.write().await.insert(
        id,
        Session {
            user_id: query.user_id.clone(),
            tx,
        },
    );
    tracing::info!(session_id = %id, user_id = ?query.user_id, "Upstream session opened");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("{}?sessionId={}", state.message_path, id));
    let guard = SessionGuard {
        id,
        sessions: Arc::clone(&state.sessions),
    };

    let messages = ReceiverStream::new(rx).filter_map(move |response| {
        let _session = &guard;
        let event = match serde_json::to_string(&response) {
            Ok(data) => Some(Ok(Event::default().event("message").data(data))),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode session message");
                None
            }
        };
        async move { event }
    });

    Sse::new(stream::once(async move { Ok(endpoint) }).chain(messages))
        .keep_alive(KeepAlive::default())
}

async fn post_message(
    State(state): State<SseState>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> Response {
    let (user_id, tx) = match state.sessions.read().await.get(&query.session_id) {
        Some(session) => (session.user_id.clone(), session.tx.clone()),
        None => return (StatusCode::NOT_FOUND, "Unknown session").into_response(),
    };

    let call = state.calls.track();
    tokio::spawn(async move {
        let scope = state.users.scope_for(user_id.as_deref()).await;
        if let Some(response) = state.dispatcher.handle_raw(&body, &scope).await {
            if tx.send(response).await.is_err() {
                tracing::debug!(session_id = %query.session_id, "Session closed before reply");
            }
        }
        drop(call);
    });

    StatusCode::ACCEPTED.into_response()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn server() -> SseProxyServer {
        SseProxyServer::new(
            Arc::new(UserSecretaryRegistry::new()),
            SseServerConfig {
                bind_address: "127.0.0.1:0".parse().unwrap(),
                sse_path: "/sse".to_string(),
                message_path: "/mcp/message".to_string(),
            },
            Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn test_post_to_unknown_session_is_404() {
        let app = server().router();
        let response = app
            .oneshot(
                Request::post(format!("/mcp/message?sessionId={}", Uuid::new_v4()))
                    .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_initialize_binds_ephemeral_port() {
        let server = server();
        server.initialize().await.unwrap();
        let addr = server.local_addr().await.unwrap();
        assert_ne!(addr.port(), 0);

        server.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_bind_failure_fails_initialize() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = SseProxyServer::new(
            Arc::new(UserSecretaryRegistry::new()),
            SseServerConfig {
                bind_address: taken.local_addr().unwrap(),
                sse_path: "/sse".to_string(),
                message_path: "/mcp/message".to_string(),
            },
            Duration::ZERO,
        );

        assert!(matches!(
            server.initialize().await,
            Err(GatewayError::UpstreamTransport(_))
        ));
        assert_eq!(server.core().state().await, crate::proxy::ServerState::Failed);
    }
}
