//! SSE backend: a remote MCP server on the HTTP+SSE transport
//!
//! `GET {serverUrl}` opens an event stream whose first `endpoint` event names
//! the URL to POST requests to. Replies come back as `message` events on the
//! same stream and are routed by id through the pending table.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use secretary_shared::{GeneralConfig, SseConfig};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use url::Url;

use super::rpc::{answer_backend_request, await_reply, PendingRequests};
use super::BackendError;
use crate::mcp::types::{IncomingMessage, JsonRpcRequest, JsonRpcResponse};

/// Budget for the liveness ping sent by health checks
const PING_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SseBackend {
    label: String,
    config: SseConfig,
    client: Client,
    pending: Arc<PendingRequests>,
    endpoint: RwLock<Option<Url>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SseBackend {
    pub fn new(label: impl Into<String>, config: SseConfig) -> Self {
        Self {
            label: label.into(),
            config,
            client: Client::new(),
            pending: Arc::new(PendingRequests::new()),
            endpoint: RwLock::new(None),
            pump: Mutex::new(None),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.bearer_token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    /// Open the event stream and wait for the endpoint announcement.
    ///
    /// Each attempt is bounded by the connect timeout; failed attempts are
    /// retried `retryCount` times, `retryDelaySeconds` apart.
    pub async fn open(&self, limits: &GeneralConfig) -> Result<(), BackendError> {
        let base = Url::parse(&self.config.server_url)
            .map_err(|e| BackendError::Config(format!("Invalid serverUrl: {}", e)))?;
        let attempt_timeout = Duration::from_secs(limits.connect_timeout_seconds);
        let strategy = FixedInterval::new(Duration::from_secs(limits.retry_delay_seconds))
            .take(limits.retry_count as usize);

        let base = &base;
        let (source, endpoint) = Retry::spawn(strategy, || async move {
            match tokio::time::timeout(attempt_timeout, self.open_stream(base)).await {
                Ok(Ok(opened)) => Ok(opened),
                Ok(Err(e)) => {
                    tracing::warn!(backend = %self.label, error = %e, "SSE connect attempt failed");
                    Err(e)
                }
                Err(_) => {
                    tracing::warn!(backend = %self.label, "SSE connect attempt timed out");
                    Err(BackendError::ConnectTimeout(attempt_timeout))
                }
            }
        })
        .await?;

        tracing::info!(backend = %self.label, endpoint = %endpoint, "SSE backend connected");
        *self.endpoint.write().await = Some(endpoint);
        self.start_pump(source).await;
        Ok(())
    }

    async fn open_stream(&self, base: &Url) -> Result<(EventSource, Url), BackendError> {
        let request = self
            .authorize(self.client.get(base.clone()))
            .header(ACCEPT, "text/event-stream");
        let mut source = EventSource::new(request)
            .map_err(|e| BackendError::Stream(format!("Cannot open event stream: {}", e)))?;
        source.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));

        while let Some(event) = source.next().await {
            match event {
                Ok(Event::Open) => continue,
                Ok(Event::Message(message)) if message.event == "endpoint" => {
                    let endpoint = base.join(message.data.trim()).map_err(|e| {
                        BackendError::Handshake(format!("Invalid endpoint event: {}", e))
                    })?;
                    return Ok((source, endpoint));
                }
                Ok(Event::Message(message)) => {
                    tracing::debug!(backend = %self.label, event = %message.event, "Ignoring event before endpoint");
                }
                Err(e) => {
                    source.close();
                    return Err(BackendError::Stream(e.to_string()));
                }
            }
        }
        Err(BackendError::Stream(
            "stream ended before endpoint event".to_string(),
        ))
    }

    async fn start_pump(&self, mut source: EventSource) {
        let label = self.label.clone();
        let pending = Arc::clone(&self.pending);
        // Replies to backend-initiated requests are posted from their own task
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<JsonRpcResponse>();

        let client = self.client.clone();
        let endpoint = self.endpoint.read().await.clone();
        let token = self.config.bearer_token.clone();
        let reply_label = label.clone();
        let replier = tokio::spawn(async move {
            let Some(endpoint) = endpoint else { return };
            while let Some(reply) = reply_rx.recv().await {
                let mut post = client.post(endpoint.clone()).json(&reply);
                if let Some(token) = &token {
                    post = post.header(AUTHORIZATION, format!("Bearer {}", token));
                }
                if let Err(e) = post.send().await {
                    tracing::debug!(backend = %reply_label, error = %e, "Failed to answer backend request");
                }
            }
        });

        let handle = tokio::spawn(async move {
            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Open) => {}
                    Ok(Event::Message(message)) if message.event == "message" => {
                        match IncomingMessage::parse(&message.data) {
                            Ok(IncomingMessage::Response(response)) => pending.complete(response).await,
                            Ok(IncomingMessage::Request(request)) => {
                                if let Some(reply) = answer_backend_request(&label, &request) {
                                    let _ = reply_tx.send(reply);
                                }
                            }
                            Err(e) => {
                                tracing::warn!(backend = %label, error = %e, "Unparsed SSE message");
                            }
                        }
                    }
                    Ok(Event::Message(message)) => {
                        tracing::debug!(backend = %label, event = %message.event, "Ignoring SSE event");
                    }
                    Err(e) => {
                        tracing::warn!(backend = %label, error = %e, "SSE stream error");
                        break;
                    }
                }
            }
            source.close();
            replier.abort();
            tracing::warn!(backend = %label, "SSE stream closed");
            pending.close("event stream closed").await;
        });

        *self.pump.lock().await = Some(handle);
    }

    async fn post(&self, message: &JsonRpcRequest) -> Result<(), BackendError> {
        let endpoint = self
            .endpoint
            .read()
            .await
            .clone()
            .ok_or_else(|| BackendError::Unavailable("stream not open".to_string()))?;

        let response = self
            .authorize(self.client.post(endpoint))
            .json(message)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    BackendError::NotSent(e.to_string())
                } else {
                    BackendError::Http(e)
                }
            })?;

        if !response.status().is_success() {
            return Err(BackendError::Unavailable(format!(
                "endpoint rejected message with HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, BackendError> {
        let id = self.pending.next_id();
        let rx = self.pending.register(id).await?;

        if let Err(e) = self.post(&JsonRpcRequest::new(id, method, params)).await {
            self.pending.cancel(id).await;
            return Err(e);
        }
        await_reply(&self.pending, id, rx, timeout).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), BackendError> {
        self.post(&JsonRpcRequest::notification(method, params)).await
    }

    /// Event stream ended or never opened
    pub async fn is_closed(&self) -> bool {
        self.pending.is_closed().await || self.endpoint.read().await.is_none()
    }

    /// Stream still open and the server answers a ping
    pub async fn is_alive(&self) -> bool {
        if self.is_closed().await {
            return false;
        }
        self.request("ping", None, PING_TIMEOUT).await.is_ok()
    }

    pub async fn close(&self) {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        self.endpoint.write().await.take();
        self.pending.close("connection closed").await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn limits() -> GeneralConfig {
        GeneralConfig {
            connect_timeout_seconds: 2,
            retry_count: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_rejected_stream_fails_to_open() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/sse")
            .with_status(401)
            .create_async()
            .await;

        let backend = SseBackend::new(
            "s/t",
            SseConfig {
                server_url: format!("{}/sse", server.url()),
                bearer_token: None,
            },
        );

        let err = backend.open(&limits()).await.unwrap_err();
        assert!(matches!(err, BackendError::Stream(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_retries_up_to_retry_count() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/sse")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let backend = SseBackend::new(
            "s/t",
            SseConfig {
                server_url: format!("{}/sse", server.url()),
                bearer_token: None,
            },
        );
        let limits = GeneralConfig {
            retry_count: 2,
            retry_delay_seconds: 0,
            ..limits()
        };

        assert!(backend.open(&limits).await.is_err());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_huge_retry_delay_does_not_overflow() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/sse")
            .with_status(503)
            .create_async()
            .await;

        let backend = SseBackend::new(
            "s/t",
            SseConfig {
                server_url: format!("{}/sse", server.url()),
                bearer_token: None,
            },
        );
        let limits = GeneralConfig {
            retry_count: 0,
            retry_delay_seconds: u64::MAX,
            ..limits()
        };

        assert!(matches!(
            backend.open(&limits).await,
            Err(BackendError::Stream(_))
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refused_post_is_not_sent() {
        let mut server = mockito::Server::new_async().await;
        // The endpoint points at a port nothing listens on
        let mock = server
            .mock("GET", "/sse")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body("event: endpoint\ndata: http://127.0.0.1:9/message\n\n")
            .create_async()
            .await;

        let backend = SseBackend::new(
            "s/t",
            SseConfig {
                server_url: format!("{}/sse", server.url()),
                bearer_token: None,
            },
        );
        let base = Url::parse(&backend.config.server_url).unwrap();
        let (mut source, endpoint) = backend.open_stream(&base).await.unwrap();
        source.close();
        *backend.endpoint.write().await = Some(endpoint);

        let err = backend
            .post(&JsonRpcRequest::new(1, "tools/call", None))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotSent(_)));
        assert!(err.is_transient());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_invalid_url_is_config_error() {
        let backend = SseBackend::new(
            "s/t",
            SseConfig {
                server_url: "not a url".to_string(),
                bearer_token: None,
            },
        );
        assert!(matches!(
            backend.open(&limits()).await,
            Err(BackendError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_request_before_open_is_unavailable() {
        let backend = SseBackend::new(
            "s/t",
            SseConfig {
                server_url: "http://127.0.0.1:9/sse".to_string(),
                bearer_token: None,
            },
        );
        let err = backend
            .request("ping", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
        assert!(!backend.is_alive().await);
    }
}
