//! Stdio upstream: one MCP client speaking newline-delimited JSON-RPC
//!
//! Every request line is dispatched on its own task so a slow tool call
//! does not block the rest; responses funnel through a single writer task.
//! On shutdown the reader stops; calls already dispatched still answer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use super::{ProxyCore, ProxyServer};
use crate::error::{GatewayError, GatewayResult};
use crate::mcp::types::JsonRpcResponse;
use crate::users::UserSecretaryRegistry;

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Responses queued ahead of the writer
const RESPONSE_QUEUE: usize = 256;

struct StdioIo {
    reader: Reader,
    writer: Writer,
}

pub struct StdioProxyServer {
    core: ProxyCore,
    /// Caller identity for scope checks; `None` is unrestricted
    user_id: Option<String>,
    /// Reader/writer supplied up front; stdin/stdout otherwise
    injected: Mutex<Option<StdioIo>>,
    /// Transport opened by initialize, consumed by run
    io: Mutex<Option<StdioIo>>,
}

impl StdioProxyServer {
    /// Serve the process's own stdin/stdout
    pub fn new(
        users: Arc<UserSecretaryRegistry>,
        user_id: Option<String>,
        health_interval: Duration,
    ) -> Self {
        Self::build(users, user_id, health_interval, None)
    }

    /// Serve an arbitrary reader/writer pair instead of stdin/stdout
    pub fn with_io<R, W>(
        users: Arc<UserSecretaryRegistry>,
        user_id: Option<String>,
        health_interval: Duration,
        reader: R,
        writer: W,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let io = StdioIo {
            reader: Box::new(reader),
            writer: Box::new(writer),
        };
        Self::build(users, user_id, health_interval, Some(io))
    }

    fn build(
        users: Arc<UserSecretaryRegistry>,
        user_id: Option<String>,
        health_interval: Duration,
        injected: Option<StdioIo>,
    ) -> Self {
        Self {
            core: ProxyCore::new(users, health_interval),
            user_id,
            injected: Mutex::new(injected),
            io: Mutex::new(None),
        }
    }

    async fn open_transport(&self) -> GatewayResult<()> {
        let io = match self.injected.lock().await.take() {
            Some(io) => io,
            None => StdioIo {
                reader: Box::new(tokio::io::stdin()),
                writer: Box::new(tokio::io::stdout()),
            },
        };
        *self.io.lock().await = Some(io);
        tracing::info!(user_id = ?self.user_id, "Stdio upstream transport opened");
        Ok(())
    }
}

#[async_trait]
impl ProxyServer for StdioProxyServer {
    async fn initialize(&self) -> GatewayResult<()> {
        self.core.initialize(|| self.open_transport()).await
    }

    async fn run(&self) -> GatewayResult<()> {
        self.core.begin_run().await?;
        let StdioIo { reader, writer } = self
            .io
            .lock()
            .await
            .take()
            .ok_or(GatewayError::NotInitialized)?;

        let (tx, mut rx) = mpsc::channel::<JsonRpcResponse>(RESPONSE_QUEUE);
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(response) = rx.recv().await {
                let mut line = match serde_json::to_string(&response) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode upstream response");
                        continue;
                    }
                };
                line.push('\n');
                let written = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    tracing::warn!(error = %e, "Upstream stdout closed");
                    break;
                }
            }
        });

        let mut lines = BufReader::new(reader).lines();
        let mut shutdown = self.core.shutdown_signal();
        let mut inflight = JoinSet::new();
        let mut stopping = *shutdown.borrow();

        while !stopping {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        let dispatcher = Arc::clone(self.core.dispatcher());
                        let users = Arc::clone(self.core.users());
                        let user_id = self.user_id.clone();
                        let tx = tx.clone();
                        let call = self.core.calls().track();
                        inflight.spawn(async move {
                            let scope = users.scope_for(user_id.as_deref()).await;
                            if let Some(response) = dispatcher.handle_raw(&line, &scope).await {
                                let _ = tx.send(response).await;
                            }
                            drop(call);
                        });
                    }
                    Ok(None) => {
                        tracing::info!("Upstream stdin closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read upstream stdin");
                        break;
                    }
                },
                Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
                _ = shutdown.changed() => stopping = true,
            }
        }

        if stopping {
            tracing::info!(in_flight = inflight.len(), "Upstream reader stopped for shutdown");
        }
        // Outstanding calls answer, or fail once their backend is closed
        while inflight.join_next().await.is_some() {}
        drop(tx);
        let _ = writer_task.await;
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.core.is_healthy().await
    }

    async fn shutdown(&self, timeout: Duration) {
        if self.core.shutdown(timeout).await {
            self.io.lock().await.take();
            self.core.finish_shutdown().await;
        }
    }

    fn core(&self) -> &ProxyCore {
        &self.core
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::proxy::ServerState;
    use serde_json::Value;

    #[tokio::test]
    async fn test_run_before_initialize_fails() {
        let (_client, server_io) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(server_io);
        let server = StdioProxyServer::with_io(
            Arc::new(UserSecretaryRegistry::new()),
            None,
            Duration::ZERO,
            reader,
            writer,
        );

        assert!(matches!(server.run().await, Err(GatewayError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_serves_until_eof() {
        let (client, server_io) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(server_io);
        let server = StdioProxyServer::with_io(
            Arc::new(UserSecretaryRegistry::new()),
            None,
            Duration::ZERO,
            reader,
            writer,
        );
        server.initialize().await.unwrap();

        let (client_read, mut client_write) = tokio::io::split(client);
        client_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
            .await
            .unwrap();
        client_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n")
            .await
            .unwrap();
        drop(client_write);

        server.run().await.unwrap();

        let mut lines = BufReader::new(client_read).lines();
        let first: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first["id"], 1);
        assert_eq!(first["result"], serde_json::json!({}));

        server.shutdown(Duration::from_secs(1)).await;
        assert_eq!(server.core().state().await, ServerState::Stopped);
        // Notification got no reply
        assert!(lines.next_line().await.unwrap().is_none());
    }
}
