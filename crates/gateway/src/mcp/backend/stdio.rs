//! Stdio backend: an MCP server running as a child process
//!
//! Requests are newline-delimited JSON-RPC written to the child's stdin by a
//! single writer task; a reader task routes every stdout line back to the
//! waiting caller, so concurrent calls share one process.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use secretary_shared::{SpawnKind, StdioConfig};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::rpc::{answer_backend_request, await_reply, PendingRequests};
use super::BackendError;
use crate::mcp::types::{IncomingMessage, JsonRpcRequest, JsonRpcResponse};

/// Outgoing line buffer per process
const WRITE_QUEUE: usize = 100;

/// A child that exits within this window after spawn failed to start
const SPAWN_GRACE: Duration = Duration::from_millis(100);
const SPAWN_POLL: Duration = Duration::from_millis(10);

/// Level at which child stderr lines are relayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StderrLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl StderrLevel {
    fn parse(level: Option<&str>) -> Self {
        match level.map(|l| l.to_ascii_lowercase()).as_deref() {
            Some("error") => StderrLevel::Error,
            Some("warn") | Some("warning") => StderrLevel::Warn,
            Some("info") => StderrLevel::Info,
            _ => StderrLevel::Debug,
        }
    }

    fn log(self, backend: &str, line: &str) {
        match self {
            StderrLevel::Error => tracing::error!(backend = %backend, stderr = %line),
            StderrLevel::Warn => tracing::warn!(backend = %backend, stderr = %line),
            StderrLevel::Info => tracing::info!(backend = %backend, stderr = %line),
            StderrLevel::Debug => tracing::debug!(backend = %backend, stderr = %line),
        }
    }
}

struct StdioProcess {
    child: Child,
    writer: mpsc::Sender<String>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct StdioBackend {
    label: String,
    config: StdioConfig,
    /// Resolved task config, exported below the profile's own env
    task_env: HashMap<String, String>,
    stderr_level: StderrLevel,
    pending: Arc<PendingRequests>,
    process: Mutex<Option<StdioProcess>>,
}

impl StdioBackend {
    pub fn new(
        label: impl Into<String>,
        config: StdioConfig,
        task_env: HashMap<String, String>,
        log_level: Option<&str>,
    ) -> Self {
        Self {
            label: label.into(),
            config,
            task_env,
            stderr_level: StderrLevel::parse(log_level),
            pending: Arc::new(PendingRequests::new()),
            process: Mutex::new(None),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = match self.config.spawn_kind {
            SpawnKind::Direct => {
                let mut cmd = Command::new(&self.config.command);
                cmd.args(&self.config.args);
                cmd
            }
            SpawnKind::Shell => {
                let mut line = self.config.command.clone();
                for arg in &self.config.args {
                    line.push(' ');
                    line.push_str(arg);
                }
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
        };

        cmd.envs(&self.task_env)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Spawn the child and start its pipe tasks
    pub async fn open(&self) -> Result<(), BackendError> {
        let mut child = self.command().spawn().map_err(|e| {
            BackendError::Spawn(format!("Failed to spawn {}: {}", self.config.command, e))
        })?;

        let started = tokio::time::Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(BackendError::Spawn(format!(
                    "{} exited immediately with {}",
                    self.config.command, status
                )));
            }
            if started.elapsed() >= SPAWN_GRACE {
                break;
            }
            tokio::time::sleep(SPAWN_POLL).await;
        }

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Spawn("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Spawn("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Spawn("Failed to capture stderr".to_string()))?;

        let (writer, mut outgoing) = mpsc::channel::<String>(WRITE_QUEUE);
        let mut tasks = Vec::with_capacity(3);

        // Writer: ends when every sender is gone, dropping stdin (EOF to the child)
        let label = self.label.clone();
        let pending = Arc::clone(&self.pending);
        tasks.push(tokio::spawn(async move {
            let mut stdin = BufWriter::new(stdin);
            while let Some(line) = outgoing.recv().await {
                tracing::trace!(backend = %label, tx = %line.trim_end());
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    tracing::warn!(backend = %label, error = %e, "Failed to write to backend stdin");
                    pending.close("backend stdin closed").await;
                    break;
                }
            }
            tracing::debug!(backend = %label, "stdin writer task exiting");
        }));

        // Reader: routes replies, answers backend pings, closes the table on EOF
        let label = self.label.clone();
        let pending = Arc::clone(&self.pending);
        let replies = writer.downgrade();
        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        tracing::trace!(backend = %label, rx = %line);
                        match IncomingMessage::parse(line) {
                            Ok(IncomingMessage::Response(response)) => pending.complete(response).await,
                            Ok(IncomingMessage::Request(request)) => {
                                let Some(reply) = answer_backend_request(&label, &request) else {
                                    continue;
                                };
                                if let (Some(tx), Ok(encoded)) =
                                    (replies.upgrade(), encode_line(&reply))
                                {
                                    let _ = tx.send(encoded).await;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(backend = %label, error = %e, line = %line, "Unparsed backend output");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(backend = %label, error = %e, "Failed to read backend stdout");
                        break;
                    }
                }
            }
            tracing::warn!(backend = %label, "Backend stdout closed");
            pending.close("backend process exited").await;
        }));

        let label = self.label.clone();
        let level = self.stderr_level;
        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    level.log(&label, trimmed);
                }
            }
        }));

        tracing::info!(
            backend = %self.label,
            command = %self.config.command,
            pid = ?child.id(),
            "Spawned stdio backend"
        );

        *self.process.lock().await = Some(StdioProcess {
            child,
            writer,
            tasks,
        });
        Ok(())
    }

    async fn writer(&self) -> Result<mpsc::Sender<String>, BackendError> {
        self.process
            .lock()
            .await
            .as_ref()
            .map(|p| p.writer.clone())
            .ok_or_else(|| BackendError::Unavailable("process not running".to_string()))
    }

    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, BackendError> {
        let writer = self.writer().await?;
        let id = self.pending.next_id();
        let line = encode_line(&JsonRpcRequest::new(id, method, params))?;

        let rx = self.pending.register(id).await?;
        if writer.send(line).await.is_err() {
            self.pending.cancel(id).await;
            return Err(BackendError::NotSent("backend stdin closed".to_string()));
        }
        await_reply(&self.pending, id, rx, timeout).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), BackendError> {
        let writer = self.writer().await?;
        let line = encode_line(&JsonRpcRequest::notification(method, params))?;
        writer
            .send(line)
            .await
            .map_err(|_| BackendError::Unavailable("backend stdin closed".to_string()))
    }

    /// Child still running and its stdout still open
    pub async fn is_alive(&self) -> bool {
        if self.pending.is_closed().await {
            return false;
        }
        let mut process = self.process.lock().await;
        match process.as_mut() {
            Some(p) => matches!(p.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Close stdin, give the child half the budget to exit, then kill it
    pub async fn close(&self, timeout: Duration) {
        let Some(process) = self.process.lock().await.take() else {
            return;
        };
        let StdioProcess {
            mut child,
            writer,
            tasks,
        } = process;
        drop(writer);

        let grace = timeout / 2;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(backend = %self.label, status = ?status, "Backend process exited gracefully");
            }
            Ok(Err(e)) => {
                tracing::error!(backend = %self.label, error = %e, "Error waiting for backend process");
            }
            Err(_) => {
                tracing::warn!(backend = %self.label, "Killing unresponsive backend process");
                if let Err(e) = child.start_kill() {
                    tracing::error!(backend = %self.label, error = %e, "Failed to kill backend process");
                }
                let remaining = timeout.saturating_sub(grace);
                if tokio::time::timeout(remaining, child.wait()).await.is_err() {
                    tracing::error!(backend = %self.label, "Backend process did not exit after kill");
                }
            }
        }

        for task in tasks {
            task.abort();
        }
        self.pending.close("connection closed").await;
    }
}

fn encode_line<T: serde::Serialize>(message: &T) -> Result<String, BackendError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
