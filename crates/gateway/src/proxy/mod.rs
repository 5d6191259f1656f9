//! Upstream-facing MCP proxy servers
//!
//! A [`ProxyServer`] exposes the aggregated tool namespace to one upstream
//! client surface: a single stdio peer ([`StdioProxyServer`]) or any number
//! of HTTP+SSE sessions ([`SseProxyServer`]). Both share [`ProxyCore`], which
//! owns the backend registry, the lifecycle state and the health monitor.
//!
//! Shutdown stops intake first, lets in-flight calls finish within half the
//! budget, then closes the backends with what remains.

pub mod dispatch;
pub mod sse;
pub mod stdio;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secretary_shared::RemoteTask;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::{GatewayError, GatewayResult};
use crate::mcp::registry::BackendRegistry;
use crate::users::UserSecretaryRegistry;
use dispatch::McpDispatcher;

pub use sse::{SseProxyServer, SseServerConfig};
pub use stdio::StdioProxyServer;

/// Lifecycle state of a proxy server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Uninitialized,
    Initializing,
    Ready,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Uninitialized => "uninitialized",
            ServerState::Initializing => "initializing",
            ServerState::Ready => "ready",
            ServerState::Running => "running",
            ServerState::ShuttingDown => "shutting down",
            ServerState::Stopped => "stopped",
            ServerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[async_trait]
pub trait ProxyServer: Send + Sync {
    /// Open the upstream transport and bring every registered task online.
    /// Idempotent once initialized.
    async fn initialize(&self) -> GatewayResult<()>;

    /// Serve until the upstream surface is torn down
    async fn run(&self) -> GatewayResult<()>;

    async fn is_healthy(&self) -> bool;

    /// Stop serving and close every backend within `timeout`. Never fails.
    async fn shutdown(&self, timeout: Duration);

    fn core(&self) -> &ProxyCore;
}

/// Tasks known to the server, shared with the admin routes
pub type TaskList = Arc<RwLock<Vec<RemoteTask>>>;

/// Counts upstream requests still being dispatched
#[derive(Clone)]
pub(crate) struct CallTracker {
    count: Arc<watch::Sender<usize>>,
}

impl CallTracker {
    fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    /// Hold the returned guard for the lifetime of one upstream request
    pub(crate) fn track(&self) -> CallGuard {
        self.count.send_modify(|n| *n += 1);
        CallGuard {
            count: Arc::clone(&self.count),
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until nothing is in flight; false if `budget` ran out first
    async fn drained(&self, budget: Duration) -> bool {
        let mut rx = self.count.subscribe();
        let idle = async move { rx.wait_for(|n| *n == 0).await.map(|_| ()) };
        matches!(tokio::time::timeout(budget, idle).await, Ok(Ok(())))
    }
}

pub(crate) struct CallGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Run `stage` for at most `budget`; false if it was cut short
async fn bounded<F: Future>(budget: Duration, stage: F, what: &str) -> bool {
    if tokio::time::timeout(budget, stage).await.is_err() {
        tracing::warn!(stage = %what, budget_secs = budget.as_secs_f64(), "Shutdown stage exceeded its budget");
        return false;
    }
    true
}

/// State shared by both upstream transports
pub struct ProxyCore {
    registry: Arc<BackendRegistry>,
    users: Arc<UserSecretaryRegistry>,
    dispatcher: Arc<McpDispatcher>,
    state: RwLock<ServerState>,
    init_lock: Mutex<()>,
    tasks: TaskList,
    calls: CallTracker,
    shutdown_tx: watch::Sender<bool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    health_interval: Duration,
}

impl ProxyCore {
    pub fn new(users: Arc<UserSecretaryRegistry>, health_interval: Duration) -> Self {
        let registry = Arc::new(BackendRegistry::new());
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            dispatcher: Arc::new(McpDispatcher::new(Arc::clone(&registry))),
            registry,
            users,
            state: RwLock::new(ServerState::Uninitialized),
            init_lock: Mutex::new(()),
            tasks: Arc::new(RwLock::new(Vec::new())),
            calls: CallTracker::new(),
            shutdown_tx,
            monitor: Mutex::new(None),
            health_interval,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn users(&self) -> &Arc<UserSecretaryRegistry> {
        &self.users
    }

    pub fn dispatcher(&self) -> &Arc<McpDispatcher> {
        &self.dispatcher
    }

    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    async fn set_state(&self, state: ServerState) {
        let mut current = self.state.write().await;
        tracing::debug!(from = %*current, to = %state, "Proxy state transition");
        *current = state;
    }

    /// Queue a task for the next initialize and pre-register its names
    pub async fn register_task(&self, task: RemoteTask) {
        let id = task.backend_id();
        self.registry
            .namespace()
            .register_names(&id, &task.secretary_name, task.display_name())
            .await;

        let mut tasks = self.tasks.write().await;
        tasks.retain(|existing| existing.backend_id() != id);
        tasks.push(task);
    }

    pub async fn registered_tasks(&self) -> Vec<RemoteTask> {
        self.tasks.read().await.clone()
    }

    pub fn task_list(&self) -> TaskList {
        Arc::clone(&self.tasks)
    }

    pub(crate) fn calls(&self) -> &CallTracker {
        &self.calls
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Shared initialize sequence; `open_transport` is the server-specific step
    pub(crate) async fn initialize<F, Fut>(&self, open_transport: F) -> GatewayResult<()>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = GatewayResult<()>> + Send,
    {
        let _guard = self.init_lock.lock().await;
        match self.state().await {
            ServerState::Ready | ServerState::Running => return Ok(()),
            ServerState::Uninitialized => {}
            other => {
                return Err(GatewayError::InvalidState {
                    action: "initialize",
                    state: other.to_string(),
                })
            }
        }
        self.set_state(ServerState::Initializing).await;

        if let Err(e) = open_transport().await {
            tracing::error!(error = %e, "Failed to open upstream transport");
            self.set_state(ServerState::Failed).await;
            return Err(e);
        }

        let tasks = self.registered_tasks().await;
        let report = self.registry.bring_all_online(&tasks).await;
        for (id, error) in &report.failed {
            tracing::warn!(backend = %id, error = %error, "Task unavailable");
        }

        self.start_health_monitor().await;
        self.set_state(ServerState::Ready).await;
        tracing::info!(
            online = report.online.len(),
            failed = report.failed.len(),
            "Proxy server initialized"
        );
        Ok(())
    }

    async fn start_health_monitor(&self) {
        if self.health_interval.is_zero() {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let interval = self.health_interval;
        let mut shutdown = self.shutdown_signal();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; backends were just checked
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.check_health().await,
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("Health monitor stopped");
        });
        *self.monitor.lock().await = Some(handle);
    }

    /// Ready -> Running; serving without initialize is an error
    pub(crate) async fn begin_run(&self) -> GatewayResult<()> {
        let mut state = self.state.write().await;
        match *state {
            ServerState::Ready => {
                *state = ServerState::Running;
                Ok(())
            }
            ServerState::Uninitialized | ServerState::Failed => Err(GatewayError::NotInitialized),
            other => Err(GatewayError::InvalidState {
                action: "run",
                state: other.to_string(),
            }),
        }
    }

    pub async fn is_healthy(&self) -> bool {
        matches!(self.state().await, ServerState::Ready | ServerState::Running)
            && self.registry.health_snapshot().await.healthy
    }

    /// Signal the serving loops, stop the monitor, drain in-flight calls and
    /// close every backend, all within `timeout`. Returns false if the server
    /// had already stopped.
    pub(crate) async fn shutdown(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        {
            let mut state = self.state.write().await;
            if matches!(*state, ServerState::Stopped | ServerState::ShuttingDown) {
                return false;
            }
            *state = ServerState::ShuttingDown;
        }
        tracing::info!(timeout_secs = timeout.as_secs_f64(), "Shutting down proxy server");

        self.shutdown_tx.send_replace(true);
        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.abort();
        }

        if !self.calls.drained(timeout / 2).await {
            tracing::warn!(
                in_flight = self.calls.in_flight(),
                "In-flight calls still running; closing backends"
            );
        }

        // Per-backend budget leaves room for the stdio kill path inside the cap
        let remaining = timeout.saturating_sub(started.elapsed());
        let per_backend = remaining.mul_f64(0.75);
        bounded(remaining, self.registry.shutdown_all(per_backend), "close backends").await;
        true
    }

    pub(crate) async fn finish_shutdown(&self) {
        self.set_state(ServerState::Stopped).await;
        tracing::info!("Proxy server stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn core() -> ProxyCore {
        ProxyCore::new(Arc::new(UserSecretaryRegistry::new()), Duration::ZERO)
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let core = core();
        let opens = AtomicUsize::new(0);
        let open = || async {
            opens.fetch_add(1, Ordering::SeqCst);
            Ok::<(), GatewayError>(())
        };

        core.initialize(open).await.unwrap();
        assert_eq!(core.state().await, ServerState::Ready);
        core.initialize(open).await.unwrap();
        assert_eq!(core.state().await, ServerState::Ready);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_marks_failed() {
        let core = core();
        let err = core
            .initialize(|| async {
                Err::<(), GatewayError>(GatewayError::UpstreamTransport("boom".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamTransport(_)));
        assert_eq!(core.state().await, ServerState::Failed);
        assert!(matches!(core.begin_run().await, Err(GatewayError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_bounded_stage_gives_up_on_hung_close() {
        let started = Instant::now();
        let finished = bounded(
            Duration::from_millis(100),
            std::future::pending::<()>(),
            "close backends",
        )
        .await;
        assert!(!finished);
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(bounded(Duration::from_secs(1), async {}, "close backends").await);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_calls() {
        let core = core();
        let guard = core.calls().track();
        assert_eq!(core.calls().in_flight(), 1);

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(guard);
        });

        let started = Instant::now();
        assert!(core.shutdown(Duration::from_secs(4)).await);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(150), "returned after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "returned after {:?}", elapsed);
        assert_eq!(core.calls().in_flight(), 0);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_waiting_for_stuck_calls() {
        let core = core();
        let _stuck = core.calls().track();

        let started = Instant::now();
        assert!(core.shutdown(Duration::from_millis(400)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(core.calls().in_flight(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_initialize() {
        let core = core();
        assert!(core.shutdown(Duration::from_millis(50)).await);
        core.finish_shutdown().await;
        assert_eq!(core.state().await, ServerState::Stopped);
        assert!(!core.shutdown(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_register_task_replaces_same_id() {
        use chrono::Utc;
        use secretary_shared::{ConnectionProfile, StdioConfig, TaskStatus};

        let task = RemoteTask {
            id: "task-1".to_string(),
            name: "T1".to_string(),
            secretary_id: "sec-1".to_string(),
            secretary_name: "S1".to_string(),
            template_id: String::new(),
            status: TaskStatus::Active,
            connection_profile: ConnectionProfile::stdio(StdioConfig {
                command: "cat".to_string(),
                ..Default::default()
            }),
            config: Default::default(),
            customizable_params: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let core = core();
        core.register_task(task.clone()).await;
        core.register_task(task).await;
        assert_eq!(core.registered_tasks().await.len(), 1);
    }
}
