//! Backend Registry
//!
//! Owns every live [`BackendConnection`] and the [`ToolNamespace`] built from
//! their tool lists. Bringing a task online runs connect, handshake and tool
//! registration under a per-task lock, so work on one task is serialized
//! while disjoint tasks proceed concurrently. A connection becomes routable
//! only once it is `Ready` and present in the map.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use secretary_shared::{BackendId, RemoteTask, TaskStatus};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use super::backend::{BackendConnection, BackendStatus, ConnectionState};
use super::namespace::ToolNamespace;
use super::types::Tool;
use crate::error::{GatewayError, GatewayResult};
use crate::users::CallerScope;

/// Budget for closing one backend outside of a bulk shutdown
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a successful bring-online call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringOnline {
    Online { tool_count: usize },
    AlreadyOnline,
}

/// A task that could not be brought online
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub secretary_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Outcome of a bulk bring-online pass
#[derive(Debug, Clone, Default)]
pub struct BulkReport {
    pub online: Vec<BackendId>,
    pub failed: Vec<(BackendId, String)>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub pass_completed: bool,
    pub backends: Vec<BackendStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    pub backends: Vec<BackendStatus>,
    pub failures: Vec<TaskFailure>,
    pub tool_count: usize,
}

pub struct BackendRegistry {
    connections: RwLock<HashMap<BackendId, Arc<BackendConnection>>>,
    namespace: Arc<ToolNamespace>,
    task_locks: Mutex<HashMap<BackendId, Arc<Mutex<()>>>>,
    failures: RwLock<HashMap<BackendId, TaskFailure>>,
    online_pass_completed: AtomicBool,
    close_timeout: Duration,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::with_namespace(Arc::new(ToolNamespace::new()))
    }

    pub fn with_namespace(namespace: Arc<ToolNamespace>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            namespace,
            task_locks: Mutex::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
            online_pass_completed: AtomicBool::new(false),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    pub fn namespace(&self) -> &Arc<ToolNamespace> {
        &self.namespace
    }

    async fn task_lock(&self, id: &BackendId) -> Arc<Mutex<()>> {
        let mut locks = self.task_locks.lock().await;
        Arc::clone(locks.entry(id.clone()).or_default())
    }

    /// Drop a task's lock entry unless another caller still holds or awaits it
    async fn release_task_lock(&self, id: &BackendId, lock: Arc<Mutex<()>>) {
        let mut locks = self.task_locks.lock().await;
        // One count for the map entry, one for `lock`
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(id);
        }
    }

    async fn connection(&self, id: &BackendId) -> Option<Arc<BackendConnection>> {
        self.connections.read().await.get(id).cloned()
    }

    /// Snapshot of the connection handles; no lock is held afterwards
    async fn all_connections(&self) -> Vec<Arc<BackendConnection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Connect, handshake and register one task's tools
    pub async fn bring_online(&self, task: &RemoteTask) -> GatewayResult<BringOnline> {
        let id = task.backend_id();
        let lock = self.task_lock(&id).await;
        let result = {
            let _guard = lock.lock().await;
            self.bring_online_locked(&id, task).await
        };
        if result.is_err() {
            self.release_task_lock(&id, lock).await;
        }
        result
    }

    async fn bring_online_locked(
        &self,
        id: &BackendId,
        task: &RemoteTask,
    ) -> GatewayResult<BringOnline> {
        if let Some(existing) = self.connection(id).await {
            // A connection whose transport died reads as Failed here
            let state = existing.state().await;
            if state.is_routable() {
                return Ok(BringOnline::AlreadyOnline);
            }
            tracing::info!(backend = %id, state = %state, "Replacing stale connection");
            self.remove(id).await;
            existing.close(self.close_timeout).await;
        }

        tracing::info!(
            backend = %id,
            secretary = %task.secretary_name,
            task = %task.display_name(),
            kind = %task.connection_profile.connection_type,
            "Bringing task online"
        );

        match self.establish(task).await {
            Ok(tool_count) => {
                self.failures.write().await.remove(id);
                Ok(BringOnline::Online { tool_count })
            }
            Err(e) => {
                tracing::error!(backend = %id, error = %e, "Failed to bring task online");
                self.record_failure(id, &e).await;
                Err(e)
            }
        }
    }

    async fn establish(&self, task: &RemoteTask) -> GatewayResult<usize> {
        let id = task.backend_id();
        let connection = BackendConnection::from_task(task)
            .map(Arc::new)
            .map_err(|e| GatewayError::backend(&id, e))?;

        let opened = async {
            connection.connect().await?;
            connection.handshake().await
        }
        .await;
        if let Err(e) = opened {
            connection.close(self.close_timeout).await;
            return Err(GatewayError::backend(&id, e));
        }

        self.namespace
            .register_names(&id, &task.secretary_name, task.display_name())
            .await;
        self.connections
            .write()
            .await
            .insert(id.clone(), Arc::clone(&connection));

        let tools = connection.tools().await;
        match self.namespace.register_tools(&id, &tools).await {
            Ok(report) => Ok(report.registered.len()),
            Err(e) => {
                self.remove(&id).await;
                connection.close(self.close_timeout).await;
                Err(e.into())
            }
        }
    }

    async fn record_failure(&self, id: &BackendId, error: &GatewayError) {
        let failure = TaskFailure {
            secretary_id: id.secretary_id.clone(),
            task_id: id.task_id.clone(),
            status: TaskStatus::Error,
            message: error.to_string(),
            at: Utc::now(),
        };
        self.failures.write().await.insert(id.clone(), failure);
    }

    /// Drop the map entry first so routing stops, then the namespace entries
    async fn remove(&self, id: &BackendId) -> Option<Arc<BackendConnection>> {
        let removed = self.connections.write().await.remove(id);
        self.namespace.remove_backend(id).await;
        removed
    }

    /// Bring every task online concurrently; individual failures are tolerated
    pub async fn bring_all_online(&self, tasks: &[RemoteTask]) -> BulkReport {
        let results = join_all(tasks.iter().map(|task| async move {
            (task.backend_id(), self.bring_online(task).await)
        }))
        .await;

        let mut report = BulkReport::default();
        for (id, result) in results {
            match result {
                Ok(_) => report.online.push(id),
                Err(e) => report.failed.push((id, e.to_string())),
            }
        }
        self.online_pass_completed.store(true, Ordering::SeqCst);

        tracing::info!(
            online = report.online.len(),
            failed = report.failed.len(),
            "Bring-online pass completed"
        );
        report
    }

    /// Stop routing to a task and close its connection
    pub async fn take_offline(&self, id: &BackendId) -> bool {
        let lock = self.task_lock(id).await;
        let removed = {
            let _guard = lock.lock().await;
            match self.remove(id).await {
                Some(connection) => {
                    self.namespace.forget_names(id).await;
                    connection.close(self.close_timeout).await;
                    tracing::info!(backend = %id, "Task taken offline");
                    true
                }
                None => false,
            }
        };
        self.release_task_lock(id, lock).await;
        removed
    }

    /// Explicit re-bring-online, replacing any existing connection
    pub async fn reconnect(&self, task: &RemoteTask) -> GatewayResult<BringOnline> {
        self.take_offline(&task.backend_id()).await;
        self.bring_online(task).await
    }

    /// Resolve a qualified tool name to a routable connection
    pub async fn route(&self, qualified: &str) -> GatewayResult<(Arc<BackendConnection>, String)> {
        let (id, local_name) = self.namespace.resolve(qualified).await?;
        let connection = self
            .connection(&id)
            .await
            .ok_or_else(|| GatewayError::NotAvailable {
                id: id.clone(),
                state: ConnectionState::Closed,
            })?;

        let state = connection.state().await;
        if !state.is_routable() {
            return Err(GatewayError::NotAvailable { id, state });
        }
        Ok((connection, local_name))
    }

    /// Qualified tools of routable backends visible to `scope`
    pub async fn list_tools(&self, scope: &CallerScope) -> Vec<Tool> {
        let mut routable = HashSet::new();
        for connection in self.all_connections().await {
            if connection.state().await.is_routable() {
                routable.insert(connection.id().clone());
            }
        }

        self.namespace
            .tools(|entry| routable.contains(&entry.backend_id) && scope.allows(&entry.secretary_name))
            .await
    }

    /// Run one health check against every connection
    pub async fn check_health(&self) {
        let connections = self.all_connections().await;
        join_all(connections.iter().map(|connection| async move {
            if !connection.health_check().await {
                let state = connection.state().await;
                tracing::warn!(backend = %connection.id(), state = %state, "Health check failed");
            }
        }))
        .await;
    }

    async fn statuses(&self) -> Vec<BackendStatus> {
        let mut statuses = Vec::new();
        for connection in self.all_connections().await {
            statuses.push(connection.status().await);
        }
        statuses.sort_by(|a, b| a.label.cmp(&b.label));
        statuses
    }

    /// Healthy once a bring-online pass completed and every connection
    /// passes a fresh health check
    pub async fn health_snapshot(&self) -> HealthSnapshot {
        self.check_health().await;
        let pass_completed = self.online_pass_completed.load(Ordering::SeqCst);
        let backends = self.statuses().await;
        let healthy = pass_completed && backends.iter().all(|b| b.state.is_routable());
        HealthSnapshot {
            healthy,
            pass_completed,
            backends,
        }
    }

    pub async fn status(&self) -> RegistryStatus {
        let mut failures: Vec<TaskFailure> = self.failures.read().await.values().cloned().collect();
        failures.sort_by(|a, b| (&a.secretary_id, &a.task_id).cmp(&(&b.secretary_id, &b.task_id)));
        RegistryStatus {
            backends: self.statuses().await,
            failures,
            tool_count: self.namespace.len().await,
        }
    }

    /// Close every connection concurrently, each bounded by `timeout`
    pub async fn shutdown_all(&self, timeout: Duration) {
        let drained: Vec<Arc<BackendConnection>> =
            self.connections.write().await.drain().map(|(_, c)| c).collect();
        self.namespace.clear().await;

        if drained.is_empty() {
            return;
        }
        tracing::info!(count = drained.len(), "Closing all backends");
        join_all(drained.iter().map(|connection| connection.close(timeout))).await;
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mcp::namespace::NamespaceError;
    use secretary_shared::{ConnectionProfile, StdioConfig};

    fn broken_task(task_id: &str) -> RemoteTask {
        RemoteTask {
            id: task_id.to_string(),
            name: task_id.to_uppercase(),
            secretary_id: "sec-1".to_string(),
            secretary_name: "S1".to_string(),
            template_id: String::new(),
            status: TaskStatus::Active,
            connection_profile: ConnectionProfile::stdio(StdioConfig {
                command: "definitely-not-a-real-binary-4f2a".to_string(),
                ..Default::default()
            }),
            config: Default::default(),
            customizable_params: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_failed_bring_online_keeps_no_entry() {
        let registry = BackendRegistry::new();
        let task = broken_task("t1");

        assert!(registry.bring_online(&task).await.is_err());

        let status = registry.status().await;
        assert!(status.backends.is_empty());
        assert_eq!(status.failures.len(), 1);
        assert_eq!(status.failures[0].status, TaskStatus::Error);
        assert_eq!(status.failures[0].task_id, "t1");
    }

    #[tokio::test]
    async fn test_not_healthy_before_first_pass() {
        let registry = BackendRegistry::new();
        assert!(!registry.health_snapshot().await.healthy);

        let report = registry.bring_all_online(&[]).await;
        assert!(report.online.is_empty());
        assert!(registry.health_snapshot().await.healthy);
    }

    #[tokio::test]
    async fn test_pass_with_failures_still_completes() {
        let registry = BackendRegistry::new();
        let report = registry
            .bring_all_online(&[broken_task("t1"), broken_task("t2")])
            .await;

        assert_eq!(report.failed.len(), 2);
        let snapshot = registry.health_snapshot().await;
        assert!(snapshot.pass_completed);
        assert!(snapshot.backends.is_empty());
    }

    #[tokio::test]
    async fn test_route_unknown_tool() {
        let registry = BackendRegistry::new();
        let Err(err) = registry.route("S1.T1.echo").await else {
            panic!("unknown tool should not route");
        };
        assert!(matches!(
            err,
            GatewayError::Namespace(NamespaceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_task_locks_do_not_accumulate() {
        let registry = BackendRegistry::new();
        for n in 0..5 {
            let task = broken_task(&format!("t{}", n));
            assert!(registry.bring_online(&task).await.is_err());
            registry.take_offline(&task.backend_id()).await;
        }
        assert!(registry.task_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_take_offline_unknown_is_noop() {
        let registry = BackendRegistry::new();
        assert!(!registry.take_offline(&BackendId::new("s", "t")).await);
        registry.shutdown_all(Duration::from_millis(10)).await;
        assert!(registry.health_snapshot().await.backends.is_empty());
    }
}
