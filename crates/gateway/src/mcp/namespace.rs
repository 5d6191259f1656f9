//! Tool Namespace
//!
//! Maps backend-local tool names to globally unique qualified names and back.
//!
//! # Qualification
//!
//! Tools are exposed upstream as `{secretary}.{task}.{tool}` (e.g. `S1.T1.echo`).
//! The separator is stripped from every component (replaced with `_`) so a
//! qualified name always splits back into exactly three parts.
//!
//! A qualified name is owned by exactly one backend at a time. Registering a
//! backend's tool list only ever touches that backend's own entries, except
//! when two backends generate the same name: the lower [`BackendId`] keeps it
//! and the other side is excluded, never merged. The outcome does not depend
//! on which backend registered first.

use std::collections::{HashMap, HashSet};

use secretary_shared::BackendId;
use tokio::sync::RwLock;

use super::types::Tool;

/// Separator between the three qualified-name components
pub const SEPARATOR: char = '.';

const REPLACEMENT: char = '_';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NamespaceError {
    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error("Backend {0} has no registered secretary/task names")]
    UnknownBackend(BackendId),
}

/// One qualified-name mapping
#[derive(Debug, Clone)]
pub struct ToolEntry {
    pub backend_id: BackendId,
    pub local_name: String,
    pub secretary_name: String,
    /// Tool descriptor as exposed upstream (qualified name, tagged description)
    pub tool: Tool,
}

/// A tool left out of the namespace because its qualified name was taken
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedTool {
    pub local_name: String,
    pub qualified_name: String,
    pub owner: BackendId,
}

/// Outcome of registering one backend's tool list
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub registered: Vec<String>,
    pub excluded: Vec<ExcludedTool>,
    /// Names taken over from a higher-ordered backend; `owner` is the loser
    pub displaced: Vec<ExcludedTool>,
}

#[derive(Debug, Clone)]
struct Names {
    secretary: String,
    task: String,
}

#[derive(Default)]
struct NamespaceState {
    names: HashMap<BackendId, Names>,
    entries: HashMap<String, ToolEntry>,
    by_backend: HashMap<BackendId, Vec<String>>,
}

/// Bidirectional qualified-name mapping shared by one registry
#[derive(Default)]
pub struct ToolNamespace {
    state: RwLock<NamespaceState>,
}

impl ToolNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic qualified name for a backend-local tool
    pub fn qualify(secretary_name: &str, task_name: &str, local_name: &str) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            sanitize(secretary_name),
            sanitize(task_name),
            sanitize(local_name),
            sep = SEPARATOR
        )
    }

    /// Record the display names used to qualify a backend's tools
    pub async fn register_names(&self, backend_id: &BackendId, secretary: &str, task: &str) {
        let mut state = self.state.write().await;
        state.names.insert(
            backend_id.clone(),
            Names {
                secretary: secretary.to_string(),
                task: task.to_string(),
            },
        );
    }

    /// Replace the mappings owned by `backend_id` with `tools`.
    ///
    /// Runs under one write section, so concurrent lookups see either the old
    /// or the new mapping set, never a mix.
    pub async fn register_tools(
        &self,
        backend_id: &BackendId,
        tools: &[Tool],
    ) -> Result<Registration, NamespaceError> {
        let mut state = self.state.write().await;
        let names = state
            .names
            .get(backend_id)
            .cloned()
            .ok_or_else(|| NamespaceError::UnknownBackend(backend_id.clone()))?;

        let mut report = Registration::default();
        let mut fresh: Vec<(String, ToolEntry)> = Vec::with_capacity(tools.len());
        let mut seen = HashSet::new();

        for tool in tools {
            let qualified = Self::qualify(&names.secretary, &names.task, &tool.name);

            if !seen.insert(qualified.clone()) {
                // Same backend produced the name twice (e.g. `a.b` and `a_b`)
                report.excluded.push(ExcludedTool {
                    local_name: tool.name.clone(),
                    qualified_name: qualified,
                    owner: backend_id.clone(),
                });
                continue;
            }

            let rival = state
                .entries
                .get(&qualified)
                .filter(|existing| existing.backend_id != *backend_id)
                .map(|existing| (existing.backend_id.clone(), existing.local_name.clone()));
            if let Some((owner, owner_local)) = rival {
                if owner < *backend_id {
                    report.excluded.push(ExcludedTool {
                        local_name: tool.name.clone(),
                        qualified_name: qualified,
                        owner,
                    });
                    continue;
                }
                // Lower id wins: take the name over from the current owner
                state.entries.remove(&qualified);
                if let Some(names) = state.by_backend.get_mut(&owner) {
                    names.retain(|name| *name != qualified);
                }
                report.displaced.push(ExcludedTool {
                    local_name: owner_local,
                    qualified_name: qualified.clone(),
                    owner,
                });
            }

            let description = match &tool.description {
                Some(desc) => format!("[{}/{}] {}", names.secretary, names.task, desc),
                None => format!("[{}/{}]", names.secretary, names.task),
            };
            let entry = ToolEntry {
                backend_id: backend_id.clone(),
                local_name: tool.name.clone(),
                secretary_name: names.secretary.clone(),
                tool: Tool {
                    name: qualified.clone(),
                    description: Some(description),
                    input_schema: tool.input_schema.clone(),
                },
            };
            fresh.push((qualified, entry));
        }

        // Diff: drop this backend's names that disappeared
        let keep: HashSet<&String> = fresh.iter().map(|(name, _)| name).collect();
        let previous = state.by_backend.remove(backend_id).unwrap_or_default();
        for name in previous.iter().filter(|name| !keep.contains(name)) {
            state.entries.remove(name);
        }

        let mut owned = Vec::with_capacity(fresh.len());
        for (name, entry) in fresh {
            owned.push(name.clone());
            state.entries.insert(name, entry);
        }
        report.registered = owned.clone();
        state.by_backend.insert(backend_id.clone(), owned);

        for excluded in &report.excluded {
            tracing::warn!(
                backend = %backend_id,
                tool = %excluded.local_name,
                qualified = %excluded.qualified_name,
                owner = %excluded.owner,
                "Tool name collision - tool excluded from routing"
            );
        }
        for displaced in &report.displaced {
            tracing::warn!(
                backend = %displaced.owner,
                tool = %displaced.local_name,
                qualified = %displaced.qualified_name,
                owner = %backend_id,
                "Tool name collision - tool excluded from routing"
            );
        }

        Ok(report)
    }

    /// Resolve a qualified name to its backend and local tool name
    pub async fn resolve(&self, qualified: &str) -> Result<(BackendId, String), NamespaceError> {
        let state = self.state.read().await;
        state
            .entries
            .get(qualified)
            .map(|entry| (entry.backend_id.clone(), entry.local_name.clone()))
            .ok_or_else(|| NamespaceError::NotFound(qualified.to_string()))
    }

    /// Secretary display name owning a qualified tool, if mapped
    pub async fn secretary_of(&self, qualified: &str) -> Option<String> {
        let state = self.state.read().await;
        state
            .entries
            .get(qualified)
            .map(|entry| entry.secretary_name.clone())
    }

    /// Drop every mapping owned by a backend
    pub async fn remove_backend(&self, backend_id: &BackendId) -> usize {
        let mut state = self.state.write().await;
        let owned = state.by_backend.remove(backend_id).unwrap_or_default();
        for name in &owned {
            state.entries.remove(name);
        }
        owned.len()
    }

    /// Forget the display names of a backend taken offline
    pub async fn forget_names(&self, backend_id: &BackendId) {
        let mut state = self.state.write().await;
        state.names.remove(backend_id);
    }

    /// Qualified tool descriptors whose entry passes `filter`, sorted by name
    pub async fn tools<F>(&self, filter: F) -> Vec<Tool>
    where
        F: Fn(&ToolEntry) -> bool,
    {
        let state = self.state.read().await;
        let mut tools: Vec<Tool> = state
            .entries
            .values()
            .filter(|entry| filter(entry))
            .map(|entry| entry.tool.clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.entries.clear();
        state.by_backend.clear();
    }
}

fn sanitize(component: &str) -> String {
    component.replace(SEPARATOR, &REPLACEMENT.to_string())
}
