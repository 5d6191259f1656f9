//! Common types used across the gateway
//!
//! Persisted records are stored as camelCase JSON.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Identity of one backend connection: the owning secretary plus the task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendId {
    pub secretary_id: String,
    pub task_id: String,
}

impl BackendId {
    pub fn new(secretary_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            secretary_id: secretary_id.into(),
            task_id: task_id.into(),
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.secretary_id, self.task_id)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Lifecycle status of a task record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    #[default]
    Active,
    Inactive,
    Error,
}

/// How a backend is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionType {
    Stdio,
    Sse,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Stdio => write!(f, "stdio"),
            ConnectionType::Sse => write!(f, "sse"),
        }
    }
}

/// How a stdio command is launched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpawnKind {
    /// Execute the command directly
    #[default]
    Direct,
    /// Run `command args...` through `sh -c`
    Shell,
}

/// Declared type of a customizable template parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParamType {
    #[default]
    String,
    Number,
    Boolean,
    Secret,
}

impl ParamType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String | ParamType::Secret => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
        }
    }
}

// =============================================================================
// Connection Profile
// =============================================================================

/// Stdio subprocess settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdioConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub spawn_kind: SpawnKind,
}

/// Streaming HTTP (SSE) settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseConfig {
    pub server_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

/// Runtime limits shared by both connection kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeneralConfig {
    pub connect_timeout_seconds: u64,
    pub timeout_seconds: u64,
    pub retry_count: u32,
    pub retry_delay_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_calls: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: 15,
            timeout_seconds: 30,
            retry_count: 3,
            retry_delay_seconds: 1,
            max_concurrent_calls: None,
            log_level: None,
        }
    }
}

/// How to reach one backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    pub connection_type: ConnectionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdio_config: Option<StdioConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse_config: Option<SseConfig>,
    #[serde(default)]
    pub general_config: GeneralConfig,
}

impl ConnectionProfile {
    pub fn stdio(config: StdioConfig) -> Self {
        Self {
            connection_type: ConnectionType::Stdio,
            stdio_config: Some(config),
            sse_config: None,
            general_config: GeneralConfig::default(),
        }
    }

    pub fn sse(config: SseConfig) -> Self {
        Self {
            connection_type: ConnectionType::Sse,
            stdio_config: None,
            sse_config: Some(config),
            general_config: GeneralConfig::default(),
        }
    }

    /// Check that the sub-config matching `connection_type` is present and usable
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.connection_type {
            ConnectionType::Stdio => {
                let stdio = self.stdio_config.as_ref().ok_or_else(|| {
                    ValidationError::Profile("stdio connection requires stdioConfig".to_string())
                })?;
                if stdio.command.trim().is_empty() {
                    return Err(ValidationError::Profile(
                        "stdio command must not be empty".to_string(),
                    ));
                }
            }
            ConnectionType::Sse => {
                let sse = self.sse_config.as_ref().ok_or_else(|| {
                    ValidationError::Profile("sse connection requires sseConfig".to_string())
                })?;
                if sse.server_url.trim().is_empty() {
                    return Err(ValidationError::Profile(
                        "sse serverUrl must not be empty".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Secretaries
// =============================================================================

/// A named owner grouping tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secretary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub task_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Secretary {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            active: true,
            task_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn info(&self) -> SecretaryInfo {
        SecretaryInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            active: self.active,
            task_count: self.task_ids.len(),
        }
    }
}

/// Summary row returned when listing secretaries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretaryInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub active: bool,
    pub task_count: usize,
}

// =============================================================================
// Templates and Tasks
// =============================================================================

/// A customizable template parameter declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigParam {
    pub name: String,
    #[serde(default)]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A reusable backend definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub connection_profile: ConnectionProfile,
    #[serde(default)]
    pub customizable_params: Vec<ConfigParam>,
    #[serde(default)]
    pub default_config: HashMap<String, Value>,
}

impl TaskTemplate {
    /// Build a task for `secretary` from this template plus user overrides.
    ///
    /// Resolution order is template defaults, then per-param defaults, then
    /// overrides. Required params must resolve to a non-null value and every
    /// declared param must match its declared type.
    pub fn instantiate(
        &self,
        task_id: impl Into<String>,
        task_name: impl Into<String>,
        secretary: &Secretary,
        overrides: HashMap<String, Value>,
    ) -> Result<RemoteTask, ValidationError> {
        self.connection_profile.validate()?;

        let mut config = self.default_config.clone();
        for param in &self.customizable_params {
            if let Some(default) = &param.default_value {
                config
                    .entry(param.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
        config.extend(overrides);

        for param in &self.customizable_params {
            match config.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    return Err(ValidationError::MissingParam(param.name.clone()));
                }
                Some(value) if !value.is_null() && !param.param_type.accepts(value) => {
                    return Err(ValidationError::ParamType {
                        name: param.name.clone(),
                        expected: param.param_type,
                    });
                }
                _ => {}
            }
        }

        let now = Utc::now();
        Ok(RemoteTask {
            id: task_id.into(),
            name: task_name.into(),
            secretary_id: secretary.id.clone(),
            secretary_name: secretary.name.clone(),
            template_id: self.id.clone(),
            status: TaskStatus::Active,
            connection_profile: self.connection_profile.clone(),
            config,
            customizable_params: self.customizable_params.clone(),
            created_at: now,
            updated_at: now,
        })
    }
}

/// One concrete backend instance owned by a secretary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTask {
    pub id: String,
    /// Display name used for tool qualification; falls back to `id` when empty
    #[serde(default)]
    pub name: String,
    pub secretary_id: String,
    pub secretary_name: String,
    #[serde(default)]
    pub template_id: String,
    #[serde(default)]
    pub status: TaskStatus,
    pub connection_profile: ConnectionProfile,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(default)]
    pub customizable_params: Vec<ConfigParam>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RemoteTask {
    pub fn backend_id(&self) -> BackendId {
        BackendId::new(&self.secretary_id, &self.id)
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active
    }

    /// Resolved config rendered as environment variables for a subprocess
    pub fn config_env(&self) -> HashMap<String, String> {
        self.config
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), rendered)
            })
            .collect()
    }
}
