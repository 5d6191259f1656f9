//! Gateway configuration

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::proxy::SseServerConfig;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Gateway configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Storage
    pub storage_dir: PathBuf,

    // Upstream (SSE)
    pub bind_address: SocketAddr,
    pub sse_path: String,
    pub message_path: String,

    // Upstream (stdio)
    pub stdio_mode: bool,
    pub stdio_user_id: Option<String>,

    // Lifecycle
    pub shutdown_timeout: Duration,
    pub health_interval: Duration,

    // Logging
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_raw = env::var("GATEWAY_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_address = bind_raw
            .parse()
            .map_err(|_| ConfigError::Invalid("GATEWAY_BIND_ADDRESS", bind_raw.clone()))?;

        let sse_path = env::var("GATEWAY_SSE_PATH").unwrap_or_else(|_| "/sse".to_string());
        let message_path =
            env::var("GATEWAY_MESSAGE_PATH").unwrap_or_else(|_| "/mcp/message".to_string());
        if !sse_path.starts_with('/') {
            return Err(ConfigError::Invalid("GATEWAY_SSE_PATH", sse_path));
        }
        if !message_path.starts_with('/') {
            return Err(ConfigError::Invalid("GATEWAY_MESSAGE_PATH", message_path));
        }
        if sse_path == message_path {
            return Err(ConfigError::PathConflict(sse_path));
        }

        let log_format = match env::var("GATEWAY_LOG_FORMAT")
            .unwrap_or_else(|_| "pretty".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            storage_dir: env::var("GATEWAY_STORAGE_DIR")
                .unwrap_or_else(|_| "./data".to_string())
                .into(),

            bind_address,
            sse_path,
            message_path,

            stdio_mode: env::var("GATEWAY_STDIO_MODE")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            stdio_user_id: env::var("GATEWAY_STDIO_USER_ID")
                .ok()
                .filter(|id| !id.trim().is_empty()),

            shutdown_timeout: Duration::from_secs(
                env::var("GATEWAY_SHUTDOWN_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            ),
            health_interval: Duration::from_secs(
                env::var("GATEWAY_HEALTH_INTERVAL_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
            ),

            log_format,
        })
    }

    /// `--stdio` on the command line overrides the environment
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if args.into_iter().any(|arg| arg.as_ref() == "--stdio") {
            self.stdio_mode = true;
        }
        self
    }

    pub fn sse_server(&self) -> SseServerConfig {
        SseServerConfig {
            bind_address: self.bind_address,
            sse_path: self.sse_path.clone(),
            message_path: self.message_path.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
    #[error("SSE path and message path must differ (both {0})")]
    PathConflict(String),
}
