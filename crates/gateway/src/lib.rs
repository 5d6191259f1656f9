//! Secretary Gateway
//!
//! Aggregates the tools of many remote MCP tasks (stdio subprocesses or SSE
//! servers), grouped under secretaries, into one MCP server. Tools are
//! exposed upstream as `{secretary}.{task}.{tool}` and every call is routed
//! to the task that provides it.

pub mod admin;
pub mod config;
pub mod error;
pub mod logging;
pub mod mcp;
pub mod proxy;
pub mod startup;
pub mod users;

pub use config::Config;
pub use error::{GatewayError, GatewayResult};
pub use proxy::{ProxyServer, SseProxyServer, StdioProxyServer};
pub use users::{CallerScope, UserSecretaryRegistry};
