//! MCP (Model Context Protocol) backend side
//!
//! Connections to remote tasks, the qualified tool namespace built from
//! their tool lists, and the registry that owns both.

pub mod backend;
pub mod health;
pub mod namespace;
pub mod registry;
pub mod types;

pub use backend::{BackendConnection, BackendError, BackendStatus, ConnectionState};
pub use namespace::{NamespaceError, ToolNamespace};
pub use registry::{BackendRegistry, BringOnline, BulkReport, HealthSnapshot};
