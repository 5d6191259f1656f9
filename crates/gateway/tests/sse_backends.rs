//! Backends reached over the HTTP+SSE transport
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{call_tool, echo_task, result_text, spawn_mock_sse_server, sse_task};
use secretary_gateway::mcp::{BackendConnection, BackendRegistry, ConnectionState};
use secretary_gateway::proxy::dispatch::McpDispatcher;
use secretary_gateway::CallerScope;

const S1: (&str, &str) = ("sec-1", "S1");

#[tokio::test]
async fn test_sse_backend_lists_every_page_and_calls_tools() {
    let url = spawn_mock_sse_server(None).await;
    let registry = Arc::new(BackendRegistry::new());

    registry
        .bring_online(&sse_task(S1, ("t1", "Remote"), url, None))
        .await
        .unwrap();

    let names: Vec<String> = registry
        .list_tools(&CallerScope::unrestricted())
        .await
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, vec!["S1.Remote.echo", "S1.Remote.reverse"]);

    let dispatcher = McpDispatcher::new(Arc::clone(&registry));
    let echoed = call_tool(&dispatcher, "S1.Remote.echo", "over sse").await;
    assert_eq!(result_text(&echoed).as_deref(), Some("over sse"));
    let reversed = call_tool(&dispatcher, "S1.Remote.reverse", "abc").await;
    assert_eq!(result_text(&reversed).as_deref(), Some("cba"));

    registry.shutdown_all(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_bearer_token_is_sent() {
    let url = spawn_mock_sse_server(Some("s3cret")).await;
    let task = sse_task(S1, ("t1", "Remote"), url, Some("s3cret"));

    let connection = BackendConnection::from_task(&task).unwrap();
    connection.connect().await.unwrap();
    connection.handshake().await.unwrap();
    assert_eq!(connection.state().await, ConnectionState::Ready);
    assert_eq!(
        connection.server_info().await.map(|info| info.name).as_deref(),
        Some("mock-sse")
    );
    assert!(connection.health_check().await);

    connection.close(Duration::from_secs(1)).await;
    assert_eq!(connection.state().await, ConnectionState::Closed);
}

#[tokio::test]
async fn test_wrong_bearer_token_fails_connect() {
    let url = spawn_mock_sse_server(Some("s3cret")).await;
    let task = sse_task(S1, ("t1", "Remote"), url, Some("guess"));

    let connection = BackendConnection::from_task(&task).unwrap();
    assert!(connection.connect().await.is_err());
    assert_eq!(connection.state().await, ConnectionState::Failed);
}

#[tokio::test]
async fn test_mixed_transports_share_one_namespace() {
    let url = spawn_mock_sse_server(None).await;
    let registry = Arc::new(BackendRegistry::new());

    let report = registry
        .bring_all_online(&[
            sse_task(S1, ("t1", "Remote"), url, None),
            echo_task(S1, ("t2", "Local"), &[]),
            // Nothing listens here
            sse_task(S1, ("t3", "Gone"), "http://127.0.0.1:9/sse".to_string(), None),
        ])
        .await;
    assert_eq!(report.online.len(), 2);
    assert_eq!(report.failed.len(), 1);

    let dispatcher = McpDispatcher::new(Arc::clone(&registry));
    let remote = call_tool(&dispatcher, "S1.Remote.echo", "r").await;
    let local = call_tool(&dispatcher, "S1.Local.echo", "l").await;
    assert_eq!(result_text(&remote).as_deref(), Some("r"));
    assert_eq!(result_text(&local).as_deref(), Some("l"));

    registry.shutdown_all(Duration::from_secs(2)).await;
}
