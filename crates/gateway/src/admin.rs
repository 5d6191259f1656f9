//! Admin HTTP routes
//!
//! Health, registry status, backend reconnects and user to secretary
//! mappings. Served next to the SSE upstream routes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use secretary_shared::BackendId;
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::mcp::registry::{BackendRegistry, BringOnline, HealthSnapshot, RegistryStatus};
use crate::proxy::TaskList;
use crate::users::UserSecretaryRegistry;

#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<BackendRegistry>,
    pub users: Arc<UserSecretaryRegistry>,
    pub tasks: TaskList,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    #[serde(flatten)]
    pub snapshot: HealthSnapshot,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingResponse {
    pub user_id: String,
    pub secretary_name: String,
    pub changed: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectResponse {
    pub secretary_id: String,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_count: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterAllResponse {
    pub user_id: String,
    pub removed: usize,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route(
            "/api/backends/:secretary_id/:task_id/reconnect",
            post(reconnect),
        )
        .route("/api/users/mappings", get(mappings))
        .route(
            "/api/users/:user_id/secretaries/:secretary_name",
            delete(unregister).post(register),
        )
        .route("/api/users/:user_id/secretaries", delete(unregister_all))
        .with_state(state)
}

/// 200 when healthy, 503 otherwise; the body is returned either way
pub async fn health(State(state): State<AdminState>) -> (StatusCode, Json<HealthResponse>) {
    let snapshot = state.registry.health_snapshot().await;
    let (code, status) = if snapshot.healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            snapshot,
        }),
    )
}

pub async fn status(State(state): State<AdminState>) -> Json<RegistryStatus> {
    Json(state.registry.status().await)
}

/// Replace a task's connection with a fresh one
pub async fn reconnect(
    State(state): State<AdminState>,
    Path((secretary_id, task_id)): Path<(String, String)>,
) -> ApiResult<Json<ReconnectResponse>> {
    let id = BackendId::new(secretary_id, task_id);
    let task = state
        .tasks
        .read()
        .await
        .iter()
        .find(|task| task.backend_id() == id)
        .cloned()
        .ok_or(ApiError::NotFound)?;

    let tool_count = match state.registry.reconnect(&task).await {
        Ok(BringOnline::Online { tool_count }) => Some(tool_count),
        Ok(BringOnline::AlreadyOnline) => None,
        Err(e) => return Err(ApiError::BadGateway(e.to_string())),
    };
    tracing::info!(backend = %id, tool_count = ?tool_count, "Backend reconnected");

    Ok(Json(ReconnectResponse {
        secretary_id: id.secretary_id,
        task_id: id.task_id,
        tool_count,
    }))
}

pub async fn mappings(
    State(state): State<AdminState>,
) -> Json<BTreeMap<String, BTreeSet<String>>> {
    Json(state.users.mappings().await)
}

fn check_segment(kind: &str, value: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{} must not be empty", kind)));
    }
    Ok(())
}

pub async fn register(
    State(state): State<AdminState>,
    Path((user_id, secretary_name)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<MappingResponse>)> {
    check_segment("userId", &user_id)?;
    check_segment("secretaryName", &secretary_name)?;

    let changed = state.users.register(&user_id, &secretary_name).await;
    let code = if changed { StatusCode::CREATED } else { StatusCode::OK };
    Ok((
        code,
        Json(MappingResponse {
            user_id,
            secretary_name,
            changed,
        }),
    ))
}

pub async fn unregister(
    State(state): State<AdminState>,
    Path((user_id, secretary_name)): Path<(String, String)>,
) -> ApiResult<Json<MappingResponse>> {
    if !state.users.unregister(&user_id, &secretary_name).await {
        return Err(ApiError::NotFound);
    }
    Ok(Json(MappingResponse {
        user_id,
        secretary_name,
        changed: true,
    }))
}

pub async fn unregister_all(
    State(state): State<AdminState>,
    Path(user_id): Path<String>,
) -> Json<UnregisterAllResponse> {
    let removed = state.users.unregister_all(&user_id).await;
    Json(UnregisterAllResponse { user_id, removed })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::Utc;
    use secretary_shared::{ConnectionProfile, RemoteTask, StdioConfig, TaskStatus};
    use serde_json::Value;
    use tower::ServiceExt;

    fn app() -> (Router, AdminState) {
        let state = AdminState {
            registry: Arc::new(BackendRegistry::new()),
            users: Arc::new(UserSecretaryRegistry::new()),
            tasks: Default::default(),
        };
        (router(state.clone()), state)
    }

    fn unspawnable_task() -> RemoteTask {
        RemoteTask {
            id: "t1".to_string(),
            name: "T1".to_string(),
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
    async fn test_reconnect_unknown_task_is_404() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::post("/api/backends/sec-1/t1/reconnect")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_failed_reconnect_is_502_and_recorded() {
        let (app, state) = app();
        state.tasks.write().await.push(unspawnable_task());

        let response = app
            .oneshot(
                Request::post("/api/backends/sec-1/t1/reconnect")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(json_body(response).await["error"]["code"], "BACKEND_UNAVAILABLE");

        let status = state.registry.status().await;
        assert_eq!(status.failures.len(), 1);
        assert_eq!(status.failures[0].task_id, "t1");
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_unavailable_before_first_pass() {
        let (app, state) = app();
        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.registry.bring_all_online(&[]).await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["passCompleted"], true);
    }

    #[tokio::test]
    async fn test_register_and_list_mappings() {
        let (app, _) = app();
        let response = app
            .clone()
            .oneshot(
                Request::post("/api/users/u1/secretaries/S1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(Request::get("/api/users/mappings").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["u1"], serde_json::json!(["S1"]));
    }

    #[tokio::test]
    async fn test_unregister_missing_mapping_is_404() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::delete("/api/users/u1/secretaries/S1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_unregister_all_drops_user() {
        let (app, state) = app();
        state.users.register("u1", "S1").await;
        state.users.register("u1", "S2").await;

        let response = app
            .oneshot(
                Request::delete("/api/users/u1/secretaries")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["removed"], 2);
        assert!(state.users.mappings().await.is_empty());
    }
}
