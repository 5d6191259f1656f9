//! Request/response correlation shared by both backend transports
//!
//! Each transport writes requests on its own channel and delivers every
//! reply it reads to [`PendingRequests::complete`]. Once the read side ends
//! the table is closed: waiting callers are released with an error and new
//! registrations are refused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{oneshot, Mutex};

use super::BackendError;
use crate::mcp::types::{JsonRpcError, JsonRpcId, JsonRpcRequest, JsonRpcResponse};

#[derive(Default)]
struct PendingInner {
    waiters: HashMap<i64, oneshot::Sender<JsonRpcResponse>>,
    closed: Option<String>,
}

pub(crate) struct PendingRequests {
    next_id: AtomicI64,
    inner: Mutex<PendingInner>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            inner: Mutex::new(PendingInner::default()),
        }
    }

    pub(crate) fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) async fn register(
        &self,
        id: i64,
    ) -> Result<oneshot::Receiver<JsonRpcResponse>, BackendError> {
        let mut inner = self.inner.lock().await;
        if let Some(reason) = &inner.closed {
            return Err(BackendError::Unavailable(reason.clone()));
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(id, tx);
        Ok(rx)
    }

    pub(crate) async fn cancel(&self, id: i64) {
        self.inner.lock().await.waiters.remove(&id);
    }

    /// Hand a reply to whoever is waiting on its id
    pub(crate) async fn complete(&self, response: JsonRpcResponse) {
        let id = match &response.id {
            Some(JsonRpcId::Number(id)) => *id,
            other => {
                tracing::debug!(id = ?other, "Dropping reply with unexpected id");
                return;
            }
        };

        let waiter = self.inner.lock().await.waiters.remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => tracing::debug!(id, "Dropping reply for unknown or cancelled request"),
        }
    }

    /// Release every waiter and refuse further requests
    pub(crate) async fn close(&self, reason: &str) {
        let mut inner = self.inner.lock().await;
        if inner.closed.is_none() {
            inner.closed = Some(reason.to_string());
        }
        inner.waiters.clear();
    }

    pub(crate) async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed.is_some()
    }
}

/// Wait for a registered reply, translating channel loss and timeouts
pub(crate) async fn await_reply(
    pending: &PendingRequests,
    id: i64,
    rx: oneshot::Receiver<JsonRpcResponse>,
    timeout: Duration,
) -> Result<JsonRpcResponse, BackendError> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(_)) => Err(BackendError::Unavailable(
            "connection closed while waiting for reply".to_string(),
        )),
        Err(_) => {
            pending.cancel(id).await;
            Err(BackendError::Timeout)
        }
    }
}

/// Answer a request the backend sent to us. Notifications get no reply.
pub(crate) fn answer_backend_request(label: &str, request: &JsonRpcRequest) -> Option<JsonRpcResponse> {
    if request.is_notification() {
        tracing::debug!(backend = %label, method = %request.method, "Backend notification");
        return None;
    }

    let response = match request.method.as_str() {
        "ping" => JsonRpcResponse::success(request.id.clone(), json!({})),
        other => {
            tracing::debug!(backend = %label, method = %other, "Rejecting backend-initiated request");
            JsonRpcResponse::error(request.id.clone(), JsonRpcError::method_not_found(other))
        }
    };
    Some(response)
}
