use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::watch;

use super::protocol::Protocol;
use super::rpc::RequestId;
use crate::errors::ProtocolError;

pub const PROGRESS_METHOD: &str = "$/progress";

/// Cooperative cancellation signal shared between a request and its handler.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    state: Arc<watch::Sender<bool>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once [`CancellationToken::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    pub(crate) fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

/// Per-invocation context handed to request handlers.
#[derive(Clone)]
pub struct RequestContext {
    pub id: RequestId,
    pub method: String,
    pub cancellation: CancellationToken,
    pub progress_token: Option<Value>,
    protocol: Protocol,
}

impl RequestContext {
    pub(crate) fn new(
        id: RequestId,
        method: String,
        cancellation: CancellationToken,
        progress_token: Option<Value>,
        protocol: Protocol,
    ) -> Self {
        Self {
            id,
            method,
            cancellation,
            progress_token,
            protocol,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Reports progress to the requester. A no-op when the requester did not
    /// ask for progress updates.
    pub async fn report_progress(
        &self,
        progress: f64,
        total: Option<f64>,
    ) -> Result<(), ProtocolError> {
        let Some(token) = self.progress_token.clone() else {
            return Ok(());
        };

        let mut params = json!({ "progressToken": token, "progress": progress });
        if let Some(total) = total {
            params["total"] = json!(total);
        }
        self.protocol.notification(PROGRESS_METHOD, Some(params)).await
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn cancellation_wakes_waiters() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        assert!(!token.is_cancelled());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken")
            .expect("join");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_after_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already cancelled");
    }

    #[test]
    fn clones_share_identity() {
        let token = CancellationToken::new();
        assert!(token.same_as(&token.clone()));
        assert!(!token.same_as(&CancellationToken::new()));
    }
}
