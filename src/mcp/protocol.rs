//! Bidirectional JSON-RPC engine
//!
//! Owns request id allocation, the pending-request and canceller tables and
//! the handler registries of one connection. All shared tables sit behind a
//! single lock that is never held across handler execution, transport I/O or
//! user callbacks.

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::Duration,
};

use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::context::{CancellationToken, RequestContext, PROGRESS_METHOD};
use super::rpc::{Message, Request, RequestId};
use crate::errors::{ProtocolError, TransportError};
use crate::transport::Transport;

pub const CANCELLED_METHOD: &str = "notifications/cancelled";
pub const INITIALIZED_METHOD: &str = "notifications/initialized";
pub const PROGRESS_ALIAS_METHOD: &str = "notifications/progress";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// One `{progress, total}` update routed to the waiter of a request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub progress_token: Value,
    pub progress: f64,
    #[serde(default)]
    pub total: Option<f64>,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

type RequestHandlerFn = Arc<
    dyn Fn(RequestContext, Option<Value>) -> BoxFuture<'static, Result<Value, ProtocolError>>
        + Send
        + Sync,
>;
type NotificationHandlerFn =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<(), ProtocolError>> + Send + Sync>;
type FallbackNotificationFn = Arc<
    dyn Fn(String, Option<Value>) -> BoxFuture<'static, Result<(), ProtocolError>> + Send + Sync,
>;

/// Notification routes. Built-in routes run inline on the dispatch path so a
/// progress update is never overtaken by the reply that follows it.
#[derive(Clone)]
enum NotificationRoute {
    Inline(fn(&Protocol, Option<Value>)),
    Task(NotificationHandlerFn),
}

#[derive(Clone)]
pub struct ProtocolOptions {
    pub request_timeout: Duration,
    on_close: Option<Arc<dyn Fn() + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(&ProtocolError) + Send + Sync>>,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            on_close: None,
            on_error: None,
        }
    }
}

impl ProtocolOptions {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Invoked once, after the connection has been torn down.
    pub fn on_close(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(callback));
        self
    }

    /// Invoked for out-of-band transport faults.
    pub fn on_error(mut self, callback: impl Fn(&ProtocolError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

#[derive(Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
    pub on_progress: Option<ProgressCallback>,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_progress(mut self, callback: impl Fn(ProgressUpdate) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }
}

struct PendingRequest {
    slot: oneshot::Sender<Result<Value, ProtocolError>>,
    progress: Option<ProgressCallback>,
}

struct State {
    next_id: i64,
    pending: HashMap<RequestId, PendingRequest>,
    cancellers: HashMap<RequestId, CancellationToken>,
    request_handlers: HashMap<String, RequestHandlerFn>,
    notification_handlers: HashMap<String, NotificationRoute>,
    fallback_request: Option<RequestHandlerFn>,
    fallback_notification: Option<FallbackNotificationFn>,
}

struct Inner {
    state: RwLock<State>,
    transport: OnceLock<Arc<dyn Transport>>,
    options: ProtocolOptions,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

/// Handle to one protocol engine. Clones share the same connection.
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<Inner>,
}

/// Removes a pending entry when the waiting caller goes away, whichever way
/// the wait ended.
struct PendingGuard<'a> {
    protocol: &'a Protocol,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.protocol.state_mut().pending.remove(&self.id);
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::new(ProtocolOptions::default())
    }
}

impl Protocol {
    pub fn new(options: ProtocolOptions) -> Self {
        let mut notification_handlers = HashMap::new();
        notification_handlers.insert(
            CANCELLED_METHOD.to_string(),
            NotificationRoute::Inline(Self::on_cancelled),
        );
        notification_handlers.insert(
            PROGRESS_METHOD.to_string(),
            NotificationRoute::Inline(Self::on_progress),
        );
        notification_handlers.insert(
            PROGRESS_ALIAS_METHOD.to_string(),
            NotificationRoute::Inline(Self::on_progress),
        );
        notification_handlers.insert(
            INITIALIZED_METHOD.to_string(),
            NotificationRoute::Inline(|_, _| {}),
        );

        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State {
                    next_id: 1,
                    pending: HashMap::new(),
                    cancellers: HashMap::new(),
                    request_handlers: HashMap::new(),
                    notification_handlers,
                    fallback_request: None,
                    fallback_notification: None,
                }),
                transport: OnceLock::new(),
                options,
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn state(&self) -> RwLockReadGuard<'_, State> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, State> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches the engine to `transport` and starts it. An engine is bound
    /// to exactly one transport for its whole life.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        if self.inner.transport.set(transport.clone()).is_err() {
            return Err(ProtocolError::AlreadyConnected);
        }

        let engine = Arc::downgrade(&self.inner);
        transport.set_message_handler(Arc::new(move |message: Message| {
            if let Some(inner) = engine.upgrade() {
                Protocol { inner }.dispatch(message);
            }
        }));

        let engine = Arc::downgrade(&self.inner);
        transport.set_close_handler(Arc::new(move || {
            if let Some(inner) = engine.upgrade() {
                Protocol { inner }.handle_close();
            }
        }));

        let engine = Arc::downgrade(&self.inner);
        transport.set_error_handler(Arc::new(move |err: TransportError| {
            if let Some(inner) = engine.upgrade() {
                Protocol { inner }.handle_error(ProtocolError::Transport(err));
            }
        }));

        transport.start().await?;
        Ok(())
    }

    /// Sends a request and waits for its outcome, the caller's cancellation
    /// or the timeout, whichever comes first.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, ProtocolError> {
        let (slot, outcome) = oneshot::channel();
        let id = {
            let mut state = self.state_mut();
            if self.is_closed() {
                return Err(ProtocolError::ConnectionClosed);
            }
            let id = RequestId::Number(state.next_id);
            state.next_id += 1;
            state.pending.insert(
                id.clone(),
                PendingRequest {
                    slot,
                    progress: options.on_progress.clone(),
                },
            );
            id
        };
        let _guard = PendingGuard {
            protocol: self,
            id: id.clone(),
        };

        let params = match options.on_progress {
            Some(_) => Some(attach_progress_token(params, &id)),
            None => params,
        };
        let timeout = options.timeout.unwrap_or(self.inner.options.request_timeout);
        let cancellation = options.cancellation.unwrap_or_default();

        let exchange = async {
            let send = self.send(Message::request(id.clone(), method, params));
            tokio::pin!(send);
            let mut outcome = outcome;
            tokio::select! {
                biased;
                reply = &mut outcome => reply,
                sent = &mut send => {
                    sent?;
                    (&mut outcome).await
                }
            }
            .unwrap_or(Err(ProtocolError::ConnectionClosed))
        };

        debug!(id = %id, method, "sending request");
        tokio::select! {
            result = exchange => result,
            _ = cancellation.cancelled() => {
                self.cancel_remote(&id, "request cancelled by caller").await;
                Err(ProtocolError::Cancelled { method: method.to_string() })
            }
            _ = tokio::time::sleep(timeout) => {
                self.cancel_remote(&id, "request timed out").await;
                Err(ProtocolError::Timeout { method: method.to_string(), timeout })
            }
        }
    }

    /// Sends a request and decodes its result into `R`.
    pub async fn call<P, R>(
        &self,
        method: &str,
        params: &P,
        options: RequestOptions,
    ) -> Result<R, ProtocolError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.request(method, Some(params), options).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Fire-and-forget. Failures are returned but leave no residual state.
    pub async fn notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), ProtocolError> {
        self.send(Message::notification(method, params)).await
    }

    async fn send(&self, message: Message) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let transport = self
            .inner
            .transport
            .get()
            .cloned()
            .ok_or(ProtocolError::NotConnected)?;
        match transport.send(message).await {
            Ok(()) => Ok(()),
            Err(TransportError::Closed) => Err(ProtocolError::ConnectionClosed),
            Err(err) => Err(err.into()),
        }
    }

    async fn cancel_remote(&self, id: &RequestId, reason: &str) {
        let params = json!({ "requestId": id, "reason": reason });
        if let Err(err) = self.notification(CANCELLED_METHOD, Some(params)).await {
            warn!(id = %id, error = %err, "failed to deliver cancellation notice");
        }
    }

    /// Registers a typed request handler. Absent params decode from `{}`.
    pub fn set_request_handler<P, R, F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(RequestContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ProtocolError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: RequestHandlerFn =
            Arc::new(move |ctx: RequestContext, params: Option<Value>| {
                let handler = handler.clone();
                async move {
                    let params: P = decode_params(params)?;
                    let result = handler(ctx, params).await?;
                    Ok(serde_json::to_value(result)?)
                }
                .boxed()
            });
        self.state_mut()
            .request_handlers
            .insert(method.into(), erased);
    }

    pub fn remove_request_handler(&self, method: &str) {
        self.state_mut().request_handlers.remove(method);
    }

    /// Registers a typed notification handler. Errors it returns are logged.
    pub fn set_notification_handler<P, F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProtocolError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: NotificationHandlerFn = Arc::new(move |params: Option<Value>| {
            let handler = handler.clone();
            async move { handler(decode_params(params)?).await }.boxed()
        });
        self.state_mut()
            .notification_handlers
            .insert(method.into(), NotificationRoute::Task(erased));
    }

    pub fn remove_notification_handler(&self, method: &str) {
        self.state_mut().notification_handlers.remove(method);
    }

    /// Handles requests for methods without a registered handler.
    pub fn set_fallback_request_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ProtocolError>> + Send + 'static,
    {
        let erased: RequestHandlerFn =
            Arc::new(move |ctx: RequestContext, params: Option<Value>| handler(ctx, params).boxed());
        self.state_mut().fallback_request = Some(erased);
    }

    /// Handles notifications for methods without a registered handler.
    pub fn set_fallback_notification_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProtocolError>> + Send + 'static,
    {
        let erased: FallbackNotificationFn =
            Arc::new(move |method: String, params: Option<Value>| handler(method, params).boxed());
        self.state_mut().fallback_notification = Some(erased);
    }

    /// Closes the transport. Teardown runs through the transport's close hook;
    /// it also runs directly when no transport was ever attached.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        let transport = self.inner.transport.get().cloned();
        let outcome = match transport {
            Some(transport) => transport.close().await.map_err(ProtocolError::from),
            None => Ok(()),
        };
        self.handle_close();
        outcome
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the connection has been torn down.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// Outbound requests still waiting for an outcome.
    pub fn pending_requests(&self) -> usize {
        self.state().pending.len()
    }

    /// Inbound requests whose handlers are still running.
    pub fn active_handlers(&self) -> usize {
        self.state().cancellers.len()
    }

    fn handle_close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (pending, cancellers) = {
            let mut state = self.state_mut();
            state.request_handlers.clear();
            state.notification_handlers.clear();
            state.fallback_request = None;
            state.fallback_notification = None;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.cancellers),
            )
        };

        debug!(
            pending = pending.len(),
            running = cancellers.len(),
            "tearing down connection"
        );
        for token in cancellers.into_values() {
            token.cancel();
        }
        for request in pending.into_values() {
            let _ = request.slot.send(Err(ProtocolError::ConnectionClosed));
        }

        self.inner.shutdown.cancel();
        if let Some(on_close) = &self.inner.options.on_close {
            on_close();
        }
    }

    fn handle_error(&self, err: ProtocolError) {
        warn!(error = %err, "transport reported an error");
        if let Some(on_error) = &self.inner.options.on_error {
            on_error(&err);
        }
    }

    fn dispatch(self, message: Message) {
        if self.is_closed() {
            debug!(kind = message.kind(), "dropping frame received after close");
            return;
        }

        match message {
            Message::Request(request) => {
                tokio::spawn(async move { self.handle_request(request).await });
            }
            Message::Notification(notification) => {
                self.handle_notification(notification.method, notification.params)
            }
            Message::Response(response) => self.resolve(Some(response.id), Ok(response.result)),
            Message::Error(error) => self.resolve(
                error.id,
                Err(ProtocolError::Rpc {
                    code: error.error.code,
                    message: error.error.message,
                    data: error.error.data,
                }),
            ),
        }
    }

    fn resolve(&self, id: Option<RequestId>, outcome: Result<Value, ProtocolError>) {
        let Some(id) = id else {
            warn!(outcome = ?outcome.err(), "peer sent an error without a request id");
            return;
        };

        let pending = self.state_mut().pending.remove(&id);
        match pending {
            Some(request) => {
                let _ = request.slot.send(outcome);
            }
            None => debug!(id = %id, "discarding reply for unknown or finished request"),
        }
    }

    async fn handle_request(self, request: Request) {
        let Request { id, method, params } = request;

        let handler = {
            let state = self.state();
            state
                .request_handlers
                .get(&method)
                .or(state.fallback_request.as_ref())
                .cloned()
        };
        let Some(handler) = handler else {
            let err = ProtocolError::MethodNotFound(method);
            self.reply(Message::error(Some(id), err.code(), err.to_string()))
                .await;
            return;
        };

        let token = CancellationToken::new();
        let duplicate = {
            let mut state = self.state_mut();
            let duplicate = state.cancellers.contains_key(&id);
            if !duplicate {
                state.cancellers.insert(id.clone(), token.clone());
            }
            duplicate
        };
        if duplicate {
            let err = ProtocolError::InvalidRequest(format!("request id {id} is already in flight"));
            self.reply(Message::error(Some(id), err.code(), err.to_string()))
                .await;
            return;
        }

        let progress_token = params
            .as_ref()
            .and_then(|params| params.get("_meta"))
            .and_then(|meta| meta.get("progressToken"))
            .cloned();
        let ctx = RequestContext::new(
            id.clone(),
            method.clone(),
            token.clone(),
            progress_token,
            self.clone(),
        );

        debug!(id = %id, method = %method, "handling request");
        let outcome = tokio::select! {
            biased;
            result = AssertUnwindSafe(handler(ctx, params)).catch_unwind() => Some(result),
            _ = token.cancelled() => None,
        };

        {
            let mut state = self.state_mut();
            if state
                .cancellers
                .get(&id)
                .is_some_and(|current| current.same_as(&token))
            {
                state.cancellers.remove(&id);
            }
        }

        let reply = match outcome {
            Some(Ok(Ok(result))) => Message::response(id, result),
            Some(Ok(Err(err))) => {
                Message::error_with_data(Some(id), err.code(), err.to_string(), err.data())
            }
            Some(Err(_panic)) => {
                let err = ProtocolError::internal(format!("handler for {method} panicked"));
                error!(id = %id, method = %method, "request handler panicked");
                Message::error(Some(id), err.code(), err.to_string())
            }
            None => {
                debug!(id = %id, method = %method, "request cancelled");
                let err = ProtocolError::Cancelled { method };
                Message::error(Some(id), err.code(), err.to_string())
            }
        };
        self.reply(reply).await;
    }

    async fn reply(&self, message: Message) {
        if let Err(err) = self.send(message).await {
            if self.is_closed() {
                debug!(error = %err, "reply dropped after close");
            } else if matches!(err, ProtocolError::Transport(TransportError::NoDeliverySlot(_))) {
                debug!(error = %err, "reply dropped, caller stopped waiting");
            } else {
                warn!(error = %err, "failed to send reply");
            }
        }
    }

    fn handle_notification(self, method: String, params: Option<Value>) {
        let (route, fallback) = {
            let state = self.state();
            (
                state.notification_handlers.get(&method).cloned(),
                state.fallback_notification.clone(),
            )
        };

        match (route, fallback) {
            (Some(NotificationRoute::Inline(handler)), _) => handler(&self, params),
            (Some(NotificationRoute::Task(handler)), _) => {
                tokio::spawn(async move {
                    if let Err(err) = handler(params).await {
                        warn!(method = %method, error = %err, "notification handler failed");
                    }
                });
            }
            (None, Some(fallback)) => {
                tokio::spawn(async move {
                    if let Err(err) = fallback(method.clone(), params).await {
                        warn!(method = %method, error = %err, "fallback notification handler failed");
                    }
                });
            }
            (None, None) => debug!(method = %method, "dropping notification without handler"),
        }
    }

    fn on_cancelled(&self, params: Option<Value>) {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct CancelledParams {
            request_id: RequestId,
            #[serde(default)]
            reason: Option<String>,
        }

        let params: CancelledParams = match decode_params(params) {
            Ok(params) => params,
            Err(err) => {
                debug!(error = %err, "ignoring malformed cancellation notice");
                return;
            }
        };

        let token = self.state().cancellers.get(&params.request_id).cloned();
        if let Some(token) = token {
            debug!(id = %params.request_id, reason = ?params.reason, "peer cancelled request");
            token.cancel();
        }
    }

    fn on_progress(&self, params: Option<Value>) {
        let update: ProgressUpdate = match decode_params(params) {
            Ok(update) => update,
            Err(err) => {
                debug!(error = %err, "ignoring malformed progress notification");
                return;
            }
        };
        let Ok(id) = serde_json::from_value::<RequestId>(update.progress_token.clone()) else {
            return;
        };

        let callback = self
            .state()
            .pending
            .get(&id)
            .and_then(|request| request.progress.clone());
        if let Some(callback) = callback {
            callback(update);
        }
    }
}

fn decode_params<P: DeserializeOwned>(params: Option<Value>) -> Result<P, ProtocolError> {
    let params = match params {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(params) => params,
    };
    serde_json::from_value(params)
        .map_err(|err| ProtocolError::invalid_params(format!("invalid params: {err}")))
}

/// Embeds `_meta.progressToken` so the peer can address progress updates.
fn attach_progress_token(params: Option<Value>, id: &RequestId) -> Value {
    let mut params = match params {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(params)) => params,
        Some(other) => return other,
    };
    let meta = params
        .entry("_meta")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(meta) = meta {
        meta.insert("progressToken".to_string(), Value::from(id.clone()));
    }
    Value::Object(params)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use futures::future::join_all;

    use super::*;
    use crate::mcp::rpc::{INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, REQUEST_CANCELLED};
    use crate::transport::testing::Duplex;

    #[derive(Deserialize)]
    struct Number {
        value: i64,
    }

    async fn connected_pair() -> (Protocol, Protocol) {
        let (client_end, server_end) = Duplex::pair();
        let client = Protocol::default();
        let server = Protocol::default();
        server.set_request_handler("double", |_ctx, params: Number| async move {
            Ok::<_, ProtocolError>(json!({ "value": params.value * 2 }))
        });
        server.set_request_handler("hang", |ctx: RequestContext, _: Value| async move {
            ctx.cancelled().await;
            Ok::<_, ProtocolError>(Value::Null)
        });
        client.connect(client_end).await.expect("client connect");
        server.connect(server_end).await.expect("server connect");
        (client, server)
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition reached");
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_to_their_own_replies() {
        let (client, _server) = connected_pair().await;

        let calls = (0..32).map(|value| {
            let client = client.clone();
            async move {
                client
                    .request("double", Some(json!({ "value": value })), RequestOptions::default())
                    .await
                    .map(|result| (value, result))
            }
        });

        for outcome in join_all(calls).await {
            let (value, result) = outcome.expect("reply");
            assert_eq!(result["value"], value * 2);
        }
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn timeout_removes_pending_entry_and_cancels_peer_handler() {
        let (client, server) = connected_pair().await;

        let err = client
            .request(
                "hang",
                None,
                RequestOptions::default().with_timeout(Duration::from_millis(30)),
            )
            .await
            .expect_err("timeout");

        assert!(matches!(err, ProtocolError::Timeout { .. }));
        assert_eq!(client.pending_requests(), 0);
        wait_until(|| server.active_handlers() == 0).await;
    }

    #[tokio::test]
    async fn caller_cancellation_unblocks_waiter() {
        let (client, server) = connected_pair().await;
        let token = CancellationToken::new();

        let call = {
            let client = client.clone();
            let token = token.clone();
            tokio::spawn(async move {
                client
                    .request("hang", None, RequestOptions::default().with_cancellation(token))
                    .await
            })
        };
        wait_until(|| server.active_handlers() == 1).await;

        token.cancel();
        let err = call.await.expect("join").expect_err("cancelled");
        assert!(matches!(err, ProtocolError::Cancelled { .. }));
        assert_eq!(client.pending_requests(), 0);
        wait_until(|| server.active_handlers() == 0).await;
    }

    #[tokio::test]
    async fn close_fails_every_pending_request_once() {
        let (client, server) = connected_pair().await;
        let closes = Arc::new(AtomicUsize::new(0));

        let calls: Vec<_> = (0..3)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move {
                    client.request("hang", None, RequestOptions::default()).await
                })
            })
            .collect();
        wait_until(|| client.pending_requests() == 3).await;
        wait_until(|| server.active_handlers() == 3).await;

        let counter = closes.clone();
        let observer = {
            let client = client.clone();
            tokio::spawn(async move {
                client.closed().await;
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };

        client.close().await.expect("close");
        client.close().await.expect("second close");

        for call in calls {
            let err = call.await.expect("join").expect_err("closed");
            assert!(matches!(err, ProtocolError::ConnectionClosed));
        }
        observer.await.expect("observer");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(client.pending_requests(), 0);

        let err = client
            .request("double", Some(json!({"value": 1})), RequestOptions::default())
            .await
            .expect_err("after close");
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn on_close_runs_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        let protocol = Protocol::new(ProtocolOptions::default().on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let (end, _peer) = Duplex::pair();
        protocol.connect(end.clone()).await.expect("connect");

        end.close().await.expect("transport close");
        protocol.close().await.expect("protocol close");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(protocol.is_closed());
    }

    #[tokio::test]
    async fn progress_reaches_the_waiting_caller_before_the_reply() {
        let (client, server) = connected_pair().await;
        server.set_request_handler("work", |ctx: RequestContext, _: Value| async move {
            for step in [1.0, 2.0, 3.0] {
                ctx.report_progress(step, Some(3.0)).await?;
            }
            Ok::<_, ProtocolError>(json!({ "done": true }))
        });

        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let result = client
            .request(
                "work",
                None,
                RequestOptions::default().with_progress(move |update: ProgressUpdate| {
                    sink.lock().expect("lock").push(update.progress);
                }),
            )
            .await
            .expect("reply");

        assert_eq!(result["done"], true);
        assert_eq!(*updates.lock().expect("lock"), vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn unknown_method_and_bad_params_become_error_frames() {
        let (client, _server) = connected_pair().await;

        let err = client
            .request("nope", None, RequestOptions::default())
            .await
            .expect_err("unknown");
        assert!(matches!(err, ProtocolError::Rpc { code, .. } if code == METHOD_NOT_FOUND));

        let err = client
            .request("double", Some(json!({"value": "x"})), RequestOptions::default())
            .await
            .expect_err("bad params");
        assert!(matches!(err, ProtocolError::Rpc { code, .. } if code == INVALID_PARAMS));
    }

    #[tokio::test]
    async fn fallback_handler_serves_unregistered_methods() {
        let (client, server) = connected_pair().await;
        server.set_fallback_request_handler(|ctx: RequestContext, _params: Option<Value>| async move {
            Ok::<_, ProtocolError>(json!({ "method": ctx.method }))
        });

        let result = client
            .request("anything/else", None, RequestOptions::default())
            .await
            .expect("fallback");
        assert_eq!(result["method"], "anything/else");
    }

    #[tokio::test]
    async fn notification_handlers_run_and_unknown_notifications_drop() {
        let (client, server) = connected_pair().await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        server.set_notification_handler("tick", move |_: Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ProtocolError>(())
            }
        });

        client.notification("tick", None).await.expect("tick");
        client.notification("unheard", None).await.expect("unheard");
        wait_until(|| seen.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn duplicate_inflight_id_is_rejected() {
        let (end, _) = Duplex::pair();
        let protocol = Protocol::default();
        protocol.set_request_handler("hang", |ctx: RequestContext, _: Value| async move {
            ctx.cancelled().await;
            Ok::<_, ProtocolError>(Value::Null)
        });
        protocol.connect(end.clone()).await.expect("connect");

        end.inject(Message::request(RequestId::Number(5), "hang", None));
        wait_until(|| protocol.active_handlers() == 1).await;
        end.inject(Message::request(RequestId::Number(5), "hang", None));

        wait_until(|| !end.sent().is_empty()).await;
        let sent = end.sent();
        assert!(matches!(
            &sent[0],
            Message::Error(error) if error.error.code == INVALID_REQUEST
                && error.id == Some(RequestId::Number(5))
        ));
        assert_eq!(protocol.active_handlers(), 1);

        end.inject(Message::notification(
            CANCELLED_METHOD,
            Some(json!({ "requestId": 5, "reason": "test" })),
        ));
        wait_until(|| protocol.active_handlers() == 0).await;
    }

    #[tokio::test]
    async fn cancelled_handler_answers_with_cancellation_error() {
        let (end, _) = Duplex::pair();
        let protocol = Protocol::default();
        protocol.set_request_handler("slow", |_ctx, _: Value| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, ProtocolError>(Value::Null)
        });
        protocol.connect(end.clone()).await.expect("connect");

        end.inject(Message::request(RequestId::Number(1), "slow", None));
        wait_until(|| protocol.active_handlers() == 1).await;
        end.inject(Message::notification(
            CANCELLED_METHOD,
            Some(json!({ "requestId": 1 })),
        ));

        wait_until(|| !end.sent().is_empty()).await;
        let sent = end.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            Message::Error(error) if error.error.code == REQUEST_CANCELLED
                && error.id == Some(RequestId::Number(1))
        ));
        assert_eq!(protocol.active_handlers(), 0);
    }

    #[tokio::test]
    async fn reply_for_unknown_id_is_discarded() {
        let end = Arc::new(Duplex::detached());
        let protocol = Protocol::default();
        protocol.connect(end.clone()).await.expect("connect");

        end.inject(Message::response(RequestId::Number(99), json!({})));
        end.inject(Message::error(Some(RequestId::from("x")), -32000, "late"));
        assert_eq!(protocol.pending_requests(), 0);
        assert!(!protocol.is_closed());
    }

    #[tokio::test]
    async fn panicking_handler_answers_with_internal_error() {
        let (client, server) = connected_pair().await;
        server.set_request_handler("boom", |_ctx, _: Value| async move {
            if true {
                panic!("kaboom");
            }
            Ok::<_, ProtocolError>(Value::Null)
        });

        let err = client
            .request("boom", None, RequestOptions::default())
            .await
            .expect_err("panic");
        assert!(matches!(err, ProtocolError::Rpc { ref message, .. } if message.contains("internal error")));
        assert_eq!(server.active_handlers(), 0);

        let result = client
            .request("double", Some(json!({"value": 2})), RequestOptions::default())
            .await
            .expect("still serving");
        assert_eq!(result["value"], 4);
    }

    #[tokio::test]
    async fn connect_twice_is_rejected() {
        let protocol = Protocol::default();
        protocol
            .connect(Arc::new(Duplex::detached()))
            .await
            .expect("connect");
        let err = protocol
            .connect(Arc::new(Duplex::detached()))
            .await
            .expect_err("second connect");
        assert!(matches!(err, ProtocolError::AlreadyConnected));
    }

    #[test]
    fn progress_token_is_embedded_in_meta() {
        let params = attach_progress_token(Some(json!({"a": 1})), &RequestId::Number(4));
        assert_eq!(params, json!({"a": 1, "_meta": {"progressToken": 4}}));

        let params = attach_progress_token(None, &RequestId::from("t"));
        assert_eq!(params, json!({"_meta": {"progressToken": "t"}}));
    }
}
