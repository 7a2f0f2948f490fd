//! Stateless HTTP request/response transports.
//!
//! The server variant answers each POST body synchronously within the HTTP
//! handler. The client variant hands each outbound envelope to a delivery
//! function and dispatches whatever envelope comes back.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};

use super::{
    rendezvous::Rendezvous, CloseHandler, ErrorHandler, LoopbackTransport, MessageHandler,
    Transport, TransportHooks,
};
use crate::errors::TransportError;
use crate::mcp::rpc::Message;

pub type DeliveryFuture = BoxFuture<'static, Result<Vec<u8>, TransportError>>;

/// Carries one serialized envelope to the peer and yields the raw reply body
/// (empty when the peer has nothing to answer).
pub type DeliveryFn = Arc<dyn Fn(Vec<u8>) -> DeliveryFuture + Send + Sync>;

pub struct HttpServerTransport {
    hooks: TransportHooks,
    rendezvous: Rendezvous,
}

impl HttpServerTransport {
    pub fn new(reply_timeout: Duration) -> Self {
        Self {
            hooks: TransportHooks::new(),
            rendezvous: Rendezvous::new(Some(reply_timeout)),
        }
    }

    /// Processes one POSTed envelope and returns the reply to write back.
    pub async fn handle_message(&self, body: &[u8]) -> Result<Option<Message>, TransportError> {
        self.rendezvous.exchange(&self.hooks, body).await
    }

    /// Number of POSTed requests currently waiting for a reply.
    pub fn waiting(&self) -> usize {
        self.rendezvous.pending()
    }
}

#[async_trait]
impl Transport for HttpServerTransport {
    async fn start(&self) -> Result<(), TransportError> {
        self.hooks.mark_started()
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.hooks.ensure_open()?;
        self.rendezvous.deliver(message)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.hooks.mark_closed() {
            self.rendezvous.fail_all();
            self.hooks.fire_close();
        }
        Ok(())
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        self.hooks.set_message_handler(handler);
    }

    fn set_error_handler(&self, handler: ErrorHandler) {
        self.hooks.set_error_handler(handler);
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        self.hooks.set_close_handler(handler);
    }
}

pub struct HttpClientTransport {
    hooks: TransportHooks,
    deliver: DeliveryFn,
}

impl HttpClientTransport {
    pub fn new(deliver: DeliveryFn) -> Self {
        Self {
            hooks: TransportHooks::new(),
            deliver,
        }
    }

    /// Delivers envelopes as JSON POST requests to `url`.
    pub fn with_endpoint(url: impl Into<String>) -> Self {
        let client = reqwest::Client::new();
        let url: Arc<str> = Arc::from(url.into());

        Self::new(Arc::new(move |body: Vec<u8>| {
            let client = client.clone();
            let url = url.clone();
            async move {
                let response = client
                    .post(url.as_ref())
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body)
                    .send()
                    .await
                    .map_err(|err| TransportError::Delivery(err.to_string()))?;

                let status = response.status();
                if !status.is_success() {
                    return Err(TransportError::Delivery(format!(
                        "peer answered with HTTP {status}"
                    )));
                }

                let bytes = response
                    .bytes()
                    .await
                    .map_err(|err| TransportError::Delivery(err.to_string()))?;
                Ok::<_, TransportError>(bytes.to_vec())
            }
            .boxed()
        }))
    }

    /// Proxies envelopes into a loopback transport living in this process.
    pub fn in_process(target: Arc<LoopbackTransport>) -> Self {
        Self::new(Arc::new(move |body: Vec<u8>| {
            let target = target.clone();
            async move {
                let reply = match target.handle_message(&body).await? {
                    Some(reply) => reply.to_vec()?,
                    None => Vec::new(),
                };
                Ok::<_, TransportError>(reply)
            }
            .boxed()
        }))
    }
}

#[async_trait]
impl Transport for HttpClientTransport {
    async fn start(&self) -> Result<(), TransportError> {
        self.hooks.mark_started()
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.hooks.ensure_open()?;

        let body = message.to_vec()?;
        let reply = (self.deliver)(body).await?;
        if reply.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }

        let reply = match Message::from_slice(&reply) {
            Ok(reply) => reply,
            Err(err) => {
                let err = TransportError::Decode(err);
                let description = err.to_string();
                self.hooks.report_error(err);
                return Err(TransportError::Delivery(description));
            }
        };
        self.hooks.dispatch(reply)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.hooks.mark_closed() {
            self.hooks.fire_close();
        }
        Ok(())
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        self.hooks.set_message_handler(handler);
    }

    fn set_error_handler(&self, handler: ErrorHandler) {
        self.hooks.set_error_handler(handler);
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        self.hooks.set_close_handler(handler);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::mcp::rpc::RequestId;

    fn canned(reply: &'static str) -> DeliveryFn {
        Arc::new(move |_: Vec<u8>| {
            async move { Ok::<_, TransportError>(reply.as_bytes().to_vec()) }.boxed()
        })
    }

    fn recording(transport: &HttpClientTransport) -> Arc<Mutex<Vec<Message>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        transport.set_message_handler(Arc::new(move |message: Message| {
            sink.lock().expect("lock").push(message);
        }));
        seen
    }

    #[tokio::test]
    async fn client_dispatches_classified_reply() {
        let transport =
            HttpClientTransport::new(canned(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#));
        let seen = recording(&transport);
        transport.start().await.expect("start");

        transport
            .send(Message::request(RequestId::Number(1), "x", None))
            .await
            .expect("send");

        let seen = seen.lock().expect("lock");
        assert_eq!(
            seen.as_slice(),
            &[Message::response(RequestId::Number(1), json!({"ok": true}))]
        );
    }

    #[tokio::test]
    async fn client_ignores_empty_reply_body() {
        let transport = HttpClientTransport::new(canned(""));
        let seen = recording(&transport);
        transport.start().await.expect("start");

        transport
            .send(Message::notification("notifications/initialized", None))
            .await
            .expect("send");
        assert!(seen.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn client_reports_undecodable_reply() {
        let transport = HttpClientTransport::new(canned("not json"));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        transport.set_error_handler(Arc::new(move |err: TransportError| {
            sink.lock().expect("lock").push(err.to_string());
        }));
        transport.set_message_handler(Arc::new(|_| {}));
        transport.start().await.expect("start");

        let err = transport
            .send(Message::request(RequestId::Number(1), "x", None))
            .await
            .expect_err("undecodable");
        assert!(matches!(err, TransportError::Delivery(_)));
        assert_eq!(errors.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn closed_client_refuses_to_send() {
        let transport = HttpClientTransport::new(canned(""));
        transport.start().await.expect("start");
        transport.close().await.expect("close");

        let err = transport
            .send(Message::notification("x", None))
            .await
            .expect_err("closed");
        assert!(matches!(err, TransportError::Closed));
    }
}
