//! Server-sent events transport.
//!
//! Outbound envelopes are pushed as `message` events onto a stream held open
//! by the peer. Inbound envelopes arrive as separate HTTP POSTs addressed to
//! the session announced in the initial `endpoint` event.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use axum::{http::Method, response::sse::Event};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{CloseHandler, ErrorHandler, MessageHandler, Transport, TransportHooks};
use crate::errors::TransportError;
use crate::mcp::rpc::Message;

pub struct SseServerTransport {
    hooks: TransportHooks,
    session_id: String,
    endpoint: String,
    sink: Mutex<Option<mpsc::Sender<Event>>>,
    max_body_bytes: usize,
}

impl SseServerTransport {
    /// Binds a new session to `sink`. Fails when nothing is listening on the
    /// other end of the sink, since events could never be flushed.
    pub fn new(
        endpoint: impl Into<String>,
        sink: mpsc::Sender<Event>,
        max_body_bytes: usize,
    ) -> Result<Self, TransportError> {
        if sink.is_closed() {
            return Err(TransportError::StreamingUnsupported);
        }

        Ok(Self {
            hooks: TransportHooks::new(),
            session_id: Uuid::new_v4().to_string(),
            endpoint: endpoint.into(),
            sink: Mutex::new(Some(sink)),
            max_body_bytes,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// URL the peer must POST its envelopes to.
    pub fn message_url(&self) -> String {
        format!("{}?session={}", self.endpoint, self.session_id)
    }

    fn sink(&self) -> MutexGuard<'_, Option<mpsc::Sender<Event>>> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn push(&self, event: Event) -> Result<(), TransportError> {
        let sender = self.sink().clone().ok_or(TransportError::Closed)?;
        if sender.send(event).await.is_err() {
            debug!(session = %self.session_id, "event stream receiver gone");
            self.shutdown();
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Validates and dispatches one envelope POSTed by the peer.
    pub async fn handle_post_message(
        &self,
        method: &Method,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<(), TransportError> {
        self.hooks.ensure_open()?;

        if method != Method::POST {
            return Err(TransportError::MethodNotAllowed(method.to_string()));
        }

        let is_json = content_type
            .and_then(|value| value.split(';').next())
            .is_some_and(|essence| essence.trim().eq_ignore_ascii_case("application/json"));
        if !is_json {
            return Err(TransportError::UnsupportedMediaType(
                content_type.unwrap_or("<none>").to_string(),
            ));
        }

        if body.len() > self.max_body_bytes {
            return Err(TransportError::PayloadTooLarge {
                size: body.len(),
                limit: self.max_body_bytes,
            });
        }

        let message = match Message::from_slice(body) {
            Ok(message) => message,
            Err(err) => {
                self.hooks.report_error(TransportError::Decode(err.clone()));
                return Err(TransportError::Decode(err));
            }
        };
        self.hooks.dispatch(message)
    }

    /// Closes the session without awaiting; used when the stream is dropped.
    pub fn shutdown(&self) {
        if self.hooks.mark_closed() {
            self.sink().take();
            self.hooks.fire_close();
        }
    }
}

#[async_trait]
impl Transport for SseServerTransport {
    async fn start(&self) -> Result<(), TransportError> {
        self.hooks.mark_started()?;
        let event = Event::default().event("endpoint").data(self.message_url());
        self.push(event).await
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.hooks.ensure_open()?;
        let data = serde_json::to_string(&message)?;
        self.push(Event::default().event("message").data(data)).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown();
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
