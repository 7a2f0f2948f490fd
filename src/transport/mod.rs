//! Transports moving raw JSON-RPC envelopes between peers
//!
//! A transport never interprets envelope content beyond decoding it; the
//! protocol engine installs its dispatch function as the message handler.

pub mod http;
pub mod loopback;
mod rendezvous;
pub mod sse;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, PoisonError, RwLock,
};

use async_trait::async_trait;
use tracing::warn;

use crate::errors::TransportError;
use crate::mcp::rpc::Message;

pub use http::{HttpClientTransport, HttpServerTransport};
pub use loopback::LoopbackTransport;
pub use sse::SseServerTransport;

pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(TransportError) + Send + Sync>;
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self) -> Result<(), TransportError>;

    /// Transmits one envelope; fails when there is no counterpart to deliver it to.
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Tears the transport down and fires the close handler at most once.
    async fn close(&self) -> Result<(), TransportError>;

    fn set_message_handler(&self, handler: MessageHandler);

    fn set_error_handler(&self, handler: ErrorHandler);

    fn set_close_handler(&self, handler: CloseHandler);
}

/// Callback slots and lifecycle guards shared by every transport.
#[derive(Default)]
pub struct TransportHooks {
    message: RwLock<Option<MessageHandler>>,
    error: RwLock<Option<ErrorHandler>>,
    close: RwLock<Option<CloseHandler>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl TransportHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_message_handler(&self, handler: MessageHandler) {
        *self.message.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn set_error_handler(&self, handler: ErrorHandler) {
        *self.error.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn set_close_handler(&self, handler: CloseHandler) {
        *self.close.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Hands an inbound envelope to the message handler. The handler is
    /// cloned out of its slot so no lock is held while it runs.
    pub fn dispatch(&self, message: Message) -> Result<(), TransportError> {
        let handler = self
            .message
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::NoMessageHandler)?;
        handler(message);
        Ok(())
    }

    pub fn report_error(&self, error: TransportError) {
        let handler = self
            .error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler(error),
            None => warn!(error = %error, "transport error without error handler"),
        }
    }

    pub fn mark_started(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }
        Ok(())
    }

    /// Fails unless the transport is started and not yet closed.
    pub fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Flips the closed guard. Returns `true` only for the first caller.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn fire_close(&self) {
        let handler = self
            .close
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn close_guard_trips_once() {
        let hooks = TransportHooks::new();
        assert!(hooks.mark_closed());
        assert!(!hooks.mark_closed());
        assert!(hooks.is_closed());
        assert!(matches!(hooks.mark_started(), Err(TransportError::Closed)));
    }

    #[test]
    fn start_guard_rejects_second_start() {
        let hooks = TransportHooks::new();
        assert!(matches!(hooks.ensure_open(), Err(TransportError::NotStarted)));
        hooks.mark_started().expect("first start");
        assert!(matches!(
            hooks.mark_started(),
            Err(TransportError::AlreadyStarted)
        ));
        hooks.ensure_open().expect("open");
    }

    #[test]
    fn dispatch_without_handler_fails() {
        let hooks = TransportHooks::new();
        let result = hooks.dispatch(Message::notification("x", None));
        assert!(matches!(result, Err(TransportError::NoMessageHandler)));

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        hooks.set_message_handler(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        hooks
            .dispatch(Message::notification("x", None))
            .expect("dispatch");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
