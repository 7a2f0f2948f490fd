//! In-process transport for a caller and callee sharing one process.

use std::time::Duration;

use async_trait::async_trait;

use super::{
    rendezvous::Rendezvous, CloseHandler, ErrorHandler, MessageHandler, Transport, TransportHooks,
};
use crate::errors::TransportError;
use crate::mcp::rpc::Message;

pub struct LoopbackTransport {
    hooks: TransportHooks,
    rendezvous: Rendezvous,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            hooks: TransportHooks::new(),
            rendezvous: Rendezvous::new(None),
        }
    }

    /// Bounds how long [`LoopbackTransport::handle_message`] waits for a reply.
    pub fn with_reply_timeout(timeout: Duration) -> Self {
        Self {
            hooks: TransportHooks::new(),
            rendezvous: Rendezvous::new(Some(timeout)),
        }
    }

    /// Simulates receipt of `raw` from the wire and returns the reply, if
    /// the frame is a request. The returned reply carries the id the caller
    /// used, not the internal correlation key.
    pub async fn handle_message(&self, raw: &[u8]) -> Result<Option<Message>, TransportError> {
        self.rendezvous.exchange(&self.hooks, raw).await
    }

    /// Number of requests currently waiting for a reply.
    pub fn waiting(&self) -> usize {
        self.rendezvous.pending()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
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
