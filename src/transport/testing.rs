//! In-memory transport used by engine and façade tests.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;

use super::{CloseHandler, ErrorHandler, MessageHandler, Transport, TransportHooks};
use crate::errors::TransportError;
use crate::mcp::rpc::Message;

/// Full-duplex link: whatever one end sends is dispatched to the other end's
/// message handler. Every sent frame is also recorded.
pub(crate) struct Duplex {
    hooks: TransportHooks,
    peer: OnceLock<Weak<Duplex>>,
    sent: Mutex<Vec<Message>>,
}

impl Duplex {
    pub(crate) fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self::detached());
        let b = Arc::new(Self::detached());
        let _ = a.peer.set(Arc::downgrade(&b));
        let _ = b.peer.set(Arc::downgrade(&a));
        (a, b)
    }

    /// An end without a peer; it only records what is sent.
    pub(crate) fn detached() -> Self {
        Self {
            hooks: TransportHooks::new(),
            peer: OnceLock::new(),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Feeds `message` to this end's handler as if the peer had sent it.
    pub(crate) fn inject(&self, message: Message) {
        self.hooks.dispatch(message).expect("dispatch");
    }

    pub(crate) fn sent(&self) -> Vec<Message> {
        self.sent.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Transport for Duplex {
    async fn start(&self) -> Result<(), TransportError> {
        self.hooks.mark_started()
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.hooks.ensure_open()?;
        self.sent.lock().expect("lock").push(message.clone());
        match self.peer.get().and_then(Weak::upgrade) {
            Some(peer) if !peer.hooks.is_closed() => peer.hooks.dispatch(message),
            Some(_) => Err(TransportError::Closed),
            None => Ok(()),
        }
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
