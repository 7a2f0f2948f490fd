use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::debug;

use super::TransportHooks;
use crate::errors::TransportError;
use crate::mcp::protocol::CANCELLED_METHOD;
use crate::mcp::rpc::{Message, Notification, RequestId};

/// Synchronous request/reply pairing for transports whose caller waits for
/// the reply inline (loopback and HTTP request/response).
///
/// Each inbound request is re-keyed with a value from a local counter before
/// it reaches the message handler, so independently numbered peers sharing
/// one engine never collide. The caller-visible id is restored on the reply,
/// and cancellation notices naming a caller id are re-keyed the same way.
pub(crate) struct Rendezvous {
    next_key: AtomicI64,
    slots: Mutex<HashMap<i64, Slot>>,
    reply_timeout: Option<Duration>,
}

struct Slot {
    caller_id: RequestId,
    reply: oneshot::Sender<Message>,
}

struct SlotGuard<'a> {
    rendezvous: &'a Rendezvous,
    key: i64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.rendezvous.slots().remove(&self.key);
    }
}

impl Rendezvous {
    pub(crate) fn new(reply_timeout: Option<Duration>) -> Self {
        Self {
            next_key: AtomicI64::new(1),
            slots: Mutex::new(HashMap::new()),
            reply_timeout,
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<i64, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn pending(&self) -> usize {
        self.slots().len()
    }

    /// Decodes one envelope, hands it to the message handler and, for a
    /// request, waits until [`Rendezvous::deliver`] supplies the reply.
    ///
    /// Once a request has been re-keyed, failures come back as
    /// [`TransportError::Unanswered`] carrying the caller's id.
    pub(crate) async fn exchange(
        &self,
        hooks: &TransportHooks,
        raw: &[u8],
    ) -> Result<Option<Message>, TransportError> {
        hooks.ensure_open()?;

        let mut request = match Message::from_slice(raw)? {
            Message::Request(request) => request,
            Message::Notification(notice) if notice.method == CANCELLED_METHOD => {
                if let Some(notice) = self.rekey_cancellation(notice) {
                    hooks.dispatch(Message::Notification(notice))?;
                }
                return Ok(None);
            }
            // Notifications and replies never produce an answer frame.
            other => {
                hooks.dispatch(other)?;
                return Ok(None);
            }
        };

        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        let caller_id = std::mem::replace(&mut request.id, RequestId::Number(key));
        let reply = self.open_slot(hooks, key, caller_id.clone())?;
        let _guard = SlotGuard {
            rendezvous: self,
            key,
        };

        debug!(key, caller_id = %caller_id, method = %request.method, "awaiting rendezvous reply");
        match self.await_reply(hooks, key, Message::Request(request), reply).await {
            Ok(mut reply) => {
                reply.set_id(caller_id);
                Ok(Some(reply))
            }
            Err(source) => Err(TransportError::Unanswered {
                id: caller_id,
                source: Box::new(source),
            }),
        }
    }

    /// Registers the delivery slot for `key`. The closed check runs under the
    /// slot lock, so a concurrent close either drains this slot or rejects it.
    fn open_slot(
        &self,
        hooks: &TransportHooks,
        key: i64,
        caller_id: RequestId,
    ) -> Result<oneshot::Receiver<Message>, TransportError> {
        let (reply, receiver) = oneshot::channel();
        let mut slots = self.slots();
        if hooks.is_closed() {
            return Err(TransportError::Closed);
        }
        slots.insert(key, Slot { caller_id, reply });
        Ok(receiver)
    }

    async fn await_reply(
        &self,
        hooks: &TransportHooks,
        key: i64,
        request: Message,
        reply: oneshot::Receiver<Message>,
    ) -> Result<Message, TransportError> {
        hooks.dispatch(request)?;

        let outcome = match self.reply_timeout {
            Some(limit) => match tokio::time::timeout(limit, reply).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // Stop the handler; nobody will read its reply.
                    let notice = Message::notification(
                        CANCELLED_METHOD,
                        Some(json!({ "requestId": key, "reason": "reply timed out" })),
                    );
                    if let Err(err) = hooks.dispatch(notice) {
                        debug!(key, error = %err, "could not cancel timed out request");
                    }
                    return Err(TransportError::ReplyTimeout(limit));
                }
            },
            None => reply.await,
        };
        outcome.map_err(|_| TransportError::Closed)
    }

    /// Rewrites the `requestId` of a cancellation notice from the caller's id
    /// to the correlation key of that caller's in-flight request. Notices for
    /// ids that are not waiting here are dropped.
    fn rekey_cancellation(&self, mut notice: Notification) -> Option<Notification> {
        let caller_id = notice
            .params
            .as_ref()
            .and_then(|params| params.get("requestId"))
            .cloned()
            .and_then(|id| serde_json::from_value::<RequestId>(id).ok());
        let Some(caller_id) = caller_id else {
            debug!("dropping cancellation notice without a request id");
            return None;
        };

        // Colliding caller ids resolve to the most recent request.
        let key = self
            .slots()
            .iter()
            .filter(|(_, slot)| slot.caller_id == caller_id)
            .map(|(key, _)| *key)
            .max();
        let Some(key) = key else {
            debug!(caller_id = %caller_id, "dropping cancellation for a request not waiting here");
            return None;
        };

        if let Some(Value::Object(params)) = notice.params.as_mut() {
            params.insert("requestId".into(), Value::from(key));
        }
        Some(notice)
    }

    /// Fills the delivery slot matching the reply's correlation key.
    pub(crate) fn deliver(&self, message: Message) -> Result<(), TransportError> {
        let key = match (&message, message.id()) {
            (Message::Response(_) | Message::Error(_), Some(RequestId::Number(key))) => *key,
            (Message::Response(_) | Message::Error(_), _) => {
                return Err(TransportError::NoCounterpart("uncorrelated reply"))
            }
            _ => return Err(TransportError::NoCounterpart(message.kind())),
        };

        let slot = self
            .slots()
            .remove(&key)
            .ok_or(TransportError::NoDeliverySlot(key))?;
        slot.reply
            .send(message)
            .map_err(|_| TransportError::NoDeliverySlot(key))
    }

    /// Drops every slot; waiting callers observe a closed transport.
    pub(crate) fn fail_all(&self) {
        self.slots().clear();
    }
}
