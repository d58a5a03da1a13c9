use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::trace;

use crate::connection::connection_state::CloseReason;
use crate::error::NatsError;
use crate::messaging::message::Message;

pub(crate) type Reply = Result<Message, NatsError>;

/// Requests waiting for their reply, keyed by the sid of their inbox subscription. Each entry
///  is resolved at most once: by the reply, by cancellation, or by the connection closing.
#[derive(Default)]
pub struct RequestTable {
    pending: DashMap<u64, oneshot::Sender<Reply>>,
}
impl RequestTable {
    pub fn new() -> RequestTable {
        RequestTable::default()
    }

    pub(crate) fn register(&self, sid: u64) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(sid, tx);
        rx
    }

    /// Resolves the request waiting on the message's sid, handing the message back if there is
    ///  none
    pub fn complete(&self, msg: Message) -> Result<(), Message> {
        match self.pending.remove(&msg.sid) {
            Some((sid, waiter)) => {
                trace!(sid, "reply received");
                let reply = if msg.is_no_responders() {
                    Err(NatsError::NoResponders)
                }
                else {
                    Ok(msg)
                };
                // the requester may have timed out in the meantime
                let _ = waiter.send(reply);
                Ok(())
            }
            None => Err(msg),
        }
    }

    pub fn cancel(&self, sid: u64) -> bool {
        self.pending.remove(&sid).is_some()
    }

    /// fails all pending requests, used when the connection they were sent on ends
    pub fn fail_all(&self, reason: CloseReason) {
        let sids = self.pending.iter()
            .map(|e| *e.key())
            .collect::<Vec<_>>();
        for sid in sids {
            if let Some((_, waiter)) = self.pending.remove(&sid) {
                let _ = waiter.send(Err(NatsError::ConnectionClosed(reason)));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn reply(sid: u64, status: Option<u16>, payload: &'static str) -> Message {
        Message {
            subject: "_INBOX.x".to_string(),
            sid,
            reply_to: None,
            headers: None,
            status,
            description: None,
            payload: Bytes::from_static(payload.as_bytes()),
        }
    }

    #[tokio::test]
    async fn test_complete() {
        let table = RequestTable::new();
        let rx = table.register(5);

        assert!(table.complete(reply(5, None, "pong")).is_ok());
        assert_eq!(rx.await.unwrap().unwrap().payload, "pong");
        assert!(table.is_empty());

        // a second reply for the same request is not consumed
        assert!(table.complete(reply(5, None, "again")).is_err());
    }

    #[tokio::test]
    async fn test_no_responders() {
        let table = RequestTable::new();
        let rx = table.register(1);
        table.complete(reply(1, Some(503), "")).unwrap();
        assert!(matches!(rx.await.unwrap(), Err(NatsError::NoResponders)));
    }

    #[tokio::test]
    async fn test_503_with_payload_is_a_reply() {
        let table = RequestTable::new();
        let rx = table.register(1);
        table.complete(reply(1, Some(503), "busy")).unwrap();
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_and_fail_all() {
        let table = RequestTable::new();
        let _rx1 = table.register(1);
        let rx2 = table.register(2);

        assert!(table.cancel(1));
        assert!(!table.cancel(1));
        assert_eq!(table.len(), 1);

        table.fail_all(CloseReason::IoError);
        assert!(matches!(rx2.await.unwrap(), Err(NatsError::ConnectionClosed(CloseReason::IoError))));
        assert!(table.is_empty());
    }
}
