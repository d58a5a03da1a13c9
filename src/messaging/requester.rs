use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::NatsError;
use crate::messaging::inbox::{InboxFactory, SidAllocator};
use crate::messaging::message::Message;
use crate::messaging::op_sink::OpSink;
use crate::messaging::request_table::RequestTable;
use crate::protocol::headers::Headers;
use crate::protocol::operation::{HPubOp, Operation, PubOp, SubOp, UnsubOp};

/// Request / reply on top of a per-request inbox subscription
pub struct Requester {
    table: Arc<RequestTable>,
    sink: Arc<dyn OpSink>,
    sids: Arc<SidAllocator>,
    inboxes: InboxFactory,
}
impl Requester {
    pub fn new(table: Arc<RequestTable>, sink: Arc<dyn OpSink>, sids: Arc<SidAllocator>, inbox_prefix: &str) -> Requester {
        Requester {
            table,
            sink,
            sids,
            inboxes: InboxFactory::new(inbox_prefix),
        }
    }

    /// Publishes a request and waits for the first reply. The waiter is registered before the
    ///  inbox SUB is sent, and the request is published only after the SUB was handed to the
    ///  connection, so a fast reply can not get lost. SUB, PUB and UNSUB all go to the same
    ///  connection: if it is replaced in between, the request fails.
    pub async fn request(&self, subject: &str, headers: Option<Headers>, payload: Bytes, timeout: Duration) -> Result<Message, NatsError> {
        let sid = self.sids.next();
        let inbox = self.inboxes.new_inbox();
        trace!(sid, subject, inbox, "request");

        let reply = self.table.register(sid);

        let mut connection = None;
        let exchange = async {
            let target = self.sink.wait_connection().await?;
            connection = Some(target);
            self.sink.send_op(target, Operation::Sub(SubOp { subject: inbox.clone(), queue_group: None, sid })).await?;

            let publish = match headers {
                Some(headers) => Operation::HPub(HPubOp {
                    subject: subject.to_string(),
                    reply_to: Some(inbox.clone()),
                    headers,
                    payload,
                }),
                None => Operation::Pub(PubOp {
                    subject: subject.to_string(),
                    reply_to: Some(inbox.clone()),
                    payload,
                }),
            };
            self.sink.send_op(target, publish).await?;

            match reply.await {
                Ok(result) => result,
                // the table was dropped, so there is no connection left to reply on
                Err(_) => Err(NatsError::NotConnected),
            }
        };

        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                debug!(sid, subject, "request timed out after {:?}", timeout);
                Err(NatsError::Timeout)
            }
        };

        self.table.cancel(sid);
        if let Some(connection) = connection {
            // a closed connection took the inbox subscription with it
            if !matches!(result, Err(NatsError::ConnectionClosed(_))) {
                if let Err(e) = self.sink.send_op(connection, Operation::Unsub(UnsubOp { sid, max_msgs: None })).await {
                    trace!(sid, "inbox UNSUB not sent: {}", e);
                }
            }
        }
        result
    }
}
