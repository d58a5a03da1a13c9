use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::trace;

use crate::connection::connection_state::CloseReason;
use crate::messaging::message::Message;
use crate::messaging::request_table::RequestTable;
use crate::messaging::subscription_registry::SubscriptionRegistry;
use crate::protocol::operation::Operation;

/// The connection's view of everything that consumes inbound messages and owns subscription
///  state across connections
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, msg: Message);

    /// SUB operations to send on the new connection `connection` before any other traffic.
    ///  Subscriptions returned here count as subscribed on that connection.
    fn resubscribe_ops(&self, connection: u64) -> Vec<Operation>;

    /// The connection became current. Subscriptions started during its handshake were not part
    ///  of the handshake, so they are sent now.
    async fn on_connected(&self, connection: u64);

    /// sids with a SUB in effect, unsubscribed when draining
    fn active_sids(&self) -> Vec<u64>;

    fn on_disconnected(&self, reason: CloseReason);
}

pub struct ClientDispatcher {
    requests: Arc<RequestTable>,
    subscriptions: Arc<SubscriptionRegistry>,
    dropped: AtomicU64,
}
impl ClientDispatcher {
    pub fn new(requests: Arc<RequestTable>, subscriptions: Arc<SubscriptionRegistry>) -> ClientDispatcher {
        ClientDispatcher {
            requests,
            subscriptions,
            dropped: AtomicU64::new(0),
        }
    }

    /// number of inbound messages nobody was subscribed to
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessageDispatcher for ClientDispatcher {
    async fn dispatch(&self, msg: Message) {
        let msg = match self.requests.complete(msg) {
            Ok(()) => return,
            Err(msg) => msg,
        };

        let sid = msg.sid;
        if !self.subscriptions.deliver(msg).await {
            trace!(sid, "no subscription for message, dropping");
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn resubscribe_ops(&self, connection: u64) -> Vec<Operation> {
        self.subscriptions.resubscribe_ops(connection)
    }

    async fn on_connected(&self, connection: u64) {
        self.subscriptions.catch_up(connection).await;
    }

    fn active_sids(&self) -> Vec<u64> {
        self.subscriptions.active_sids()
    }

    fn on_disconnected(&self, reason: CloseReason) {
        self.requests.fail_all(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use bytes::Bytes;
    use crate::connection::connection_events::ConnectionEventNotifier;
    use crate::error::NatsError;
    use crate::messaging::inbox::SidAllocator;
    use crate::messaging::subscription_registry::SubscribeOptions;
    use crate::test_util::tracking_sink::TrackingOpSink;

    fn msg(sid: u64) -> Message {
        Message {
            subject: "foo".to_string(),
            sid,
            reply_to: None,
            headers: None,
            status: None,
            description: None,
            payload: Bytes::from_static(b"x"),
        }
    }

    fn dispatcher() -> (ClientDispatcher, Arc<RequestTable>, Arc<SubscriptionRegistry>, Arc<SidAllocator>) {
        let sids = Arc::new(SidAllocator::new());
        let requests = Arc::new(RequestTable::new());
        let subscriptions = Arc::new(SubscriptionRegistry::new(
            Arc::new(TrackingOpSink::new()),
            sids.clone(),
            Arc::new(ConnectionEventNotifier::new()),
            Duration::from_millis(500),
            16,
        ));
        (ClientDispatcher::new(requests.clone(), subscriptions.clone()), requests, subscriptions, sids)
    }

    #[tokio::test]
    async fn test_routing() {
        let (dispatcher, requests, subscriptions, sids) = dispatcher();

        let subscription = subscriptions.subscribe("foo", SubscribeOptions::default()).await;
        let mut consumer = subscription.messages().await.unwrap();
        let request_sid = sids.next();
        let reply = requests.register(request_sid);

        dispatcher.dispatch(msg(request_sid)).await;
        dispatcher.dispatch(msg(subscription.sid())).await;
        dispatcher.dispatch(msg(99)).await;

        assert_eq!(reply.await.unwrap().unwrap().sid, request_sid);
        assert_eq!(consumer.next().await.unwrap().sid, subscription.sid());
        assert_eq!(dispatcher.dropped_messages(), 1);

        // the request entry is gone after the first reply
        dispatcher.dispatch(msg(request_sid)).await;
        assert_eq!(dispatcher.dropped_messages(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_fails_requests() {
        let (dispatcher, requests, _, _) = dispatcher();
        let reply = requests.register(7);

        dispatcher.on_disconnected(CloseReason::ServerInitiatedClose);
        assert!(matches!(reply.await.unwrap(), Err(NatsError::ConnectionClosed(CloseReason::ServerInitiatedClose))));
    }
}
