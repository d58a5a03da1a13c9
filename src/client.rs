use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::connection::active_connection::ActiveConnection;
use crate::connection::connection_config::ConnectionConfig;
use crate::connection::connection_events::{ConnectionEvent, ConnectionEventNotifier};
use crate::connection::connection_manager::ConnectionManager;
use crate::connection::connection_state::ConnectionState;
use crate::connection::engine::ProtocolEngine;
use crate::error::NatsError;
use crate::messaging::inbox::SidAllocator;
use crate::messaging::message::Message;
use crate::messaging::message_dispatcher::ClientDispatcher;
use crate::messaging::request_table::RequestTable;
use crate::messaging::requester::Requester;
use crate::messaging::subscription_registry::{SubscribeOptions, Subscription, SubscriptionRegistry};
use crate::protocol::encoder::publish_size;
use crate::protocol::headers::Headers;
use crate::protocol::operation::{HPubOp, Operation, PubOp};
use crate::protocol::server_info::ServerInfo;
use crate::transport::server_address::ServerAddress;
use crate::transport::tls;
use crate::transport::transport::{DefaultConnector, TransportConnector};

#[derive(Clone, Debug, Default)]
pub struct PublishOptions {
    pub reply_to: Option<String>,
    pub headers: Option<Headers>,
}

#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub headers: Option<Headers>,
    /// `None` uses the configured request timeout
    pub timeout: Option<Duration>,
}

/// A client connected to a NATS server or cluster. It stays connected until [Client::disconnect]
///  or [Client::drain] is called, replacing failed connections along the way. Subscriptions
///  survive reconnects.
///
/// Operations called while the client is between connections wait for the next connection,
///  up to the configured connect timeout.
pub struct Client {
    config: Arc<ConnectionConfig>,
    events: Arc<ConnectionEventNotifier>,
    active: Arc<ActiveConnection>,
    manager: Arc<ConnectionManager>,
    subscriptions: Arc<SubscriptionRegistry>,
    dispatcher: Arc<ClientDispatcher>,
    requester: Requester,
}

impl Client {
    /// Connects over TCP, TLS or WebSocket depending on the configured server addresses
    pub async fn connect(config: ConnectionConfig) -> anyhow::Result<Client> {
        let tls_config = tls::client_config(&config.tls_root_certificates)?;
        Client::connect_with_connector(config, Arc::new(DefaultConnector::new(tls_config))).await
    }

    /// Connects through a custom connector. Returns once the first connection is established,
    ///  or fails if that takes longer than the connect timeout.
    pub async fn connect_with_connector(config: ConnectionConfig, connector: Arc<dyn TransportConnector>) -> anyhow::Result<Client> {
        config.validate()?;
        let config = Arc::new(config);

        let events = Arc::new(ConnectionEventNotifier::new());
        let active = Arc::new(ActiveConnection::new(config.connect_timeout));
        let sids = Arc::new(SidAllocator::new());

        let subscriptions = Arc::new(SubscriptionRegistry::new(
            active.clone(),
            sids.clone(),
            events.clone(),
            config.unsubscribe_debounce,
            config.subscription_capacity,
        ));
        let requests = Arc::new(RequestTable::new());
        let requester = Requester::new(requests.clone(), active.clone(), sids, &config.inbox_prefix);
        let dispatcher = Arc::new(ClientDispatcher::new(requests, subscriptions.clone()));

        let manager = ConnectionManager::new(
            config.clone(),
            connector,
            dispatcher.clone(),
            events.clone(),
            active.clone(),
        );
        manager.start();

        if let Err(e) = active.wait_connected(config.connect_timeout).await {
            warn!("initial connection failed: {}", e);
            manager.shutdown().await;
            return Err(anyhow!("could not connect to any of {:?}: {}", config.servers.iter().map(|s| s.to_string()).collect::<Vec<_>>(), e));
        }
        info!("client connected");

        Ok(Client {
            config,
            events,
            active,
            manager,
            subscriptions,
            dispatcher,
            requester,
        })
    }

    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<(), NatsError> {
        self.publish_with(subject, payload, PublishOptions::default()).await
    }

    pub async fn publish_with(&self, subject: &str, payload: impl Into<Bytes>, options: PublishOptions) -> Result<(), NatsError> {
        let payload = payload.into();
        if let Some(reply_to) = &options.reply_to {
            validate_subject(reply_to)?;
        }
        let headers = options.headers.filter(|h| !h.is_empty());
        let engine = self.checked_connection(subject, headers.as_ref(), payload.len()).await?;

        trace!(subject, "publish");
        let op = match headers {
            Some(headers) => Operation::HPub(HPubOp {
                subject: subject.to_string(),
                reply_to: options.reply_to,
                headers,
                payload,
            }),
            None => Operation::Pub(PubOp {
                subject: subject.to_string(),
                reply_to: options.reply_to,
                payload,
            }),
        };
        engine.send(op).await
    }

    /// an eager subscription without queue group
    pub async fn subscribe(&self, subject: &str) -> Result<Subscription, NatsError> {
        self.subscribe_with(subject, SubscribeOptions::default()).await
    }

    pub async fn subscribe_with(&self, subject: &str, options: SubscribeOptions) -> Result<Subscription, NatsError> {
        validate_subject(subject)?;
        if let Some(queue_group) = &options.queue_group {
            validate_subject(queue_group)?;
        }
        debug!(subject, queue_group = ?options.queue_group, "subscribe");
        Ok(self.subscriptions.subscribe(subject, options).await)
    }

    /// Publishes a request and waits for the first reply
    pub async fn request(&self, subject: &str, payload: impl Into<Bytes>, timeout: Duration) -> Result<Message, NatsError> {
        self.request_with(subject, payload, RequestOptions { headers: None, timeout: Some(timeout) }).await
    }

    pub async fn request_with(&self, subject: &str, payload: impl Into<Bytes>, options: RequestOptions) -> Result<Message, NatsError> {
        let payload = payload.into();
        let headers = options.headers.filter(|h| !h.is_empty());
        self.checked_connection(subject, headers.as_ref(), payload.len()).await?;

        let timeout = options.timeout.unwrap_or(self.config.request_timeout);
        self.requester.request(subject, headers, payload, timeout).await
    }

    /// Waits until the server has processed everything sent before
    pub async fn flush(&self) -> Result<(), NatsError> {
        let engine = self.active.wait_connected(self.config.connect_timeout).await?;
        engine.flush().await
    }

    /// Unsubscribes everything, waits for the server to confirm, and disconnects. The client
    ///  is disconnected even if draining fails or times out.
    pub async fn drain(&self, timeout: Duration) -> Result<(), NatsError> {
        let result = match self.active.current() {
            Some(engine) => engine.drain(timeout).await,
            None => Err(NatsError::NotConnected),
        };
        if let Err(e) = &result {
            debug!("drain failed: {}", e);
        }
        self.disconnect().await;
        result
    }

    /// Closes the connection and stops reconnecting
    pub async fn disconnect(&self) {
        self.manager.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.active.is_closed()
    }

    /// state of the current connection, `None` while reconnecting
    pub fn state(&self) -> Option<ConnectionState> {
        self.active.current()
            .map(|engine| engine.state())
    }

    /// INFO of the server the client is currently connected to
    pub fn server_info(&self) -> Option<Arc<ServerInfo>> {
        self.active.current()
            .and_then(|engine| engine.server_info())
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// number of inbound messages nobody was subscribed to
    pub fn dropped_messages(&self) -> u64 {
        self.dispatcher.dropped_messages()
    }

    /// the seed servers and those discovered since
    pub fn servers(&self) -> Vec<ServerAddress> {
        self.manager.servers()
    }

    /// Checks a publication against the subject rules and the limits of the server it will be
    ///  sent to, waiting for a connection if necessary
    async fn checked_connection(&self, subject: &str, headers: Option<&Headers>, payload_len: usize) -> Result<Arc<ProtocolEngine>, NatsError> {
        validate_subject(subject)?;

        let engine = self.active.wait_connected(self.config.connect_timeout).await?;
        if let Some(info) = engine.server_info() {
            if headers.is_some() && !info.headers {
                return Err(NatsError::HeadersNotSupported);
            }
            let size = publish_size(headers, payload_len);
            if info.max_payload > 0 && size > info.max_payload {
                return Err(NatsError::MaxPayloadExceeded { size, max: info.max_payload });
            }
        }
        Ok(engine)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.manager.is_shut_down() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let manager = self.manager.clone();
            handle.spawn(async move { manager.shutdown().await });
        }
    }
}

fn validate_subject(subject: &str) -> Result<(), NatsError> {
    if subject.is_empty() || subject.contains(char::is_whitespace) {
        return Err(NatsError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::connection_state::{CloseReason, Phase};
    use crate::protocol::operation::UnsubOp;
    use crate::test_util::test_server::{test_server_info, TestServer, TestServerConnector};
    use rstest::rstest;
    use tokio::time::Instant;

    fn config() -> ConnectionConfig {
        let mut config = ConnectionConfig::from_urls("nats://localhost:4222").unwrap();
        config.reconnect_delay = Duration::from_millis(10);
        config.unsubscribe_debounce = Duration::from_millis(10);
        config
    }

    async fn connect(server: &Arc<TestServer>, configure: impl FnOnce(&mut ConnectionConfig)) -> Client {
        let mut config = config();
        configure(&mut config);
        Client::connect_with_connector(config, Arc::new(TestServerConnector(server.clone()))).await.unwrap()
    }

    async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>, matching: impl Fn(&ConnectionEvent) -> bool) -> ConnectionEvent {
        loop {
            let event = events.recv().await.unwrap();
            if matching(&event) {
                return event;
            }
        }
    }

    fn subs_sent(server: &TestServer, subject: &str) -> usize {
        server.received().iter()
            .filter(|op| matches!(op, Operation::Sub(sub) if sub.subject == subject))
            .count()
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_once() {
        let server = TestServer::new(test_server_info("s1"));
        let client = connect(&server, |_| {}).await;
        assert_eq!(client.state().unwrap().phase, Phase::Connected);
        assert_eq!(client.server_info().unwrap().server_id, "s1");

        let sub = client.subscribe("greet.*").await.unwrap();
        let mut messages = sub.messages().await.unwrap();
        client.publish("greet.world", "hello").await.unwrap();

        let msg = messages.next().await.unwrap();
        assert_eq!(msg.subject, "greet.world");
        assert_eq!(msg.payload, Bytes::from("hello"));

        client.flush().await.unwrap();
        assert!(messages.try_next().is_none());
        assert_eq!(client.dropped_messages(), 0);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_publish_with_headers_and_reply_to() {
        let server = TestServer::new(test_server_info("s1"));
        let client = connect(&server, |_| {}).await;

        let sub = client.subscribe("orders").await.unwrap();
        let mut messages = sub.messages().await.unwrap();
        let headers = Headers::from_iter([("Order-Id", "17")]);
        client.publish_with("orders", "new", PublishOptions { reply_to: Some("confirmations".to_string()), headers: Some(headers) }).await.unwrap();

        let msg = messages.next().await.unwrap();
        assert_eq!(msg.reply_to.as_deref(), Some("confirmations"));
        assert_eq!(msg.headers.unwrap().get("Order-Id"), Some("17"));
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_request_reply() {
        let server = TestServer::new(test_server_info("s1"));
        let client = Arc::new(connect(&server, |_| {}).await);

        let service = client.subscribe("echo").await.unwrap();
        let mut requests = service.messages().await.unwrap();
        let responder = {
            let client = client.clone();
            tokio::spawn(async move {
                let request = requests.next().await.unwrap();
                assert_eq!(request.headers.unwrap().get("Trace"), Some("abc"));
                client.publish(request.reply_to.as_deref().unwrap(), request.payload).await.unwrap();
            })
        };

        let options = RequestOptions {
            headers: Some(Headers::from_iter([("Trace", "abc")])),
            timeout: Some(Duration::from_secs(1)),
        };
        let reply = client.request_with("echo", "ping", options).await.unwrap();
        assert_eq!(reply.payload, Bytes::from("ping"));
        responder.await.unwrap();
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_request_without_responders_fails_fast() {
        let server = TestServer::new(test_server_info("s1"));
        let client = connect(&server, |_| {}).await;

        let start = Instant::now();
        let result = client.request("nobody.home", "x", Duration::from_secs(5)).await;
        assert!(matches!(result, Err(NatsError::NoResponders)));
        assert!(start.elapsed() < Duration::from_secs(5));

        // the inbox subscription was cleaned up
        client.flush().await.unwrap();
        assert!(server.received().iter().any(|op| matches!(op, Operation::Unsub(_))));
        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let mut info = test_server_info("s1");
        info.headers = false;
        let server = TestServer::new(info);
        let client = connect(&server, |_| {}).await;

        let start = Instant::now();
        let result = client.request("slow", "x", Duration::from_millis(300)).await;
        assert!(matches!(result, Err(NatsError::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(300));
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_headers_need_server_support() {
        let mut info = test_server_info("s1");
        info.headers = false;
        let server = TestServer::new(info);
        let client = connect(&server, |_| {}).await;

        let headers = Headers::from_iter([("a", "b")]);
        let result = client.publish_with("s", "x", PublishOptions { reply_to: None, headers: Some(headers.clone()) }).await;
        assert!(matches!(result, Err(NatsError::HeadersNotSupported)));
        let result = client.request_with("s", "x", RequestOptions { headers: Some(headers), timeout: None }).await;
        assert!(matches!(result, Err(NatsError::HeadersNotSupported)));

        // empty headers are sent as a plain publication
        client.publish_with("s", "x", PublishOptions { reply_to: None, headers: Some(Headers::new()) }).await.unwrap();
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_max_payload() {
        let mut info = test_server_info("s1");
        info.max_payload = 16;
        let server = TestServer::new(info);
        let client = connect(&server, |_| {}).await;

        client.publish("s", vec![0u8; 16]).await.unwrap();
        let result = client.publish("s", vec![0u8; 17]).await;
        assert!(matches!(result, Err(NatsError::MaxPayloadExceeded { size: 17, max: 16 })));
        client.disconnect().await;
    }

    #[rstest]
    #[case::empty("")]
    #[case::space("a b")]
    #[case::tab("a\tb")]
    #[case::newline("a\r\n")]
    #[tokio::test]
    async fn test_invalid_subject(#[case] subject: &str) {
        let server = TestServer::new(test_server_info("s1"));
        let client = connect(&server, |_| {}).await;

        assert!(matches!(client.publish(subject, "x").await, Err(NatsError::InvalidSubject(_))));
        assert!(matches!(client.subscribe(subject).await, Err(NatsError::InvalidSubject(_))));
        assert!(matches!(client.request(subject, "x", Duration::from_secs(1)).await, Err(NatsError::InvalidSubject(_))));
        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resubscribes() {
        let server = TestServer::new(test_server_info("s1"));
        let client = connect(&server, |_| {}).await;

        let sub = client.subscribe("updates").await.unwrap();
        let mut messages = sub.messages().await.unwrap();
        client.flush().await.unwrap();
        assert_eq!(subs_sent(&server, "updates"), 1);

        let mut events = client.events();
        server.disconnect_all();
        let disconnected = next_event(&mut events, |e| matches!(e, ConnectionEvent::Disconnected(_))).await;
        assert!(matches!(disconnected, ConnectionEvent::Disconnected(d) if d.reason == CloseReason::ServerInitiatedClose));
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Connected(_))).await;

        assert_eq!(subs_sent(&server, "updates"), 2);
        client.publish("updates", "after").await.unwrap();
        assert_eq!(messages.next().await.unwrap().payload, Bytes::from("after"));
        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_while_reconnecting_sends_one_sub() {
        let server = TestServer::new(test_server_info("s1"));
        let client = connect(&server, |config| config.reconnect_delay = Duration::from_secs(1)).await;

        let mut events = client.events();
        server.disconnect_all();
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Disconnected(_))).await;

        let sub = client.subscribe("dup").await.unwrap();
        let mut messages = sub.messages().await.unwrap();
        assert!(sub.is_active());

        client.flush().await.unwrap();
        assert_eq!(subs_sent(&server, "dup"), 1);

        client.publish("dup", "once").await.unwrap();
        assert_eq!(messages.next().await.unwrap().payload, Bytes::from("once"));
        client.flush().await.unwrap();
        assert!(messages.try_next().is_none());
        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_subscription_unsubscribes() {
        let server = TestServer::new(test_server_info("s1"));
        let client = connect(&server, |_| {}).await;

        let sub = client.subscribe("gone").await.unwrap();
        let sid = sub.sid();
        client.flush().await.unwrap();
        drop(sub);

        while !server.received().contains(&Operation::Unsub(UnsubOp { sid, max_msgs: None })) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(server.subscription_count(), 0);
        client.publish("gone", "x").await.unwrap();
        client.flush().await.unwrap();
        assert_eq!(client.dropped_messages(), 0);
        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_waits_for_reconnect() {
        let server = TestServer::new(test_server_info("s1"));
        let client = connect(&server, |config| config.reconnect_delay = Duration::from_secs(1)).await;

        let mut events = client.events();
        server.disconnect_all();
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Disconnected(_))).await;

        let start = Instant::now();
        client.publish("s", "x").await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_lazy_subscription() {
        let server = TestServer::new(test_server_info("s1"));
        let client = connect(&server, |_| {}).await;

        let options = SubscribeOptions { eager: false, ..Default::default() };
        let sub = client.subscribe_with("lazy", options).await.unwrap();
        client.flush().await.unwrap();
        assert_eq!(subs_sent(&server, "lazy"), 0);

        let _messages = sub.messages().await.unwrap();
        client.flush().await.unwrap();
        assert_eq!(subs_sent(&server, "lazy"), 1);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_rejected_credentials_give_up() {
        let server = TestServer::new(test_server_info("s1"));
        server.set_reject_auth(true);

        let mut config = config();
        config.max_reconnects = Some(2);
        let result = Client::connect_with_connector(config, Arc::new(TestServerConnector(server.clone()))).await;
        assert!(result.is_err());
        assert_eq!(server.received().iter().filter(|op| matches!(op, Operation::Connect(_))).count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_connecting() {
        let server = TestServer::new(test_server_info("s1"));
        let result = Client::connect_with_connector(ConnectionConfig::new(vec![]), Arc::new(TestServerConnector(server.clone()))).await;
        assert!(result.is_err());
        assert!(server.received().is_empty());
    }

    #[tokio::test]
    async fn test_drain_unsubscribes_and_disconnects() {
        let server = TestServer::new(test_server_info("s1"));
        let client = connect(&server, |_| {}).await;

        let sub = client.subscribe("work").await.unwrap();
        client.flush().await.unwrap();
        client.drain(Duration::from_secs(1)).await.unwrap();

        assert!(server.received().contains(&Operation::Unsub(UnsubOp { sid: sub.sid(), max_msgs: None })));
        assert!(client.is_closed());
        assert!(client.state().is_none());
        assert!(matches!(client.publish("work", "x").await, Err(NatsError::ConnectionClosed(CloseReason::CleanClose))));
    }

    #[tokio::test]
    async fn test_disconnect_emits_closed() {
        let server = TestServer::new(test_server_info("s1"));
        let client = connect(&server, |_| {}).await;
        let mut events = client.events();

        client.disconnect().await;
        next_event(&mut events, |e| *e == ConnectionEvent::Closed).await;
        assert!(client.is_closed());
        assert_eq!(client.servers().len(), 1);
    }
}
