use std::sync::Arc;

use parking_lot::Mutex;
use tokio::select;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::connection::active_connection::ActiveConnection;
use crate::connection::connection_config::ConnectionConfig;
use crate::connection::connection_events::{ConnectionEvent, ConnectionEventNotifier};
use crate::connection::connection_state::CloseReason;
use crate::connection::engine::ProtocolEngine;
use crate::connection::server_pool::ServerPool;
use crate::messaging::message_dispatcher::MessageDispatcher;
use crate::transport::server_address::ServerAddress;
use crate::transport::transport::TransportConnector;
use crate::util::random::RngRandom;

/// Keeps the client connected: runs one [ProtocolEngine] at a time and replaces it when it
///  ends, until the client shuts down or too many consecutive attempts failed.
pub struct ConnectionManager {
    config: Arc<ConnectionConfig>,
    connector: Arc<dyn TransportConnector>,
    dispatcher: Arc<dyn MessageDispatcher>,
    events: Arc<ConnectionEventNotifier>,
    active: Arc<ActiveConnection>,
    pool: Mutex<ServerPool>,
    current: Mutex<Option<Arc<ProtocolEngine>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}
impl ConnectionManager {
    pub fn new(
        config: Arc<ConnectionConfig>,
        connector: Arc<dyn TransportConnector>,
        dispatcher: Arc<dyn MessageDispatcher>,
        events: Arc<ConnectionEventNotifier>,
        active: Arc<ActiveConnection>,
    ) -> Arc<ConnectionManager> {
        let pool = ServerPool::new(config.servers.clone(), config.lame_duck_backoff);
        Arc::new(ConnectionManager {
            config,
            connector,
            dispatcher,
            events,
            active,
            pool: Mutex::new(pool),
            current: Default::default(),
            shutdown: watch::Sender::new(false),
            task: Default::default(),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        let handle = tokio::spawn(async move { manager.run().await });
        *self.task.lock() = Some(handle);
    }

    /// Stops reconnecting and closes the current connection, returning when the manager is done
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        debug!("shutting down connection manager");

        let current = self.current.lock().clone();
        if let Some(engine) = current {
            engine.close().await;
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// the current server pool, seeds first
    pub fn servers(&self) -> Vec<ServerAddress> {
        self.pool.lock().addresses()
    }

    async fn run(self: Arc<Self>) {
        let mut failures = 0u32;
        let mut attempt = 0u32;
        let mut last_reason = CloseReason::CleanClose;

        loop {
            if self.is_shut_down() {
                last_reason = CloseReason::CleanClose;
                break;
            }
            if let Some(max) = self.config.max_reconnects {
                if failures >= max {
                    error!("giving up after {} failed connection attempts", failures);
                    break;
                }
            }
            let next = self.pool.lock().next_server::<RngRandom>(Instant::now());
            let Some(server) = next else {
                error!("no servers to connect to");
                break;
            };

            if attempt > 0 {
                self.events.send_event(ConnectionEvent::Reconnecting { attempt });
            }
            attempt += 1;

            last_reason = self.run_connection(&server).await;

            match last_reason {
                CloseReason::LameDuckMode => {
                    self.pool.lock().mark_lame_duck(&server, Instant::now());
                    failures = 0;
                }
                reason if reason.is_failure() => {
                    failures += 1;
                    debug!(%server, ?reason, "connection attempt failed ({} in a row)", failures);
                }
                _ => failures = 0,
            }

            if self.is_shut_down() {
                last_reason = CloseReason::CleanClose;
                break;
            }

            let mut shutdown = self.shutdown.subscribe();
            select! {
                _ = sleep(self.config.reconnect_delay) => {}
                _ = shutdown.wait_for(|s| *s) => {
                    last_reason = CloseReason::CleanClose;
                    break;
                }
            }
        }

        info!(?last_reason, "stopped connecting");
        self.active.set_closed(last_reason);
        self.events.send_event(ConnectionEvent::Closed);
    }

    /// runs one engine from start to close, returning its close reason
    async fn run_connection(&self, server: &ServerAddress) -> CloseReason {
        let engine = Arc::new(ProtocolEngine::new(
            server.clone(),
            self.config.clone(),
            self.dispatcher.clone(),
            self.events.clone(),
        ));
        *self.current.lock() = Some(engine.clone());
        if self.is_shut_down() {
            engine.close().await;
        }

        // subscribed before start so that no announcement can slip through
        let mut events = self.events.subscribe();

        self.active.set_connecting(engine.id());
        let reason = match engine.start(self.connector.as_ref()).await {
            Ok(info) => {
                self.fold_discovered(info.advertised_urls(server.is_websocket()), server);
                self.active.set_connected(engine.clone());
                self.dispatcher.on_connected(engine.id()).await;

                let reason = loop {
                    select! {
                        reason = engine.closed() => break reason,
                        event = events.recv() => match event {
                            Ok(ConnectionEvent::ServersDiscovered(urls)) => self.fold_discovered(&urls, server),
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(n)) => warn!("missed {} connection events", n),
                            Err(broadcast::error::RecvError::Closed) => break engine.closed().await,
                        },
                    }
                };
                self.active.set_pending();
                reason
            }
            Err(reason) => {
                self.active.set_pending();
                reason
            }
        };

        *self.current.lock() = None;
        reason
    }

    fn fold_discovered(&self, urls: &[String], advertised_by: &ServerAddress) {
        if urls.is_empty() {
            return;
        }
        let added = self.pool.lock().add_discovered(urls, advertised_by);
        if !added.is_empty() {
            info!("discovered servers {:?}", added);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::error::NatsError;
    use crate::messaging::message_dispatcher::MockMessageDispatcher;
    use crate::test_util::test_server::{test_server_info, MemoryConnector, ServerPeer};
    use crate::protocol::operation::Operation;
    use tokio::sync::mpsc;

    fn dispatcher() -> MockMessageDispatcher {
        let mut dispatcher = MockMessageDispatcher::new();
        dispatcher.expect_resubscribe_ops().returning(|_| Vec::new());
        dispatcher.expect_on_connected().returning(|_| ());
        dispatcher.expect_active_sids().returning(Vec::new);
        dispatcher.expect_on_disconnected().returning(|_| ());
        dispatcher.expect_dispatch().returning(|_| ());
        dispatcher
    }

    struct Fixture {
        manager: Arc<ConnectionManager>,
        active: Arc<ActiveConnection>,
        connector: Arc<MemoryConnector>,
        peers: mpsc::UnboundedReceiver<ServerPeer>,
        events: broadcast::Receiver<ConnectionEvent>,
    }

    fn fixture(configure: impl FnOnce(&mut ConnectionConfig)) -> Fixture {
        let mut config = ConnectionConfig::new(vec![ServerAddress::parse("nats://localhost:4222").unwrap()]);
        configure(&mut config);
        let config = Arc::new(config);

        let (connector, peers) = MemoryConnector::new();
        let notifier = Arc::new(ConnectionEventNotifier::new());
        let events = notifier.subscribe();
        let active = Arc::new(ActiveConnection::new(config.connect_timeout));
        let manager = ConnectionManager::new(config, connector.clone(), Arc::new(dispatcher()), notifier, active.clone());
        Fixture { manager, active, connector, peers, events }
    }

    async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>, matching: impl Fn(&ConnectionEvent) -> bool) -> ConnectionEvent {
        loop {
            let event = events.recv().await.unwrap();
            if matching(&event) {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_and_reconnects() {
        let mut f = fixture(|_| {});
        f.manager.start();

        let mut peer = f.peers.recv().await.unwrap();
        peer.handshake(test_server_info("one")).await;
        f.active.wait_connected(Duration::from_secs(1)).await.unwrap();

        peer.close().await;
        next_event(&mut f.events, |e| matches!(e, ConnectionEvent::Disconnected(_))).await;
        assert_eq!(
            next_event(&mut f.events, |e| matches!(e, ConnectionEvent::Reconnecting { .. })).await,
            ConnectionEvent::Reconnecting { attempt: 1 }
        );

        let mut peer = f.peers.recv().await.unwrap();
        peer.handshake(test_server_info("two")).await;
        let engine = f.active.wait_connected(Duration::from_secs(1)).await.unwrap();
        assert_eq!(engine.server_info().unwrap().server_id, "two");

        f.manager.shutdown().await;
        assert_eq!(peer.receive().await.unwrap(), Operation::Empty);
        next_event(&mut f.events, |e| *e == ConnectionEvent::Closed).await;
        assert!(matches!(f.active.wait_connected(Duration::from_secs(1)).await, Err(NatsError::ConnectionClosed(CloseReason::CleanClose))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_consecutive_failures() {
        let mut f = fixture(|c| c.max_reconnects = Some(3));
        f.connector.refuse_next(100);
        f.manager.start();

        next_event(&mut f.events, |e| *e == ConnectionEvent::Closed).await;
        assert_eq!(f.connector.attempts(), 3);
        assert!(matches!(f.active.wait_connected(Duration::from_secs(1)).await, Err(NatsError::ConnectionClosed(CloseReason::IoError))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lame_duck_does_not_count_as_failure() {
        let mut f = fixture(|c| c.max_reconnects = Some(1));
        f.manager.start();

        let mut peer = f.peers.recv().await.unwrap();
        let mut info = test_server_info("one");
        info.ldm = Some(true);
        peer.send(&Operation::Info(Box::new(info))).await.unwrap();

        // the lame duck server is the only one, so it is tried again, and that attempt times out
        next_event(&mut f.events, |e| matches!(e, ConnectionEvent::Reconnecting { .. })).await;
        next_event(&mut f.events, |e| *e == ConnectionEvent::Closed).await;
        assert_eq!(f.connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_connection_resets_failures() {
        let mut f = fixture(|c| c.max_reconnects = Some(2));
        f.connector.refuse_next(1);
        f.manager.start();

        let mut peer = f.peers.recv().await.unwrap();
        peer.handshake(test_server_info("one")).await;
        f.active.wait_connected(Duration::from_secs(5)).await.unwrap();

        f.connector.refuse_next(100);
        peer.close().await;
        next_event(&mut f.events, |e| *e == ConnectionEvent::Closed).await;
        // one refused, one connected, then two refused
        assert_eq!(f.connector.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovered_servers_join_the_pool() {
        let mut f = fixture(|_| {});
        f.manager.start();

        let mut peer = f.peers.recv().await.unwrap();
        let mut info = test_server_info("one");
        info.connect_urls = Some(vec!["10.0.0.2:4222".to_string()]);
        peer.handshake(info).await;
        f.active.wait_connected(Duration::from_secs(1)).await.unwrap();
        assert_eq!(f.manager.servers().len(), 2);

        let mut info = test_server_info("one");
        info.connect_urls = Some(vec!["10.0.0.3:4222".to_string()]);
        peer.send(&Operation::Info(Box::new(info))).await.unwrap();
        next_event(&mut f.events, |e| matches!(e, ConnectionEvent::ServersDiscovered(_))).await;
        // the manager sees the event after the test did
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.manager.servers().len(), 3);

        f.manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_waiting_to_reconnect() {
        let mut f = fixture(|_| {});
        f.connector.refuse_next(100);
        f.manager.start();

        next_event(&mut f.events, |e| matches!(e, ConnectionEvent::Reconnecting { .. })).await;
        f.manager.shutdown().await;
        next_event(&mut f.events, |e| *e == ConnectionEvent::Closed).await;
        assert!(f.manager.is_shut_down());
        assert!(f.active.is_closed());
    }
}
