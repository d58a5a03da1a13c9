use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::trace;

use crate::connection::connection_state::CloseReason;
use crate::connection::engine::ProtocolEngine;
use crate::error::NatsError;
use crate::messaging::op_sink::OpSink;
use crate::protocol::operation::Operation;

#[derive(Clone)]
enum Slot {
    /// between connections, or before the first one
    Pending,
    /// the connection with this id is in its handshake
    Connecting(u64),
    Connected(Arc<ProtocolEngine>),
    /// the client stopped connecting for good
    Closed(CloseReason),
}

/// The connection currently in use. Senders arriving while the client is between connections
///  wait for the next one, up to a timeout.
pub struct ActiveConnection {
    slot: watch::Sender<Slot>,
    wait_timeout: Duration,
}
impl ActiveConnection {
    pub fn new(wait_timeout: Duration) -> ActiveConnection {
        ActiveConnection {
            slot: watch::Sender::new(Slot::Pending),
            wait_timeout,
        }
    }

    pub fn set_connecting(&self, connection: u64) {
        self.replace_unless_closed(Slot::Connecting(connection));
    }

    pub fn set_connected(&self, engine: Arc<ProtocolEngine>) {
        self.slot.send_replace(Slot::Connected(engine));
    }

    pub fn set_pending(&self) {
        self.replace_unless_closed(Slot::Pending);
    }

    fn replace_unless_closed(&self, new_slot: Slot) {
        self.slot.send_if_modified(|slot| {
            if matches!(slot, Slot::Closed(_)) {
                false
            }
            else {
                *slot = new_slot;
                true
            }
        });
    }

    pub fn set_closed(&self, reason: CloseReason) {
        self.slot.send_replace(Slot::Closed(reason));
    }

    pub fn current(&self) -> Option<Arc<ProtocolEngine>> {
        match &*self.slot.borrow() {
            Slot::Connected(engine) => Some(engine.clone()),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(&*self.slot.borrow(), Slot::Closed(_))
    }

    /// The current connection, waiting up to `timeout` for one if the client is reconnecting.
    ///  A connection that already ended counts as no connection.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<Arc<ProtocolEngine>, NatsError> {
        let mut rx = self.slot.subscribe();
        let wait = async {
            loop {
                let slot = rx.borrow_and_update().clone();
                match slot {
                    Slot::Connected(engine) if engine.close_reason().is_none() => return Ok(engine),
                    Slot::Closed(reason) => return Err(NatsError::ConnectionClosed(reason)),
                    // an engine that ended is about to be replaced
                    Slot::Connected(_) | Slot::Connecting(_) | Slot::Pending => {}
                }
                if rx.changed().await.is_err() {
                    return Err(NatsError::NotConnected);
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                trace!("no connection within {:?}", timeout);
                Err(NatsError::NotConnected)
            }
        }
    }
}

#[async_trait]
impl OpSink for ActiveConnection {
    fn current_connection(&self) -> Option<u64> {
        match &*self.slot.borrow() {
            Slot::Connected(engine) if engine.close_reason().is_none() => Some(engine.id()),
            _ => None,
        }
    }

    async fn wait_connection(&self) -> Result<u64, NatsError> {
        self.wait_connected(self.wait_timeout).await
            .map(|engine| engine.id())
    }

    async fn send_op(&self, connection: u64, op: Operation) -> Result<(), NatsError> {
        let mut rx = self.slot.subscribe();
        let engine = async {
            loop {
                let slot = rx.borrow_and_update().clone();
                match slot {
                    Slot::Connected(engine) if engine.id() == connection => return Ok(engine),
                    Slot::Connecting(id) if id == connection => {}
                    Slot::Closed(reason) => return Err(NatsError::ConnectionClosed(reason)),
                    _ => {
                        trace!(connection, "connection is gone, not sending {}", op.name());
                        return Err(NatsError::NotConnected);
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(NatsError::NotConnected);
                }
            }
        };

        let engine = match tokio::time::timeout(self.wait_timeout, engine).await {
            Ok(engine) => engine?,
            Err(_) => return Err(NatsError::NotConnected),
        };
        engine.send(op).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::connection_config::ConnectionConfig;
    use crate::connection::connection_events::ConnectionEventNotifier;
    use crate::messaging::message_dispatcher::MockMessageDispatcher;
    use crate::transport::server_address::ServerAddress;

    fn engine() -> Arc<ProtocolEngine> {
        let config = ConnectionConfig::new(vec![ServerAddress::parse("localhost").unwrap()]);
        Arc::new(ProtocolEngine::new(
            config.servers[0].clone(),
            Arc::new(config),
            Arc::new(MockMessageDispatcher::new()),
            Arc::new(ConnectionEventNotifier::new()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_connection() {
        let active = Arc::new(ActiveConnection::new(Duration::from_secs(5)));
        let waiter = {
            let active = active.clone();
            tokio::spawn(async move { active.wait_connected(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        let engine = engine();
        active.set_connected(engine.clone());
        assert!(Arc::ptr_eq(&waiter.await.unwrap().unwrap(), &engine));
        assert!(active.current().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let active = ActiveConnection::new(Duration::from_secs(5));
        assert!(matches!(active.wait_connected(Duration::from_secs(1)).await, Err(NatsError::NotConnected)));
        assert!(matches!(active.wait_connection().await, Err(NatsError::NotConnected)));
        assert!(matches!(active.send_op(1, Operation::Ping).await, Err(NatsError::NotConnected)));
    }

    #[tokio::test]
    async fn test_closed_is_final() {
        let active = ActiveConnection::new(Duration::from_secs(5));
        active.set_closed(CloseReason::IoError);
        active.set_pending();

        assert!(active.is_closed());
        assert!(matches!(active.wait_connected(Duration::from_secs(1)).await, Err(NatsError::ConnectionClosed(CloseReason::IoError))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_connection_is_skipped() {
        let active = ActiveConnection::new(Duration::from_secs(5));
        let ended = engine();
        ended.close().await;
        active.set_connected(ended);

        assert!(matches!(active.wait_connected(Duration::from_secs(1)).await, Err(NatsError::NotConnected)));
    }

    #[tokio::test]
    async fn test_send_on_unstarted_engine_fails() {
        let active = ActiveConnection::new(Duration::from_secs(5));
        let engine = engine();
        active.set_connected(engine.clone());
        assert_eq!(active.current_connection(), Some(engine.id()));
        assert!(matches!(active.send_op(engine.id(), Operation::Ping).await, Err(NatsError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_targets_one_connection() {
        let active = ActiveConnection::new(Duration::from_secs(5));
        let first = engine();
        let second = engine();
        assert_ne!(first.id(), second.id());

        active.set_connected(first.clone());
        assert_eq!(active.wait_connection().await.unwrap(), first.id());

        active.set_connected(second.clone());
        assert_eq!(active.current_connection(), Some(second.id()));
        assert!(matches!(active.send_op(first.id(), Operation::Ping).await, Err(NatsError::NotConnected)));

        active.set_closed(CloseReason::CleanClose);
        assert_eq!(active.current_connection(), None);
        assert!(matches!(active.send_op(second.id(), Operation::Ping).await, Err(NatsError::ConnectionClosed(CloseReason::CleanClose))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_waits_for_handshake_of_its_connection() {
        let active = Arc::new(ActiveConnection::new(Duration::from_secs(5)));
        let engine = engine();
        active.set_connecting(engine.id());
        assert_eq!(active.current_connection(), None);

        let sender = {
            let active = active.clone();
            let id = engine.id();
            tokio::spawn(async move { active.send_op(id, Operation::Ping).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!sender.is_finished());

        // another connection in its handshake fails right away
        assert!(matches!(active.send_op(engine.id() + 1000, Operation::Ping).await, Err(NatsError::NotConnected)));

        active.set_connected(engine.clone());
        // reaches the engine, which was never started
        assert!(matches!(sender.await.unwrap(), Err(NatsError::NotConnected)));
    }
}
