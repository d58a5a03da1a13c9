use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::error::NatsError;
use crate::protocol::operation::Operation;

/// Where the connection-independent parts of the client send their operations.
///
/// Connections are identified by ids that are never reused. Operations are always sent on a
///  specific connection, so a sequence of operations that belongs together (SUB then UNSUB, or
///  a request's SUB and PUB) either goes to a single connection or fails.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OpSink: Send + Sync + 'static {
    /// the connection operations currently go to, `None` while the client is reconnecting
    fn current_connection(&self) -> Option<u64>;

    /// the current connection, waiting for one if the client is reconnecting
    async fn wait_connection(&self) -> Result<u64, NatsError>;

    /// Sends on the given connection. Fails if that connection is no longer current. If it is
    ///  still in its handshake, this waits for the handshake's outcome.
    async fn send_op(&self, connection: u64, op: Operation) -> Result<(), NatsError>;
}
