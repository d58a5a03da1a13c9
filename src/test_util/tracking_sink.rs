use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::NatsError;
use crate::messaging::op_sink::OpSink;
use crate::protocol::operation::Operation;

/// An [OpSink] that records all operations for later verification, in the order they were sent.
///  It starts out connected on connection 1.
#[derive(Debug)]
pub struct TrackingOpSink {
    tracker: Arc<RwLock<Vec<Operation>>>,
    /// 0 while disconnected
    connection: AtomicU64,
}
impl TrackingOpSink {
    pub fn new() -> Self {
        TrackingOpSink {
            tracker: Default::default(),
            connection: AtomicU64::new(1),
        }
    }

    /// operations for other connections are rejected, and not recorded
    pub fn set_connection(&self, connection: Option<u64>) {
        self.connection.store(connection.unwrap_or(0), Ordering::Release);
    }

    /// checks and removes the oldest recorded operation
    pub async fn assert_op_sent(&self, op: Operation) {
        let mut lock = self.tracker.write().await;
        if lock.is_empty() {
            panic!("no operation was sent, expected {:?}", op);
        }

        let actual = lock.remove(0);
        assert_eq!(actual, op);
    }

    pub async fn assert_no_remaining_ops(&self) {
        let lock = self.tracker.read().await;
        assert!(lock.is_empty(), "unexpected operations: {:?}", *lock);
    }

    pub async fn sent_ops(&self) -> Vec<Operation> {
        self.tracker.read().await.clone()
    }
}

impl Default for TrackingOpSink {
    fn default() -> Self {
        TrackingOpSink::new()
    }
}

#[async_trait]
impl OpSink for TrackingOpSink {
    fn current_connection(&self) -> Option<u64> {
        match self.connection.load(Ordering::Acquire) {
            0 => None,
            connection => Some(connection),
        }
    }

    async fn wait_connection(&self) -> Result<u64, NatsError> {
        self.current_connection()
            .ok_or(NatsError::NotConnected)
    }

    async fn send_op(&self, connection: u64, op: Operation) -> Result<(), NatsError> {
        if self.current_connection() != Some(connection) {
            return Err(NatsError::NotConnected);
        }
        self.tracker.write().await.push(op);
        Ok(())
    }
}
