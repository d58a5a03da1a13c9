use tokio::sync::broadcast;
use tracing::trace;

use crate::connection::connection_state::CloseReason;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    Connected(ConnectedData),
    Disconnected(DisconnectedData),
    /// a new connection attempt is about to start after the previous connection ended
    Reconnecting { attempt: u32 },
    /// the named server announced lame duck mode
    LameDuck { server: String },
    /// a non-fatal -ERR from the server
    ServerError(String),
    /// a control line that could not be interpreted
    UnparsedControl(String),
    /// new cluster addresses were added to the server pool
    ServersDiscovered(Vec<String>),
    /// a message was dropped because the consumer's buffer was full
    SlowConsumer { sid: u64 },
    /// the client stopped connecting, either on request or because it gave up
    Closed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectedData {
    pub server: String,
    pub server_id: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DisconnectedData {
    pub server: String,
    pub reason: CloseReason,
}

pub struct ConnectionEventNotifier {
    sender: broadcast::Sender<ConnectionEvent>,
}
impl Default for ConnectionEventNotifier {
    fn default() -> Self {
        ConnectionEventNotifier::new()
    }
}
impl ConnectionEventNotifier {
    pub fn new() -> ConnectionEventNotifier {
        let (sender, _) = broadcast::channel(128);

        ConnectionEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ConnectionEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
