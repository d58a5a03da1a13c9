use crate::connection::connection_state::CloseReason;
use crate::protocol::protocol_error::ProtocolError;

/// Errors reported by client operations. Setup and configuration paths use `anyhow` instead,
///  since their failures are reported rather than handled.
#[derive(Debug, thiserror::Error)]
pub enum NatsError {
    #[error("not connected to a server")]
    NotConnected,
    #[error("connection closed: {0:?}")]
    ConnectionClosed(CloseReason),
    #[error("operation timed out")]
    Timeout,
    #[error("no responders are subscribed to the request subject")]
    NoResponders,
    #[error("payload of {size} bytes exceeds the server's maximum of {max} bytes")]
    MaxPayloadExceeded { size: usize, max: usize },
    #[error("the server does not support message headers")]
    HeadersNotSupported,
    #[error("invalid subject {0:?}")]
    InvalidSubject(String),
    #[error("subscription is closed")]
    SubscriptionClosed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
