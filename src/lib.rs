//! A client for the NATS messaging protocol.
//!
//! The crate is layered bottom-up:
//!
//! * [protocol] is the wire codec: it turns bytes from a transport into [protocol::operation::Operation]
//!   values and back. It knows nothing about connections.
//! * [transport] abstracts the byte stream (plain TCP, TLS upgraded in place, WebSocket) behind
//!   a line / exact-length reader and a writer.
//! * [connection] drives one server connection ([connection::engine::ProtocolEngine]) through
//!   handshake, keepalive and shutdown, and replaces it on failure
//!   ([connection::connection_manager::ConnectionManager]).
//! * [messaging] owns everything that outlives a single connection: the subscription registry
//!   with its demand counting, the request correlation table and the message dispatcher that
//!   routes incoming messages to either of them.
//! * [client::Client] is the user-facing facade tying the layers together.
pub mod auth;
pub mod client;
pub mod connection;
pub mod error;
pub mod messaging;
pub mod protocol;
pub mod transport;
pub mod util;
pub mod test_util;
