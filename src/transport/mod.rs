//! Byte-level connections to a server. The codec and the connection logic see only the traits in
//!  [transport]; the concrete transports are plain TCP optionally upgraded to TLS
//!  ([stream_transport]), and WebSocket ([websocket]).

pub mod buffered_reader;
pub mod server_address;
pub mod stream_transport;
pub mod tls;
pub mod transport;
pub mod websocket;
