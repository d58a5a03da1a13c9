use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tracing::debug;

use crate::transport::server_address::ServerAddress;
use crate::transport::stream_transport::StreamTransport;
use crate::transport::websocket::WebSocketTransport;

/// The read side of a connection, as the wire codec needs it: CRLF-delimited control lines
///  and length-prefixed payloads.
#[async_trait]
pub trait TransportReader: Send {
    /// Reads one line terminated by CRLF and returns it without the terminator. Returns `None`
    ///  if the stream ends cleanly before the first byte of a line.
    async fn read_line(&mut self) -> io::Result<Option<Bytes>>;

    /// Reads exactly `n` bytes, failing with [io::ErrorKind::UnexpectedEof] if the stream ends
    ///  before that.
    async fn read_exact(&mut self, n: usize) -> io::Result<Bytes>;
}

#[async_trait]
pub trait TransportWriter: Send {
    async fn write(&mut self, buf: &[u8]) -> io::Result<()>;
    async fn flush(&mut self) -> io::Result<()>;
    async fn close(&mut self) -> io::Result<()>;
    fn is_closed(&self) -> bool;
}

/// A full-duplex connection to a server. It starts out as a single object so the handshake can
///  upgrade it to TLS in place, and is then split so reading and writing can proceed in
///  separate tasks.
#[async_trait]
pub trait Transport: TransportReader + TransportWriter {
    /// Performs a TLS handshake over the existing connection, verifying the server as `host`.
    ///  A no-op if the transport is already encrypted.
    async fn upgrade_tls(&mut self, host: &str) -> io::Result<()>;

    fn is_tls(&self) -> bool;

    fn split(self: Box<Self>) -> io::Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>)>;
}

/// Opens transports to servers. This is the seam where tests plug in in-memory connections.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    async fn connect(&self, addr: &ServerAddress) -> io::Result<Box<dyn Transport>>;
}

/// Connects via TCP (upgraded to TLS on demand) or WebSocket, depending on the address' scheme
pub struct DefaultConnector {
    tls_config: Arc<rustls::ClientConfig>,
}
impl DefaultConnector {
    pub fn new(tls_config: Arc<rustls::ClientConfig>) -> DefaultConnector {
        DefaultConnector { tls_config }
    }
}

#[async_trait]
impl TransportConnector for DefaultConnector {
    async fn connect(&self, addr: &ServerAddress) -> io::Result<Box<dyn Transport>> {
        debug!("opening transport to {}", addr);
        if addr.is_websocket() {
            Ok(Box::new(WebSocketTransport::connect(addr, self.tls_config.clone()).await?))
        }
        else {
            Ok(Box::new(StreamTransport::connect_tcp(addr, Some(self.tls_config.clone())).await?))
        }
    }
}
