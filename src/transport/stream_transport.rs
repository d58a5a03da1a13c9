use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::transport::buffered_reader::{read_exact, read_line, BufferedReader};
use crate::transport::server_address::ServerAddress;
use crate::transport::transport::{Transport, TransportReader, TransportWriter};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A byte stream that is either plain or has been upgraded to TLS
pub enum ClientStream {
    Plain(Box<dyn AsyncStream>),
    Tls(Box<TlsStream<Box<dyn AsyncStream>>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            ClientStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            ClientStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            ClientStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            ClientStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// [Transport] over any async byte stream: TCP in production, an in-memory duplex in tests
pub struct StreamTransport {
    /// `None` after close, and transiently during a TLS upgrade
    stream: Option<ClientStream>,
    read_buf: BytesMut,
    tls_config: Option<Arc<rustls::ClientConfig>>,
}
impl StreamTransport {
    pub fn new(stream: impl AsyncStream + 'static, tls_config: Option<Arc<rustls::ClientConfig>>) -> StreamTransport {
        StreamTransport {
            stream: Some(ClientStream::Plain(Box::new(stream))),
            read_buf: BytesMut::new(),
            tls_config,
        }
    }

    pub async fn connect_tcp(addr: &ServerAddress, tls_config: Option<Arc<rustls::ClientConfig>>) -> io::Result<StreamTransport> {
        let stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("could not set TCP_NODELAY for {}: {}", addr, e);
        }
        Ok(StreamTransport::new(stream, tls_config))
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport is closed")
}

#[async_trait]
impl TransportReader for StreamTransport {
    async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        let stream = self.stream.as_mut().ok_or_else(closed_error)?;
        read_line(stream, &mut self.read_buf).await
    }

    async fn read_exact(&mut self, n: usize) -> io::Result<Bytes> {
        let stream = self.stream.as_mut().ok_or_else(closed_error)?;
        read_exact(stream, &mut self.read_buf, n).await
    }
}

#[async_trait]
impl TransportWriter for StreamTransport {
    async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let stream = self.stream.as_mut().ok_or_else(closed_error)?;
        stream.write_all(buf).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        let stream = self.stream.as_mut().ok_or_else(closed_error)?;
        stream.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        match self.stream.take() {
            Some(mut stream) => stream.shutdown().await,
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn upgrade_tls(&mut self, host: &str) -> io::Result<()> {
        if self.is_tls() {
            return Ok(());
        }
        let config = self.tls_config.clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "TLS is not configured for this transport"))?;
        if !self.read_buf.is_empty() {
            // the server must wait for the client's TLS handshake after INFO
            return Err(io::Error::new(io::ErrorKind::InvalidData, "unexpected plaintext data before TLS handshake"));
        }
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let plain = match self.stream.take() {
            Some(ClientStream::Plain(plain)) => plain,
            Some(tls) => {
                self.stream = Some(tls);
                return Ok(());
            }
            None => return Err(closed_error()),
        };

        debug!("upgrading connection to {} to TLS", host);
        let tls = TlsConnector::from(config)
            .connect(server_name, plain)
            .await?;
        self.stream = Some(ClientStream::Tls(Box::new(tls)));
        Ok(())
    }

    fn is_tls(&self) -> bool {
        matches!(self.stream, Some(ClientStream::Tls(_)))
    }

    fn split(self: Box<Self>) -> io::Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>)> {
        let StreamTransport { stream, read_buf, .. } = *self;
        let stream = stream.ok_or_else(closed_error)?;

        let (read_half, write_half) = tokio::io::split(stream);
        Ok((
            Box::new(BufferedReader::with_buffer(read_half, read_buf)),
            Box::new(StreamWriter { write_half: Some(write_half) }),
        ))
    }
}

/// Write side of a split [StreamTransport]
pub struct StreamWriter {
    write_half: Option<WriteHalf<ClientStream>>,
}

#[async_trait]
impl TransportWriter for StreamWriter {
    async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let w = self.write_half.as_mut().ok_or_else(closed_error)?;
        w.write_all(buf).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        let w = self.write_half.as_mut().ok_or_else(closed_error)?;
        w.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        match self.write_half.take() {
            Some(mut w) => w.shutdown().await,
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.write_half.is_none()
    }
}
