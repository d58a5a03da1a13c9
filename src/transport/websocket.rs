use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::transport::buffered_reader::{read_exact, read_line, BufferedReader, ByteSource};
use crate::transport::server_address::ServerAddress;
use crate::transport::transport::{Transport, TransportReader, TransportWriter};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [Transport] carrying the protocol's byte stream in binary WebSocket frames. Frame
///  boundaries carry no meaning: a frame may contain several operations or part of one.
pub struct WebSocketTransport {
    stream: Option<WsStream>,
    read_buf: BytesMut,
    secure: bool,
}
impl WebSocketTransport {
    pub async fn connect(addr: &ServerAddress, tls_config: Arc<rustls::ClientConfig>) -> io::Result<WebSocketTransport> {
        let url = addr.ws_url();
        debug!("opening WebSocket connection to {}", url);

        let connector = if addr.requires_tls() { Some(Connector::Rustls(tls_config)) } else { None };
        let (stream, _response) = connect_async_tls_with_config(url, None, true, connector)
            .await
            .map_err(io::Error::other)?;

        Ok(WebSocketTransport {
            stream: Some(stream),
            read_buf: BytesMut::new(),
            secure: addr.requires_tls(),
        })
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "WebSocket is closed")
}

/// Appends the next binary frame's content. Control frames are handled by tungstenite itself,
///  and a close frame counts as end of stream.
async fn fill_from_frames<S>(frames: &mut S, buf: &mut BytesMut) -> io::Result<usize>
where S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin + Send
{
    loop {
        match frames.next().await {
            Some(Ok(Message::Binary(data))) => {
                buf.extend_from_slice(&data);
                if !data.is_empty() {
                    return Ok(data.len());
                }
            }
            Some(Ok(Message::Text(text))) => {
                buf.extend_from_slice(text.as_bytes());
                if !text.is_empty() {
                    return Ok(text.len());
                }
            }
            Some(Ok(Message::Close(frame))) => {
                debug!("WebSocket closed by server: {:?}", frame);
                return Ok(0);
            }
            Some(Ok(other)) => trace!("ignoring WebSocket control frame {:?}", other),
            Some(Err(e)) => return Err(io::Error::other(e)),
            None => return Ok(0),
        }
    }
}

#[async_trait]
impl ByteSource for WsStream {
    async fn fill(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        fill_from_frames(self, buf).await
    }
}

#[async_trait]
impl ByteSource for SplitStream<WsStream> {
    async fn fill(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        fill_from_frames(self, buf).await
    }
}

#[async_trait]
impl TransportReader for WebSocketTransport {
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
impl TransportWriter for WebSocketTransport {
    async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let stream = self.stream.as_mut().ok_or_else(closed_error)?;
        stream.feed(Message::binary(Bytes::copy_from_slice(buf))).await
            .map_err(io::Error::other)
    }

    async fn flush(&mut self) -> io::Result<()> {
        let stream = self.stream.as_mut().ok_or_else(closed_error)?;
        SinkExt::flush(stream).await
            .map_err(io::Error::other)
    }

    async fn close(&mut self) -> io::Result<()> {
        match self.stream.take() {
            Some(mut stream) => stream.close(None).await.map_err(io::Error::other),
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    /// Encryption is negotiated when the WebSocket is opened, so there is nothing to upgrade on a
    ///  `wss` connection and no way to upgrade a `ws` one.
    async fn upgrade_tls(&mut self, _host: &str) -> io::Result<()> {
        if self.secure {
            Ok(())
        }
        else {
            Err(io::Error::new(io::ErrorKind::Unsupported, "server requires TLS, connect with wss:// instead"))
        }
    }

    fn is_tls(&self) -> bool {
        self.secure
    }

    fn split(self: Box<Self>) -> io::Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>)> {
        let WebSocketTransport { stream, read_buf, .. } = *self;
        let (sink, frames) = stream.ok_or_else(closed_error)?.split();
        Ok((
            Box::new(BufferedReader::with_buffer(frames, read_buf)),
            Box::new(WebSocketWriter { sink: Some(sink) }),
        ))
    }
}

pub struct WebSocketWriter {
    sink: Option<SplitSink<WsStream, Message>>,
}

#[async_trait]
impl TransportWriter for WebSocketWriter {
    async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let sink = self.sink.as_mut().ok_or_else(closed_error)?;
        sink.feed(Message::binary(Bytes::copy_from_slice(buf))).await
            .map_err(io::Error::other)
    }

    async fn flush(&mut self) -> io::Result<()> {
        let sink = self.sink.as_mut().ok_or_else(closed_error)?;
        sink.flush().await
            .map_err(io::Error::other)
    }

    async fn close(&mut self) -> io::Result<()> {
        match self.sink.take() {
            Some(mut sink) => sink.close().await.map_err(io::Error::other),
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.sink.is_none()
    }
}
