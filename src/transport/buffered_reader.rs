use std::io;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, ReadHalf};

use crate::transport::stream_transport::ClientStream;
use crate::transport::transport::TransportReader;

/// Control lines longer than this are treated as a protocol violation rather than buffered
///  without bound. INFO with a large cluster's connect_urls is the longest legitimate line.
pub const MAX_CONTROL_LINE: usize = 1024 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// Something that can append freshly received bytes to a buffer, returning 0 at end of stream
#[async_trait]
pub trait ByteSource: Send {
    async fn fill(&mut self, buf: &mut BytesMut) -> io::Result<usize>;
}

#[async_trait]
impl ByteSource for ClientStream {
    async fn fill(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        buf.reserve(READ_CHUNK);
        self.read_buf(buf).await
    }
}

#[async_trait]
impl ByteSource for ReadHalf<ClientStream> {
    async fn fill(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        buf.reserve(READ_CHUNK);
        self.read_buf(buf).await
    }
}

#[async_trait]
impl<'a> ByteSource for &'a [u8] {
    async fn fill(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        let n = self.len().min(READ_CHUNK);
        buf.extend_from_slice(&self[..n]);
        *self = &self[n..];
        Ok(n)
    }
}

pub async fn read_line<S: ByteSource + ?Sized>(source: &mut S, buf: &mut BytesMut) -> io::Result<Option<Bytes>> {
    let mut searched = 0;
    loop {
        if let Some(pos) = find_crlf(&buf[searched..]) {
            let line = buf.split_to(searched + pos).freeze();
            buf.advance(2);
            return Ok(Some(line));
        }
        // a CR at the very end may be followed by LF in the next chunk
        searched = buf.len().saturating_sub(1);

        if buf.len() > MAX_CONTROL_LINE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "control line exceeds maximum length"));
        }

        if source.fill(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream ended inside a control line"));
        }
    }
}

pub async fn read_exact<S: ByteSource + ?Sized>(source: &mut S, buf: &mut BytesMut, n: usize) -> io::Result<Bytes> {
    while buf.len() < n {
        if source.fill(buf).await? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, format!("stream ended after {} of {} bytes", buf.len(), n)));
        }
    }
    Ok(buf.split_to(n).freeze())
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2)
        .position(|w| w == b"\r\n")
}

/// Read side of a split transport, or a reader over any other byte source
pub struct BufferedReader<S> {
    source: S,
    buf: BytesMut,
}
impl<S: ByteSource> BufferedReader<S> {
    pub fn new(source: S) -> BufferedReader<S> {
        Self::with_buffer(source, BytesMut::new())
    }

    /// continue reading with bytes that were already received but not yet consumed
    pub fn with_buffer(source: S, buf: BytesMut) -> BufferedReader<S> {
        BufferedReader { source, buf }
    }
}

#[async_trait]
impl<S: ByteSource> TransportReader for BufferedReader<S> {
    async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        read_line(&mut self.source, &mut self.buf).await
    }

    async fn read_exact(&mut self, n: usize) -> io::Result<Bytes> {
        read_exact(&mut self.source, &mut self.buf, n).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// hands out data in predefined chunks to exercise boundaries
    struct ChunkedSource(VecDeque<&'static [u8]>);

    #[async_trait]
    impl ByteSource for ChunkedSource {
        async fn fill(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(chunk) => {
                    buf.extend_from_slice(chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }
    }

    #[tokio::test]
    async fn test_read_line_across_chunks() {
        let mut reader = BufferedReader::new(ChunkedSource(VecDeque::from(vec![
            &b"PI"[..], b"NG\r", b"\nPO", b"NG\r\nMSG a 1 3\r\nab", b"c\r\n",
        ])));

        assert_eq!(reader.read_line().await.unwrap().unwrap(), "PING");
        assert_eq!(reader.read_line().await.unwrap().unwrap(), "PONG");
        assert_eq!(reader.read_line().await.unwrap().unwrap(), "MSG a 1 3");
        assert_eq!(reader.read_exact(5).await.unwrap(), "abc\r\n");
        assert!(reader.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_inside_line() {
        let mut reader = BufferedReader::new(&b"PIN"[..]);
        let err = reader.read_line().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_eof_inside_payload() {
        let mut reader = BufferedReader::new(&b"abc"[..]);
        let err = reader.read_exact(10).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let data: &'static [u8] = Box::leak(vec![b'x'; MAX_CONTROL_LINE + READ_CHUNK + 1].into_boxed_slice());
        let mut reader = BufferedReader::new(data);
        let err = reader.read_line().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
