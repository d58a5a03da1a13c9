use std::io;

/// Framing errors raised by the wire codec. All of them are fatal for the connection they were
///  raised on: once a frame could not be parsed, the stream position is undefined.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("stream ended in the middle of an operation")]
    UnexpectedEof,
    #[error("payload of {op} is not terminated by CRLF")]
    MissingCrlf { op: &'static str },
    #[error("header block does not start with NATS/1.0")]
    InvalidHeaderPreamble,
    #[error("malformed header line {0:?}")]
    MalformedHeaderLine(String),
    #[error("invalid arguments for {op}: {args:?}")]
    InvalidArguments { op: &'static str, args: String },
    #[error("invalid JSON in {op}: {source}")]
    InvalidJson {
        op: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("control line is not valid UTF-8")]
    InvalidUtf8,
}
impl ProtocolError {
    /// Distinguishes transport failures from malformed data sent by the peer
    pub fn is_io(&self) -> bool {
        matches!(self, ProtocolError::Io(_))
    }

    pub(crate) fn invalid_args(op: &'static str, args: &str) -> ProtocolError {
        ProtocolError::InvalidArguments { op, args: args.to_string() }
    }

    /// A stream ending before a length-prefixed payload was complete is a framing problem, not a
    ///  transport problem
    pub(crate) fn from_read(e: io::Error) -> ProtocolError {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::UnexpectedEof
        }
        else {
            ProtocolError::Io(e)
        }
    }
}
