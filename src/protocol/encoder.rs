use bytes::{BufMut, BytesMut};

use crate::protocol::headers::{encode_header_block, encoded_len, put_decimal, Headers};
use crate::protocol::operation::Operation;
use crate::protocol::protocol_error::ProtocolError;

/// Appends the wire representation of `op` to `buf`. Numbers and subjects are written
///  directly into the buffer: encoding is on the hot path for every published message.
pub fn encode(op: &Operation, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    match op {
        Operation::Info(info) => {
            buf.put_slice(b"INFO ");
            serde_json::to_writer((&mut *buf).writer(), info)
                .map_err(|source| ProtocolError::InvalidJson { op: "INFO", source })?;
            buf.put_slice(b"\r\n");
        }
        Operation::Connect(connect) => {
            buf.put_slice(b"CONNECT ");
            serde_json::to_writer((&mut *buf).writer(), connect)
                .map_err(|source| ProtocolError::InvalidJson { op: "CONNECT", source })?;
            buf.put_slice(b"\r\n");
        }
        Operation::Pub(p) => {
            buf.reserve(p.subject.len() + p.payload.len() + 32);
            buf.put_slice(b"PUB ");
            buf.put_slice(p.subject.as_bytes());
            put_opt_arg(buf, p.reply_to.as_deref());
            buf.put_u8(b' ');
            put_decimal(buf, p.payload.len() as u64);
            buf.put_slice(b"\r\n");
            buf.put_slice(&p.payload);
            buf.put_slice(b"\r\n");
        }
        Operation::HPub(p) => {
            let headers = if p.headers.is_empty() { None } else { Some(&p.headers) };
            let header_len = encoded_len(None, None, headers);

            buf.reserve(p.subject.len() + header_len + p.payload.len() + 48);
            buf.put_slice(b"HPUB ");
            buf.put_slice(p.subject.as_bytes());
            put_opt_arg(buf, p.reply_to.as_deref());
            put_lengths(buf, header_len, p.payload.len());
            encode_header_block(None, None, headers, buf);
            buf.put_slice(&p.payload);
            buf.put_slice(b"\r\n");
        }
        Operation::Sub(s) => {
            buf.put_slice(b"SUB ");
            buf.put_slice(s.subject.as_bytes());
            put_opt_arg(buf, s.queue_group.as_deref());
            buf.put_u8(b' ');
            put_decimal(buf, s.sid);
            buf.put_slice(b"\r\n");
        }
        Operation::Unsub(u) => {
            buf.put_slice(b"UNSUB ");
            put_decimal(buf, u.sid);
            if let Some(max_msgs) = u.max_msgs {
                buf.put_u8(b' ');
                put_decimal(buf, max_msgs);
            }
            buf.put_slice(b"\r\n");
        }
        Operation::Msg(m) => {
            buf.reserve(m.subject.len() + m.payload.len() + 48);
            buf.put_slice(b"MSG ");
            buf.put_slice(m.subject.as_bytes());
            buf.put_u8(b' ');
            put_decimal(buf, m.sid);
            put_opt_arg(buf, m.reply_to.as_deref());
            buf.put_u8(b' ');
            put_decimal(buf, m.payload.len() as u64);
            buf.put_slice(b"\r\n");
            buf.put_slice(&m.payload);
            buf.put_slice(b"\r\n");
        }
        Operation::HMsg(m) => {
            let description = m.status.and(m.description.as_deref());
            let header_len = encoded_len(m.status, description, m.headers.as_ref());

            buf.reserve(m.subject.len() + header_len + m.payload.len() + 64);
            buf.put_slice(b"HMSG ");
            buf.put_slice(m.subject.as_bytes());
            buf.put_u8(b' ');
            put_decimal(buf, m.sid);
            put_opt_arg(buf, m.reply_to.as_deref());
            put_lengths(buf, header_len, m.payload.len());
            encode_header_block(m.status, description, m.headers.as_ref(), buf);
            buf.put_slice(&m.payload);
            buf.put_slice(b"\r\n");
        }
        Operation::Ping => buf.put_slice(b"PING\r\n"),
        Operation::Pong => buf.put_slice(b"PONG\r\n"),
        Operation::Ok => buf.put_slice(b"+OK\r\n"),
        Operation::Err(msg) => {
            buf.put_slice(b"-ERR");
            if let Some(msg) = msg {
                buf.put_slice(b" '");
                buf.put_slice(msg.as_bytes());
                buf.put_u8(b'\'');
            }
            buf.put_slice(b"\r\n");
        }
        Operation::Unknown(line) => {
            buf.put_slice(line.as_bytes());
            buf.put_slice(b"\r\n");
        }
        Operation::Empty => {}
    }
    Ok(())
}

fn put_opt_arg(buf: &mut BytesMut, arg: Option<&str>) {
    if let Some(arg) = arg {
        buf.put_u8(b' ');
        buf.put_slice(arg.as_bytes());
    }
}

/// ` <header bytes> <total bytes>\r\n`
fn put_lengths(buf: &mut BytesMut, header_len: usize, payload_len: usize) {
    buf.put_u8(b' ');
    put_decimal(buf, header_len as u64);
    buf.put_u8(b' ');
    put_decimal(buf, (header_len + payload_len) as u64);
    buf.put_slice(b"\r\n");
}

/// number of payload bytes a publication counts against a server's max_payload
pub fn publish_size(headers: Option<&Headers>, payload_len: usize) -> usize {
    match headers {
        Some(h) if !h.is_empty() => encoded_len(None, None, Some(h)) + payload_len,
        _ => payload_len,
    }
}
