use bytes::Bytes;
use tracing::trace;

use crate::protocol::headers::parse_header_block;
use crate::protocol::operation::{HMsgOp, HPubOp, MsgOp, Operation, PubOp, SubOp, UnsubOp};
use crate::protocol::protocol_error::ProtocolError;
use crate::transport::transport::TransportReader;

/// Upper bound for payload lengths when the peer announced no limit of its own
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Reads the next operation from the stream, accepting payloads of up to [DEFAULT_MAX_PAYLOAD]
///  bytes. Operation names are matched case-insensitively, and arguments may be separated by
///  any run of spaces or tabs.
///
/// End of input before the first byte of a frame yields [Operation::Empty]. Any malformed frame
///  is returned as an error, after which the stream position is undefined.
pub async fn decode<R: TransportReader + ?Sized>(reader: &mut R) -> Result<Operation, ProtocolError> {
    decode_limited(reader, DEFAULT_MAX_PAYLOAD).await
}

/// Like [decode], but frames announcing more than `max_payload` bytes are rejected as invalid
///  arguments before any of their payload is read.
pub async fn decode_limited<R: TransportReader + ?Sized>(reader: &mut R, max_payload: usize) -> Result<Operation, ProtocolError> {
    let line = match reader.read_line().await.map_err(ProtocolError::from_read)? {
        Some(line) => line,
        None => return Ok(Operation::Empty),
    };
    let line = std::str::from_utf8(&line)
        .map_err(|_| ProtocolError::InvalidUtf8)?;

    let (name, args) = match line.find([' ', '\t']) {
        Some(idx) => (&line[..idx], line[idx..].trim()),
        None => (line, ""),
    };

    if name.eq_ignore_ascii_case("MSG") {
        decode_msg(args, max_payload, reader).await
    }
    else if name.eq_ignore_ascii_case("HMSG") {
        decode_hmsg(args, max_payload, reader).await
    }
    else if name.eq_ignore_ascii_case("PING") {
        Ok(Operation::Ping)
    }
    else if name.eq_ignore_ascii_case("PONG") {
        Ok(Operation::Pong)
    }
    else if name.eq_ignore_ascii_case("+OK") {
        Ok(Operation::Ok)
    }
    else if name.eq_ignore_ascii_case("-ERR") {
        Ok(Operation::Err(decode_err(args)))
    }
    else if name.eq_ignore_ascii_case("INFO") {
        let info = serde_json::from_str(args)
            .map_err(|source| ProtocolError::InvalidJson { op: "INFO", source })?;
        Ok(Operation::Info(Box::new(info)))
    }
    else if name.eq_ignore_ascii_case("CONNECT") {
        let connect = serde_json::from_str(args)
            .map_err(|source| ProtocolError::InvalidJson { op: "CONNECT", source })?;
        Ok(Operation::Connect(Box::new(connect)))
    }
    else if name.eq_ignore_ascii_case("PUB") {
        decode_pub(args, max_payload, reader).await
    }
    else if name.eq_ignore_ascii_case("HPUB") {
        decode_hpub(args, max_payload, reader).await
    }
    else if name.eq_ignore_ascii_case("SUB") {
        decode_sub(args)
    }
    else if name.eq_ignore_ascii_case("UNSUB") {
        decode_unsub(args)
    }
    else {
        trace!("unknown control line {:?}", line);
        Ok(Operation::Unknown(line.to_string()))
    }
}

async fn decode_msg<R: TransportReader + ?Sized>(args: &str, max_payload: usize, reader: &mut R) -> Result<Operation, ProtocolError> {
    let parts = args.split_ascii_whitespace().collect::<Vec<_>>();
    let (subject, sid, reply_to, len) = match parts.as_slice() {
        [subject, sid, len] => (*subject, *sid, None, *len),
        [subject, sid, reply_to, len] => (*subject, *sid, Some(*reply_to), *len),
        _ => return Err(ProtocolError::invalid_args("MSG", args)),
    };
    let sid = parse_num("MSG", sid, args)?;
    let len = parse_len("MSG", len, args, max_payload)?;

    let payload = read_payload("MSG", len, reader).await?;
    Ok(Operation::Msg(MsgOp {
        subject: subject.to_string(),
        sid,
        reply_to: reply_to.map(|s| s.to_string()),
        payload,
    }))
}

async fn decode_hmsg<R: TransportReader + ?Sized>(args: &str, max_payload: usize, reader: &mut R) -> Result<Operation, ProtocolError> {
    let parts = args.split_ascii_whitespace().collect::<Vec<_>>();
    let (subject, sid, reply_to, header_len, total_len) = match parts.as_slice() {
        [subject, sid, header_len, total_len] => (*subject, *sid, None, *header_len, *total_len),
        [subject, sid, reply_to, header_len, total_len] => (*subject, *sid, Some(*reply_to), *header_len, *total_len),
        _ => return Err(ProtocolError::invalid_args("HMSG", args)),
    };
    let sid = parse_num("HMSG", sid, args)?;
    let header_bytes = parse_len("HMSG", header_len, args, max_payload)?;
    let total_bytes = parse_len("HMSG", total_len, args, max_payload)?;
    if header_bytes > total_bytes {
        return Err(ProtocolError::invalid_args("HMSG", args));
    }

    let mut payload = read_payload("HMSG", total_bytes, reader).await?;
    let header_block = payload.split_to(header_bytes);
    let block = parse_header_block(&header_block)?;

    Ok(Operation::HMsg(HMsgOp {
        subject: subject.to_string(),
        sid,
        reply_to: reply_to.map(|s| s.to_string()),
        header_bytes,
        total_bytes,
        status: block.status,
        description: block.description,
        headers: block.headers,
        payload,
    }))
}

async fn decode_pub<R: TransportReader + ?Sized>(args: &str, max_payload: usize, reader: &mut R) -> Result<Operation, ProtocolError> {
    let parts = args.split_ascii_whitespace().collect::<Vec<_>>();
    let (subject, reply_to, len) = match parts.as_slice() {
        [subject, len] => (*subject, None, *len),
        [subject, reply_to, len] => (*subject, Some(*reply_to), *len),
        _ => return Err(ProtocolError::invalid_args("PUB", args)),
    };
    let len = parse_len("PUB", len, args, max_payload)?;

    let payload = read_payload("PUB", len, reader).await?;
    Ok(Operation::Pub(PubOp {
        subject: subject.to_string(),
        reply_to: reply_to.map(|s| s.to_string()),
        payload,
    }))
}

async fn decode_hpub<R: TransportReader + ?Sized>(args: &str, max_payload: usize, reader: &mut R) -> Result<Operation, ProtocolError> {
    let parts = args.split_ascii_whitespace().collect::<Vec<_>>();
    let (subject, reply_to, header_len, total_len) = match parts.as_slice() {
        [subject, header_len, total_len] => (*subject, None, *header_len, *total_len),
        [subject, reply_to, header_len, total_len] => (*subject, Some(*reply_to), *header_len, *total_len),
        _ => return Err(ProtocolError::invalid_args("HPUB", args)),
    };
    let header_len = parse_len("HPUB", header_len, args, max_payload)?;
    let total_len = parse_len("HPUB", total_len, args, max_payload)?;
    if header_len > total_len {
        return Err(ProtocolError::invalid_args("HPUB", args));
    }

    let mut payload = read_payload("HPUB", total_len, reader).await?;
    let header_block = payload.split_to(header_len);
    let block = parse_header_block(&header_block)?;

    Ok(Operation::HPub(HPubOp {
        subject: subject.to_string(),
        reply_to: reply_to.map(|s| s.to_string()),
        headers: block.headers.unwrap_or_default(),
        payload,
    }))
}

fn decode_sub(args: &str) -> Result<Operation, ProtocolError> {
    let parts = args.split_ascii_whitespace().collect::<Vec<_>>();
    let (subject, queue_group, sid) = match parts.as_slice() {
        [subject, sid] => (*subject, None, *sid),
        [subject, queue_group, sid] => (*subject, Some(*queue_group), *sid),
        _ => return Err(ProtocolError::invalid_args("SUB", args)),
    };
    Ok(Operation::Sub(SubOp {
        subject: subject.to_string(),
        queue_group: queue_group.map(|s| s.to_string()),
        sid: parse_num("SUB", sid, args)?,
    }))
}

fn decode_unsub(args: &str) -> Result<Operation, ProtocolError> {
    let parts = args.split_ascii_whitespace().collect::<Vec<_>>();
    let (sid, max_msgs) = match parts.as_slice() {
        [sid] => (*sid, None),
        [sid, max_msgs] => (*sid, Some(*max_msgs)),
        _ => return Err(ProtocolError::invalid_args("UNSUB", args)),
    };
    Ok(Operation::Unsub(UnsubOp {
        sid: parse_num("UNSUB", sid, args)?,
        max_msgs: match max_msgs {
            Some(n) => Some(parse_num("UNSUB", n, args)?),
            None => None,
        },
    }))
}

/// servers quote the error text in single quotes
fn decode_err(args: &str) -> Option<String> {
    let text = args.trim();
    let text = text.strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(text)
        .trim();
    if text.is_empty() {
        None
    }
    else {
        Some(text.to_string())
    }
}

fn parse_num(op: &'static str, s: &str, args: &str) -> Result<u64, ProtocolError> {
    s.parse::<u64>()
        .map_err(|_| ProtocolError::invalid_args(op, args))
}

fn parse_len(op: &'static str, s: &str, args: &str, max_payload: usize) -> Result<usize, ProtocolError> {
    let len = usize::try_from(parse_num(op, s, args)?)
        .map_err(|_| ProtocolError::invalid_args(op, args))?;
    if len > max_payload {
        trace!("{} announces {} bytes, more than the limit of {}", op, len, max_payload);
        return Err(ProtocolError::invalid_args(op, args));
    }
    Ok(len)
}

/// reads `len` bytes followed by the CRLF terminating every payload
async fn read_payload<R: TransportReader + ?Sized>(op: &'static str, len: usize, reader: &mut R) -> Result<Bytes, ProtocolError> {
    let framed_len = len.checked_add(2)
        .ok_or(ProtocolError::MissingCrlf { op })?;
    let mut data = reader.read_exact(framed_len).await
        .map_err(ProtocolError::from_read)?;
    let terminator = data.split_off(len);
    if terminator != b"\r\n"[..] {
        return Err(ProtocolError::MissingCrlf { op });
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::headers::Headers;
    use crate::transport::buffered_reader::BufferedReader;
    use rstest::rstest;

    async fn decode_all(data: &'static [u8]) -> Result<Vec<Operation>, ProtocolError> {
        let mut reader = BufferedReader::new(data);
        let mut result = vec![];
        loop {
            match decode(&mut reader).await? {
                Operation::Empty => return Ok(result),
                op => result.push(op),
            }
        }
    }

    async fn decode_one(data: &'static [u8]) -> Result<Operation, ProtocolError> {
        let mut reader = BufferedReader::new(data);
        decode(&mut reader).await
    }

    fn msg(subject: &str, sid: u64, reply_to: Option<&str>, payload: &'static [u8]) -> Operation {
        Operation::Msg(MsgOp {
            subject: subject.to_string(),
            sid,
            reply_to: reply_to.map(|s| s.to_string()),
            payload: Bytes::from_static(payload),
        })
    }

    #[rstest]
    #[case::ping(b"PING\r\n", Operation::Ping)]
    #[case::ping_lower(b"ping\r\n", Operation::Ping)]
    #[case::pong(b"PONG\r\n", Operation::Pong)]
    #[case::ok(b"+OK\r\n", Operation::Ok)]
    #[case::err_quoted(b"-ERR 'Authorization Violation'\r\n", Operation::Err(Some("Authorization Violation".to_string())))]
    #[case::err_unquoted(b"-ERR Unknown Protocol Operation\r\n", Operation::Err(Some("Unknown Protocol Operation".to_string())))]
    #[case::err_empty(b"-ERR\r\n", Operation::Err(None))]
    #[case::msg(b"MSG foo.bar 9 11\r\nHello World\r\n", msg("foo.bar", 9, None, b"Hello World"))]
    #[case::msg_reply(b"MSG foo.bar 9 GREETING.34 11\r\nHello World\r\n", msg("foo.bar", 9, Some("GREETING.34"), b"Hello World"))]
    #[case::msg_mixed_case_tabs(b"mSg\tfoo  9 \t 2\r\nhi\r\n", msg("foo", 9, None, b"hi"))]
    #[case::msg_empty_payload(b"MSG foo 1 0\r\n\r\n", msg("foo", 1, None, b""))]
    #[case::msg_payload_with_crlf(b"MSG foo 1 4\r\n\r\n\r\n\r\n", msg("foo", 1, None, b"\r\n\r\n"))]
    #[case::unknown(b"FOO bar\r\n", Operation::Unknown("FOO bar".to_string()))]
    #[case::sub(b"SUB foo 1\r\n", Operation::Sub(SubOp { subject: "foo".to_string(), queue_group: None, sid: 1 }))]
    #[case::sub_queue(b"SUB foo workers 1\r\n", Operation::Sub(SubOp { subject: "foo".to_string(), queue_group: Some("workers".to_string()), sid: 1 }))]
    #[case::unsub(b"UNSUB 5\r\n", Operation::Unsub(UnsubOp { sid: 5, max_msgs: None }))]
    #[case::unsub_max(b"UNSUB 5 10\r\n", Operation::Unsub(UnsubOp { sid: 5, max_msgs: Some(10) }))]
    #[case::publish(b"PUB foo reply 3\r\nabc\r\n", Operation::Pub(PubOp { subject: "foo".to_string(), reply_to: Some("reply".to_string()), payload: Bytes::from_static(b"abc") }))]
    #[tokio::test]
    async fn test_decode(#[case] data: &'static [u8], #[case] expected: Operation) {
        assert_eq!(decode_one(data).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_decode_empty_stream() {
        assert_eq!(decode_one(b"").await.unwrap(), Operation::Empty);
    }

    #[tokio::test]
    async fn test_decode_info() {
        let op = decode_one(b"INFO {\"server_id\":\"x\",\"headers\":true,\"max_payload\":1024,\"connect_urls\":[\"a:4222\"],\"future\":1}\r\n").await.unwrap();
        match op {
            Operation::Info(info) => {
                assert_eq!(info.server_id, "x");
                assert!(info.headers);
                assert_eq!(info.max_payload, 1024);
                assert_eq!(info.connect_urls, Some(vec!["a:4222".to_string()]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decode_hmsg_with_duplicate_headers() {
        let op = decode_one(b"HMSG foo 3 reply 30 35\r\nNATS/1.0\r\nA: 1\r\nB: 2\r\nA: 3\r\n\r\nhello\r\n").await.unwrap();
        match op {
            Operation::HMsg(m) => {
                assert_eq!(m.subject, "foo");
                assert_eq!(m.sid, 3);
                assert_eq!(m.reply_to.as_deref(), Some("reply"));
                assert_eq!(m.header_bytes, 30);
                assert_eq!(m.total_bytes, 35);
                assert_eq!(m.payload, "hello");
                let headers = m.headers.unwrap();
                assert_eq!(headers.get_all("A"), &["1".to_string(), "3".to_string()]);
                assert_eq!(headers.get("B"), Some("2"));
                assert_eq!(m.status, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decode_hmsg_status_only() {
        let op = decode_one(b"HMSG _INBOX.x 7 16 16\r\nNATS/1.0 503\r\n\r\n\r\n").await.unwrap();
        match op {
            Operation::HMsg(m) => {
                assert_eq!(m.status, Some(503));
                assert!(m.headers.is_none());
                assert!(m.payload.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decode_hpub_without_headers_yields_empty_map() {
        let op = decode_one(b"HPUB foo 12 14\r\nNATS/1.0\r\n\r\nhi\r\n").await.unwrap();
        assert_eq!(op, Operation::HPub(HPubOp {
            subject: "foo".to_string(),
            reply_to: None,
            headers: Headers::new(),
            payload: Bytes::from_static(b"hi"),
        }));
    }

    #[tokio::test]
    async fn test_decode_sequence() {
        let ops = decode_all(b"PING\r\nMSG a 1 1\r\nx\r\nPONG\r\n").await.unwrap();
        assert_eq!(ops, vec![Operation::Ping, msg("a", 1, None, b"x"), Operation::Pong]);
    }

    #[rstest]
    #[case::truncated_payload(b"MSG foo 1 10\r\nabc")]
    #[case::truncated_line(b"MSG foo 1")]
    #[case::truncated_crlf(b"MSG foo 1 3\r\nabc")]
    #[tokio::test]
    async fn test_decode_truncated_is_fatal(#[case] data: &'static [u8]) {
        assert!(matches!(decode_one(data).await, Err(ProtocolError::UnexpectedEof)));
    }

    #[rstest]
    #[case::msg_too_few(b"MSG foo 3\r\n")]
    #[case::msg_too_many(b"MSG a b c d e\r\n")]
    #[case::msg_bad_len(b"MSG foo 1 x\r\n")]
    #[case::msg_bad_sid(b"MSG foo abc 1\r\nx\r\n")]
    #[case::hmsg_header_larger_than_total(b"HMSG foo 1 20 10\r\n")]
    #[case::unsub_no_sid(b"UNSUB\r\n")]
    #[tokio::test]
    async fn test_decode_invalid_arguments(#[case] data: &'static [u8]) {
        assert!(matches!(decode_one(data).await, Err(ProtocolError::InvalidArguments { .. })));
    }

    #[rstest]
    #[case::msg_len_overflows(b"MSG foo 1 18446744073709551615\r\n")]
    #[case::msg_len_beyond_u64(b"MSG foo 1 99999999999999999999999\r\n")]
    #[case::msg_len_over_limit(b"MSG foo 1 67108865\r\n")]
    #[case::hmsg_total_overflows(b"HMSG foo 1 12 18446744073709551615\r\n")]
    #[case::hmsg_header_over_limit(b"HMSG foo 1 67108865 67108866\r\n")]
    #[case::hpub_len_overflows(b"HPUB foo 12 18446744073709551615\r\n")]
    #[case::pub_len_overflows(b"PUB foo 18446744073709551615\r\n")]
    #[tokio::test]
    async fn test_decode_rejects_oversized_lengths(#[case] data: &'static [u8]) {
        assert!(matches!(decode_one(data).await, Err(ProtocolError::InvalidArguments { .. })));
    }

    #[tokio::test]
    async fn test_decode_limited_uses_given_limit() {
        let mut reader = BufferedReader::new(&b"MSG foo 1 5\r\nhello\r\nMSG foo 1 6\r\nhello!\r\n"[..]);
        assert_eq!(decode_limited(&mut reader, 5).await.unwrap(), msg("foo", 1, None, b"hello"));
        assert!(matches!(decode_limited(&mut reader, 5).await, Err(ProtocolError::InvalidArguments { op: "MSG", .. })));
    }

    #[tokio::test]
    async fn test_decode_payload_at_limit() {
        let mut reader = BufferedReader::new(&b"HMSG foo 1 12 14\r\nNATS/1.0\r\n\r\nhi\r\n"[..]);
        assert!(matches!(decode_limited(&mut reader, 14).await, Ok(Operation::HMsg(_))));
    }

    #[tokio::test]
    async fn test_decode_missing_crlf() {
        assert!(matches!(decode_one(b"MSG foo 1 3\r\nabcde\r\n").await, Err(ProtocolError::MissingCrlf { op: "MSG" })));
    }

    #[tokio::test]
    async fn test_decode_invalid_json() {
        assert!(matches!(decode_one(b"INFO {not json\r\n").await, Err(ProtocolError::InvalidJson { op: "INFO", .. })));
    }

    #[tokio::test]
    async fn test_decode_bad_header_preamble() {
        assert!(matches!(decode_one(b"HMSG foo 1 12 12\r\nHTTP/1.1\r\n\r\n\r\n").await, Err(ProtocolError::InvalidHeaderPreamble)));
    }
}
