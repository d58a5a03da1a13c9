use bytes::{BufMut, BytesMut};

use crate::protocol::protocol_error::ProtocolError;

pub const HEADER_PREAMBLE: &str = "NATS/1.0";

/// Status code a server puts into an otherwise empty reply when a request has no subscribers
pub const STATUS_NO_RESPONDERS: u16 = 503;

/// Message headers: an ordered multimap. Names keep the order of their first insertion, and
///  multiple values per name are kept in the order they were added.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Vec<String>)>,
}
impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    /// adds a value, keeping previous values for the same name
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((name, vec![value])),
        }
    }

    /// replaces all previous values for the name
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, values)) => *values = vec![value],
            None => self.entries.push((name, vec![value])),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        let idx = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(idx).1)
    }

    /// the first value for the name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name)
            .first()
            .map(|s| s.as_str())
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries.iter()
            .find(|(n, _)| n == name)
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter()
            .map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    /// number of distinct names
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl <K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item=(K, V)>>(iter: T) -> Self {
        let mut result = Headers::new();
        for (k, v) in iter {
            result.append(k, v);
        }
        result
    }
}

/// The decoded content of a header block
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    pub status: Option<u16>,
    pub description: Option<String>,
    /// `None` if the block contains no header lines at all
    pub headers: Option<Headers>,
}

pub fn parse_header_block(block: &[u8]) -> Result<HeaderBlock, ProtocolError> {
    let block = std::str::from_utf8(block)
        .map_err(|_| ProtocolError::InvalidUtf8)?;

    let mut lines = block.split("\r\n");
    let status_line = lines.next()
        .ok_or(ProtocolError::InvalidHeaderPreamble)?;
    let rest = status_line.strip_prefix(HEADER_PREAMBLE)
        .ok_or(ProtocolError::InvalidHeaderPreamble)?;
    if !(rest.is_empty() || rest.starts_with(' ') || rest.starts_with('\t')) {
        return Err(ProtocolError::InvalidHeaderPreamble);
    }

    let (status, description) = parse_status(rest.trim())?;

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':')
            .ok_or_else(|| ProtocolError::MalformedHeaderLine(line.to_string()))?;
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(ProtocolError::MalformedHeaderLine(line.to_string()));
        }
        headers.append(name, value.trim());
    }

    Ok(HeaderBlock {
        status,
        description,
        headers: if headers.is_empty() { None } else { Some(headers) },
    })
}

fn parse_status(s: &str) -> Result<(Option<u16>, Option<String>), ProtocolError> {
    if s.is_empty() {
        return Ok((None, None));
    }

    let (code, description) = match s.split_once(char::is_whitespace) {
        Some((code, description)) => (code, description.trim()),
        None => (s, ""),
    };
    let code = code.parse::<u16>()
        .map_err(|_| ProtocolError::InvalidHeaderPreamble)?;
    let description = if description.is_empty() { None } else { Some(description.to_string()) };
    Ok((Some(code), description))
}

/// number of bytes [encode_header_block] will write, for announcing the header size before
///  writing the block itself
pub fn encoded_len(status: Option<u16>, description: Option<&str>, headers: Option<&Headers>) -> usize {
    let mut len = HEADER_PREAMBLE.len();
    if let Some(status) = status {
        len += 1 + decimal_len(status as u64);
        if let Some(description) = description {
            len += 1 + description.len();
        }
    }
    len += 2;
    if let Some(headers) = headers {
        for (name, values) in headers.iter() {
            for value in values {
                len += name.len() + 2 + value.len() + 2;
            }
        }
    }
    len + 2
}

pub fn encode_header_block(status: Option<u16>, description: Option<&str>, headers: Option<&Headers>, buf: &mut BytesMut) {
    buf.put_slice(HEADER_PREAMBLE.as_bytes());
    if let Some(status) = status {
        buf.put_u8(b' ');
        put_decimal(buf, status as u64);
        if let Some(description) = description {
            buf.put_u8(b' ');
            buf.put_slice(description.as_bytes());
        }
    }
    buf.put_slice(b"\r\n");
    if let Some(headers) = headers {
        for (name, values) in headers.iter() {
            for value in values {
                buf.put_slice(name.as_bytes());
                buf.put_slice(b": ");
                buf.put_slice(value.as_bytes());
                buf.put_slice(b"\r\n");
            }
        }
    }
    buf.put_slice(b"\r\n");
}

pub(crate) fn decimal_len(mut n: u64) -> usize {
    let mut len = 1;
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}

/// writes the decimal representation without going through a String
pub(crate) fn put_decimal(buf: &mut BytesMut, mut n: u64) {
    let mut digits = [0u8; 20];
    let mut pos = digits.len();
    loop {
        pos -= 1;
        digits[pos] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    buf.put_slice(&digits[pos..]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_duplicate_names_preserved_in_order() {
        let block = parse_header_block(b"NATS/1.0\r\nA: 1\r\nB: x\r\nA: 2\r\n\r\n").unwrap();
        let headers = block.headers.unwrap();

        assert_eq!(headers.get_all("A"), &["1".to_string(), "2".to_string()]);
        assert_eq!(headers.get("B"), Some("x"));
        assert_eq!(headers.iter().map(|(n, _)| n).collect::<Vec<_>>(), vec!["A", "B"]);
    }

    #[rstest]
    #[case::bare(b"NATS/1.0\r\n\r\n", None, None)]
    #[case::status(b"NATS/1.0 503\r\n\r\n", Some(503), None)]
    #[case::status_description(b"NATS/1.0 408 Request Timeout\r\n\r\n", Some(408), Some("Request Timeout"))]
    #[case::no_trailing_blank_line(b"NATS/1.0 503", Some(503), None)]
    fn test_status_only_has_null_headers(#[case] block: &[u8], #[case] status: Option<u16>, #[case] description: Option<&str>) {
        let parsed = parse_header_block(block).unwrap();
        assert_eq!(parsed.status, status);
        assert_eq!(parsed.description.as_deref(), description);
        assert!(parsed.headers.is_none());
    }

    #[test]
    fn test_values_are_trimmed() {
        let block = parse_header_block(b"NATS/1.0\r\nName:   spaced value \t\r\n\r\n").unwrap();
        assert_eq!(block.headers.unwrap().get("Name"), Some("spaced value"));
    }

    #[rstest]
    #[case::wrong_preamble(b"HTTP/1.1\r\nA: 1\r\n\r\n")]
    #[case::glued_version(b"NATS/1.01\r\n\r\n")]
    #[case::status_not_numeric(b"NATS/1.0 abc\r\n\r\n")]
    fn test_invalid_preamble(#[case] block: &[u8]) {
        assert!(matches!(parse_header_block(block), Err(ProtocolError::InvalidHeaderPreamble)));
    }

    #[rstest]
    #[case::no_colon(b"NATS/1.0\r\nnocolon\r\n\r\n")]
    #[case::empty_name(b"NATS/1.0\r\n: value\r\n\r\n")]
    #[case::space_in_name(b"NATS/1.0\r\nbad name: value\r\n\r\n")]
    fn test_malformed_line(#[case] block: &[u8]) {
        assert!(matches!(parse_header_block(block), Err(ProtocolError::MalformedHeaderLine(_))));
    }

    #[rstest]
    #[case::bare(None, None, None)]
    #[case::status(Some(503), None, None)]
    #[case::description(Some(503), Some("No Responders"), None)]
    #[case::headers(None, None, Some(vec![("A", "1"), ("A", "2"), ("Bb", "")]))]
    fn test_encoded_len_matches_encoding(#[case] status: Option<u16>, #[case] description: Option<&str>, #[case] headers: Option<Vec<(&str, &str)>>) {
        let headers = headers.map(|h| h.into_iter().collect::<Headers>());

        let mut buf = BytesMut::new();
        encode_header_block(status, description, headers.as_ref(), &mut buf);
        assert_eq!(buf.len(), encoded_len(status, description, headers.as_ref()));

        let parsed = parse_header_block(&buf).unwrap();
        assert_eq!(parsed.status, status);
        assert_eq!(parsed.description.as_deref(), description);
        assert_eq!(parsed.headers, headers);
    }

    #[test]
    fn test_insert_replaces_append_accumulates() {
        let mut headers = Headers::new();
        headers.append("A", "1");
        headers.append("A", "2");
        headers.insert("A", "3");
        assert_eq!(headers.get_all("A"), &["3".to_string()]);

        assert_eq!(headers.remove("A"), Some(vec!["3".to_string()]));
        assert!(headers.is_empty());
        assert!(headers.get_all("A").is_empty());
    }

    #[rstest]
    #[case(0, "0")]
    #[case(7, "7")]
    #[case(10, "10")]
    #[case(1048576, "1048576")]
    #[case(u64::MAX, "18446744073709551615")]
    fn test_put_decimal(#[case] n: u64, #[case] expected: &str) {
        let mut buf = BytesMut::new();
        put_decimal(&mut buf, n);
        assert_eq!(&buf[..], expected.as_bytes());
        assert_eq!(decimal_len(n), expected.len());
    }
}
