use bytes::Bytes;

use crate::protocol::headers::Headers;
use crate::protocol::server_info::{ConnectInfo, ServerInfo};

/// One protocol frame. Client and server operations share a single type: the codec is used in
///  both directions (the in-process test server decodes what the client encodes), and the
///  connection layer rejects operations arriving from the wrong side via
///  [Operation::is_server_originated].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Info(Box<ServerInfo>),
    Connect(Box<ConnectInfo>),
    Pub(PubOp),
    HPub(HPubOp),
    Sub(SubOp),
    Unsub(UnsubOp),
    Msg(MsgOp),
    HMsg(HMsgOp),
    Ping,
    Pong,
    Ok,
    Err(Option<String>),
    /// a control line with an operation name this codec does not know
    Unknown(String),
    /// end of input
    Empty,
}
impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Info(_) => "INFO",
            Operation::Connect(_) => "CONNECT",
            Operation::Pub(_) => "PUB",
            Operation::HPub(_) => "HPUB",
            Operation::Sub(_) => "SUB",
            Operation::Unsub(_) => "UNSUB",
            Operation::Msg(_) => "MSG",
            Operation::HMsg(_) => "HMSG",
            Operation::Ping => "PING",
            Operation::Pong => "PONG",
            Operation::Ok => "+OK",
            Operation::Err(_) => "-ERR",
            Operation::Unknown(_) => "<unknown>",
            Operation::Empty => "<empty>",
        }
    }

    /// Operations a server may legitimately send to a client. PING and PONG flow both ways.
    pub fn is_server_originated(&self) -> bool {
        !matches!(self,
            Operation::Connect(_) |
            Operation::Pub(_) |
            Operation::HPub(_) |
            Operation::Sub(_) |
            Operation::Unsub(_)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PubOp {
    pub subject: String,
    pub reply_to: Option<String>,
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HPubOp {
    pub subject: String,
    pub reply_to: Option<String>,
    pub headers: Headers,
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubOp {
    pub subject: String,
    pub queue_group: Option<String>,
    pub sid: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnsubOp {
    pub sid: u64,
    /// auto-unsubscribe after this many further messages
    pub max_msgs: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MsgOp {
    pub subject: String,
    pub sid: u64,
    pub reply_to: Option<String>,
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HMsgOp {
    pub subject: String,
    pub sid: u64,
    pub reply_to: Option<String>,
    /// size of the header block on the wire, including the terminating blank line
    pub header_bytes: usize,
    /// size of header block plus payload on the wire
    pub total_bytes: usize,
    pub status: Option<u16>,
    pub description: Option<String>,
    pub headers: Option<Headers>,
    pub payload: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::info(Operation::Info(Box::default()), true)]
    #[case::msg(Operation::Msg(MsgOp { subject: "a".to_string(), sid: 1, reply_to: None, payload: Bytes::new() }), true)]
    #[case::ping(Operation::Ping, true)]
    #[case::err(Operation::Err(None), true)]
    #[case::connect(Operation::Connect(Box::default()), false)]
    #[case::publish(Operation::Pub(PubOp { subject: "a".to_string(), reply_to: None, payload: Bytes::new() }), false)]
    #[case::sub(Operation::Sub(SubOp { subject: "a".to_string(), queue_group: None, sid: 1 }), false)]
    #[case::unsub(Operation::Unsub(UnsubOp { sid: 1, max_msgs: None }), false)]
    fn test_is_server_originated(#[case] op: Operation, #[case] expected: bool) {
        assert_eq!(op.is_server_originated(), expected);
    }
}
