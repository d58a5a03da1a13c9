use bytes::Bytes;

use crate::protocol::headers::{Headers, STATUS_NO_RESPONDERS};
use crate::protocol::operation::{HMsgOp, MsgOp};

/// A message delivered to a subscription or as the reply to a request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub sid: u64,
    pub reply_to: Option<String>,
    pub headers: Option<Headers>,
    /// status code from the header block, set by the server for control replies
    pub status: Option<u16>,
    pub description: Option<String>,
    pub payload: Bytes,
}
impl Message {
    /// the server's reply to a request nobody was subscribed to
    pub fn is_no_responders(&self) -> bool {
        self.status == Some(STATUS_NO_RESPONDERS) && self.payload.is_empty()
    }
}

impl From<MsgOp> for Message {
    fn from(m: MsgOp) -> Self {
        Message {
            subject: m.subject,
            sid: m.sid,
            reply_to: m.reply_to,
            headers: None,
            status: None,
            description: None,
            payload: m.payload,
        }
    }
}

impl From<HMsgOp> for Message {
    fn from(m: HMsgOp) -> Self {
        Message {
            subject: m.subject,
            sid: m.sid,
            reply_to: m.reply_to,
            headers: m.headers,
            status: m.status,
            description: m.description,
            payload: m.payload,
        }
    }
}
