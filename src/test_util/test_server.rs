use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::io::duplex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::protocol::decoder::decode;
use crate::protocol::encoder::encode;
use crate::protocol::headers::STATUS_NO_RESPONDERS;
use crate::protocol::operation::{HMsgOp, MsgOp, Operation};
use crate::protocol::protocol_error::ProtocolError;
use crate::protocol::server_info::{ConnectInfo, ServerInfo};
use crate::transport::server_address::ServerAddress;
use crate::transport::stream_transport::StreamTransport;
use crate::transport::transport::{Transport, TransportConnector, TransportReader, TransportWriter};

const PIPE_CAPACITY: usize = 256 * 1024;

/// INFO as a current server sends it, supporting headers
pub fn test_server_info(server_id: &str) -> ServerInfo {
    ServerInfo {
        server_id: server_id.to_string(),
        server_name: server_id.to_string(),
        version: "2.10.0".to_string(),
        host: "127.0.0.1".to_string(),
        port: 4222,
        headers: true,
        max_payload: 1024 * 1024,
        proto: 1,
        ..Default::default()
    }
}

fn encode_op(op: &Operation) -> io::Result<BytesMut> {
    let mut buf = BytesMut::new();
    encode(op, &mut buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    Ok(buf)
}

/// The server side of an in-memory connection, driven step by step by a test
pub struct ServerPeer {
    pub addr: ServerAddress,
    transport: StreamTransport,
}
impl ServerPeer {
    pub async fn send(&mut self, op: &Operation) -> io::Result<()> {
        let buf = encode_op(op)?;
        self.send_raw(&buf).await
    }

    pub async fn send_raw(&mut self, data: &[u8]) -> io::Result<()> {
        self.transport.write(data).await?;
        self.transport.flush().await
    }

    /// the next operation the client sent, [Operation::Empty] once the client closed
    pub async fn receive(&mut self) -> Result<Operation, ProtocolError> {
        decode(&mut self.transport).await
    }

    /// Sends INFO and plays the server's part of the handshake up to and including the PONG.
    ///  Returns the client's CONNECT and everything it sent between CONNECT and PING.
    pub async fn handshake(&mut self, info: ServerInfo) -> (ConnectInfo, Vec<Operation>) {
        self.send(&Operation::Info(Box::new(info))).await.unwrap();
        let connect = match self.receive().await.unwrap() {
            Operation::Connect(connect) => *connect,
            other => panic!("expected CONNECT, was {:?}", other),
        };

        let mut before_ping = vec![];
        loop {
            match self.receive().await.unwrap() {
                Operation::Ping => break,
                other => before_ping.push(other),
            }
        }
        self.send(&Operation::Pong).await.unwrap();
        (connect, before_ping)
    }

    /// the next operation that is not a PING, answering PINGs along the way
    pub async fn receive_skipping_pings(&mut self) -> Result<Operation, ProtocolError> {
        loop {
            match self.receive().await? {
                Operation::Ping => {
                    self.send(&Operation::Pong).await?;
                }
                other => return Ok(other),
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.transport.close().await;
    }
}

/// A connector handing the server end of each new in-memory connection to the test
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<ServerPeer>,
    refuse: AtomicU32,
    attempts: AtomicU32,
}
impl MemoryConnector {
    pub fn new() -> (Arc<MemoryConnector>, mpsc::UnboundedReceiver<ServerPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = MemoryConnector {
            peers,
            refuse: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        };
        (Arc::new(connector), rx)
    }

    /// the next `n` connection attempts fail as if the server was down
    pub fn refuse_next(&self, n: u32) {
        self.refuse.store(n, Ordering::Release);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1)).is_ok()
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(&self, addr: &ServerAddress) -> io::Result<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        if take_one(&self.refuse) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused by test"));
        }

        let (client, server) = duplex(PIPE_CAPACITY);
        let peer = ServerPeer {
            addr: addr.clone(),
            transport: StreamTransport::new(server, None),
        };
        self.peers.send(peer)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "no server listening"))?;
        Ok(Box::new(StreamTransport::new(client, None)))
    }
}

struct ServerSubscription {
    conn_id: u64,
    sid: u64,
    subject: String,
}

/// An in-process server speaking enough of the protocol for end-to-end tests of the client:
///  handshake, PING / PONG, subscriptions with wildcards, message routing and no-responders
///  replies. Connections are made through its [TransportConnector] implementation.
pub struct TestServer {
    info: Mutex<ServerInfo>,
    reject_auth: AtomicBool,
    refuse: AtomicU32,
    next_conn_id: AtomicU64,
    received: Mutex<Vec<Operation>>,
    subscriptions: Mutex<Vec<ServerSubscription>>,
    connections: Mutex<FxHashMap<u64, mpsc::UnboundedSender<Operation>>>,
    no_responders: Mutex<FxHashMap<u64, bool>>,
}
impl TestServer {
    pub fn new(info: ServerInfo) -> Arc<TestServer> {
        Arc::new(TestServer {
            info: Mutex::new(info),
            reject_auth: AtomicBool::new(false),
            refuse: AtomicU32::new(0),
            next_conn_id: AtomicU64::new(0),
            received: Default::default(),
            subscriptions: Default::default(),
            connections: Default::default(),
            no_responders: Default::default(),
        })
    }

    /// answer every CONNECT with an authorization error
    pub fn set_reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::Release);
    }

    pub fn refuse_next(&self, n: u32) {
        self.refuse.store(n, Ordering::Release);
    }

    pub fn set_info(&self, info: ServerInfo) {
        *self.info.lock() = info;
    }

    /// every operation received from any client, in order
    pub fn received(&self) -> Vec<Operation> {
        self.received.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// sends an operation to every connected client
    pub fn broadcast(&self, op: Operation) {
        for tx in self.connections.lock().values() {
            let _ = tx.send(op.clone());
        }
    }

    /// closes all connections from the server side
    pub fn disconnect_all(&self) {
        debug!("test server dropping all connections");
        self.connections.lock().clear();
        self.subscriptions.lock().clear();
    }

    fn start_connection(self: &Arc<Self>, transport: StreamTransport) -> io::Result<()> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::AcqRel);
        let (mut reader, mut writer) = Box::new(transport).split()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Operation>();
        let _ = tx.send(Operation::Info(Box::new(self.info.lock().clone())));
        self.connections.lock().insert(conn_id, tx);

        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let Ok(buf) = encode_op(&op) else { break };
                if writer.write(&buf).await.is_err() || writer.flush().await.is_err() {
                    break;
                }
            }
            let _ = writer.close().await;
        });

        let server = self.clone();
        tokio::spawn(async move {
            loop {
                match decode(reader.as_mut()).await {
                    Ok(Operation::Empty) | Err(_) => break,
                    Ok(op) => {
                        if !server.on_client_op(conn_id, op) {
                            break;
                        }
                    }
                }
            }
            trace!(conn_id, "test server connection ended");
            server.connections.lock().remove(&conn_id);
            server.subscriptions.lock().retain(|s| s.conn_id != conn_id);
        });
        Ok(())
    }

    fn send_to(&self, conn_id: u64, op: Operation) -> bool {
        match self.connections.lock().get(&conn_id) {
            Some(tx) => tx.send(op).is_ok(),
            None => false,
        }
    }

    /// returns `false` if the connection should be closed
    fn on_client_op(&self, conn_id: u64, op: Operation) -> bool {
        trace!(conn_id, "test server received {:?}", op);
        self.received.lock().push(op.clone());

        match op {
            Operation::Connect(connect) => {
                if self.reject_auth.load(Ordering::Acquire) {
                    self.send_to(conn_id, Operation::Err(Some("Authorization Violation".to_string())));
                    self.connections.lock().remove(&conn_id);
                    return false;
                }
                let no_responders = connect.no_responders.unwrap_or(false) && connect.headers.unwrap_or(false);
                self.no_responders.lock().insert(conn_id, no_responders);
                true
            }
            Operation::Ping => self.send_to(conn_id, Operation::Pong),
            Operation::Sub(sub) => {
                self.subscriptions.lock().push(ServerSubscription {
                    conn_id,
                    sid: sub.sid,
                    subject: sub.subject,
                });
                true
            }
            Operation::Unsub(unsub) => {
                self.subscriptions.lock().retain(|s| !(s.conn_id == conn_id && s.sid == unsub.sid));
                true
            }
            Operation::Pub(p) => {
                self.route(conn_id, &p.subject, p.reply_to, None, p.payload);
                true
            }
            Operation::HPub(p) => {
                self.route(conn_id, &p.subject, p.reply_to, Some(p.headers), p.payload);
                true
            }
            _ => true,
        }
    }

    fn route(&self, from: u64, subject: &str, reply_to: Option<String>, headers: Option<crate::protocol::headers::Headers>, payload: Bytes) {
        let targets = self.subscriptions.lock().iter()
            .filter(|s| subject_matches(&s.subject, subject))
            .map(|s| (s.conn_id, s.sid))
            .collect::<Vec<_>>();

        if targets.is_empty() {
            let wants_status = self.no_responders.lock().get(&from).copied().unwrap_or(false);
            if let (Some(reply_to), true) = (reply_to, wants_status) {
                let inbox = self.subscriptions.lock().iter()
                    .find(|s| s.conn_id == from && subject_matches(&s.subject, &reply_to))
                    .map(|s| s.sid);
                if let Some(sid) = inbox {
                    self.send_to(from, Operation::HMsg(HMsgOp {
                        subject: reply_to,
                        sid,
                        reply_to: None,
                        header_bytes: 0,
                        total_bytes: 0,
                        status: Some(STATUS_NO_RESPONDERS),
                        description: None,
                        headers: None,
                        payload: Bytes::new(),
                    }));
                }
            }
            return;
        }

        for (conn_id, sid) in targets {
            let op = match &headers {
                Some(h) if !h.is_empty() => Operation::HMsg(HMsgOp {
                    subject: subject.to_string(),
                    sid,
                    reply_to: reply_to.clone(),
                    header_bytes: 0,
                    total_bytes: 0,
                    status: None,
                    description: None,
                    headers: Some(h.clone()),
                    payload: payload.clone(),
                }),
                _ => Operation::Msg(MsgOp {
                    subject: subject.to_string(),
                    sid,
                    reply_to: reply_to.clone(),
                    payload: payload.clone(),
                }),
            };
            self.send_to(conn_id, op);
        }
    }
}

/// A connector for [TestServer] must produce a boxed transport per connection, so the server is
///  wrapped in an `Arc` and implements the connector on that
pub struct TestServerConnector(pub Arc<TestServer>);

#[async_trait]
impl TransportConnector for TestServerConnector {
    async fn connect(&self, addr: &ServerAddress) -> io::Result<Box<dyn Transport>> {
        if take_one(&self.0.refuse) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused by test server"));
        }
        trace!("test server accepting connection to {}", addr);
        let (client, server) = duplex(PIPE_CAPACITY);
        self.0.start_connection(StreamTransport::new(server, None))?;
        Ok(Box::new(StreamTransport::new(client, None)))
    }
}

/// subject matching with `*` (one token) and `>` (one or more trailing tokens) wildcards
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
