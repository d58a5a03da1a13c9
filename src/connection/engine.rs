use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, debug_span, error, info, trace, warn, Instrument};

use crate::auth::credentials;
use crate::connection::close_signal::CloseSignal;
use crate::connection::connection_config::ConnectionConfig;
use crate::connection::connection_events::{ConnectedData, ConnectionEvent, ConnectionEventNotifier, DisconnectedData};
use crate::connection::connection_state::{CloseReason, ConnectionState, Phase, StateCell};
use crate::connection::writer::{write_loop, WriterCommand};
use crate::error::NatsError;
use crate::messaging::message_dispatcher::MessageDispatcher;
use crate::protocol::decoder::{decode, decode_limited, DEFAULT_MAX_PAYLOAD};
use crate::protocol::encoder::encode;
use crate::protocol::operation::{Operation, UnsubOp};
use crate::protocol::protocol_error::ProtocolError;
use crate::protocol::server_info::{ConnectInfo, ServerInfo};
use crate::transport::server_address::ServerAddress;
use crate::transport::transport::{Transport, TransportConnector, TransportReader, TransportWriter};

/// One connection to one server, from opening the transport to its close reason. An engine is
///  never reused: reconnecting means starting a new engine.
///
/// After the handshake, the connection is served by exactly two tasks: a reader that decodes
///  and dispatches incoming operations, and the writer (see [write_loop]) that all outgoing
///  operations are funneled through.
pub struct ProtocolEngine {
    shared: Arc<EngineShared>,
}

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

struct EngineShared {
    /// unique per process, never 0
    id: u64,
    server: ServerAddress,
    config: Arc<ConnectionConfig>,
    dispatcher: Arc<dyn MessageDispatcher>,
    events: Arc<ConnectionEventNotifier>,
    state: Arc<StateCell>,
    closed: CloseSignal,
    /// set once the reader and writer tasks run
    established: AtomicBool,
    commands: mpsc::Sender<WriterCommand>,
    command_receiver: Mutex<Option<mpsc::Receiver<WriterCommand>>>,
    server_info: ArcSwapOption<ServerInfo>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProtocolEngine {
    pub fn new(
        server: ServerAddress,
        config: Arc<ConnectionConfig>,
        dispatcher: Arc<dyn MessageDispatcher>,
        events: Arc<ConnectionEventNotifier>,
    ) -> ProtocolEngine {
        let (commands, command_receiver) = mpsc::channel(config.write_queue_capacity);
        ProtocolEngine {
            shared: Arc::new(EngineShared {
                id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
                server,
                config,
                dispatcher,
                events,
                state: Arc::new(StateCell::new()),
                closed: CloseSignal::new(),
                established: AtomicBool::new(false),
                commands,
                command_receiver: Mutex::new(Some(command_receiver)),
                server_info: ArcSwapOption::empty(),
                tasks: Default::default(),
            }),
        }
    }

    /// Opens the transport and performs the handshake, bounded by the configured connect timeout.
    ///  On success the connection is `Connected` and served by its reader and writer tasks, on
    ///  failure it is closed and the reason is returned.
    pub async fn start(&self, connector: &dyn TransportConnector) -> Result<Arc<ServerInfo>, CloseReason> {
        let shared = &self.shared;
        if !shared.state.transition(Phase::Idle, Phase::Connecting) {
            warn!(server = %shared.server, "engine was started before");
            return Err(shared.closed.get().unwrap_or(CloseReason::ProtocolError));
        }
        debug!(server = %shared.server, "connecting");

        let handshake = match timeout(shared.config.connect_timeout, shared.handshake(connector)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(server = %shared.server, "handshake did not complete within {:?}", shared.config.connect_timeout);
                Err(CloseReason::IoError)
            }
        };
        let (transport, info) = match handshake {
            Ok(result) => result,
            Err(reason) => {
                shared.shutdown(reason).await;
                return Err(shared.closed.get().unwrap_or(reason));
            }
        };

        let (reader, writer) = match transport.split() {
            Ok(halves) => halves,
            Err(e) => {
                warn!(server = %shared.server, "could not split transport: {}", e);
                shared.shutdown(CloseReason::IoError).await;
                return Err(shared.closed.get().unwrap_or(CloseReason::IoError));
            }
        };
        let commands = shared.command_receiver.lock().take();
        let Some(commands) = commands else {
            shared.shutdown(CloseReason::ProtocolError).await;
            return Err(shared.closed.get().unwrap_or(CloseReason::ProtocolError));
        };

        shared.spawn_tasks(reader, writer, commands);
        shared.established.store(true, Ordering::Release);

        if !shared.state.transition(Phase::Connecting, Phase::Connected) {
            // closed while the handshake was running
            shared.abort_tasks();
            return Err(shared.closed.get().unwrap_or(CloseReason::CleanClose));
        }

        info!(server = %shared.server, server_id = info.server_id, "connected");
        shared.events.send_event(ConnectionEvent::Connected(ConnectedData {
            server: shared.server.to_string(),
            server_id: info.server_id.clone(),
        }));
        Ok(info)
    }

    /// Hands an operation to the writer. Returns once it is queued, not when it is written.
    pub async fn send(&self, op: Operation) -> Result<(), NatsError> {
        self.shared.check_open()?;
        self.shared.commands.send(WriterCommand::Op(op)).await
            .map_err(|_| self.shared.closed_error())
    }

    /// sends a PING, the matching PONG updates the round trip time
    pub async fn ping(&self) -> Result<(), NatsError> {
        self.shared.check_open()?;
        let ping = WriterCommand::Ping { waiter: None, timed_from: Some(tokio::time::Instant::now()) };
        self.shared.commands.send(ping).await
            .map_err(|_| self.shared.closed_error())
    }

    /// Waits until everything sent so far is written and processed by the server
    pub async fn flush(&self) -> Result<(), NatsError> {
        self.shared.flush().await
    }

    /// Unsubscribes all active subscriptions and flushes, without closing the connection
    pub async fn drain(&self, timeout_after: Duration) -> Result<(), NatsError> {
        let shared = &self.shared;
        if !shared.state.transition(Phase::Connected, Phase::Draining) {
            return Err(shared.closed_error());
        }

        let sids = shared.dispatcher.active_sids();
        debug!(server = %shared.server, "draining {} subscriptions", sids.len());
        let drain = async {
            for sid in sids {
                shared.commands.send(WriterCommand::Op(Operation::Unsub(UnsubOp { sid, max_msgs: None }))).await
                    .map_err(|_| shared.closed_error())?;
            }
            shared.flush().await
        };

        match timeout(timeout_after, drain).await {
            Ok(result) => result,
            Err(_) => {
                warn!(server = %shared.server, "drain did not complete within {:?}", timeout_after);
                Err(NatsError::Timeout)
            }
        }
    }

    /// Flushes and closes the connection. Closing an already closed connection does nothing.
    pub async fn close(&self) {
        self.shared.shutdown(CloseReason::CleanClose).await
    }

    /// Closes the connection because the server is shutting down
    pub async fn enter_lame_duck_mode(&self) {
        self.shared.shutdown(CloseReason::LameDuckMode).await
    }

    /// waits for the connection to end
    pub async fn closed(&self) -> CloseReason {
        self.shared.closed.wait().await
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.closed.get()
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.phase()
    }

    pub fn phase_changes(&self) -> watch::Receiver<Phase> {
        self.shared.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.snapshot()
    }

    /// the most recent INFO received from the server
    pub fn server_info(&self) -> Option<Arc<ServerInfo>> {
        self.shared.server_info.load_full()
    }

    pub fn server(&self) -> &ServerAddress {
        &self.shared.server
    }

    /// identifies this connection among all connections the process made
    pub fn id(&self) -> u64 {
        self.shared.id
    }
}

impl EngineShared {
    async fn handshake(&self, connector: &dyn TransportConnector) -> Result<(Box<dyn Transport>, Arc<ServerInfo>), CloseReason> {
        let mut transport = connector.connect(&self.server).await
            .map_err(|e| {
                warn!(server = %self.server, "could not connect: {}", e);
                CloseReason::IoError
            })?;

        match self.negotiate(transport.as_mut()).await {
            Ok(info) => Ok((transport, info)),
            Err(reason) => {
                let _ = transport.close().await;
                Err(reason)
            }
        }
    }

    async fn negotiate(&self, transport: &mut dyn Transport) -> Result<Arc<ServerInfo>, CloseReason> {
        let info = match decode(&mut *transport).await {
            Ok(Operation::Info(info)) => Arc::new(*info),
            Ok(other) => {
                warn!(server = %self.server, "expected INFO from server, got {}", other.name());
                return Err(CloseReason::ProtocolError);
            }
            Err(e) => return Err(self.read_failed(&e)),
        };
        debug!(server_id = info.server_id, version = info.version, headers = info.headers, "received INFO");
        self.server_info.store(Some(info.clone()));

        if info.is_lame_duck() {
            info!(server = %self.server, "server is in lame duck mode, not connecting");
            return Err(CloseReason::LameDuckMode);
        }

        if info.requires_tls() || self.config.tls_required || self.server.requires_tls() {
            debug!(server = %self.server, "upgrading to TLS");
            transport.upgrade_tls(&self.server.host).await
                .map_err(|e| {
                    warn!(server = %self.server, "TLS upgrade failed: {}", e);
                    CloseReason::IoError
                })?;
        }

        let connect = self.connect_info(&info, transport.is_tls()).await?;
        let mut ops = vec![Operation::Connect(Box::new(connect))];
        ops.extend(self.dispatcher.resubscribe_ops(self.id));
        ops.push(Operation::Ping);
        debug!(server = %self.server, "sending CONNECT with {} resubscriptions", ops.len() - 2);
        write_ops(transport, &ops).await?;

        self.await_pong(transport).await?;
        Ok(self.server_info.load_full().unwrap_or(info))
    }

    async fn connect_info(&self, info: &ServerInfo, tls: bool) -> Result<ConnectInfo, CloseReason> {
        let auth = credentials::resolve(self.config.credentials.as_ref(), info.nonce.as_deref(), &self.server).await
            .map_err(|e| {
                error!(server = %self.server, "could not prepare authentication: {:#}", e);
                CloseReason::HandshakeRejected
            })?;

        let mut connect = ConnectInfo::new();
        connect.verbose = self.config.verbose;
        connect.pedantic = self.config.pedantic;
        connect.tls_required = tls;
        connect.name = self.config.name.clone();
        connect.echo = self.config.echo;
        connect.headers = Some(true);
        connect.no_responders = Some(self.config.no_responders && info.headers);
        auth.apply_to(&mut connect);
        Ok(connect)
    }

    /// The server answers the handshake's PING only after processing CONNECT, so its PONG
    ///  confirms the connection. Authorization failures arrive as -ERR instead.
    async fn await_pong(&self, transport: &mut dyn Transport) -> Result<(), CloseReason> {
        loop {
            let op = decode_limited(&mut *transport, self.payload_limit()).await
                .map_err(|e| self.read_failed(&e))?;
            match op {
                Operation::Pong => return Ok(()),
                Operation::Ok => trace!("+OK"),
                Operation::Ping => {
                    self.state.record_server_ping();
                    write_ops(transport, &[Operation::Pong]).await?;
                }
                Operation::Info(info) => {
                    if info.is_lame_duck() {
                        info!(server = %self.server, "server entered lame duck mode during handshake");
                        return Err(CloseReason::LameDuckMode);
                    }
                    self.server_info.store(Some(Arc::new(*info)));
                }
                Operation::Err(msg) => {
                    let msg = msg.unwrap_or_default();
                    warn!(server = %self.server, "server rejected the connection: {}", msg);
                    self.events.send_event(ConnectionEvent::ServerError(msg));
                    return Err(CloseReason::HandshakeRejected);
                }
                Operation::Msg(m) => {
                    self.state.incr_messages_in();
                    self.dispatcher.dispatch(m.into()).await;
                }
                Operation::HMsg(m) => {
                    self.state.incr_messages_in();
                    self.dispatcher.dispatch(m.into()).await;
                }
                Operation::Unknown(line) => {
                    warn!(server = %self.server, "unparseable control line {:?}", line);
                    self.events.send_event(ConnectionEvent::UnparsedControl(line));
                }
                Operation::Empty => {
                    warn!(server = %self.server, "server closed the connection during the handshake");
                    return Err(CloseReason::HandshakeRejected);
                }
                other => {
                    warn!(server = %self.server, "unexpected {} from server during the handshake", other.name());
                    return Err(CloseReason::ProtocolError);
                }
            }
        }
    }

    /// the server never sends more than the max_payload it announced
    fn payload_limit(&self) -> usize {
        match self.server_info.load().as_deref() {
            Some(info) if info.max_payload > 0 => info.max_payload,
            _ => DEFAULT_MAX_PAYLOAD,
        }
    }

    fn read_failed(&self, e: &ProtocolError) -> CloseReason {
        if self.closed.is_completed() {
            debug!(server = %self.server, "read ended after close: {}", e);
        }
        else if e.is_io() {
            warn!(server = %self.server, "read failed: {}", e);
        }
        else {
            error!(server = %self.server, "protocol error: {}", e);
        }

        if e.is_io() {
            CloseReason::IoError
        }
        else {
            CloseReason::ProtocolError
        }
    }

    fn spawn_tasks(
        self: &Arc<Self>,
        reader: Box<dyn TransportReader>,
        writer: Box<dyn TransportWriter>,
        commands: mpsc::Receiver<WriterCommand>,
    ) {
        let reader_task = {
            let shared = self.clone();
            tokio::spawn(async move {
                let reason = read_loop(shared.clone(), reader).await;
                // shutdown aborts this task
                tokio::spawn(async move { shared.shutdown(reason).await });
            })
        };

        let writer_task = {
            let shared = self.clone();
            let span = debug_span!("write_loop", server = %self.server);
            tokio::spawn(async move {
                let result = write_loop(writer, commands, shared.config.clone(), shared.state.clone())
                    .instrument(span)
                    .await;
                if let Err(e) = result {
                    if !shared.closed.is_completed() {
                        warn!(server = %shared.server, "write failed: {}", e);
                    }
                    tokio::spawn(async move { shared.shutdown(CloseReason::IoError).await });
                }
            })
        };

        let mut tasks = self.tasks.lock();
        tasks.push(reader_task);
        tasks.push(writer_task);
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Returns `Some` if the operation ends the connection
    async fn on_operation(&self, op: Operation) -> Option<CloseReason> {
        match op {
            Operation::Msg(m) => {
                self.state.incr_messages_in();
                self.dispatcher.dispatch(m.into()).await;
            }
            Operation::HMsg(m) => {
                self.state.incr_messages_in();
                self.dispatcher.dispatch(m.into()).await;
            }
            Operation::Ping => {
                self.state.record_server_ping();
                if self.commands.send(WriterCommand::Op(Operation::Pong)).await.is_err() {
                    trace!("writer is gone, not answering PING");
                }
            }
            Operation::Pong => {
                if let Some(rtt) = self.state.record_pong() {
                    trace!(?rtt, "PONG");
                }
            }
            Operation::Info(info) => {
                if info.is_lame_duck() {
                    warn!(server = %self.server, "server entered lame duck mode");
                    return Some(CloseReason::LameDuckMode);
                }
                let urls = info.advertised_urls(self.server.is_websocket()).to_vec();
                self.server_info.store(Some(Arc::new(*info)));
                if !urls.is_empty() {
                    debug!(server = %self.server, "server advertised {} cluster addresses", urls.len());
                    self.events.send_event(ConnectionEvent::ServersDiscovered(urls));
                }
            }
            Operation::Ok => trace!("+OK"),
            Operation::Err(msg) => {
                let msg = msg.unwrap_or_default();
                warn!(server = %self.server, "server error: {}", msg);
                self.events.send_event(ConnectionEvent::ServerError(msg));
            }
            Operation::Unknown(line) => {
                warn!(server = %self.server, "unparseable control line {:?}", line);
                self.events.send_event(ConnectionEvent::UnparsedControl(line));
            }
            Operation::Empty => {
                info!(server = %self.server, "server closed the connection");
                return Some(CloseReason::ServerInitiatedClose);
            }
            other => {
                error!(server = %self.server, "server sent client operation {}", other.name());
                return Some(CloseReason::ProtocolError);
            }
        }
        None
    }

    fn check_open(&self) -> Result<(), NatsError> {
        if self.state.phase().is_open() {
            Ok(())
        }
        else {
            Err(self.closed_error())
        }
    }

    fn closed_error(&self) -> NatsError {
        match self.closed.get() {
            Some(reason) => NatsError::ConnectionClosed(reason),
            None => NatsError::NotConnected,
        }
    }

    async fn flush(&self) -> Result<(), NatsError> {
        self.check_open()?;
        let (tx, rx) = oneshot::channel();
        self.commands.send(WriterCommand::Ping { waiter: Some(tx), timed_from: None }).await
            .map_err(|_| self.closed_error())?;
        rx.await
            .map_err(|_| self.closed_error())
    }

    /// Ends the connection. The first reason wins, later calls return immediately.
    ///
    /// Events: only a connection that emitted `Connected` emits `Disconnected`. A lame duck
    ///  server emits `LameDuck` first, so an established connection emits `LameDuck` followed by
    ///  `Disconnected` with reason `LameDuckMode`, while a handshake ending on a lame duck INFO
    ///  emits `LameDuck` alone and leaves the reason to [ProtocolEngine::start]'s result.
    async fn shutdown(&self, reason: CloseReason) {
        if !self.closed.complete(reason) {
            return;
        }
        let established = self.established.load(Ordering::Acquire);

        if reason == CloseReason::LameDuckMode {
            self.state.advance(Phase::LameDuck);
            self.events.send_event(ConnectionEvent::LameDuck { server: self.server.to_string() });
        }
        else {
            self.state.advance(Phase::Closing);
        }

        if established && matches!(reason, CloseReason::CleanClose | CloseReason::LameDuckMode) {
            let (ack, acked) = oneshot::channel();
            let commands = self.commands.clone();
            let graceful = async move {
                if commands.send(WriterCommand::Close(ack)).await.is_ok() {
                    let _ = acked.await;
                }
            };
            if timeout(self.config.connect_timeout, graceful).await.is_err() {
                debug!(server = %self.server, "writer did not finish in time, closing anyway");
            }
        }

        self.abort_tasks();
        self.state.drop_pong_waiters();
        self.state.finish(reason);

        if established {
            self.dispatcher.on_disconnected(reason);
            info!(server = %self.server, ?reason, "disconnected");
            self.events.send_event(ConnectionEvent::Disconnected(DisconnectedData {
                server: self.server.to_string(),
                reason,
            }));
        }
        else if reason == CloseReason::LameDuckMode {
            info!(server = %self.server, "connection attempt ended, server is in lame duck mode");
        }
        else {
            debug!(server = %self.server, ?reason, "connection attempt ended");
        }
    }
}

#[tracing::instrument(name = "read_loop", skip_all, fields(server = %shared.server))]
async fn read_loop(shared: Arc<EngineShared>, mut reader: Box<dyn TransportReader>) -> CloseReason {
    loop {
        let op = match decode_limited(reader.as_mut(), shared.payload_limit()).await {
            Ok(op) => op,
            Err(e) => return shared.read_failed(&e),
        };
        trace!("received {}", op.name());
        if let Some(reason) = shared.on_operation(op).await {
            return reason;
        }
    }
}

async fn write_ops(transport: &mut dyn Transport, ops: &[Operation]) -> Result<(), CloseReason> {
    let mut buf = BytesMut::new();
    for op in ops {
        encode(op, &mut buf)
            .map_err(|e| {
                error!("could not encode {}: {}", op.name(), e);
                CloseReason::ProtocolError
            })?;
    }
    let written = async {
        transport.write(&buf).await?;
        transport.flush().await
    };
    written.await
        .map_err(|e| {
            warn!("write failed during handshake: {}", e);
            CloseReason::IoError
        })
}
