use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Lifecycle of a single connection
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Idle,
    Connecting,
    Connected,
    Draining,
    LameDuck,
    Closing,
    Closed,
    Failed,
}
impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Closed | Phase::Failed)
    }

    /// whether operations can be sent on a connection in this phase
    pub fn is_open(&self) -> bool {
        matches!(self, Phase::Connected | Phase::Draining)
    }
}

/// Why a connection ended. Every connection ends with exactly one reason.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseReason {
    /// the client closed the connection
    CleanClose,
    /// the server closed the connection without sending an error
    ServerInitiatedClose,
    /// the server announced it is shutting down
    LameDuckMode,
    IoError,
    ProtocolError,
    /// the server answered CONNECT with an error, typically an authorization failure
    HandshakeRejected,
}
impl CloseReason {
    /// failures that count towards giving up on reconnecting
    pub fn is_failure(&self) -> bool {
        matches!(self, CloseReason::IoError | CloseReason::HandshakeRejected)
    }

    fn terminal_phase(&self) -> Phase {
        match self {
            CloseReason::CleanClose | CloseReason::ServerInitiatedClose | CloseReason::LameDuckMode => Phase::Closed,
            CloseReason::IoError | CloseReason::ProtocolError | CloseReason::HandshakeRejected => Phase::Failed,
        }
    }
}

/// A point-in-time snapshot of a connection's state
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionState {
    pub phase: Phase,
    pub rtt: Option<Duration>,
    /// when the server last pinged us
    pub last_ping_at: Option<Instant>,
    pub last_pong_at: Option<Instant>,
    pub messages_in: u64,
    pub messages_out: u64,
}

#[derive(Default)]
struct Timings {
    rtt: Option<Duration>,
    last_ping_at: Option<Instant>,
    last_pong_at: Option<Instant>,
}

/// A PING written after the handshake, waiting for its PONG
struct PendingPing {
    waiter: Option<oneshot::Sender<()>>,
    /// set for pings whose round trip is measured
    timed_from: Option<Instant>,
}

/// The mutable state of one connection, shared between the engine's API, its reader task and
///  its writer task
pub(crate) struct StateCell {
    phase: watch::Sender<Phase>,
    timings: Mutex<Timings>,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    /// One entry per PING written after the handshake, in order. PONGs arrive in the same order,
    ///  so each PONG resolves the oldest entry.
    pending_pings: Mutex<VecDeque<PendingPing>>,
}
impl StateCell {
    pub fn new() -> StateCell {
        StateCell {
            phase: watch::Sender::new(Phase::Idle),
            timings: Default::default(),
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            pending_pings: Default::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Moves to a new phase. Terminal phases are final, so this returns `false` without
    ///  changing anything once the connection is closed or failed.
    pub fn advance(&self, to: Phase) -> bool {
        self.phase.send_if_modified(|phase| {
            if phase.is_terminal() || *phase == to {
                false
            }
            else {
                debug!("connection phase {:?} -> {:?}", phase, to);
                *phase = to;
                true
            }
        })
    }

    /// moves from `from` to `to`, returning `false` if the phase was not `from`
    pub fn transition(&self, from: Phase, to: Phase) -> bool {
        self.phase.send_if_modified(|phase| {
            if *phase == from {
                debug!("connection phase {:?} -> {:?}", phase, to);
                *phase = to;
                true
            }
            else {
                false
            }
        })
    }

    pub fn finish(&self, reason: CloseReason) {
        self.advance(reason.terminal_phase());
    }

    /// A PING was written. `waiter` is notified when the matching PONG arrives, and if
    ///  `timed_from` is set, that PONG updates the round trip time.
    pub fn push_pending_ping(&self, waiter: Option<oneshot::Sender<()>>, timed_from: Option<Instant>) {
        self.pending_pings.lock().push_back(PendingPing { waiter, timed_from });
    }

    /// Processes a PONG, returning the round trip time if it answered a timed ping
    pub fn record_pong(&self) -> Option<Duration> {
        let answered = self.pending_pings.lock().pop_front();
        let now = Instant::now();

        let mut timings = self.timings.lock();
        timings.last_pong_at = Some(now);
        let Some(answered) = answered else {
            trace!("PONG without a pending PING");
            return None;
        };
        if let Some(waiter) = answered.waiter {
            let _ = waiter.send(());
        }
        let rtt = answered.timed_from
            .map(|sent| now.saturating_duration_since(sent));
        if rtt.is_some() {
            timings.rtt = rtt;
        }
        rtt
    }

    pub fn record_server_ping(&self) {
        self.timings.lock().last_ping_at = Some(Instant::now());
    }

    pub fn pings_outstanding(&self) -> u32 {
        self.pending_pings.lock().len() as u32
    }

    /// waiters of pings that will never be answered are released, which their receivers see as
    ///  the connection closing
    pub fn drop_pong_waiters(&self) {
        self.pending_pings.lock().clear();
    }

    pub fn incr_messages_in(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_messages_out(&self) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionState {
        let timings = self.timings.lock();
        ConnectionState {
            phase: self.phase(),
            rtt: timings.rtt,
            last_ping_at: timings.last_ping_at,
            last_pong_at: timings.last_pong_at,
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
        }
    }
}
