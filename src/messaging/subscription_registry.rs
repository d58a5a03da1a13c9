use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::connection::connection_events::{ConnectionEvent, ConnectionEventNotifier};
use crate::error::NatsError;
use crate::messaging::inbox::SidAllocator;
use crate::messaging::message::Message;
use crate::messaging::op_sink::OpSink;
use crate::messaging::replay_buffer::ReplayBuffer;
use crate::protocol::operation::{Operation, SubOp, UnsubOp};
use crate::util::atomic_map::AtomicMap;

#[derive(Clone, Debug)]
pub struct SubscribeOptions {
    pub queue_group: Option<String>,
    /// Send SUB right away. Otherwise the subscription becomes active when the first consumer
    ///  attaches.
    pub eager: bool,
    /// number of most recent messages replayed to consumers attaching later
    pub replay_buffer: usize,
    /// send UNSUB when the last consumer detaches, after the debounce period
    pub unsubscribe_on_idle: bool,
}
impl Default for SubscribeOptions {
    fn default() -> Self {
        SubscribeOptions {
            queue_group: None,
            eager: true,
            replay_buffer: 0,
            unsubscribe_on_idle: false,
        }
    }
}

pub(crate) struct SubscriptionEntry {
    sid: u64,
    subject: String,
    queue_group: Option<String>,
    unsubscribe_on_idle: bool,
    /// [INACTIVE], [UNSENT], or the id of the connection SUB was sent on. Starting and stopping
    ///  happen under the state lock, while a new connection's handshake claims entries without
    ///  it (see [SubscriptionEntry::claim]).
    wire: AtomicU64,
    state: Mutex<EntryState>,
}

/// no SUB wanted
const INACTIVE: u64 = 0;
/// SUB wanted, but not sent on any connection yet
const UNSENT: u64 = u64::MAX;

impl SubscriptionEntry {
    fn sub_op(&self) -> Operation {
        Operation::Sub(SubOp {
            subject: self.subject.clone(),
            queue_group: self.queue_group.clone(),
            sid: self.sid,
        })
    }

    fn is_active(&self) -> bool {
        self.wire.load(Ordering::Acquire) != INACTIVE
    }

    /// Marks an active subscription as subscribed on `connection`. Returns `false` if it is
    ///  inactive or was subscribed on that connection already, so each connection gets at most
    ///  one SUB per sid.
    fn claim(&self, connection: u64) -> bool {
        self.wire
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |wire| {
                if wire == INACTIVE || wire == connection {
                    None
                }
                else {
                    Some(connection)
                }
            })
            .is_ok()
    }
}

struct EntryState {
    consumers: Vec<(u64, mpsc::Sender<Message>)>,
    stop_timer: Option<JoinHandle<()>>,
    replay: ReplayBuffer<Message>,
    closed: bool,
}

/// All subscriptions of a client, independent of the connection they are currently active on.
///
/// A subscription's demand is the number of attached consumers. Depending on its options, a
///  subscription starts (sends SUB) eagerly or when demand first becomes positive, and stops
///  (sends UNSUB) when demand stays at zero for the debounce period. Starting and stopping are
///  idempotent, so there is never more than one SUB in effect per sid.
pub struct SubscriptionRegistry {
    entries: AtomicMap<u64, Arc<SubscriptionEntry>>,
    sink: Arc<dyn OpSink>,
    sids: Arc<SidAllocator>,
    events: Arc<ConnectionEventNotifier>,
    debounce: Duration,
    consumer_capacity: usize,
    next_consumer_id: AtomicU64,
}
impl SubscriptionRegistry {
    pub fn new(
        sink: Arc<dyn OpSink>,
        sids: Arc<SidAllocator>,
        events: Arc<ConnectionEventNotifier>,
        debounce: Duration,
        consumer_capacity: usize,
    ) -> SubscriptionRegistry {
        SubscriptionRegistry {
            entries: AtomicMap::new(),
            sink,
            sids,
            events,
            debounce,
            consumer_capacity,
            next_consumer_id: AtomicU64::new(0),
        }
    }

    pub async fn subscribe(self: &Arc<Self>, subject: &str, options: SubscribeOptions) -> Subscription {
        let sid = self.sids.next();
        let entry = Arc::new(SubscriptionEntry {
            sid,
            subject: subject.to_string(),
            queue_group: options.queue_group,
            unsubscribe_on_idle: options.unsubscribe_on_idle,
            wire: AtomicU64::new(INACTIVE),
            state: Mutex::new(EntryState {
                consumers: vec![],
                stop_timer: None,
                replay: ReplayBuffer::new(options.replay_buffer),
                closed: false,
            }),
        });
        self.entries.update(|m| {
            m.insert(sid, entry.clone());
        });
        debug!(sid, subject, eager = options.eager, "new subscription");

        if options.eager {
            let _state = entry.state.lock().await;
            self.start_locked(&entry).await;
        }

        Subscription {
            entry,
            registry: self.clone(),
            unsubscribed: false,
        }
    }

    /// Callers must hold the entry's state lock. Without a current connection, nothing is sent:
    ///  the next connection's handshake or [SubscriptionRegistry::catch_up] sends the SUB.
    async fn start_locked(&self, entry: &SubscriptionEntry) {
        if entry.wire.compare_exchange(INACTIVE, UNSENT, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return;
        }
        let Some(connection) = self.sink.current_connection() else {
            debug!(sid = entry.sid, "not connected, SUB deferred until connected");
            return;
        };
        self.send_sub_locked(entry, connection).await;
    }

    /// callers must hold the entry's state lock
    async fn send_sub_locked(&self, entry: &SubscriptionEntry, connection: u64) {
        if !entry.claim(connection) {
            return;
        }
        trace!(sid = entry.sid, connection, "sending SUB");
        if let Err(e) = self.sink.send_op(connection, entry.sub_op()).await {
            // still active: it is part of the replay on the next connection
            debug!(sid = entry.sid, "SUB deferred until reconnect: {}", e);
        }
    }

    /// callers must hold the entry's state lock
    async fn stop_locked(&self, entry: &SubscriptionEntry) {
        let connection = entry.wire.swap(INACTIVE, Ordering::AcqRel);
        if connection == INACTIVE {
            return;
        }
        if connection == UNSENT {
            trace!(sid = entry.sid, "SUB was never sent, no UNSUB needed");
            return;
        }
        // the SUB's connection is gone if this fails, and with it the server side subscription
        trace!(sid = entry.sid, connection, "sending UNSUB");
        if let Err(e) = self.sink.send_op(connection, Operation::Unsub(UnsubOp { sid: entry.sid, max_msgs: None })).await {
            debug!(sid = entry.sid, "UNSUB not sent: {}", e);
        }
    }

    async fn attach(self: &Arc<Self>, entry: &Arc<SubscriptionEntry>) -> Result<MessageStream, NatsError> {
        let mut state = entry.state.lock().await;
        if state.closed {
            return Err(NatsError::SubscriptionClosed);
        }
        if let Some(timer) = state.stop_timer.take() {
            trace!(sid = entry.sid, "consumer attached, cancelling pending unsubscribe");
            timer.abort();
        }

        let (tx, rx) = mpsc::channel(self.consumer_capacity);
        for msg in state.replay.snapshot() {
            let _ = tx.try_send(msg);
        }
        let consumer_id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        state.consumers.push((consumer_id, tx));
        trace!(sid = entry.sid, demand = state.consumers.len(), "consumer attached");

        self.start_locked(entry).await;

        Ok(MessageStream {
            rx,
            consumer_id,
            entry: entry.clone(),
            registry: self.clone(),
            detached: false,
        })
    }

    async fn detach(self: &Arc<Self>, entry: &Arc<SubscriptionEntry>, consumer_id: u64) {
        let mut state = entry.state.lock().await;
        state.consumers.retain(|(id, _)| *id != consumer_id);
        trace!(sid = entry.sid, demand = state.consumers.len(), "consumer detached");

        if state.consumers.is_empty() && !state.closed && entry.unsubscribe_on_idle && entry.is_active() && state.stop_timer.is_none() {
            let registry = self.clone();
            let entry = entry.clone();
            let debounce = self.debounce;
            state.stop_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                registry.stop_if_idle(&entry).await;
            }));
        }
    }

    async fn stop_if_idle(&self, entry: &SubscriptionEntry) {
        let mut state = entry.state.lock().await;
        state.stop_timer = None;
        if state.consumers.is_empty() && !state.closed {
            debug!(sid = entry.sid, "no consumers left, unsubscribing");
            self.stop_locked(entry).await;
        }
    }

    async fn unsubscribe(&self, entry: &SubscriptionEntry) {
        let mut state = entry.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(timer) = state.stop_timer.take() {
            timer.abort();
        }
        // dropping the senders ends the consumers' streams
        state.consumers.clear();
        self.stop_locked(entry).await;
        drop(state);

        self.entries.update(|m| {
            m.remove(&entry.sid);
        });
        debug!(sid = entry.sid, "unsubscribed");
    }

    /// Delivers a message to all consumers of the subscription with the message's sid. Returns
    ///  `false` if there is no such subscription.
    pub async fn deliver(&self, msg: Message) -> bool {
        let Some(entry) = self.entries.get(&msg.sid) else {
            return false;
        };

        let mut state = entry.state.lock().await;
        if state.closed {
            return false;
        }
        if state.replay.capacity() > 0 {
            let _ = state.replay.add(msg.clone());
        }

        let mut slow = false;
        state.consumers.retain(|(_, tx)| {
            match tx.try_send(msg.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    slow = true;
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        if slow {
            warn!(sid = entry.sid, subject = entry.subject, "slow consumer, dropping message");
            self.events.send_event(ConnectionEvent::SlowConsumer { sid: entry.sid });
        }
        true
    }

    /// SUB operations for all active subscriptions not yet subscribed on `connection`, to be
    ///  replayed in its handshake. The returned subscriptions count as subscribed on it.
    pub fn resubscribe_ops(&self, connection: u64) -> Vec<Operation> {
        let mut entries = self.entries.values();
        entries.sort_by_key(|e| e.sid);
        entries.iter()
            .filter(|e| e.claim(connection))
            .map(|e| e.sub_op())
            .collect()
    }

    /// Sends SUB on the now current `connection` for subscriptions started while it was in its
    ///  handshake
    pub async fn catch_up(&self, connection: u64) {
        let mut entries = self.entries.values();
        entries.sort_by_key(|e| e.sid);
        for entry in entries {
            let state = entry.state.lock().await;
            if !state.closed {
                self.send_sub_locked(&entry, connection).await;
            }
        }
    }

    pub fn active_sids(&self) -> Vec<u64> {
        let mut sids = self.entries.values()
            .iter()
            .filter(|e| e.is_active())
            .map(|e| e.sid)
            .collect::<Vec<_>>();
        sids.sort();
        sids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Handle to a subscription. Messages are received by attaching consumers with
///  [Subscription::messages]; the subscription stays in place while the handle lives,
///  independent of consumers coming and going. Dropping the handle unsubscribes like
///  [Subscription::unsubscribe] does, without waiting for it.
pub struct Subscription {
    entry: Arc<SubscriptionEntry>,
    registry: Arc<SubscriptionRegistry>,
    unsubscribed: bool,
}
impl Subscription {
    pub fn sid(&self) -> u64 {
        self.entry.sid
    }

    pub fn subject(&self) -> &str {
        &self.entry.subject
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.entry.queue_group.as_deref()
    }

    /// whether the subscription is started: SUB was sent, or is sent once the client is connected
    pub fn is_active(&self) -> bool {
        self.entry.is_active()
    }

    /// Attaches a new consumer, which receives the replay buffer's content followed by all
    ///  messages arriving from now on
    pub async fn messages(&self) -> Result<MessageStream, NatsError> {
        self.registry.attach(&self.entry).await
    }

    /// Removes the subscription immediately, ending all consumers' streams
    pub async fn unsubscribe(mut self) {
        self.unsubscribed = true;
        self.registry.unsubscribe(&self.entry).await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.unsubscribed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let registry = self.registry.clone();
            let entry = self.entry.clone();
            handle.spawn(async move {
                registry.unsubscribe(&entry).await;
            });
        }
    }
}

/// One consumer of a subscription. Dropping it detaches the consumer, [MessageStream::close]
///  does the same but waits for it to take effect.
pub struct MessageStream {
    rx: mpsc::Receiver<Message>,
    consumer_id: u64,
    entry: Arc<SubscriptionEntry>,
    registry: Arc<SubscriptionRegistry>,
    detached: bool,
}
impl MessageStream {
    /// `None` when the subscription was unsubscribed
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    pub async fn close(mut self) {
        self.detached = true;
        self.registry.detach(&self.entry, self.consumer_id).await;
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let registry = self.registry.clone();
            let entry = self.entry.clone();
            let consumer_id = self.consumer_id;
            handle.spawn(async move {
                registry.detach(&entry, consumer_id).await;
            });
        }
    }
}
