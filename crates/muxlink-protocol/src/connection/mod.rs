//! The connection core.
//!
//! A [`Connection`] multiplexes up to 16 in-flight messages over one framed
//! socket with three cooperating tokio tasks: the receive loop (frames in,
//! estimators, slot table), the send loop (budgeted priority sends, pings,
//! cancellation), and the dispatch loop (application callbacks). All fatal
//! conditions funnel through `force_close`, whose reason is what
//! [`Connection::wait_close`] returns.

mod dispatch;
mod receive;
mod send;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use muxlink_core::CapabilitySet;
use muxlink_core::MovingAverage;
use muxlink_core::constants::{MAX_HEADER_LEN, MESSAGE_NUMBER_COUNT};

use crate::close::CloseSignal;
use crate::config::TransportConfig;
use crate::dispatch_queue::DispatchQueue;
use crate::error::{ConfigError, SendError};
use crate::event::{CallbackRegistry, MessageEvents};
use crate::message::{Message, OutgoingMessage};
use crate::send_queue::PrioritySendQueue;
use crate::socket::FramedSocket;

/// Outbound throughput assumed until the peer reports a measurement, and the
/// seed of the inbound estimator (bytes per second).
pub const THROUGHPUT_GUESS: i64 = 1_000_000;

/// Round-trip estimate before the first pong (milliseconds).
pub const RTT_GUESS_MS: i64 = 100;

/// Bound on a graceful socket close before it is abandoned.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Protocol phase prior to Closing; Closing and Closed live in [`CloseSignal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// No frame from the peer yet; capabilities unresolved.
    Opening,
    /// Traffic observed (with or without a capability exchange).
    Open,
}

/// Mutable connection state; every lock section is short and await-free.
pub(crate) struct MuxState {
    pub(crate) phase: Phase,
    pub(crate) negotiated: CapabilitySet,
    pub(crate) capabilities_sent: bool,
    pub(crate) send_capabilities: bool,
    pub(crate) send_pong: bool,
    pub(crate) incoming_slots: [Option<Arc<Message>>; MESSAGE_NUMBER_COUNT],
    pub(crate) available_numbers: Vec<u8>,
    pub(crate) cancel_requests: Vec<Arc<OutgoingMessage>>,
    pub(crate) ping_sent_at: Option<Instant>,
    pub(crate) missed_pings: u32,
}

impl MuxState {
    fn new(config: &TransportConfig, send_capabilities: bool) -> MuxState {
        MuxState {
            phase: Phase::Opening,
            negotiated: CapabilitySet::NONE,
            capabilities_sent: false,
            send_capabilities,
            send_pong: false,
            incoming_slots: std::array::from_fn(|_| None),
            available_numbers: (0..config.max_concurrent_messages).rev().collect(),
            cancel_requests: Vec::new(),
            ping_sent_at: None,
            missed_pings: 0,
        }
    }
}

pub(crate) struct Shared<S: FramedSocket> {
    pub(crate) socket: S,
    pub(crate) config: TransportConfig,
    pub(crate) name: String,
    pub(crate) local_capabilities: CapabilitySet,
    pub(crate) close: CloseSignal,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) state: Mutex<MuxState>,
    pub(crate) send_queue: Mutex<PrioritySendQueue>,
    pub(crate) dispatch_queue: Mutex<DispatchQueue>,
    pub(crate) inbound_throughput: Mutex<MovingAverage>,
    pub(crate) local_rtt: Mutex<MovingAverage>,
    pub(crate) remote_rtt_ms: AtomicU32,
    pub(crate) outbound_throughput: AtomicI64,
    pub(crate) bytes_in: AtomicU64,
    pub(crate) bytes_out: AtomicU64,
    pub(crate) send_wake: Notify,
    pub(crate) pong_wake: Notify,
    pub(crate) permit_wake: Notify,
    pub(crate) dispatch_wake: Notify,
    pub(crate) dispatch_started: AtomicBool,
}

impl<S: FramedSocket> Shared<S> {
    pub(crate) fn state(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().expect("connection state lock")
    }

    pub(crate) fn send_queue(&self) -> MutexGuard<'_, PrioritySendQueue> {
        self.send_queue.lock().expect("send queue lock")
    }

    pub(crate) fn dispatch_queue(&self) -> MutexGuard<'_, DispatchQueue> {
        self.dispatch_queue.lock().expect("dispatch queue lock")
    }

    pub(crate) fn slots_occupied(&self) -> usize {
        self.state()
            .incoming_slots
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    /// Queue a message handle for the dispatch loop.
    pub(crate) fn enqueue_dispatch(&self, message: &Arc<Message>) {
        if self.dispatch_queue().enqueue(message) {
            self.dispatch_wake.notify_one();
        }
    }

    /// Hand an outgoing message to the send loop's cancel drain.
    pub(crate) fn queue_cancel(&self, outgoing: &Arc<OutgoingMessage>) {
        if !outgoing.request_cancel() {
            return;
        }
        self.state().cancel_requests.push(outgoing.clone());
        self.send_wake.notify_one();
    }

    /// The local estimates carried in every outgoing control-frame prefix.
    pub(crate) fn estimate_prefix(&self) -> (u16, i32) {
        let rtt = self
            .local_rtt
            .lock()
            .expect("rtt estimator lock")
            .value()
            .clamp(0, u16::MAX as i64) as u16;
        let throughput = self
            .inbound_throughput
            .lock()
            .expect("throughput estimator lock")
            .value()
            .clamp(0, i32::MAX as i64) as i32;
        (rtt, throughput)
    }

    /// Begin closing. Idempotent; the first reason wins. Cancels all
    /// in-progress incoming messages so their registries observe Cancelled
    /// through the dispatch loop, then closes the socket (bounded).
    pub(crate) async fn force_close(&self, reason: &str, wait_for_remote: bool) {
        if !self.close.begin(reason) {
            return;
        }
        tracing::debug!(name = %self.name, reason, "connection: closing");

        let doomed: Vec<Arc<Message>> = {
            let mut state = self.state();
            state.incoming_slots.iter_mut().filter_map(|slot| slot.take()).collect()
        };
        for message in doomed {
            message.mark_cancelled();
            self.enqueue_dispatch(&message);
        }

        if !self.dispatch_started.load(Ordering::SeqCst) {
            // No dispatch loop will ever drain; complete the close here.
            self.close.mark_closed();
        }

        self.send_wake.notify_one();
        self.pong_wake.notify_one();
        self.permit_wake.notify_waiters();
        self.dispatch_wake.notify_one();

        if tokio::time::timeout(CLOSE_TIMEOUT, self.socket.close(reason, wait_for_remote))
            .await
            .is_err()
        {
            tracing::warn!(name = %self.name, "connection: socket close timed out");
        }
    }
}

/// One multiplexed message connection over a framed socket.
///
/// Cheap to clone; all clones drive the same connection. Construction spawns
/// the receive and send loops; the application registers its callbacks and
/// then calls [`begin_dispatch`](Connection::begin_dispatch) exactly once.
pub struct Connection<S: FramedSocket> {
    shared: Arc<Shared<S>>,
}

impl<S: FramedSocket> Clone for Connection<S> {
    fn clone(&self) -> Connection<S> {
        Connection {
            shared: self.shared.clone(),
        }
    }
}

impl<S: FramedSocket> Connection<S> {
    /// Create a connection over `socket` and spawn its receive and send
    /// loops. With `send_capabilities` the connection announces its
    /// capability record proactively (clients); servers wait to see one
    /// first so legacy peers are not confused. Must be called within a tokio
    /// runtime.
    pub fn new(
        socket: S,
        config: TransportConfig,
        name: impl Into<String>,
        send_capabilities: bool,
    ) -> Result<Connection<S>, ConfigError> {
        config.validate()?;
        let name = name.into();
        let samples = config.bandwidth_estimator_samples;

        let shared = Arc::new(Shared {
            socket,
            name,
            local_capabilities: CapabilitySet::local(),
            close: CloseSignal::new(),
            callbacks: CallbackRegistry::new(),
            state: Mutex::new(MuxState::new(&config, send_capabilities)),
            send_queue: Mutex::new(PrioritySendQueue::new(config.priority_levels as usize)),
            dispatch_queue: Mutex::new(DispatchQueue::new()),
            inbound_throughput: Mutex::new(MovingAverage::new(samples, THROUGHPUT_GUESS)),
            local_rtt: Mutex::new(MovingAverage::new(samples, RTT_GUESS_MS)),
            remote_rtt_ms: AtomicU32::new(RTT_GUESS_MS as u32),
            outbound_throughput: AtomicI64::new(THROUGHPUT_GUESS),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            send_wake: Notify::new(),
            pong_wake: Notify::new(),
            permit_wake: Notify::new(),
            dispatch_wake: Notify::new(),
            dispatch_started: AtomicBool::new(false),
            config,
        });

        let receive_shared = shared.clone();
        shared.close.add_task(tokio::spawn(async move {
            if let Err(err) = receive::run(&receive_shared).await {
                tracing::warn!(name = %receive_shared.name, error = %err, "connection: receive loop failed");
                receive_shared.force_close(&err.to_string(), false).await;
            }
        }));

        let send_shared = shared.clone();
        shared.close.add_task(tokio::spawn(async move {
            if let Err(err) = send::run(&send_shared).await {
                tracing::warn!(name = %send_shared.name, error = %err, "connection: send loop failed");
                send_shared.force_close(&err.to_string(), false).await;
            }
        }));

        Ok(Connection { shared })
    }

    /// Register a connection-level callback for the events in `filter`.
    pub fn register_callback(
        &self,
        filter: MessageEvents,
        callback: impl Fn(&Arc<Message>, MessageEvents) + Send + Sync + 'static,
    ) {
        self.shared.callbacks.register(filter, callback);
    }

    /// Start the dispatch loop. Call once, after callbacks are registered; a
    /// second call is a logged no-op.
    pub fn begin_dispatch(&self) {
        if self.shared.dispatch_started.swap(true, Ordering::SeqCst) {
            tracing::warn!(name = %self.shared.name, "connection: dispatch already started");
            return;
        }
        let shared = self.shared.clone();
        self.shared
            .close
            .add_task(tokio::spawn(async move { dispatch::run(&shared).await }));
    }

    /// Queue `message` for sending at `priority` (0 = highest), optionally
    /// with a header carried on each of its descriptors.
    ///
    /// Blocks while all message numbers are in use. An incomplete (still
    /// receiving) message is forwarded incrementally as its bytes arrive.
    pub async fn send_message(
        &self,
        message: Arc<Message>,
        priority: u8,
        header: Option<Vec<u8>>,
    ) -> Result<Arc<OutgoingMessage>, SendError> {
        let shared = &self.shared;
        if priority >= shared.config.priority_levels {
            return Err(SendError::PriorityOutOfRange {
                priority,
                levels: shared.config.priority_levels,
            });
        }
        if let Some(header) = &header
            && header.len() > MAX_HEADER_LEN
        {
            return Err(SendError::HeaderTooLong(header.len()));
        }

        let mut closing = shared.close.subscribe();
        let message_number = loop {
            if shared.close.is_closing() {
                return Err(SendError::Closing);
            }
            if let Some(number) = shared.state().available_numbers.pop() {
                break number;
            }
            tokio::select! {
                _ = shared.permit_wake.notified() => {}
                _ = closing.changed() => {}
            }
        };

        let outgoing = Arc::new(OutgoingMessage::new(
            message.clone(),
            message_number,
            priority,
            header,
        ));

        if !message.is_complete() {
            // Forwarding: new inbound bytes become sendable, and an upstream
            // cancel must travel onward.
            let wake = Arc::downgrade(shared);
            message
                .register_callback(MessageEvents::PAYLOAD_RECEIVED, move |_, _| {
                    if let Some(shared) = wake.upgrade() {
                        shared.send_wake.notify_one();
                    }
                })
                .expect("incoming message accepts payload callbacks");

            let cancel_shared = Arc::downgrade(shared);
            let cancel_target = Arc::downgrade(&outgoing);
            message
                .register_callback(MessageEvents::CANCELLED, move |_, _| {
                    if let (Some(shared), Some(outgoing)) =
                        (cancel_shared.upgrade(), cancel_target.upgrade())
                    {
                        shared.queue_cancel(&outgoing);
                    }
                })
                .expect("incoming message accepts cancel callbacks");

            // The upstream cancel may have landed before those callbacks
            // existed.
            if message.is_cancelled() {
                shared.queue_cancel(&outgoing);
            }
        }

        shared.send_queue().enqueue(outgoing.clone());
        shared.send_wake.notify_one();
        tracing::trace!(
            name = %shared.name,
            number = message_number,
            priority,
            len = message.expected_len(),
            "connection: message queued"
        );
        Ok(outgoing)
    }

    /// Request cancellation of an in-flight send. Non-blocking; cancelling a
    /// fully-sent message is a silent no-op.
    pub fn cancel(&self, outgoing: &Arc<OutgoingMessage>) {
        self.shared.queue_cancel(outgoing);
    }

    /// Close the connection with `reason`. Idempotent; the first caller's
    /// reason is what [`wait_close`](Connection::wait_close) reports.
    pub async fn force_close(&self, reason: &str, wait_for_remote: bool) {
        self.shared.force_close(reason, wait_for_remote).await;
    }

    /// Wait until all pending events have been delivered after closing, and
    /// return the close reason. Also reaps the loop tasks, which exit once
    /// closing is signalled.
    pub async fn wait_close(&self) -> String {
        let reason = self.shared.close.wait_closed().await;
        self.shared.close.join_all().await;
        reason
    }

    /// Round-trip estimate in milliseconds: the smaller of the locally
    /// measured value and the peer's report (local sampling overestimates).
    pub fn rtt_estimate_ms(&self) -> u32 {
        let local = self
            .shared
            .local_rtt
            .lock()
            .expect("rtt estimator lock")
            .value()
            .clamp(0, u32::MAX as i64) as u32;
        local.min(self.shared.remote_rtt_ms.load(Ordering::Relaxed))
    }

    /// Measured inbound throughput in bytes per second.
    pub fn inbound_throughput_estimate(&self) -> i64 {
        self.shared
            .inbound_throughput
            .lock()
            .expect("throughput estimator lock")
            .value()
    }

    /// Outbound throughput in bytes per second, as last reported by the peer.
    pub fn outbound_throughput_estimate(&self) -> i64 {
        self.shared.outbound_throughput.load(Ordering::Relaxed)
    }

    /// Capabilities in force: the intersection negotiated with the peer, or
    /// the empty set before (or without) a capability exchange.
    pub fn negotiated_capabilities(&self) -> CapabilitySet {
        self.shared.state().negotiated
    }

    /// Total bytes received from the socket (control and data frames).
    pub fn bytes_in(&self) -> u64 {
        self.shared.bytes_in.load(Ordering::Relaxed)
    }

    /// Total bytes submitted to the socket (control and data frames).
    pub fn bytes_out(&self) -> u64 {
        self.shared.bytes_out.load(Ordering::Relaxed)
    }

    pub fn is_closing(&self) -> bool {
        self.shared.close.is_closing()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl<S: FramedSocket> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.shared.name)
            .field("closing", &self.is_closing())
            .finish()
    }
}
