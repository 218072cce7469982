//! Shared helpers for the end-to-end scenarios.
//!
//! Every scenario runs two or more connections over [`muxlink_protocol::sim`]
//! sockets under tokio's paused clock, so modeled link timing is exact and
//! the tests finish in wall-clock milliseconds.

// Each test binary uses its own slice of these helpers.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tokio::time::Instant;

use muxlink_protocol::sim::SimSocket;
use muxlink_protocol::{Connection, Message, MessageEvents, TransportConfig};

pub type SimConnection = Connection<SimSocket>;

/// A completed message as observed by a connection-level callback.
pub struct CompletedMessage {
    pub payload: Vec<u8>,
    pub header: Option<Vec<u8>>,
}

/// Counters fed by a connection-level callback registered for all events.
#[derive(Default)]
pub struct EventCounters {
    pub new_messages: AtomicUsize,
    pub payload_events: AtomicUsize,
    pub completed: AtomicUsize,
    pub cancelled: AtomicUsize,
    pub last_completed: Mutex<Option<CompletedMessage>>,
    /// Payload lengths in completion order.
    pub completed_lengths: Mutex<Vec<usize>>,
}

impl EventCounters {
    pub fn new_messages(&self) -> usize {
        self.new_messages.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Register an all-events counter callback on `connection`.
pub fn watch_events(connection: &SimConnection) -> Arc<EventCounters> {
    init_logging();
    let counters = Arc::new(EventCounters::default());
    let sink = counters.clone();
    connection.register_callback(MessageEvents::ALL, move |message, events| {
        if events.contains(MessageEvents::NEW_MESSAGE) {
            sink.new_messages.fetch_add(1, Ordering::SeqCst);
        }
        if events.contains(MessageEvents::PAYLOAD_RECEIVED) {
            sink.payload_events.fetch_add(1, Ordering::SeqCst);
        }
        if events.contains(MessageEvents::COMPLETE) {
            sink.completed.fetch_add(1, Ordering::SeqCst);
            sink.completed_lengths
                .lock()
                .unwrap()
                .push(message.expected_len());
            *sink.last_completed.lock().unwrap() = Some(CompletedMessage {
                payload: message.payload(),
                header: message.header(),
            });
        }
        if events.contains(MessageEvents::CANCELLED) {
            sink.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    });
    counters
}

/// A deterministic non-repeating test pattern.
pub fn test_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) >> 3) as u8).collect()
}

/// An outgoing message carrying the test pattern.
pub fn pattern_message(len: usize) -> Arc<Message> {
    Message::from_payload(test_pattern(len)).expect("test message within limits")
}

/// Poll `condition` until it holds or `timeout` of modeled time elapses.
pub async fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// A client/server connection pair over the given sockets, with event
/// counters attached and dispatch running.
pub fn connect(
    client_socket: SimSocket,
    server_socket: SimSocket,
    config: TransportConfig,
) -> (SimConnection, Arc<EventCounters>, SimConnection, Arc<EventCounters>) {
    let client = Connection::new(client_socket, config.clone(), "client", true)
        .expect("valid test config");
    let server =
        Connection::new(server_socket, config, "server", false).expect("valid test config");

    let client_events = watch_events(&client);
    let server_events = watch_events(&server);
    client.begin_dispatch();
    server.begin_dispatch();

    (client, client_events, server, server_events)
}
