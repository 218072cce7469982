//! Message entities.
//!
//! A [`Message`] owns one payload buffer and its transfer progress; an
//! [`OutgoingMessage`] wraps a message queued for sending with its wire tag,
//! priority, and send progress. Incoming messages are created by the
//! connection; outgoing ones by the application. For relays, a still-filling
//! incoming message can be handed straight back to `send_message`, and the
//! send side tracks how many received bytes are ready to forward.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use muxlink_core::constants::MAX_MESSAGE_LEN;

use crate::error::{CallbackError, MessageError};
use crate::event::{CallbackRegistry, MessageEvents};

/// Which side of the connection produced the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// One logical message: payload buffer, optional header, transfer progress.
pub struct Message {
    direction: Direction,
    expected_len: usize,
    header: Mutex<Option<Vec<u8>>>,
    payload: RwLock<Vec<u8>>,
    bytes_received: AtomicUsize,
    cancelled: AtomicBool,
    // Dispatch once-flags: NewMessage announced, Complete delivered.
    announced: AtomicBool,
    complete_fired: AtomicBool,
    callbacks: CallbackRegistry,
}

impl Message {
    /// Create an incoming-style message that will be filled to `expected_len`
    /// bytes.
    pub fn with_expected_len(expected_len: usize) -> Result<Arc<Message>, MessageError> {
        if expected_len > MAX_MESSAGE_LEN {
            return Err(MessageError::TooLarge(expected_len));
        }
        Ok(Arc::new(Message {
            direction: Direction::Incoming,
            expected_len,
            header: Mutex::new(None),
            payload: RwLock::new(vec![0u8; expected_len]),
            bytes_received: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            announced: AtomicBool::new(false),
            complete_fired: AtomicBool::new(false),
            callbacks: CallbackRegistry::new(),
        }))
    }

    /// Create an outgoing message from a complete payload.
    pub fn from_payload(payload: Vec<u8>) -> Result<Arc<Message>, MessageError> {
        let expected_len = payload.len();
        if expected_len > MAX_MESSAGE_LEN {
            return Err(MessageError::TooLarge(expected_len));
        }
        Ok(Arc::new(Message {
            direction: Direction::Outgoing,
            expected_len,
            header: Mutex::new(None),
            payload: RwLock::new(payload),
            bytes_received: AtomicUsize::new(expected_len),
            cancelled: AtomicBool::new(false),
            announced: AtomicBool::new(false),
            complete_fired: AtomicBool::new(false),
            callbacks: CallbackRegistry::new(),
        }))
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Full payload length of this message.
    pub fn expected_len(&self) -> usize {
        self.expected_len
    }

    /// The application header, if one arrived with the first data frame.
    pub fn header(&self) -> Option<Vec<u8>> {
        self.header.lock().expect("message header lock").clone()
    }

    pub(crate) fn set_header(&self, header: Vec<u8>) {
        *self.header.lock().expect("message header lock") = Some(header);
    }

    /// Copy of the payload buffer as currently filled.
    pub fn payload(&self) -> Vec<u8> {
        self.payload.read().expect("message payload lock").clone()
    }

    /// Bytes received so far (equals the full length for outgoing messages).
    pub fn bytes_received(&self) -> usize {
        self.bytes_received.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_received() == self.expected_len
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Store a received chunk. Cancelled messages accept no further payload.
    ///
    /// The caller guarantees `offset + data.len() <= expected_len` and that
    /// chunks arrive in increasing offset order.
    pub fn accept_chunk(&self, offset: usize, data: &[u8]) {
        if self.is_cancelled() {
            return;
        }
        let end = offset + data.len();
        {
            let mut payload = self.payload.write().expect("message payload lock");
            payload[offset..end].copy_from_slice(data);
        }
        self.bytes_received.fetch_max(end, Ordering::AcqRel);
        tracing::trace!(offset, len = data.len(), "message: chunk accepted");
    }

    /// Copy `len` payload bytes starting at `offset` into `out`.
    pub(crate) fn copy_range(&self, offset: usize, len: usize, out: &mut Vec<u8>) {
        let payload = self.payload.read().expect("message payload lock");
        out.extend_from_slice(&payload[offset..offset + len]);
    }

    /// Mark cancelled; returns true the first time.
    pub(crate) fn mark_cancelled(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    /// Record that NewMessage has been dispatched; returns true the first time.
    pub(crate) fn mark_announced(&self) -> bool {
        !self.announced.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn was_announced(&self) -> bool {
        self.announced.load(Ordering::Acquire)
    }

    /// Record that Complete has been dispatched; returns true the first time.
    pub(crate) fn mark_complete_fired(&self) -> bool {
        !self.complete_fired.swap(true, Ordering::AcqRel)
    }

    /// Register a message-level callback.
    ///
    /// Outgoing messages never fire events, and NewMessage only exists at
    /// connection level; both registrations are rejected.
    pub fn register_callback(
        &self,
        events: MessageEvents,
        callback: impl Fn(&Arc<Message>, MessageEvents) + Send + Sync + 'static,
    ) -> Result<(), CallbackError> {
        if self.direction == Direction::Outgoing {
            return Err(CallbackError::OutgoingMessage);
        }
        if events.contains(MessageEvents::NEW_MESSAGE) {
            return Err(CallbackError::NewMessageAtMessageLevel);
        }
        self.callbacks.register(events, callback);
        Ok(())
    }

    pub(crate) fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("direction", &self.direction)
            .field("expected_len", &self.expected_len)
            .field("bytes_received", &self.bytes_received())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// An in-flight send: a message plus its wire tag and progress.
pub struct OutgoingMessage {
    message: Arc<Message>,
    message_number: u8,
    priority: u8,
    header: Option<Vec<u8>>,
    bytes_sent: AtomicUsize,
    cancel_requested: AtomicBool,
}

impl OutgoingMessage {
    pub(crate) fn new(
        message: Arc<Message>,
        message_number: u8,
        priority: u8,
        header: Option<Vec<u8>>,
    ) -> OutgoingMessage {
        OutgoingMessage {
            message,
            message_number,
            priority,
            header,
            bytes_sent: AtomicUsize::new(0),
            cancel_requested: AtomicBool::new(false),
        }
    }

    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    /// The 4-bit wire tag this send occupies.
    pub fn message_number(&self) -> u8 {
        self.message_number
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Header carried on this send's descriptors, if any.
    pub fn header(&self) -> Option<&Vec<u8>> {
        self.header.as_ref()
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::Acquire)
    }

    pub(crate) fn add_bytes_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n, Ordering::AcqRel);
    }

    /// Bytes of the full payload still to send.
    pub fn bytes_remaining(&self) -> usize {
        self.message.expected_len().saturating_sub(self.bytes_sent())
    }

    /// Received bytes not yet sent; for a relay this trails the inbound copy.
    pub fn bytes_ready(&self) -> usize {
        self.message.bytes_received().saturating_sub(self.bytes_sent())
    }

    /// Flag this send for cancellation; returns true the first time.
    pub(crate) fn request_cancel(&self) -> bool {
        !self.cancel_requested.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for OutgoingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingMessage")
            .field("message_number", &self.message_number)
            .field("priority", &self.priority)
            .field("bytes_sent", &self.bytes_sent())
            .field("bytes_remaining", &self.bytes_remaining())
            .finish()
    }
}
