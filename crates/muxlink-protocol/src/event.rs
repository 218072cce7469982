//! Message life-cycle events and the callback registry.
//!
//! Events travel as a small bitmap so one dispatch can announce several
//! transitions at once (a short message's first dispatch carries
//! NewMessage | PayloadReceived | Complete).

use std::ops::{BitOr, BitOrAssign};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use crate::message::Message;

/// Bitmap of message life-cycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageEvents(u8);

impl MessageEvents {
    pub const NONE: MessageEvents = MessageEvents(0);
    /// First dispatch of an incoming message (connection level only).
    pub const NEW_MESSAGE: MessageEvents = MessageEvents(1);
    /// Payload bytes arrived since the previous dispatch.
    pub const PAYLOAD_RECEIVED: MessageEvents = MessageEvents(2);
    /// The payload is fully present.
    pub const COMPLETE: MessageEvents = MessageEvents(4);
    /// The message was cancelled; terminal, mutually exclusive with COMPLETE.
    pub const CANCELLED: MessageEvents = MessageEvents(8);
    pub const ALL: MessageEvents = MessageEvents(15);

    /// The raw bitmap.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set in `self`.
    pub fn contains(self, other: MessageEvents) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit is shared with `other`.
    pub fn intersects(self, other: MessageEvents) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for MessageEvents {
    type Output = MessageEvents;

    fn bitor(self, rhs: MessageEvents) -> MessageEvents {
        MessageEvents(self.0 | rhs.0)
    }
}

impl BitOrAssign for MessageEvents {
    fn bitor_assign(&mut self, rhs: MessageEvents) {
        self.0 |= rhs.0;
    }
}

/// Callback invoked with the message and the full set of events that occurred.
pub type EventCallback = Arc<dyn Fn(&Arc<Message>, MessageEvents) + Send + Sync>;

struct CallbackEntry {
    filter: MessageEvents,
    callback: EventCallback,
}

/// Ordered set of event callbacks with per-callback event filters.
///
/// A callback fires when its filter intersects the events of a dispatch; it
/// always receives the full event bitmap. Panics inside a callback are caught
/// and logged so application code cannot take down the transport loops.
pub struct CallbackRegistry {
    entries: Mutex<Vec<CallbackEntry>>,
}

impl CallbackRegistry {
    pub fn new() -> CallbackRegistry {
        CallbackRegistry {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Append a callback; registration order is invocation order.
    pub fn register(
        &self,
        filter: MessageEvents,
        callback: impl Fn(&Arc<Message>, MessageEvents) + Send + Sync + 'static,
    ) {
        self.entries
            .lock()
            .expect("callback registry lock")
            .push(CallbackEntry {
                filter,
                callback: Arc::new(callback),
            });
    }

    /// Invoke every callback whose filter intersects `events`.
    pub fn fire(&self, message: &Arc<Message>, events: MessageEvents) {
        if events.is_empty() {
            return;
        }

        // Snapshot under the lock so a callback may register further
        // callbacks without deadlocking.
        let matched: Vec<EventCallback> = self
            .entries
            .lock()
            .expect("callback registry lock")
            .iter()
            .filter(|entry| entry.filter.intersects(events))
            .map(|entry| entry.callback.clone())
            .collect();

        for callback in matched {
            let result = catch_unwind(AssertUnwindSafe(|| callback(message, events)));
            if result.is_err() {
                tracing::error!(events = events.bits(), "event: callback panicked");
            }
        }
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("callback registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CallbackRegistry {
    fn default() -> CallbackRegistry {
        CallbackRegistry::new()
    }
}
