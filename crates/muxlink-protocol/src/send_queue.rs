//! Per-priority send queue.
//!
//! One FIFO per priority level plus a cached highest-priority cursor, so the
//! scan stays constant-amortized while low-priority bulk traffic saturates
//! the link. The queue is pure state; the send loop drives it.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::message::OutgoingMessage;

pub(crate) struct PrioritySendQueue {
    levels: Vec<VecDeque<Arc<OutgoingMessage>>>,
    /// Lowest index that may hold a non-empty queue.
    cursor: usize,
}

impl PrioritySendQueue {
    pub fn new(priority_levels: usize) -> PrioritySendQueue {
        PrioritySendQueue {
            levels: (0..priority_levels).map(|_| VecDeque::new()).collect(),
            cursor: priority_levels,
        }
    }

    /// Append to the message's priority FIFO and pull the cursor back up.
    pub fn enqueue(&mut self, outgoing: Arc<OutgoingMessage>) {
        let priority = outgoing.priority() as usize;
        self.levels[priority].push_back(outgoing);
        self.cursor = self.cursor.min(priority);
    }

    /// Return the highest-priority message with payload ready, and how many
    /// bytes of it to send (bounded by `max_bytes`).
    ///
    /// A head whose `bytes_ready` is 0 stays queued (a relay's inbound copy
    /// may still be filling) but does not block lower priorities. A message
    /// whose final bytes are being returned is dequeued.
    pub fn next(&mut self, max_bytes: usize) -> Option<(Arc<OutgoingMessage>, usize)> {
        if max_bytes == 0 {
            return None;
        }

        let mut priority = self.cursor;
        while priority < self.levels.len() {
            if self.levels[priority].is_empty() {
                if priority == self.cursor {
                    self.cursor += 1;
                }
                priority += 1;
                continue;
            }

            let head = self.levels[priority].front().expect("non-empty level");
            let ready = head.bytes_ready();
            if ready == 0 {
                // An unsent empty message still needs its (empty) frame on
                // the wire; anything else is waiting for forwarded bytes.
                if head.bytes_remaining() == 0 && head.bytes_sent() == 0 {
                    let head = self.levels[priority].pop_front().expect("non-empty level");
                    return Some((head, 0));
                }
                priority += 1;
                continue;
            }

            let n = ready.min(max_bytes);
            let outgoing = if n == head.bytes_remaining() {
                self.levels[priority].pop_front().expect("non-empty level")
            } else {
                head.clone()
            };
            return Some((outgoing, n));
        }
        None
    }

    /// Remove a cancelled message, preserving the order of the rest.
    /// Returns false if the message is not queued (already fully sent).
    pub fn cancel(&mut self, outgoing: &Arc<OutgoingMessage>) -> bool {
        let level = &mut self.levels[outgoing.priority() as usize];
        match level.iter().position(|queued| Arc::ptr_eq(queued, outgoing)) {
            Some(index) => {
                level.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(VecDeque::is_empty)
    }

    #[cfg(test)]
    pub fn queued_messages(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }
}
