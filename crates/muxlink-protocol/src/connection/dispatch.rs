//! Dispatch loop.
//!
//! Delivers message events to the message-level registry and then the
//! connection-level registry, one message at a time. The loop outlives
//! Closing just long enough to drain pending events, then the connection is
//! Closed.

use std::sync::Arc;

use crate::connection::Shared;
use crate::event::MessageEvents;
use crate::message::Message;
use crate::socket::FramedSocket;

pub(super) async fn run<S: FramedSocket>(shared: &Arc<Shared<S>>) {
    let mut closing = shared.close.subscribe();

    loop {
        loop {
            let next = shared.dispatch_queue().dequeue();
            let Some(message) = next else { break };
            deliver(shared, &message);
        }

        let drained = shared.close.is_closing()
            && shared.dispatch_queue().is_empty()
            && shared.slots_occupied() == 0;
        if drained {
            break;
        }

        tokio::select! {
            _ = shared.dispatch_wake.notified() => {}
            _ = closing.changed() => {}
        }
    }

    tracing::debug!(name = %shared.name, "connection: closed");
    shared.close.mark_closed();
}

fn deliver<S: FramedSocket>(shared: &Shared<S>, message: &Arc<Message>) {
    let events = if message.is_cancelled() {
        if !message.was_announced() {
            // The application never heard of this message; stay silent.
            tracing::trace!(name = %shared.name, "dispatch: unannounced cancelled message suppressed");
            return;
        }
        MessageEvents::CANCELLED
    } else {
        let mut events = MessageEvents::PAYLOAD_RECEIVED;
        if message.mark_announced() {
            events |= MessageEvents::NEW_MESSAGE;
        }
        if message.is_complete() && message.mark_complete_fired() {
            events |= MessageEvents::COMPLETE;
        }
        events
    };

    tracing::trace!(
        name = %shared.name,
        events = events.bits(),
        bytes = message.bytes_received(),
        "dispatch: delivering events"
    );
    message.callbacks().fire(message, events);
    shared.callbacks.fire(message, events);
}
