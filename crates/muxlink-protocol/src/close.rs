//! Connection close signal.
//!
//! Bundles what every connection needs to shut down: a watch channel that
//! makes the loops runnable when closing starts, a first-caller-wins reason
//! cell, the spawned task handles, and a second flag that flips once the
//! dispatch loop has drained (Closing → Closed).

use std::sync::Mutex;

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub(crate) struct CloseSignal {
    closing_tx: watch::Sender<bool>,
    closing_rx: watch::Receiver<bool>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    reason: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CloseSignal {
    pub fn new() -> CloseSignal {
        let (closing_tx, closing_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);

        CloseSignal {
            closing_tx,
            closing_rx,
            closed_tx,
            closed_rx,
            reason: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// A receiver for `tokio::select!` branches in the loops.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.closing_rx.clone()
    }

    pub fn is_closing(&self) -> bool {
        *self.closing_rx.borrow()
    }

    /// Begin closing with `reason`. Only the first caller's reason is kept;
    /// returns whether this call won.
    pub fn begin(&self, reason: &str) -> bool {
        let mut slot = self.reason.lock().expect("close reason lock");
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason.to_string());
        drop(slot);

        let _ = self.closing_tx.send(true);
        true
    }

    /// The close reason, once closing has begun.
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().expect("close reason lock").clone()
    }

    /// Record that all pending events have been delivered (Closed state).
    pub fn mark_closed(&self) {
        let _ = self.closed_tx.send(true);
    }

    /// Wait for the Closed state and return the close reason.
    pub async fn wait_closed(&self) -> String {
        let mut closed = self.closed_rx.clone();
        // The sender lives in self, so this cannot error while we hold &self.
        let _ = closed.wait_for(|done| *done).await;
        self.reason().unwrap_or_default()
    }

    /// Retain a spawned loop's handle for teardown.
    pub fn add_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().expect("close task lock").push(handle);
    }

    /// Await every retained task, draining the list.
    pub async fn join_all(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .expect("close task lock")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_neither_closing_nor_closed() {
        let signal = CloseSignal::new();
        assert!(!signal.is_closing());
        assert_eq!(signal.reason(), None);
    }

    #[test]
    fn first_reason_wins() {
        let signal = CloseSignal::new();
        assert!(signal.begin("first"));
        assert!(!signal.begin("second"));
        assert!(signal.is_closing());
        assert_eq!(signal.reason().as_deref(), Some("first"));
    }

    #[test]
    fn subscribers_observe_closing() {
        let signal = CloseSignal::new();
        let rx = signal.subscribe();
        assert!(!*rx.borrow());
        signal.begin("done");
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn wait_closed_returns_reason_after_drain() {
        let signal = CloseSignal::new();
        signal.begin("remote went away");
        signal.mark_closed();
        assert_eq!(signal.wait_closed().await, "remote went away");
    }

    #[tokio::test]
    async fn join_all_drains_handles() {
        let signal = CloseSignal::new();
        let rx = signal.subscribe();
        signal.add_task(tokio::spawn(async move {
            let mut rx = rx;
            let _ = rx.wait_for(|closing| *closing).await;
        }));

        signal.begin("shutdown");
        signal.join_all().await;
        assert!(signal.tasks.lock().unwrap().is_empty());
    }
}
