//! Simulated framed-socket pair.
//!
//! Models a bidirectional link with per-direction one-way latency and line
//! rate. Frames serialize through the line one after another (a shared
//! next-idle instant per direction) and arrive after the latency, preserving
//! order — the same queueing an OS socket buffer would exhibit. Built for
//! the end-to-end tests, which drive it under tokio's paused clock.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::SocketError;
use crate::socket::FramedSocket;

/// One direction of a simulated link.
#[derive(Debug, Clone, Copy)]
pub struct SimLink {
    /// One-way propagation delay.
    pub latency: Duration,
    /// Line rate in bytes per second.
    pub throughput: u64,
    /// Silently discard every frame (close notifications still reach the
    /// local side).
    pub drop_frames: bool,
}

impl SimLink {
    pub fn new(latency: Duration, throughput: u64) -> SimLink {
        assert!(throughput > 0, "line rate must be positive");
        SimLink {
            latency,
            throughput,
            drop_frames: false,
        }
    }

    /// A link that delivers nothing, for liveness testing.
    pub fn black_hole() -> SimLink {
        SimLink {
            latency: Duration::ZERO,
            throughput: 1,
            drop_frames: true,
        }
    }

    /// Zero latency at 1 GiB/s; effectively an in-process loopback.
    pub fn fast() -> SimLink {
        SimLink::new(Duration::ZERO, 1 << 30)
    }

    fn transmit_time(&self, len: usize) -> Duration {
        Duration::from_secs_f64(len as f64 / self.throughput as f64)
    }
}

enum SimEvent {
    Frame { deliver_at: Instant, data: Vec<u8> },
    Closed,
}

/// One endpoint of a simulated connection.
pub struct SimSocket {
    link: SimLink,
    peer_tx: mpsc::UnboundedSender<SimEvent>,
    self_tx: mpsc::UnboundedSender<SimEvent>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SimEvent>>,
    next_idle: Mutex<Instant>,
    closed: AtomicBool,
}

/// Create a connected socket pair; `a_to_b` shapes the first socket's sends,
/// `b_to_a` the second's.
pub fn pair(a_to_b: SimLink, b_to_a: SimLink) -> (SimSocket, SimSocket) {
    let (to_b, b_inbox) = mpsc::unbounded_channel();
    let (to_a, a_inbox) = mpsc::unbounded_channel();

    let a = SimSocket {
        link: a_to_b,
        peer_tx: to_b.clone(),
        self_tx: to_a.clone(),
        rx: tokio::sync::Mutex::new(a_inbox),
        next_idle: Mutex::new(Instant::now()),
        closed: AtomicBool::new(false),
    };
    let b = SimSocket {
        link: b_to_a,
        peer_tx: to_a,
        self_tx: to_b,
        rx: tokio::sync::Mutex::new(b_inbox),
        next_idle: Mutex::new(Instant::now()),
        closed: AtomicBool::new(false),
    };
    (a, b)
}

impl FramedSocket for SimSocket {
    async fn receive_frame(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            None | Some(SimEvent::Closed) => Err(SocketError::Closing),
            Some(SimEvent::Frame { deliver_at, data }) => {
                tokio::time::sleep_until(deliver_at).await;
                if data.len() > buf.len() {
                    return Err(SocketError::FrameTooLarge);
                }
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
        }
    }

    async fn send_frame(&self, frame: &[u8]) {
        if self.closed.load(Ordering::SeqCst) || self.link.drop_frames {
            return;
        }

        let deliver_at = {
            let mut next_idle = self.next_idle.lock().expect("sim line lock");
            let start = (*next_idle).max(Instant::now());
            *next_idle = start + self.link.transmit_time(frame.len());
            *next_idle + self.link.latency
        };
        let _ = self.peer_tx.send(SimEvent::Frame {
            deliver_at,
            data: frame.to_vec(),
        });
    }

    async fn close(&self, reason: &str, _wait_for_remote: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::trace!(reason, "sim: socket closed");

        // The local receiver sees the close immediately; the peer after one
        // propagation delay (unless the link eats it).
        let _ = self.self_tx.send(SimEvent::Closed);
        if !self.link.drop_frames {
            let peer_tx = self.peer_tx.clone();
            let latency = self.link.latency;
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                let _ = peer_tx.send(SimEvent::Closed);
            });
        }
    }
}
