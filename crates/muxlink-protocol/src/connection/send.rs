//! Send loop.
//!
//! Paces outbound data with a byte budget recomputed every
//! `target_responsiveness` tick from the peer-reported throughput, so little
//! more than one tick's worth of data ever queues below the transport and a
//! priority switch takes effect within a tick. Also owns pong and capability
//! emission, the cancel drain, and jittered liveness pings.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use muxlink_core::constants::MAX_GROUP_DESCRIPTORS;
use muxlink_core::frame::{ControlFrame, DataFrameDescriptor, FrameBody};

use crate::config::TransportConfig;
use crate::connection::{Shared, THROUGHPUT_GUESS};
use crate::error::ConnectionError;
use crate::socket::FramedSocket;

pub(super) async fn run<S: FramedSocket>(shared: &Arc<Shared<S>>) -> Result<(), ConnectionError> {
    let mut closing = shared.close.subscribe();
    let tick = shared.config.target_responsiveness;
    let mut budget = compute_budget(shared);
    let mut budget_deadline = Instant::now() + tick;
    let mut ping_count: u32 = 0;
    let mut ping_deadline = Instant::now() + jittered(ping_base(&shared.config, ping_count));

    loop {
        if shared.close.is_closing() {
            return Ok(());
        }

        if Instant::now() >= budget_deadline {
            budget = compute_budget(shared);
            budget_deadline = Instant::now() + tick;
        }

        let (send_pong, send_caps) = {
            let mut state = shared.state();
            let pong = state.send_pong;
            state.send_pong = false;
            let caps = state.send_capabilities && !state.capabilities_sent;
            if caps {
                state.capabilities_sent = true;
                state.send_capabilities = false;
            }
            (pong, caps)
        };
        if send_pong {
            send_control(shared, FrameBody::Pong).await;
        }
        if send_caps {
            tracing::debug!(name = %shared.name, "send: capabilities");
            send_control(shared, FrameBody::Capabilities(shared.local_capabilities)).await;
        }

        flush_cancellations(shared).await?;

        if Instant::now() >= ping_deadline {
            run_ping(shared, &mut ping_count).await?;
            ping_deadline = Instant::now() + jittered(ping_base(&shared.config, ping_count));
        }

        let frames_sent = pump_data(shared, &mut budget).await;
        if frames_sent > 0 {
            // A full group may have left ready data behind; go again.
            continue;
        }

        if budget > 0 {
            tokio::select! {
                _ = shared.send_wake.notified() => {}
                _ = shared.pong_wake.notified() => {}
                _ = tokio::time::sleep_until(ping_deadline) => {}
                _ = closing.changed() => {}
            }
        } else {
            // Throttled: new data is useless until the budget resets, but a
            // pong must still flow.
            tokio::select! {
                _ = tokio::time::sleep_until(budget_deadline) => {}
                _ = shared.pong_wake.notified() => {}
                _ = closing.changed() => {}
            }
        }
    }
}

/// Budget for one tick, rounded up to whole packets:
/// `⌈(throughput × percent × tick_ms / 100_000) / mtu⌉ × mtu`.
fn compute_budget<S: FramedSocket>(shared: &Shared<S>) -> usize {
    let config = &shared.config;
    let mut throughput = shared.outbound_throughput.load(Ordering::Relaxed);
    if throughput <= 0 {
        // A peer that never reported anything useful gets the seed guess,
        // otherwise the budget would wedge at zero.
        throughput = THROUGHPUT_GUESS;
    }
    let mtu = config.single_packet_mtu as i64;
    let raw = throughput * config.max_percent_throughput as i64
        * config.target_responsiveness.as_millis() as i64
        / 100_000;
    ((raw + mtu - 1) / mtu * mtu).max(0) as usize
}

fn ping_base(config: &TransportConfig, ping_count: u32) -> Duration {
    let warmup_pings =
        (config.ping_interval.as_millis() / config.initial_ping_interval.as_millis().max(1)) as u32;
    if ping_count < warmup_pings {
        config.initial_ping_interval
    } else {
        config.ping_interval
    }
}

/// Uniform over [base/2, 3·base/2), so pings never correlate with transport
/// retransmission timers.
fn jittered(base: Duration) -> Duration {
    let base_ms = (base.as_millis() as u64).max(1);
    Duration::from_millis(base_ms / 2 + rand::rng().random_range(0..base_ms))
}

async fn run_ping<S: FramedSocket>(
    shared: &Arc<Shared<S>>,
    ping_count: &mut u32,
) -> Result<(), ConnectionError> {
    let outstanding = shared.state().ping_sent_at.is_some();
    if outstanding {
        let missed = {
            let mut state = shared.state();
            state.missed_pings += 1;
            state.missed_pings
        };
        tracing::debug!(name = %shared.name, missed, "send: ping unanswered");
        if missed >= shared.config.missed_ping_count {
            return Err(ConnectionError::LivenessTimeout);
        }
    } else {
        send_control(shared, FrameBody::Ping).await;
        shared.state().ping_sent_at = Some(Instant::now());
        *ping_count += 1;
        tracing::trace!(name = %shared.name, count = *ping_count, "send: ping");
    }
    Ok(())
}

/// Drain queued cancellation requests into at most one `0x12` frame.
async fn flush_cancellations<S: FramedSocket>(
    shared: &Arc<Shared<S>>,
) -> Result<(), ConnectionError> {
    let requests = {
        let mut state = shared.state();
        if state.cancel_requests.is_empty() {
            return Ok(());
        }
        std::mem::take(&mut state.cancel_requests)
    };

    let supports_cancel = shared
        .state()
        .negotiated
        .supports(muxlink_core::capabilities::CAP_CANCEL_MESSAGE);
    let mut mask: u16 = 0;

    for outgoing in requests {
        if outgoing.bytes_remaining() == 0 {
            // Too late: the final byte is already on the wire.
            tracing::trace!(
                name = %shared.name,
                number = outgoing.message_number(),
                "send: cancel after completion ignored"
            );
            continue;
        }
        if !supports_cancel {
            // A legacy peer would read 0x12 as a reserved opcode and likely
            // terminate; the message stays in flight and its number leaks
            // until the connection ends. Give up only once that leak has
            // exhausted the pool.
            tracing::warn!(
                name = %shared.name,
                number = outgoing.message_number(),
                "send: peer cannot cancel, message stays in flight"
            );
            if shared.state().available_numbers.is_empty() {
                return Err(ConnectionError::BackpressureExhausted);
            }
            continue;
        }

        if shared.send_queue().cancel(&outgoing) {
            mask |= 1 << outgoing.message_number();
            shared
                .state()
                .available_numbers
                .push(outgoing.message_number());
            shared.permit_wake.notify_one();
            tracing::debug!(
                name = %shared.name,
                number = outgoing.message_number(),
                "send: message cancelled"
            );
        }
    }

    if mask != 0 {
        send_control(shared, FrameBody::CancelMessages(mask)).await;
    }
    Ok(())
}

/// Peel ready sends into one group (≤15 descriptors) within the budget, then
/// emit the control frame followed by each data frame in descriptor order.
/// Returns the number of data frames sent.
async fn pump_data<S: FramedSocket>(shared: &Arc<Shared<S>>, budget: &mut usize) -> usize {
    let mut descriptors: Vec<DataFrameDescriptor> = Vec::new();
    let mut frames: Vec<(Vec<u8>, Option<u8>)> = Vec::new();

    while *budget > 0 && descriptors.len() < MAX_GROUP_DESCRIPTORS {
        let granted = shared.send_queue().next(*budget);
        let Some((outgoing, n)) = granted else { break };

        let sent_so_far = outgoing.bytes_sent();
        let is_last = n == outgoing.bytes_remaining();
        let mut chunk = Vec::with_capacity(n);
        if n > 0 {
            outgoing.message().copy_range(sent_so_far, n, &mut chunk);
        }
        outgoing.add_bytes_sent(n);
        *budget -= n;

        descriptors.push(DataFrameDescriptor {
            message_number: outgoing.message_number(),
            offset: sent_so_far as u32,
            total_length: outgoing.message().expected_len() as u32,
            is_first: sent_so_far == 0,
            is_last,
            header: outgoing.header().cloned().unwrap_or_default(),
        });
        frames.push((chunk, is_last.then(|| outgoing.message_number())));
    }

    if descriptors.is_empty() {
        return 0;
    }
    let count = descriptors.len();
    tracing::trace!(name = %shared.name, frames = count, "send: data group");
    send_control(shared, FrameBody::SendData(descriptors)).await;

    for (chunk, finished_number) in frames {
        shared.bytes_out.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        shared.socket.send_frame(&chunk).await;
        if let Some(number) = finished_number {
            // The message's last byte is out; its number is free again.
            shared.state().available_numbers.push(number);
            shared.permit_wake.notify_one();
        }
    }
    count
}

async fn send_control<S: FramedSocket>(shared: &Arc<Shared<S>>, body: FrameBody) {
    let (rtt_estimate_ms, throughput_estimate) = shared.estimate_prefix();
    let frame = ControlFrame {
        rtt_estimate_ms,
        throughput_estimate,
        body,
    };
    match frame.encode() {
        Ok(bytes) => {
            shared.bytes_out.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            shared.socket.send_frame(&bytes).await;
        }
        Err(err) => {
            // Locally-built frames are validated at admission; reaching this
            // is a bug worth a loud log, not a connection teardown.
            tracing::error!(name = %shared.name, error = %err, "send: control frame rejected by codec");
        }
    }
}
