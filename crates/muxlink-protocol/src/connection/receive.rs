//! Receive loop.
//!
//! Alternates between control frames (into a fixed staging buffer) and the
//! data frames the most recent Send-Data group announced. Group throughput
//! is timed from the control frame to the group's last data frame and fed to
//! the inbound estimator.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::watch;
use tokio::time::Instant;

use muxlink_core::capabilities::CAP_CAPABILITIES_SUPPORTED;
use muxlink_core::constants::{MAX_CONTROL_FRAME_LEN, MESSAGE_NUMBER_COUNT};
use muxlink_core::frame::{ControlFrame, DataFrameDescriptor, FrameBody};
use muxlink_core::CapabilitySet;

use crate::connection::{Phase, Shared};
use crate::error::ConnectionError;
use crate::message::Message;
use crate::socket::FramedSocket;

/// A data frame announced by a decoded descriptor, awaited on the socket.
struct ExpectedFrame {
    message_number: u8,
    offset: u32,
    total_length: u32,
    is_last: bool,
    last_in_group: bool,
}

/// Timing of one in-progress data group.
struct GroupTiming {
    started: Instant,
    bytes: u64,
}

enum Step {
    Continue,
    Closing,
}

pub(super) async fn run<S: FramedSocket>(shared: &Arc<Shared<S>>) -> Result<(), ConnectionError> {
    let mut closing = shared.close.subscribe();
    let mut staging = vec![0u8; MAX_CONTROL_FRAME_LEN];
    let mut data_buf: Vec<u8> = Vec::new();
    let mut expected: VecDeque<ExpectedFrame> = VecDeque::new();
    let mut group: Option<GroupTiming> = None;

    loop {
        if shared.close.is_closing() {
            return Ok(());
        }

        let step = match expected.pop_front() {
            Some(frame) => {
                receive_data_frame(shared, &mut closing, frame, &mut data_buf, &mut group).await?
            }
            None => {
                receive_control_frame(shared, &mut closing, &mut staging, &mut expected, &mut group)
                    .await?
            }
        };
        if let Step::Closing = step {
            return Ok(());
        }
    }
}

async fn receive_data_frame<S: FramedSocket>(
    shared: &Arc<Shared<S>>,
    closing: &mut watch::Receiver<bool>,
    frame: ExpectedFrame,
    data_buf: &mut Vec<u8>,
    group: &mut Option<GroupTiming>,
) -> Result<Step, ConnectionError> {
    // The frame can carry at most the rest of the message; anything larger
    // trips the socket's frame-too-large sentinel and closes the connection.
    let limit = (frame.total_length - frame.offset) as usize;
    if data_buf.len() < limit {
        data_buf.resize(limit, 0);
    }

    let n = tokio::select! {
        result = shared.socket.receive_frame(&mut data_buf[..limit]) => result?,
        _ = closing.changed() => return Ok(Step::Closing),
    };
    shared.bytes_in.fetch_add(n as u64, Ordering::Relaxed);

    if let Some(timing) = group.as_mut() {
        timing.bytes += n as u64;
    }

    let slot = shared.state().incoming_slots[frame.message_number as usize].clone();
    match slot {
        Some(message) => {
            message.accept_chunk(frame.offset as usize, &data_buf[..n]);
            shared.enqueue_dispatch(&message);
            if frame.is_last {
                shared.state().incoming_slots[frame.message_number as usize] = None;
                tracing::trace!(
                    name = %shared.name,
                    number = frame.message_number,
                    "receive: message complete, slot retired"
                );
            }
        }
        None => {
            // The message was cancelled after its group was announced.
            tracing::trace!(
                name = %shared.name,
                number = frame.message_number,
                "receive: data frame for retired message dropped"
            );
        }
    }

    if frame.last_in_group {
        finish_group(shared, group);
    }
    Ok(Step::Continue)
}

fn finish_group<S: FramedSocket>(shared: &Shared<S>, group: &mut Option<GroupTiming>) {
    let Some(timing) = group.take() else { return };
    let elapsed_ms = timing.started.elapsed().as_millis() as u64;
    // Sub-MTU groups and zero-elapsed clocks only add noise.
    if timing.bytes > shared.config.single_packet_mtu as u64 && elapsed_ms > 0 {
        let rate = (timing.bytes * 1000 / elapsed_ms) as i64;
        shared
            .inbound_throughput
            .lock()
            .expect("throughput estimator lock")
            .record(rate);
        tracing::trace!(
            name = %shared.name,
            bytes = timing.bytes,
            elapsed_ms,
            rate,
            "receive: inbound throughput sample"
        );
    }
}

async fn receive_control_frame<S: FramedSocket>(
    shared: &Arc<Shared<S>>,
    closing: &mut watch::Receiver<bool>,
    staging: &mut [u8],
    expected: &mut VecDeque<ExpectedFrame>,
    group: &mut Option<GroupTiming>,
) -> Result<Step, ConnectionError> {
    let n = tokio::select! {
        result = shared.socket.receive_frame(staging) => result?,
        _ = closing.changed() => return Ok(Step::Closing),
    };
    shared.bytes_in.fetch_add(n as u64, Ordering::Relaxed);

    let frame = ControlFrame::decode(&staging[..n])?;

    // Every control frame refreshes the peer's view of the link.
    shared
        .remote_rtt_ms
        .store(frame.rtt_estimate_ms as u32, Ordering::Relaxed);
    shared
        .outbound_throughput
        .store(frame.throughput_estimate as i64, Ordering::Relaxed);

    match frame.body {
        FrameBody::Capabilities(remote) => handle_capabilities(shared, remote),
        FrameBody::SendData(descriptors) => handle_group(shared, descriptors, expected, group)?,
        FrameBody::Ping => {
            open(shared);
            shared.state().send_pong = true;
            shared.pong_wake.notify_one();
        }
        FrameBody::Pong => handle_pong(shared),
        FrameBody::CancelMessages(mask) => handle_incoming_cancel(shared, mask),
        FrameBody::Reserved(opcode) => {
            open(shared);
            tracing::trace!(name = %shared.name, opcode, "receive: ignoring reserved opcode");
        }
    }
    Ok(Step::Continue)
}

/// A legacy peer never negotiates; its first frame still opens the connection.
fn open<S: FramedSocket>(shared: &Shared<S>) {
    let mut state = shared.state();
    if state.phase == Phase::Opening {
        state.phase = Phase::Open;
        tracing::debug!(name = %shared.name, "connection: open");
    }
}

fn handle_capabilities<S: FramedSocket>(shared: &Shared<S>, remote: CapabilitySet) {
    let mut state = shared.state();
    state.phase = Phase::Open;
    state.negotiated = CapabilitySet::negotiate(shared.local_capabilities, remote);
    tracing::debug!(
        name = %shared.name,
        major = remote.major_version,
        minor = remote.minor_version,
        bits = state.negotiated.bits,
        "connection: capabilities negotiated"
    );

    let answer = state.negotiated.supports(CAP_CAPABILITIES_SUPPORTED)
        && !state.capabilities_sent
        && !state.send_capabilities;
    if answer {
        state.send_capabilities = true;
        drop(state);
        shared.send_wake.notify_one();
    }
}

fn handle_group<S: FramedSocket>(
    shared: &Shared<S>,
    descriptors: Vec<DataFrameDescriptor>,
    expected: &mut VecDeque<ExpectedFrame>,
    group: &mut Option<GroupTiming>,
) -> Result<(), ConnectionError> {
    open(shared);
    *group = Some(GroupTiming {
        started: Instant::now(),
        bytes: 0,
    });

    let count = descriptors.len();
    for (index, descriptor) in descriptors.into_iter().enumerate() {
        if descriptor.offset > descriptor.total_length {
            return Err(ConnectionError::ProtocolViolation(format!(
                "descriptor offset {} beyond message length {}",
                descriptor.offset, descriptor.total_length
            )));
        }

        if descriptor.is_first {
            let message = Message::with_expected_len(descriptor.total_length as usize)
                .map_err(|e| ConnectionError::ProtocolViolation(e.to_string()))?;
            if !descriptor.header.is_empty() {
                message.set_header(descriptor.header.clone());
            }
            let stale = shared.state().incoming_slots[descriptor.message_number as usize]
                .replace(message);
            if let Some(stale) = stale {
                tracing::warn!(
                    name = %shared.name,
                    number = descriptor.message_number,
                    "receive: message number reused while in flight"
                );
                if stale.mark_cancelled() {
                    shared.enqueue_dispatch(&stale);
                }
            }
            tracing::trace!(
                name = %shared.name,
                number = descriptor.message_number,
                len = descriptor.total_length,
                "receive: incoming message started"
            );
        }

        expected.push_back(ExpectedFrame {
            message_number: descriptor.message_number,
            offset: descriptor.offset,
            total_length: descriptor.total_length,
            is_last: descriptor.is_last,
            last_in_group: index + 1 == count,
        });
    }
    Ok(())
}

fn handle_pong<S: FramedSocket>(shared: &Shared<S>) {
    open(shared);
    let started = {
        let mut state = shared.state();
        state.missed_pings = 0;
        state.ping_sent_at.take()
    };
    if let Some(started) = started {
        let elapsed_ms = started.elapsed().as_millis() as i64;
        shared
            .local_rtt
            .lock()
            .expect("rtt estimator lock")
            .record(elapsed_ms);
        tracing::trace!(name = %shared.name, elapsed_ms, "receive: pong");
    }
}

fn handle_incoming_cancel<S: FramedSocket>(shared: &Shared<S>, mask: u16) {
    open(shared);
    for number in 0..MESSAGE_NUMBER_COUNT {
        if mask & (1 << number) == 0 {
            continue;
        }
        let message = shared.state().incoming_slots[number].take();
        if let Some(message) = message {
            tracing::debug!(name = %shared.name, number, "receive: message cancelled by peer");
            if message.mark_cancelled() {
                shared.enqueue_dispatch(&message);
            }
        }
    }
}
