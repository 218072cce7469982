//! Throughput shaping: shaped transfer timing and the budget bound.

mod common;

use std::time::Duration;

use common::{connect, pattern_message, wait_for};
use muxlink_protocol::sim::{self, SimLink};
use muxlink_protocol::TransportConfig;
use tokio::time::Instant;

fn wan_link() -> SimLink {
    SimLink::new(Duration::from_millis(250), 263_168)
}

#[tokio::test(start_paused = true)]
async fn shaped_transfer_lands_in_expected_window() {
    let (a_socket, b_socket) = sim::pair(wan_link(), wan_link());
    let (a, a_events, b, b_events) = connect(a_socket, b_socket, TransportConfig::default());

    // Prime both directions so the estimators reflect the real line rate.
    a.send_message(pattern_message(1_047_552), 0, None).await.unwrap();
    b.send_message(pattern_message(1_047_552), 0, None).await.unwrap();
    assert!(
        wait_for(
            || a_events.completed() == 1 && b_events.completed() == 1,
            Duration::from_secs(15),
        )
        .await,
        "priming exchange did not finish"
    );

    let started = Instant::now();
    a.send_message(pattern_message(1_047_552), 0, None).await.unwrap();
    assert!(wait_for(|| b_events.completed() == 2, Duration::from_secs(10)).await);

    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(4_000) && elapsed <= Duration::from_millis(6_000),
        "shaped transfer took {elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn outbound_bytes_respect_the_budget_bound() {
    let (a_socket, b_socket) = sim::pair(wan_link(), wan_link());
    let (a, a_events, b, b_events) = connect(a_socket, b_socket, TransportConfig::default());

    // Converge the estimators first.
    a.send_message(pattern_message(1_047_552), 0, None).await.unwrap();
    b.send_message(pattern_message(1_047_552), 0, None).await.unwrap();
    assert!(
        wait_for(
            || a_events.completed() == 1 && b_events.completed() == 1,
            Duration::from_secs(15),
        )
        .await
    );

    // A saturating send, observed over a 2-second window (20 budget ticks).
    a.send_message(pattern_message(4_194_303), 0, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let window = Duration::from_secs(2);
    let estimate = a.outbound_throughput_estimate() as u64;
    let before = a.bytes_out();
    tokio::time::sleep(window).await;
    let sent = a.bytes_out() - before;

    let config = TransportConfig::default();
    let data_bound = estimate * config.max_percent_throughput as u64 * window.as_secs() / 100;
    // Each tick's budget rounds up to a whole packet, so allow one MTU per
    // tick in the window, plus the ticks' control-frame overhead.
    let ticks = (window.as_millis() / config.target_responsiveness.as_millis()) as u64 + 1;
    let slack = ticks * config.single_packet_mtu as u64 + 2_048;
    assert!(
        sent <= data_bound + slack,
        "sent {sent} bytes, bound {data_bound} + {slack}"
    );
    // The shaper must also actually use the link, not starve it.
    assert!(sent >= data_bound / 2, "sent only {sent} of bound {data_bound}");
}

#[tokio::test(start_paused = true)]
async fn estimators_converge_to_the_line_rate() {
    let (a_socket, b_socket) = sim::pair(wan_link(), wan_link());
    let (a, a_events, b, b_events) = connect(a_socket, b_socket, TransportConfig::default());

    a.send_message(pattern_message(1_047_552), 0, None).await.unwrap();
    b.send_message(pattern_message(1_047_552), 0, None).await.unwrap();
    assert!(
        wait_for(
            || a_events.completed() == 1 && b_events.completed() == 1,
            Duration::from_secs(15),
        )
        .await
    );

    // B measured A's traffic at roughly the line rate; its inbound estimate
    // sits between the true rate and the seed it started from.
    let inbound = b.inbound_throughput_estimate();
    assert!(
        (200_000..=1_000_000).contains(&inbound),
        "inbound estimate {inbound}"
    );

    // A's outbound estimate is whatever B last reported.
    let outbound = a.outbound_throughput_estimate();
    assert!(
        (200_000..=1_000_000).contains(&outbound),
        "outbound estimate {outbound}"
    );

    // Round trips ride the 250 ms one-way link.
    let rtt = a.rtt_estimate_ms();
    assert!((100..=1_500).contains(&rtt), "rtt estimate {rtt}");
}
