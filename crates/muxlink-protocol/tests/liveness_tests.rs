//! Liveness: a dead link is detected by missed pings on both ends.

mod common;

use std::time::Duration;

use common::{connect, wait_for};
use muxlink_protocol::sim::{self, SimLink};
use muxlink_protocol::TransportConfig;

fn liveness_config() -> TransportConfig {
    TransportConfig {
        ping_interval: Duration::from_millis(5_000),
        initial_ping_interval: Duration::from_millis(2_500),
        missed_ping_count: 4,
        ..TransportConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn dead_link_closes_both_ends() {
    let (a_socket, b_socket) = sim::pair(SimLink::black_hole(), SimLink::black_hole());
    let (a, a_events, b, b_events) = connect(a_socket, b_socket, liveness_config());

    let reason_a = tokio::time::timeout(Duration::from_secs(30), a.wait_close())
        .await
        .expect("a did not close within 30 s");
    let reason_b = tokio::time::timeout(Duration::from_secs(30), b.wait_close())
        .await
        .expect("b did not close within 30 s");

    assert_eq!(reason_a, "remote side did not respond to a ping");
    assert_eq!(reason_b, "remote side did not respond to a ping");
    assert!(a.is_closing());
    assert!(b.is_closing());

    // A dead link produced no message traffic at all.
    assert_eq!(a_events.new_messages(), 0);
    assert_eq!(a_events.completed(), 0);
    assert_eq!(b_events.new_messages(), 0);
    assert_eq!(b_events.completed(), 0);
}

#[tokio::test(start_paused = true)]
async fn live_link_stays_open_across_many_ping_cycles() {
    let (a_socket, b_socket) = sim::pair(SimLink::fast(), SimLink::fast());
    let (a, _a_events, b, _b_events) = connect(a_socket, b_socket, liveness_config());

    // Several full ping intervals pass; pongs keep both sides alive.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!a.is_closing());
    assert!(!b.is_closing());

    // Pings flowed: the RTT estimators have been fed (loopback RTT is ~0,
    // well under the seed).
    assert!(wait_for(|| a.rtt_estimate_ms() < 100, Duration::from_secs(30)).await);
}

#[tokio::test(start_paused = true)]
async fn force_close_reason_wins_over_later_failures() {
    let (a_socket, b_socket) = sim::pair(SimLink::fast(), SimLink::fast());
    let (a, _a_events, b, _b_events) = connect(a_socket, b_socket, liveness_config());

    a.force_close("operator shutdown", false).await;
    assert_eq!(a.wait_close().await, "operator shutdown");

    // The peer observes the socket close as a transport-closed reason.
    let reason_b = tokio::time::timeout(Duration::from_secs(10), b.wait_close())
        .await
        .expect("peer did not observe the close");
    assert_eq!(reason_b, "transport closed");

    // Sending after close is rejected.
    let result = a
        .send_message(common::pattern_message(10), 0, None)
        .await;
    assert!(result.is_err());
}
