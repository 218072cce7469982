//! Connection configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tunable parameters of one connection.
///
/// The defaults suit an interactive WAN link: 100 ms send-budget ticks keep
/// at most tens of milliseconds of data queued below the transport, so a
/// priority switch takes effect quickly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Number of distinct send priorities (1-16). Priority 0 is the highest.
    pub priority_levels: u8,
    /// Payload bytes assumed to fit one underlying packet; the send budget is
    /// rounded up to a multiple of this.
    pub single_packet_mtu: usize,
    /// Maximum messages in flight per direction (1-16).
    pub max_concurrent_messages: u8,
    /// Length of one send-budget tick; also the reaction time of priority
    /// switches.
    pub target_responsiveness: Duration,
    /// Window size of the throughput and RTT moving averages.
    pub bandwidth_estimator_samples: usize,
    /// Base interval between liveness pings once the connection is warmed up.
    pub ping_interval: Duration,
    /// Ping interval used for the first few probes, so a dead peer is noticed
    /// quickly after connecting.
    pub initial_ping_interval: Duration,
    /// Consecutive unanswered pings tolerated before the connection is
    /// declared dead.
    pub missed_ping_count: u32,
    /// Share of the estimated outbound throughput the sender may use (0-100).
    pub max_percent_throughput: u8,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            priority_levels: 16,
            single_packet_mtu: 1398,
            max_concurrent_messages: 16,
            target_responsiveness: Duration::from_millis(100),
            bandwidth_estimator_samples: 100,
            ping_interval: Duration::from_millis(15_000),
            initial_ping_interval: Duration::from_millis(5_000),
            missed_ping_count: 4,
            max_percent_throughput: 75,
        }
    }
}

impl TransportConfig {
    /// Check all fields are within protocol limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.priority_levels == 0 || self.priority_levels > 16 {
            return Err(ConfigError::PriorityLevels(self.priority_levels));
        }
        if self.max_concurrent_messages == 0 || self.max_concurrent_messages > 16 {
            return Err(ConfigError::ConcurrentMessages(self.max_concurrent_messages));
        }
        if self.max_percent_throughput > 100 {
            return Err(ConfigError::PercentThroughput(self.max_percent_throughput));
        }
        if self.single_packet_mtu == 0 {
            return Err(ConfigError::ZeroField("single_packet_mtu"));
        }
        if self.bandwidth_estimator_samples == 0 {
            return Err(ConfigError::ZeroField("bandwidth_estimator_samples"));
        }
        if self.target_responsiveness.is_zero() {
            return Err(ConfigError::ZeroField("target_responsiveness"));
        }
        if self.ping_interval.is_zero() {
            return Err(ConfigError::ZeroField("ping_interval"));
        }
        if self.initial_ping_interval.is_zero() {
            return Err(ConfigError::ZeroField("initial_ping_interval"));
        }
        if self.missed_ping_count == 0 {
            return Err(ConfigError::ZeroField("missed_ping_count"));
        }
        Ok(())
    }
}
