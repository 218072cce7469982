//! Protocol error types.
//!
//! These errors cover configuration validation, send admission, callback
//! registration, message construction, the framed-socket sentinels, and the
//! fatal conditions that close a connection.

use muxlink_core::FrameError;
use muxlink_core::constants::{MAX_HEADER_LEN, MAX_MESSAGE_LEN};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("priority_levels must be 1-16, got {0}")]
    PriorityLevels(u8),

    #[error("max_concurrent_messages must be 1-16, got {0}")]
    ConcurrentMessages(u8),

    #[error("max_percent_throughput must be 0-100, got {0}")]
    PercentThroughput(u8),

    #[error("{0} must be non-zero")]
    ZeroField(&'static str),
}

/// Result of an underlying framed-socket operation going wrong.
///
/// These map the transport binding's negative return sentinels onto typed
/// errors: closing, cancelled, frame-exceeds-buffer, non-binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SocketError {
    #[error("socket closing")]
    Closing,

    #[error("receive cancelled")]
    Cancelled,

    #[error("frame exceeds receive buffer")]
    FrameTooLarge,

    #[error("non-binary frame")]
    NotBinary,
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message too large: {0} bytes (max {MAX_MESSAGE_LEN})")]
    TooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CallbackError {
    #[error("outgoing messages do not fire callbacks")]
    OutgoingMessage,

    #[error("the new-message event is only valid at connection level")]
    NewMessageAtMessageLevel,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("priority {priority} out of range (levels: {levels})")]
    PriorityOutOfRange { priority: u8, levels: u8 },

    #[error("header too long: {0} bytes (max {MAX_HEADER_LEN})")]
    HeaderTooLong(usize),

    #[error("connection is closing")]
    Closing,
}

/// Fatal conditions; each becomes the close reason of the connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("transport closed")]
    TransportClosed,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("out of message numbers and unable to cancel")]
    BackpressureExhausted,

    #[error("remote side did not respond to a ping")]
    LivenessTimeout,
}

impl From<SocketError> for ConnectionError {
    fn from(e: SocketError) -> ConnectionError {
        match e {
            SocketError::Closing | SocketError::Cancelled => ConnectionError::TransportClosed,
            SocketError::FrameTooLarge => {
                ConnectionError::ProtocolViolation("frame exceeds receive buffer".into())
            }
            SocketError::NotBinary => {
                ConnectionError::ProtocolViolation("non-binary frame".into())
            }
        }
    }
}

impl From<FrameError> for ConnectionError {
    fn from(e: FrameError) -> ConnectionError {
        ConnectionError::ProtocolViolation(e.to_string())
    }
}
