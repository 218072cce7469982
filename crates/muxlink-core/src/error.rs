//! Error types for the wire-format layer.

use crate::constants::{MAX_GROUP_DESCRIPTORS, MAX_HEADER_LEN, MAX_MESSAGE_LEN};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("control frame too short: {actual} bytes (minimum {min})")]
    TooShort { min: usize, actual: usize },

    #[error("control frame length mismatch: body ends at {expected} bytes but frame has {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("descriptor truncated at byte {at}")]
    DescriptorTruncated { at: usize },

    #[error("descriptor count {0} out of range (1-{MAX_GROUP_DESCRIPTORS})")]
    DescriptorCount(usize),

    #[error("header too long: {0} bytes (max {MAX_HEADER_LEN})")]
    HeaderTooLong(usize),

    #[error("message number {0} does not fit the 4-bit field")]
    MessageNumberOutOfRange(u8),

    #[error("{field} {value} does not fit the 26-bit field (max {MAX_MESSAGE_LEN})")]
    FieldOutOfRange { field: &'static str, value: u64 },

    #[error("capability record truncated: {actual} bytes (need {need})")]
    CapabilityTruncated { need: usize, actual: usize },
}
