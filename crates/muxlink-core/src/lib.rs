//! Wire format and link-estimation primitives for the muxlink transport.
//!
//! This crate holds everything below the connection state machine: the
//! big-endian field codec, the control-frame and data-frame-descriptor
//! codecs, the capability record, and the moving-average estimator used for
//! bandwidth and round-trip measurements.

pub mod capabilities;
pub mod codec;
pub mod constants;
pub mod error;
pub mod estimator;
pub mod frame;

pub use capabilities::CapabilitySet;
pub use error::FrameError;
pub use estimator::MovingAverage;
pub use frame::{ControlFrame, DataFrameDescriptor, FrameBody};
