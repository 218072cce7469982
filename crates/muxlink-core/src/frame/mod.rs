//! Control-frame and data-frame-descriptor codecs.
//!
//! Every frame the transport writes to the underlying socket is either a
//! control frame (encoded here) or a raw slice of message payload announced
//! by the descriptors of the preceding control frame.

pub mod control;
pub mod descriptor;

pub use control::{ControlFrame, FrameBody};
pub use descriptor::DataFrameDescriptor;
