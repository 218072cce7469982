//! Data-frame descriptor packing.
//!
//! One descriptor travels inside a Send-Data control frame for each data
//! frame that follows on the socket. Layout is two big-endian 32-bit words
//! plus the optional header bytes:
//!
//! - word 0: `message_number(4) || is_first(1) || is_last(1) || offset(26)`
//! - word 1: `header_len(6) || total_length(26)`

use crate::codec::{read_i32, write_i32};
use crate::constants::{DESCRIPTOR_FIXED_LEN, MAX_HEADER_LEN, MESSAGE_NUMBER_COUNT};
use crate::error::FrameError;

const FLAG_FIRST: u32 = 1 << 27;
const FLAG_LAST: u32 = 1 << 26;
const LOW_26_MASK: u32 = (1 << 26) - 1;

/// Placement of one data frame within its message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrameDescriptor {
    /// 4-bit tag identifying the in-flight message.
    pub message_number: u8,
    /// Byte offset of this frame's payload within the message.
    pub offset: u32,
    /// Full length of the message being transferred.
    pub total_length: u32,
    /// First frame of the message: the receiver allocates on this.
    pub is_first: bool,
    /// Last frame of the message: the receiver retires the slot on this.
    pub is_last: bool,
    /// Application header, carried in full on every descriptor that has one.
    pub header: Vec<u8>,
}

impl DataFrameDescriptor {
    /// Encoded size of this descriptor.
    pub fn encoded_len(&self) -> usize {
        DESCRIPTOR_FIXED_LEN + self.header.len()
    }

    fn validate(&self) -> Result<(), FrameError> {
        if self.message_number as usize >= MESSAGE_NUMBER_COUNT {
            return Err(FrameError::MessageNumberOutOfRange(self.message_number));
        }
        if self.offset & !LOW_26_MASK != 0 {
            return Err(FrameError::FieldOutOfRange {
                field: "offset",
                value: self.offset as u64,
            });
        }
        if self.total_length & !LOW_26_MASK != 0 {
            return Err(FrameError::FieldOutOfRange {
                field: "total length",
                value: self.total_length as u64,
            });
        }
        if self.header.len() > MAX_HEADER_LEN {
            return Err(FrameError::HeaderTooLong(self.header.len()));
        }
        Ok(())
    }

    /// Append the encoded descriptor to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), FrameError> {
        self.validate()?;

        let mut word0 = (self.message_number as u32) << 28 | (self.offset & LOW_26_MASK);
        if self.is_first {
            word0 |= FLAG_FIRST;
        }
        if self.is_last {
            word0 |= FLAG_LAST;
        }
        let word1 = (self.header.len() as u32) << 26 | (self.total_length & LOW_26_MASK);

        let at = out.len();
        out.resize(at + DESCRIPTOR_FIXED_LEN, 0);
        write_i32(out, at, word0 as i32);
        write_i32(out, at + 4, word1 as i32);
        out.extend_from_slice(&self.header);
        Ok(())
    }

    /// Decode one descriptor from the front of `buf`, returning it together
    /// with the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(DataFrameDescriptor, usize), FrameError> {
        if buf.len() < DESCRIPTOR_FIXED_LEN {
            return Err(FrameError::DescriptorTruncated { at: buf.len() });
        }

        let word0 = read_i32(buf, 0) as u32;
        let word1 = read_i32(buf, 4) as u32;
        let header_len = (word1 >> 26) as usize;

        let consumed = DESCRIPTOR_FIXED_LEN + header_len;
        if buf.len() < consumed {
            return Err(FrameError::DescriptorTruncated { at: buf.len() });
        }

        let descriptor = DataFrameDescriptor {
            message_number: (word0 >> 28) as u8,
            offset: word0 & LOW_26_MASK,
            total_length: word1 & LOW_26_MASK,
            is_first: word0 & FLAG_FIRST != 0,
            is_last: word0 & FLAG_LAST != 0,
            header: buf[DESCRIPTOR_FIXED_LEN..consumed].to_vec(),
        };
        Ok((descriptor, consumed))
    }
}
