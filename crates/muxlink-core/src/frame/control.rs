//! Control-frame codec.
//!
//! Every control frame opens with an 8-byte prefix carrying the opcode and
//! the sender's current inbound-direction link estimates, followed by an
//! opcode-specific body. Reserved opcodes decode to [`FrameBody::Reserved`]
//! so protocol extensions never tear down a connection.

use crate::capabilities::CapabilitySet;
use crate::codec::{read_i32, read_u16, write_i32, write_u16};
use crate::constants::{
    CONTROL_PREFIX_LEN, MAX_GROUP_DESCRIPTORS, OPCODE_CANCEL_MESSAGES, OPCODE_CAPABILITIES,
    OPCODE_PING, OPCODE_PONG, OPCODE_SEND_DATA_MAX,
};
use crate::error::FrameError;
use crate::frame::descriptor::DataFrameDescriptor;

/// Opcode-specific content of a control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    /// `0x00`: the sender's capability record.
    Capabilities(CapabilitySet),
    /// `0x01..=0x0F`: the descriptors of a data group; the opcode is the count.
    SendData(Vec<DataFrameDescriptor>),
    /// `0x10`: liveness probe.
    Ping,
    /// `0x11`: liveness probe response.
    Pong,
    /// `0x12`: bitmask of message numbers to cancel.
    CancelMessages(u16),
    /// Any other opcode: ignored on receipt, body bytes discarded.
    Reserved(u8),
}

impl FrameBody {
    /// The wire opcode for this body.
    pub fn opcode(&self) -> u8 {
        match self {
            FrameBody::Capabilities(_) => OPCODE_CAPABILITIES,
            FrameBody::SendData(descriptors) => descriptors.len() as u8,
            FrameBody::Ping => OPCODE_PING,
            FrameBody::Pong => OPCODE_PONG,
            FrameBody::CancelMessages(_) => OPCODE_CANCEL_MESSAGES,
            FrameBody::Reserved(opcode) => *opcode,
        }
    }
}

/// One decoded (or to-be-encoded) control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    /// Sender's round-trip estimate in milliseconds.
    pub rtt_estimate_ms: u16,
    /// Sender's inbound throughput estimate in bytes per second.
    pub throughput_estimate: i32,
    pub body: FrameBody,
}

impl ControlFrame {
    /// Encode the frame: 8-byte prefix plus opcode-specific body.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if let FrameBody::SendData(descriptors) = &self.body
            && (descriptors.is_empty() || descriptors.len() > MAX_GROUP_DESCRIPTORS)
        {
            return Err(FrameError::DescriptorCount(descriptors.len()));
        }

        let mut out = vec![0u8; CONTROL_PREFIX_LEN];
        out[0] = self.body.opcode();
        // byte 1 reserved, written as zero
        write_u16(&mut out, 2, self.rtt_estimate_ms);
        write_i32(&mut out, 4, self.throughput_estimate);

        match &self.body {
            FrameBody::Capabilities(set) => set.encode_into(&mut out),
            FrameBody::SendData(descriptors) => {
                for descriptor in descriptors {
                    descriptor.encode_into(&mut out)?;
                }
            }
            FrameBody::CancelMessages(mask) => {
                let at = out.len();
                out.resize(at + 2, 0);
                write_u16(&mut out, at, *mask);
            }
            FrameBody::Ping | FrameBody::Pong | FrameBody::Reserved(_) => {}
        }

        tracing::trace!(
            opcode = out[0],
            len = out.len(),
            "frame: encoded control frame"
        );
        Ok(out)
    }

    /// Decode a received control frame.
    pub fn decode(buf: &[u8]) -> Result<ControlFrame, FrameError> {
        if buf.len() < CONTROL_PREFIX_LEN {
            return Err(FrameError::TooShort {
                min: CONTROL_PREFIX_LEN,
                actual: buf.len(),
            });
        }

        let opcode = buf[0];
        let rtt_estimate_ms = read_u16(buf, 2);
        let throughput_estimate = read_i32(buf, 4);
        let payload = &buf[CONTROL_PREFIX_LEN..];

        let body = match opcode {
            OPCODE_CAPABILITIES => FrameBody::Capabilities(CapabilitySet::decode(payload)?),
            1..=OPCODE_SEND_DATA_MAX => {
                let mut descriptors = Vec::with_capacity(opcode as usize);
                let mut at = 0;
                for _ in 0..opcode {
                    let (descriptor, consumed) = DataFrameDescriptor::decode(&payload[at..])?;
                    descriptors.push(descriptor);
                    at += consumed;
                }
                if at != payload.len() {
                    return Err(FrameError::LengthMismatch {
                        expected: CONTROL_PREFIX_LEN + at,
                        actual: buf.len(),
                    });
                }
                FrameBody::SendData(descriptors)
            }
            OPCODE_PING => FrameBody::Ping,
            OPCODE_PONG => FrameBody::Pong,
            OPCODE_CANCEL_MESSAGES => {
                if payload.len() < 2 {
                    return Err(FrameError::TooShort {
                        min: CONTROL_PREFIX_LEN + 2,
                        actual: buf.len(),
                    });
                }
                FrameBody::CancelMessages(read_u16(payload, 0))
            }
            other => FrameBody::Reserved(other),
        };

        tracing::trace!(opcode, len = buf.len(), "frame: decoded control frame");
        Ok(ControlFrame {
            rtt_estimate_ms,
            throughput_estimate,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_CONTROL_FRAME_LEN;

    fn frame(body: FrameBody) -> ControlFrame {
        ControlFrame {
            rtt_estimate_ms: 48,
            throughput_estimate: 250_000,
            body,
        }
    }

    fn descriptor(message_number: u8, header_len: usize) -> DataFrameDescriptor {
        DataFrameDescriptor {
            message_number,
            offset: 1398 * message_number as u32,
            total_length: 1 << 20,
            is_first: message_number == 0,
            is_last: false,
            header: vec![0x5A; header_len],
        }
    }

    #[test]
    fn prefix_layout_exact() {
        let encoded = frame(FrameBody::Ping).encode().unwrap();
        assert_eq!(encoded.len(), 8);
        assert_eq!(encoded[0], 0x10);
        assert_eq!(encoded[1], 0x00);
        assert_eq!(&encoded[2..4], &[0x00, 48]);
        assert_eq!(&encoded[4..8], &0x0003_D090_i32.to_be_bytes());
    }

    #[test]
    fn ping_pong_roundtrip() {
        for body in [FrameBody::Ping, FrameBody::Pong] {
            let original = frame(body);
            let decoded = ControlFrame::decode(&original.encode().unwrap()).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn capabilities_frame_known_encoding() {
        let frame = ControlFrame {
            rtt_estimate_ms: 0x0102,
            throughput_estimate: 0x0304_0506,
            body: FrameBody::Capabilities(CapabilitySet {
                major_version: 1,
                minor_version: 1,
                bits: 3,
            }),
        };
        assert_eq!(
            hex::encode(frame.encode().unwrap()),
            "00000102030405060001000100000003"
        );
    }

    #[test]
    fn capabilities_roundtrip() {
        let original = frame(FrameBody::Capabilities(CapabilitySet::local()));
        let encoded = original.encode().unwrap();
        assert_eq!(encoded.len(), 16);
        assert_eq!(ControlFrame::decode(&encoded).unwrap(), original);
    }

    #[test]
    fn send_data_roundtrip_all_counts() {
        for count in 1..=MAX_GROUP_DESCRIPTORS {
            let descriptors: Vec<_> = (0..count)
                .map(|i| descriptor(i as u8, i % 4))
                .collect();
            let original = frame(FrameBody::SendData(descriptors));
            let encoded = original.encode().unwrap();
            assert_eq!(encoded[0] as usize, count);
            assert_eq!(ControlFrame::decode(&encoded).unwrap(), original);
        }
    }

    #[test]
    fn cancel_bitmask_roundtrip() {
        for mask in [0x0001u16, 0x8001, 0b0000_1010_0101_0000, 0xFFFF] {
            let original = frame(FrameBody::CancelMessages(mask));
            let decoded = ControlFrame::decode(&original.encode().unwrap()).unwrap();
            assert_eq!(decoded.body, FrameBody::CancelMessages(mask));
        }
    }

    #[test]
    fn reserved_opcode_is_not_an_error() {
        let mut raw = frame(FrameBody::Ping).encode().unwrap();
        raw[0] = 0x7F;
        raw.extend_from_slice(&[1, 2, 3]);
        let decoded = ControlFrame::decode(&raw).unwrap();
        assert_eq!(decoded.body, FrameBody::Reserved(0x7F));
        assert_eq!(decoded.rtt_estimate_ms, 48);
    }

    #[test]
    fn reserved_prefix_byte_ignored_on_read() {
        let mut raw = frame(FrameBody::Pong).encode().unwrap();
        raw[1] = 0xEE;
        assert_eq!(ControlFrame::decode(&raw).unwrap().body, FrameBody::Pong);
    }

    #[test]
    fn decode_rejects_short_prefix() {
        assert!(matches!(
            ControlFrame::decode(&[0u8; 7]),
            Err(FrameError::TooShort { min: 8, actual: 7 })
        ));
    }

    #[test]
    fn decode_rejects_trailing_garbage_after_descriptors() {
        let original = frame(FrameBody::SendData(vec![descriptor(3, 0)]));
        let mut raw = original.encode().unwrap();
        raw.push(0xFF);
        assert!(matches!(
            ControlFrame::decode(&raw),
            Err(FrameError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn encode_rejects_bad_group_sizes() {
        assert!(frame(FrameBody::SendData(vec![])).encode().is_err());
        let too_many: Vec<_> = (0..16).map(|_| descriptor(0, 0)).collect();
        assert!(frame(FrameBody::SendData(too_many)).encode().is_err());
    }

    #[test]
    fn worst_case_frame_fits_staging_buffer() {
        let descriptors: Vec<_> = (0..MAX_GROUP_DESCRIPTORS)
            .map(|i| descriptor(i as u8, 63))
            .collect();
        let encoded = frame(FrameBody::SendData(descriptors)).encode().unwrap();
        assert_eq!(encoded.len(), 8 + 15 * (8 + 63));
        assert!(encoded.len() <= MAX_CONTROL_FRAME_LEN);
    }

    #[test]
    fn negative_throughput_estimate_survives() {
        let original = ControlFrame {
            rtt_estimate_ms: 0,
            throughput_estimate: -1,
            body: FrameBody::Ping,
        };
        let decoded = ControlFrame::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded.throughput_estimate, -1);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn descriptor_strategy() -> impl Strategy<Value = DataFrameDescriptor> {
            (
                0u8..16,
                0u32..(1 << 26),
                0u32..(1 << 26),
                proptest::bool::ANY,
                proptest::bool::ANY,
                proptest::collection::vec(any::<u8>(), 0..=63),
            )
                .prop_map(
                    |(message_number, offset, total_length, is_first, is_last, header)| {
                        DataFrameDescriptor {
                            message_number,
                            offset,
                            total_length,
                            is_first,
                            is_last,
                            header,
                        }
                    },
                )
        }

        proptest! {
            #[test]
            fn group_frame_roundtrip(
                rtt in any::<u16>(),
                throughput in any::<i32>(),
                descriptors in proptest::collection::vec(descriptor_strategy(), 1..=15),
            ) {
                let original = ControlFrame {
                    rtt_estimate_ms: rtt,
                    throughput_estimate: throughput,
                    body: FrameBody::SendData(descriptors),
                };
                let decoded = ControlFrame::decode(&original.encode().unwrap()).unwrap();
                prop_assert_eq!(decoded, original);
            }

            #[test]
            fn cancel_frame_roundtrip(rtt in any::<u16>(), mask in any::<u16>()) {
                let original = ControlFrame {
                    rtt_estimate_ms: rtt,
                    throughput_estimate: 0,
                    body: FrameBody::CancelMessages(mask),
                };
                let decoded = ControlFrame::decode(&original.encode().unwrap()).unwrap();
                prop_assert_eq!(decoded, original);
            }
        }
    }
}
