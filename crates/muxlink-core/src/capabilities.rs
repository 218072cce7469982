//! Capability negotiation records.
//!
//! Each side announces a protocol version and a feature bitmask in an 8-byte
//! record; the effective capability set of a connection is the bitwise AND of
//! both masks at the lexicographically lower version.

use crate::codec::{read_i32, read_u16, write_i32, write_u16};
use crate::error::FrameError;

/// Bit 0: the peer understands capability records at all.
pub const CAP_CAPABILITIES_SUPPORTED: u32 = 1 << 0;

/// Bit 1: the peer accepts Cancel-Messages frames.
pub const CAP_CANCEL_MESSAGE: u32 = 1 << 1;

/// Bit 31: a capability-extension block follows (reserved for future use).
pub const CAP_EXTENSION_PRESENT: u32 = 1 << 31;

/// Protocol version advertised by this library.
pub const LOCAL_MAJOR_VERSION: u16 = 1;
pub const LOCAL_MINOR_VERSION: u16 = 1;

/// A protocol version plus feature bitmask, as carried in `0x00` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet {
    pub major_version: u16,
    pub minor_version: u16,
    pub bits: u32,
}

impl CapabilitySet {
    /// Encoded size on the wire.
    pub const WIRE_LEN: usize = 8;

    /// The empty set: what a connection holds until the first `0x00` frame
    /// arrives from the peer.
    pub const NONE: CapabilitySet = CapabilitySet {
        major_version: 0,
        minor_version: 0,
        bits: 0,
    };

    /// The capability set this library advertises.
    pub fn local() -> CapabilitySet {
        CapabilitySet {
            major_version: LOCAL_MAJOR_VERSION,
            minor_version: LOCAL_MINOR_VERSION,
            bits: CAP_CAPABILITIES_SUPPORTED | CAP_CANCEL_MESSAGE,
        }
    }

    /// Intersect two capability sets: common bits at the lower version.
    pub fn negotiate(a: CapabilitySet, b: CapabilitySet) -> CapabilitySet {
        let (major_version, minor_version) = if (a.major_version, a.minor_version)
            <= (b.major_version, b.minor_version)
        {
            (a.major_version, a.minor_version)
        } else {
            (b.major_version, b.minor_version)
        };

        CapabilitySet {
            major_version,
            minor_version,
            bits: a.bits & b.bits,
        }
    }

    /// Whether every bit in `mask` is present.
    pub fn supports(&self, mask: u32) -> bool {
        self.bits & mask == mask
    }

    /// Append the 8-byte record: `major(u16) || minor(u16) || bits(i32)`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let at = out.len();
        out.resize(at + Self::WIRE_LEN, 0);
        write_u16(out, at, self.major_version);
        write_u16(out, at + 2, self.minor_version);
        write_i32(out, at + 4, self.bits as i32);
    }

    /// Decode an 8-byte record.
    pub fn decode(buf: &[u8]) -> Result<CapabilitySet, FrameError> {
        if buf.len() < Self::WIRE_LEN {
            return Err(FrameError::CapabilityTruncated {
                need: Self::WIRE_LEN,
                actual: buf.len(),
            });
        }

        Ok(CapabilitySet {
            major_version: read_u16(buf, 0),
            minor_version: read_u16(buf, 2),
            bits: read_i32(buf, 4) as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_set_advertises_cancel() {
        let local = CapabilitySet::local();
        assert_eq!(local.major_version, 1);
        assert_eq!(local.minor_version, 1);
        assert!(local.supports(CAP_CAPABILITIES_SUPPORTED));
        assert!(local.supports(CAP_CANCEL_MESSAGE));
        assert!(!local.supports(CAP_EXTENSION_PRESENT));
    }

    #[test]
    fn negotiate_intersects_bits() {
        let a = CapabilitySet {
            major_version: 1,
            minor_version: 1,
            bits: 0b0111,
        };
        let b = CapabilitySet {
            major_version: 1,
            minor_version: 1,
            bits: 0b0101,
        };
        assert_eq!(CapabilitySet::negotiate(a, b).bits, 0b0101);
    }

    #[test]
    fn negotiate_takes_lower_version() {
        let a = CapabilitySet {
            major_version: 1,
            minor_version: 4,
            bits: 1,
        };
        let b = CapabilitySet {
            major_version: 2,
            minor_version: 0,
            bits: 1,
        };
        let n = CapabilitySet::negotiate(a, b);
        assert_eq!((n.major_version, n.minor_version), (1, 4));

        // Same major: minor decides.
        let c = CapabilitySet {
            major_version: 1,
            minor_version: 1,
            bits: 1,
        };
        let n = CapabilitySet::negotiate(a, c);
        assert_eq!((n.major_version, n.minor_version), (1, 1));
    }

    #[test]
    fn negotiate_is_commutative() {
        let a = CapabilitySet {
            major_version: 1,
            minor_version: 7,
            bits: 0b11,
        };
        let b = CapabilitySet {
            major_version: 1,
            minor_version: 2,
            bits: 0b01,
        };
        assert_eq!(CapabilitySet::negotiate(a, b), CapabilitySet::negotiate(b, a));
    }

    #[test]
    fn wire_roundtrip() {
        let set = CapabilitySet {
            major_version: 0x0102,
            minor_version: 0x0304,
            bits: CAP_CAPABILITIES_SUPPORTED | CAP_EXTENSION_PRESENT,
        };
        let mut buf = Vec::new();
        set.encode_into(&mut buf);
        assert_eq!(buf.len(), CapabilitySet::WIRE_LEN);
        assert_eq!(&buf[..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(CapabilitySet::decode(&buf).unwrap(), set);
    }

    #[test]
    fn extension_bit_survives_i32_wire_field() {
        // Bit 31 makes the wire field negative; the mask must come back intact.
        let set = CapabilitySet {
            major_version: 1,
            minor_version: 0,
            bits: CAP_EXTENSION_PRESENT | CAP_CANCEL_MESSAGE,
        };
        let mut buf = Vec::new();
        set.encode_into(&mut buf);
        assert_eq!(buf[4], 0x80);
        assert_eq!(CapabilitySet::decode(&buf).unwrap().bits, set.bits);
    }

    #[test]
    fn decode_rejects_short_record() {
        assert!(matches!(
            CapabilitySet::decode(&[0u8; 7]),
            Err(FrameError::CapabilityTruncated { need: 8, actual: 7 })
        ));
    }
}
