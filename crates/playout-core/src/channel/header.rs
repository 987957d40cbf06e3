//! Channel coder wire headers
//!
//! All headers are packed with explicit shifts into network byte order;
//! nothing depends on host struct layout.
//!
//! Redundancy (RFC 2198 style):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |1|   block PT  |  timestamp offset         |   block length    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0|   block PT  |   (primary; length is the rest of the packet)
//! +-+-+-+-+-+-+-+-+
//! ```
//!
//! Interleaver:
//!
//! ```text
//! +-------------+----------------+-----+-----+-----+---------------+
//! | PT (7)      | units/leaf (8) |n1-1 |n2-1 |phase| presence (8)  |
//! +-------------+----------------+-----+-----+-----+---------------+
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};

/// Largest payload type representable in 7 bits
pub const MAX_PAYLOAD_TYPE: u8 = 0x7f;

/// Largest redundancy timestamp offset (14 bits)
pub const MAX_RED_OFFSET: u32 = 0x3fff;

/// Largest redundancy block length in bytes (10 bits)
pub const MAX_RED_BLOCK_LEN: usize = 0x3ff;

/// Largest interleaver matrix dimension (3 bits, stored minus one)
pub const MAX_INTERLEAVE_DIM: u8 = 8;

/// One header of a redundancy block chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedundancyHeader {
    /// Redundant block with explicit offset and length
    Extension {
        payload_type: u8,
        ts_offset: u32,
        length: usize,
    },
    /// Final header; the primary block runs to the end of the packet
    Primary { payload_type: u8 },
}

impl RedundancyHeader {
    /// Size of an extension header in bytes
    pub const EXTENSION_SIZE: usize = 4;

    /// Size of the primary header in bytes
    pub const PRIMARY_SIZE: usize = 1;

    pub fn payload_type(&self) -> u8 {
        match *self {
            RedundancyHeader::Extension { payload_type, .. } => payload_type,
            RedundancyHeader::Primary { payload_type } => payload_type,
        }
    }

    /// Serialize, refusing any value that would not fit its field
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        match *self {
            RedundancyHeader::Extension {
                payload_type,
                ts_offset,
                length,
            } => {
                check_payload_type(payload_type)?;
                if ts_offset > MAX_RED_OFFSET {
                    return Err(Error::Configuration(format!(
                        "redundancy offset {} exceeds {}",
                        ts_offset, MAX_RED_OFFSET
                    )));
                }
                if length > MAX_RED_BLOCK_LEN {
                    return Err(Error::Configuration(format!(
                        "redundancy block of {} bytes exceeds {}",
                        length, MAX_RED_BLOCK_LEN
                    )));
                }
                let word = 0x8000_0000u32
                    | (payload_type as u32) << 24
                    | ts_offset << 10
                    | length as u32;
                buf.put_u32(word);
            }
            RedundancyHeader::Primary { payload_type } => {
                check_payload_type(payload_type)?;
                buf.put_u8(payload_type);
            }
        }
        Ok(())
    }

    /// Parse the full header chain from the front of a packet
    ///
    /// Returns the headers in wire order (primary last) and leaves `buf`
    /// positioned at the first block.
    pub fn parse_chain(buf: &mut impl Buf) -> Result<Vec<RedundancyHeader>> {
        let mut headers = Vec::new();
        loop {
            if buf.remaining() < Self::PRIMARY_SIZE {
                return Err(Error::truncated(Self::PRIMARY_SIZE, buf.remaining()));
            }
            if buf.chunk()[0] & 0x80 == 0 {
                let payload_type = buf.get_u8() & MAX_PAYLOAD_TYPE;
                headers.push(RedundancyHeader::Primary { payload_type });
                return Ok(headers);
            }
            if buf.remaining() < Self::EXTENSION_SIZE {
                return Err(Error::truncated(Self::EXTENSION_SIZE, buf.remaining()));
            }
            let word = buf.get_u32();
            headers.push(RedundancyHeader::Extension {
                payload_type: ((word >> 24) & 0x7f) as u8,
                ts_offset: (word >> 10) & MAX_RED_OFFSET,
                length: (word & MAX_RED_BLOCK_LEN as u32) as usize,
            });
        }
    }
}

/// Interleaver packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterleaverHeader {
    pub payload_type: u8,
    pub units_per_leaf: u8,
    pub n1: u8,
    pub n2: u8,
    pub phase: u8,
    /// Bit `7 - row` is set when that row's leaf is present
    pub presence: u8,
}

impl InterleaverHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 4;

    /// Presence bit for a matrix row
    pub fn row_bit(row: usize) -> u8 {
        0x80 >> row
    }

    pub fn is_present(&self, row: usize) -> bool {
        self.presence & Self::row_bit(row) != 0
    }

    /// Number of leaves carried
    pub fn present_rows(&self) -> usize {
        self.presence.count_ones() as usize
    }

    fn validate(&self) -> Result<()> {
        if self.n1 == 0 || self.n1 > MAX_INTERLEAVE_DIM || self.n2 == 0 || self.n2 > MAX_INTERLEAVE_DIM {
            return Err(Error::ProtocolViolation(format!(
                "interleaver dimensions {}x{} out of range",
                self.n1, self.n2
            )));
        }
        if self.phase >= self.n2 {
            return Err(Error::ProtocolViolation(format!(
                "interleaver phase {} outside {} columns",
                self.phase, self.n2
            )));
        }
        if self.units_per_leaf == 0 {
            return Err(Error::ProtocolViolation("interleaver leaf without units".into()));
        }
        let valid_rows = !(0xffu8.checked_shr(self.n1 as u32).unwrap_or(0));
        if self.presence & !valid_rows != 0 {
            return Err(Error::ProtocolViolation(format!(
                "presence mask {:#04x} marks rows beyond n1={}",
                self.presence, self.n1
            )));
        }
        Ok(())
    }

    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        check_payload_type(self.payload_type)?;
        self.validate()
            .map_err(|e| Error::Configuration(e.to_string()))?;
        let word = (self.payload_type as u32) << 25
            | (self.units_per_leaf as u32) << 17
            | ((self.n1 - 1) as u32) << 14
            | ((self.n2 - 1) as u32) << 11
            | (self.phase as u32) << 8
            | self.presence as u32;
        buf.put_u32(word);
        Ok(())
    }

    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(Error::truncated(Self::SIZE, buf.remaining()));
        }
        let word = buf.get_u32();
        let header = Self {
            payload_type: ((word >> 25) & 0x7f) as u8,
            units_per_leaf: ((word >> 17) & 0xff) as u8,
            n1: ((word >> 14) & 0x7) as u8 + 1,
            n2: ((word >> 11) & 0x7) as u8 + 1,
            phase: ((word >> 8) & 0x7) as u8,
            presence: (word & 0xff) as u8,
        };
        header.validate()?;
        Ok(header)
    }
}

fn check_payload_type(payload_type: u8) -> Result<()> {
    if payload_type > MAX_PAYLOAD_TYPE {
        return Err(Error::Configuration(format!(
            "payload type {} does not fit in 7 bits",
            payload_type
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redundancy_extension_bit_layout() {
        let mut buf = BytesMut::new();
        RedundancyHeader::Extension {
            payload_type: 110,
            ts_offset: 320,
            length: 160,
        }
        .serialize(&mut buf)
        .unwrap();
        RedundancyHeader::Primary { payload_type: 100 }
            .serialize(&mut buf)
            .unwrap();

        // F=1, PT=110 -> 0xee; offset 320 = 0b00000101000000; length 160
        assert_eq!(&buf[..], &[0xee, 0x05, 0x00, 0xa0, 0x64]);

        let mut bytes = buf.freeze();
        let chain = RedundancyHeader::parse_chain(&mut bytes).unwrap();
        assert_eq!(
            chain,
            vec![
                RedundancyHeader::Extension {
                    payload_type: 110,
                    ts_offset: 320,
                    length: 160
                },
                RedundancyHeader::Primary { payload_type: 100 },
            ]
        );
        assert_eq!(bytes.remaining(), 0);
    }

    #[test]
    fn test_redundancy_field_overflow_rejected() {
        let mut buf = BytesMut::new();
        let too_far = RedundancyHeader::Extension {
            payload_type: 100,
            ts_offset: MAX_RED_OFFSET + 1,
            length: 10,
        };
        assert!(matches!(too_far.serialize(&mut buf), Err(Error::Configuration(_))));
        let too_long = RedundancyHeader::Extension {
            payload_type: 100,
            ts_offset: 160,
            length: MAX_RED_BLOCK_LEN + 1,
        };
        assert!(matches!(too_long.serialize(&mut buf), Err(Error::Configuration(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_truncated_chain() {
        let mut bytes = bytes::Bytes::from_static(&[0xee, 0x05]);
        assert!(matches!(
            RedundancyHeader::parse_chain(&mut bytes),
            Err(Error::BufferTooSmall { required: 4, available: 2 })
        ));
        let mut empty = bytes::Bytes::new();
        assert!(RedundancyHeader::parse_chain(&mut empty).is_err());
    }

    #[test]
    fn test_interleaver_header_bit_layout() {
        let header = InterleaverHeader {
            payload_type: 100,
            units_per_leaf: 1,
            n1: 4,
            n2: 4,
            phase: 2,
            presence: 0xd0,
        };
        let mut buf = BytesMut::new();
        header.serialize(&mut buf).unwrap();
        let word = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(word >> 25, 100);
        assert_eq!((word >> 17) & 0xff, 1);
        assert_eq!((word >> 14) & 0x7, 3);
        assert_eq!((word >> 11) & 0x7, 3);
        assert_eq!((word >> 8) & 0x7, 2);
        assert_eq!(word & 0xff, 0xd0);

        let parsed = InterleaverHeader::parse(&mut buf.freeze()).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_present(0) && parsed.is_present(1) && parsed.is_present(3));
        assert!(!parsed.is_present(2));
        assert_eq!(parsed.present_rows(), 3);
    }

    #[test]
    fn test_interleaver_rejects_bad_phase_and_rows() {
        // n1=2 (stored 1), n2=2 (stored 1), phase 3
        let word: u32 = 100 << 25 | 1 << 17 | 1 << 14 | 1 << 11 | 3 << 8 | 0x80;
        let mut bytes = bytes::Bytes::copy_from_slice(&word.to_be_bytes());
        assert!(InterleaverHeader::parse(&mut bytes).unwrap_err().is_protocol_violation());

        // presence bit for row 2 with n1=2
        let word: u32 = 100 << 25 | 1 << 17 | 1 << 14 | 1 << 11 | 0x20;
        let mut bytes = bytes::Bytes::copy_from_slice(&word.to_be_bytes());
        assert!(InterleaverHeader::parse(&mut bytes).unwrap_err().is_protocol_violation());
    }
}
