//! Binary snapshot format.
//!
//! # File layout
//!
//! ```text
//! "REDIS0009"                            ; 9-byte ASCII header
//!   ( 0xFE <db_id:len>                   ; select database
//!     ( [0xFC <expire_ms:le:8>]          ; optional absolute expiry
//!       <type:1> <key:len-prefixed> <value:type-specific> )*
//!   )*
//! 0xFF                                   ; end of file
//! <crc64:le:8>                           ; checksum of everything above
//! ```
//!
//! Type bytes: STRING=0, LIST=1, SET=2, ZSET=3, HASH=4. Sorted-set scores
//! are 8-byte big-endian IEEE-754. The checksum is the reflected ISO 3309
//! CRC-64 with initial value 0, written little-endian, covering every byte
//! up to and including the EOF opcode.
//!
//! # Length encoding
//!
//! - 0–63: one byte `00xxxxxx`
//! - 64–16383: two bytes `01xxxxxx xxxxxxxx`
//! - larger: `10000000` followed by a big-endian 32-bit value

pub mod reader;
pub mod writer;

pub use reader::{load_file, load_slice, LoadReport};
pub use writer::{serialize_keyspace, SnapshotEngine, SaveReport};

use crate::error::{PersistError, PersistResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// 9-byte file header.
pub const HEADER: &[u8; 9] = b"REDIS0009";

/// Prefix every valid header shares; the last two bytes are version digits.
pub const HEADER_PREFIX: &[u8; 7] = b"REDIS00";

/// Select-database opcode.
pub const OPCODE_SELECT_DB: u8 = 0xFE;

/// End-of-file opcode.
pub const OPCODE_EOF: u8 = 0xFF;

/// Absolute-expiry opcode (milliseconds, 8-byte little-endian).
pub const OPCODE_EXPIRE_MS: u8 = 0xFC;

/// Value type tags.
pub const TYPE_STRING: u8 = 0;
/// List value tag.
pub const TYPE_LIST: u8 = 1;
/// Set value tag.
pub const TYPE_SET: u8 = 2;
/// Sorted-set value tag.
pub const TYPE_ZSET: u8 = 3;
/// Hash value tag.
pub const TYPE_HASH: u8 = 4;

/// Write a length in the variable-width encoding.
pub fn write_length<W: Write>(out: &mut W, len: usize) -> PersistResult<()> {
    if len < 64 {
        out.write_u8(len as u8)?;
    } else if len < 16_384 {
        out.write_u8(0x40 | (len >> 8) as u8)?;
        out.write_u8((len & 0xFF) as u8)?;
    } else {
        if len > u32::MAX as usize {
            return Err(PersistError::corruption(format!(
                "length {} not encodable",
                len
            )));
        }
        out.write_u8(0x80)?;
        out.write_u32::<BigEndian>(len as u32)?;
    }
    Ok(())
}

/// Read a length in the variable-width encoding.
pub fn read_length<R: Read>(input: &mut R) -> PersistResult<usize> {
    let first = input.read_u8()?;
    match first >> 6 {
        0b00 => Ok((first & 0x3F) as usize),
        0b01 => {
            let low = input.read_u8()?;
            Ok((((first & 0x3F) as usize) << 8) | low as usize)
        }
        0b10 => Ok(input.read_u32::<BigEndian>()? as usize),
        _ => Err(PersistError::corruption(format!(
            "invalid length prefix byte 0x{:02X}",
            first
        ))),
    }
}

/// Write a length-prefixed byte sequence.
pub fn write_bytes<W: Write>(out: &mut W, bytes: &[u8]) -> PersistResult<()> {
    write_length(out, bytes.len())?;
    out.write_all(bytes)?;
    Ok(())
}

/// Read a length-prefixed byte sequence.
///
/// Lengths above the wire bulk limit cannot come from a well-formed image;
/// rejecting them keeps a corrupted length byte from driving a huge
/// allocation before the checksum check runs.
pub fn read_bytes<R: Read>(input: &mut R) -> PersistResult<Vec<u8>> {
    let len = read_length(input)?;
    if len > ember_core::MAX_BULK_LEN {
        return Err(PersistError::corruption(format!(
            "implausible payload length {}",
            len
        )));
    }
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn round_trip(len: usize) -> (usize, usize) {
        let mut buf = Vec::new();
        write_length(&mut buf, len).unwrap();
        let encoded_len = buf.len();
        let decoded = read_length(&mut Cursor::new(&buf)).unwrap();
        (decoded, encoded_len)
    }

    #[test]
    fn test_length_encoding_widths() {
        assert_eq!(round_trip(0), (0, 1));
        assert_eq!(round_trip(63), (63, 1));
        assert_eq!(round_trip(64), (64, 2));
        assert_eq!(round_trip(16_383), (16_383, 2));
        assert_eq!(round_trip(16_384), (16_384, 5));
        assert_eq!(round_trip(1 << 30), (1 << 30, 5));
    }

    #[test]
    fn test_length_boundary_bit_patterns() {
        let mut buf = Vec::new();
        write_length(&mut buf, 63).unwrap();
        assert_eq!(buf, [0x3F]);

        buf.clear();
        write_length(&mut buf, 64).unwrap();
        assert_eq!(buf, [0x40, 0x40]);

        buf.clear();
        write_length(&mut buf, 16_384).unwrap();
        assert_eq!(buf, [0x80, 0x00, 0x00, 0x40, 0x00]);
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let mut cursor = Cursor::new(vec![0xC0u8]);
        assert!(matches!(
            read_length(&mut cursor),
            Err(PersistError::Corruption(_))
        ));
    }

    #[test]
    fn test_bytes_round_trip() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"payload").unwrap();
        let decoded = read_bytes(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, b"payload");
    }

    proptest! {
        #[test]
        fn prop_length_round_trip(len in 0usize..(1 << 26)) {
            prop_assert_eq!(round_trip(len).0, len);
        }
    }
}
