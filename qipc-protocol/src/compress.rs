//! Compression envelope.
//!
//! A compressed payload starts with a length field holding the uncompressed
//! message size (header included): 4 bytes unsigned for mode 1, 8 bytes
//! signed for every other mode. The rest is a block stream of groups, each a
//! flag byte followed by up to eight items. A clear flag bit is one literal
//! byte. A set bit is a back-reference: one byte selecting a previous
//! position through a table keyed by the XOR of two adjacent output bytes,
//! then one byte holding the copy length beyond the first two bytes.

use crate::error::ProtocolError;
use crate::header::{Endianness, HEADER_SIZE};

/// Width of the length field that opens a compressed payload.
pub fn length_field_len(compression_mode: u8) -> usize {
    if compression_mode == 1 {
        4
    } else {
        8
    }
}

/// Parses the length field and returns the uncompressed payload size.
pub fn uncompressed_size(
    compression_mode: u8,
    mut field: &[u8],
    endianness: Endianness,
) -> Result<usize, ProtocolError> {
    let needed = length_field_len(compression_mode);
    if field.len() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            available: field.len(),
        });
    }

    let total = if compression_mode == 1 {
        endianness.get_u32(&mut field) as i64
    } else {
        endianness.get_i64(&mut field)
    };

    let size = total - HEADER_SIZE as i64;
    if size <= 0 {
        return Err(ProtocolError::InvalidUncompressedSize(size));
    }
    usize::try_from(size).map_err(|_| ProtocolError::InvalidUncompressedSize(size))
}

/// Upper bound on output bytes per block byte: a two-byte back-reference
/// copies at most 257 bytes.
pub const MAX_EXPANSION: usize = 129;

/// Expands a compressed block into exactly `expected_size` bytes.
///
/// Sizes the block could not produce are rejected before any allocation.
pub fn decompress(compressed: &[u8], expected_size: usize) -> Result<Vec<u8>, ProtocolError> {
    if expected_size > compressed.len().saturating_mul(MAX_EXPANSION) {
        return Err(ProtocolError::Decompression(format!(
            "{} byte block cannot expand to {} bytes",
            compressed.len(),
            expected_size
        )));
    }
    let mut out = vec![0u8; expected_size];
    let mut table = [0usize; 256];
    let mut input = compressed.iter().copied();
    let mut next = || {
        input
            .next()
            .ok_or_else(|| ProtocolError::Decompression("compressed block ended early".into()))
    };

    let (mut s, mut p) = (0usize, 0usize);
    let mut flags = 0u8;
    let mut bit = 0u16;

    while s < expected_size {
        if bit == 0 {
            flags = next()?;
            bit = 1;
        }

        let is_reference = u16::from(flags) & bit != 0;
        let mut extra = 0usize;
        if is_reference {
            let mut r = table[usize::from(next()?)];
            if s + 2 > expected_size {
                return Err(overrun(s + 2, expected_size));
            }
            for _ in 0..2 {
                out[s] = out[r];
                s += 1;
                r += 1;
            }
            extra = usize::from(next()?);
            if s + extra > expected_size {
                return Err(overrun(s + extra, expected_size));
            }
            for m in 0..extra {
                out[s + m] = out[r + m];
            }
        } else {
            out[s] = next()?;
            s += 1;
        }

        while p + 1 < s {
            table[usize::from(out[p] ^ out[p + 1])] = p;
            p += 1;
        }

        if is_reference {
            s += extra;
            p = s;
        }

        bit <<= 1;
        if bit == 256 {
            bit = 0;
        }
    }

    Ok(out)
}

fn overrun(end: usize, expected: usize) -> ProtocolError {
    ProtocolError::Decompression(format!(
        "back-reference ends at {} past uncompressed size {}",
        end, expected
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literals_only() {
        // Two groups: eight literals, then two.
        let mut block = vec![0x00];
        block.extend_from_slice(b"abcdefgh");
        block.push(0x00);
        block.extend_from_slice(b"ij");

        let out = decompress(&block, 10).unwrap();
        assert_eq!(out, b"abcdefghij");
    }

    #[test]
    fn test_back_reference() {
        // 'a', 'b' literal; third item copies two bytes from the pair "ab".
        let block = [0b0000_0100, b'a', b'b', b'a' ^ b'b', 0x00];
        let out = decompress(&block, 4).unwrap();
        assert_eq!(out, b"abab");
    }

    #[test]
    fn test_overlapping_back_reference() {
        // Copy of four bytes from position 0 while writing from position 2.
        let block = [0b0000_0100, b'a', b'a', 0x00, 0x02];
        let out = decompress(&block, 6).unwrap();
        assert_eq!(out, b"aaaaaa");
    }

    #[test]
    fn test_truncated_block() {
        let block = [0x00, b'a'];
        let result = decompress(&block, 4);
        assert!(matches!(result, Err(ProtocolError::Decompression(_))));
    }

    #[test]
    fn test_reference_past_end() {
        let block = [0b0000_0100, b'a', b'b', b'a' ^ b'b', 0x05];
        let result = decompress(&block, 4);
        assert!(matches!(result, Err(ProtocolError::Decompression(_))));
    }

    #[test]
    fn test_size_beyond_block_capacity() {
        let block = [0b0000_0001, 0x00];
        let result = decompress(&block, usize::MAX);
        assert!(matches!(result, Err(ProtocolError::Decompression(_))));

        let result = decompress(&[], 1);
        assert!(matches!(result, Err(ProtocolError::Decompression(_))));
    }

    #[test]
    fn test_longest_back_reference_within_capacity() {
        // One literal and one 257-byte copy: 258 bytes from a 4-byte block.
        let block = [0b0000_0010, b'z', 0x00, 0xff];
        let out = decompress(&block, 258).unwrap();
        assert_eq!(out, vec![b'z'; 258]);
    }

    #[test]
    fn test_uncompressed_size_mode_one() {
        let size = uncompressed_size(1, &[20, 0, 0, 0], Endianness::Little).unwrap();
        assert_eq!(size, 12);

        let size = uncompressed_size(1, &[0, 0, 0, 20], Endianness::Big).unwrap();
        assert_eq!(size, 12);
    }

    #[test]
    fn test_uncompressed_size_wide_field() {
        let field = (1i64 << 33).to_le_bytes();
        let size = uncompressed_size(2, &field, Endianness::Little).unwrap();
        assert_eq!(size as u64, (1u64 << 33) - 8);
    }

    #[test]
    fn test_uncompressed_size_not_positive() {
        let result = uncompressed_size(1, &[8, 0, 0, 0], Endianness::Little);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidUncompressedSize(0))
        ));

        let field = (-4i64).to_le_bytes();
        let result = uncompressed_size(2, &field, Endianness::Little);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidUncompressedSize(-12))
        ));
    }

    #[test]
    fn test_length_field_len() {
        assert_eq!(length_field_len(1), 4);
        assert_eq!(length_field_len(2), 8);
    }
}
