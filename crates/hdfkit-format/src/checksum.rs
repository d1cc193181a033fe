//! HDF5 metadata checksum: Jenkins lookup3 `hashlittle`.
//!
//! HDF5 uses Bob Jenkins' lookup3 hash for the checksums of v2/v3
//! superblocks and v2 object header chunks.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::FormatError;

/// Compute the Jenkins lookup3 checksum of a byte slice.
///
/// This is `hashlittle` with an initial value of zero, matching
/// `H5_checksum_lookup3` in the HDF5 C library.
pub fn jenkins_lookup3(data: &[u8]) -> u32 {
    let mut a: u32 = 0xdeadbeefu32.wrapping_add(data.len() as u32);
    let mut b = a;
    let mut c = a;

    let mut rest = data;
    while rest.len() > 12 {
        a = a.wrapping_add(LittleEndian::read_u32(&rest[0..4]));
        b = b.wrapping_add(LittleEndian::read_u32(&rest[4..8]));
        c = c.wrapping_add(LittleEndian::read_u32(&rest[8..12]));
        mix(&mut a, &mut b, &mut c);
        rest = &rest[12..];
    }

    if rest.is_empty() {
        return c;
    }

    // Missing tail bytes contribute nothing, same as zero bytes.
    let mut tail = [0u8; 12];
    tail[..rest.len()].copy_from_slice(rest);
    a = a.wrapping_add(LittleEndian::read_u32(&tail[0..4]));
    b = b.wrapping_add(LittleEndian::read_u32(&tail[4..8]));
    c = c.wrapping_add(LittleEndian::read_u32(&tail[8..12]));
    final_mix(&mut a, &mut b, &mut c);
    c
}

/// Verify a trailing 4-byte checksum over `block[..len - 4]`.
pub fn verify_trailing(structure: &'static str, block: &[u8]) -> Result<(), FormatError> {
    if block.len() < 4 {
        return Err(FormatError::UnexpectedEof {
            expected: 4,
            available: block.len(),
        });
    }
    let split = block.len() - 4;
    let stored = LittleEndian::read_u32(&block[split..]);
    let computed = jenkins_lookup3(&block[..split]);
    if stored != computed {
        return Err(FormatError::ChecksumMismatch {
            structure,
            stored,
            computed,
        });
    }
    Ok(())
}

fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(4);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(6);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(8);
    *b = b.wrapping_add(*a);
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(16);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(19);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(4);
    *b = b.wrapping_add(*a);
}

fn final_mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(14));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(11));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(25));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(16));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(4));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(14));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(24));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert_eq!(jenkins_lookup3(b""), 0xdeadbeef);
    }

    #[test]
    fn reference_vector() {
        // From the lookup3.c self-test driver.
        assert_eq!(
            jenkins_lookup3(b"Four score and seven years ago"),
            0x17770551
        );
    }

    #[test]
    fn all_tail_lengths_differ() {
        let mut seen = std::collections::HashSet::new();
        for len in 0..=24 {
            let data: Vec<u8> = (0..len).map(|i| i as u8 + 1).collect();
            assert!(seen.insert(jenkins_lookup3(&data)), "collision at {len}");
        }
    }

    #[test]
    fn verify_trailing_roundtrip() {
        let mut block = b"OHDR some header bytes".to_vec();
        let sum = jenkins_lookup3(&block);
        block.extend_from_slice(&sum.to_le_bytes());
        verify_trailing("object header", &block).unwrap();

        block[3] ^= 1;
        assert!(matches!(
            verify_trailing("object header", &block),
            Err(FormatError::ChecksumMismatch { structure: "object header", .. })
        ));
    }
}
