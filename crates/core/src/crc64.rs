//! Streaming CRC-64 used by the snapshot file footer.
//!
//! Parameters: ISO 3309 polynomial, reflected, initial value 0, no final
//! xor — the exact variant the snapshot format is defined over. The lookup
//! table is built once at first use.

use once_cell::sync::Lazy;

/// Reflected form of the ISO 3309 polynomial (x^64 + x^4 + x^3 + x + 1).
const POLY_REFLECTED: u64 = 0xD800_0000_0000_0000;

static TABLE: Lazy<[u64; 256]> = Lazy::new(|| {
    let mut table = [0u64; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let mut crc = i as u64;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLY_REFLECTED
            } else {
                crc >> 1
            };
        }
        *slot = crc;
    }
    table
});

/// Incremental CRC-64 hasher.
#[derive(Debug, Clone, Default)]
pub struct Crc64 {
    state: u64,
}

impl Crc64 {
    /// Start a new checksum (initial value 0).
    pub fn new() -> Self {
        Crc64 { state: 0 }
    }

    /// Feed bytes into the checksum.
    pub fn update(&mut self, bytes: &[u8]) {
        let mut crc = self.state;
        for &b in bytes {
            crc = TABLE[((crc ^ b as u64) & 0xFF) as usize] ^ (crc >> 8);
        }
        self.state = crc;
    }

    /// The checksum over everything fed so far.
    pub fn finalize(&self) -> u64 {
        self.state
    }
}

/// One-shot checksum of a byte slice.
pub fn crc64(bytes: &[u8]) -> u64 {
    let mut hasher = Crc64::new();
    hasher.update(bytes);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_input_is_zero() {
        assert_eq!(crc64(b""), 0);
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        let data = b"REDIS0009 some payload bytes";
        let mut hasher = Crc64::new();
        hasher.update(&data[..7]);
        hasher.update(&data[7..]);
        assert_eq!(hasher.finalize(), crc64(data));
    }

    #[test]
    fn test_single_bit_sensitivity() {
        let data = vec![0xA5u8; 64];
        let base = crc64(&data);
        for i in 0..data.len() {
            let mut flipped = data.clone();
            flipped[i] ^= 0x01;
            assert_ne!(crc64(&flipped), base, "flip at byte {} undetected", i);
        }
    }

    proptest! {
        #[test]
        fn prop_deterministic(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            prop_assert_eq!(crc64(&data), crc64(&data));
        }

        #[test]
        fn prop_split_point_irrelevant(data in proptest::collection::vec(any::<u8>(), 1..512),
                                       split in 0usize..512)
        {
            let split = split % data.len();
            let mut hasher = Crc64::new();
            hasher.update(&data[..split]);
            hasher.update(&data[split..]);
            prop_assert_eq!(hasher.finalize(), crc64(&data));
        }
    }
}
