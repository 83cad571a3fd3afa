//! Growable byte buffer with a pre-allocation policy.
//!
//! Backing store for string values. The buffer doubles while the used length
//! stays at or below 1 MiB, then grows linearly in 1 MiB steps, so repeated
//! appends stay amortised-cheap without over-reserving for large values.

/// Used length at which growth switches from doubling to +1 MiB steps.
const PREALLOC_LIMIT: usize = 1024 * 1024;

/// Mutable `(buffer, used_len)` pair; `buffer.len()` is the capacity.
#[derive(Debug, Clone)]
pub struct DynStr {
    buf: Box<[u8]>,
    used: usize,
}

impl DynStr {
    /// Create an empty buffer with no capacity.
    pub fn new() -> Self {
        DynStr {
            buf: Box::new([]),
            used: 0,
        }
    }

    /// Create a buffer holding a copy of `bytes`, with capacity per policy.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut s = DynStr::new();
        s.append(bytes);
        s
    }

    /// Bytes in use.
    pub fn len(&self) -> usize {
        self.used
    }

    /// True when no bytes are in use.
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Allocated capacity.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The used portion of the buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.used]
    }

    /// Append `bytes`, growing the buffer per the pre-allocation policy.
    ///
    /// Returns the new used length.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        self.reserve(bytes.len());
        self.buf[self.used..self.used + bytes.len()].copy_from_slice(bytes);
        self.used += bytes.len();
        self.used
    }

    /// Replace the contents with `bytes`, reusing capacity when possible.
    pub fn set(&mut self, bytes: &[u8]) {
        self.used = 0;
        self.append(bytes);
    }

    /// Ensure room for `additional` more bytes.
    ///
    /// New capacity is at least double the resulting used length while that
    /// stays within `PREALLOC_LIMIT`, and used length + 1 MiB beyond it.
    fn reserve(&mut self, additional: usize) {
        let needed = self.used + additional;
        if needed <= self.buf.len() {
            return;
        }
        let target = if needed <= PREALLOC_LIMIT {
            needed * 2
        } else {
            needed + PREALLOC_LIMIT
        };
        let mut grown = vec![0u8; target].into_boxed_slice();
        grown[..self.used].copy_from_slice(&self.buf[..self.used]);
        self.buf = grown;
        debug_assert!(self.used <= self.buf.len());
    }
}

impl Default for DynStr {
    fn default() -> Self {
        DynStr::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_append_and_read_back() {
        let mut s = DynStr::new();
        s.append(b"hello");
        s.append(b" world");
        assert_eq!(s.as_slice(), b"hello world");
        assert_eq!(s.len(), 11);
    }

    #[test]
    fn test_doubling_below_limit() {
        let mut s = DynStr::new();
        s.append(&[0u8; 100]);
        assert_eq!(s.capacity(), 200);

        s.append(&[0u8; 100]);
        assert_eq!(s.capacity(), 400);
    }

    #[test]
    fn test_linear_growth_above_limit() {
        let mut s = DynStr::new();
        s.append(&vec![0u8; PREALLOC_LIMIT + 1]);
        assert_eq!(s.capacity(), PREALLOC_LIMIT + 1 + PREALLOC_LIMIT);
    }

    #[test]
    fn test_set_reuses_capacity() {
        let mut s = DynStr::from_bytes(b"a longer initial value");
        let cap = s.capacity();
        s.set(b"short");
        assert_eq!(s.as_slice(), b"short");
        assert_eq!(s.capacity(), cap);
    }

    proptest! {
        #[test]
        fn prop_used_never_exceeds_capacity(chunks in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..256), 0..20))
        {
            let mut s = DynStr::new();
            let mut expected = Vec::new();
            for chunk in &chunks {
                s.append(chunk);
                expected.extend_from_slice(chunk);
                prop_assert!(s.len() <= s.capacity());
            }
            prop_assert_eq!(s.as_slice(), &expected[..]);
        }
    }
}
