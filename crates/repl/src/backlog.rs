//! Ring buffer of recently-propagated command bytes.
//!
//! The backlog remembers the most recent `capacity` bytes of the commit
//! stream, addressed by absolute offset. A reconnecting replica that is
//! still within the window gets exactly the bytes it missed; one that has
//! fallen out triggers a full resync.
//!
//! Invariants: `latest` is monotonic non-decreasing, `latest - earliest`
//! never exceeds the capacity, and `range_since(from)` is answerable iff
//! `earliest <= from <= latest`.

use crate::error::{ReplError, ReplResult};

/// Default backlog capacity: 1 MiB.
pub const DEFAULT_BACKLOG_SIZE: usize = 1024 * 1024;

/// Fixed-size circular byte buffer with absolute offsets.
#[derive(Debug)]
pub struct Backlog {
    buffer: Vec<u8>,
    /// Earliest absolute offset still present.
    earliest: u64,
    /// Absolute offset one past the newest byte.
    latest: u64,
    /// Set once the ring has overwritten its first byte.
    wrapped: bool,
}

impl Backlog {
    /// Create a backlog holding up to `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "backlog capacity must be non-zero");
        Backlog {
            buffer: vec![0u8; capacity],
            earliest: 0,
            latest: 0,
            wrapped: false,
        }
    }

    /// Ring capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Earliest servable absolute offset.
    pub fn earliest_offset(&self) -> u64 {
        self.earliest
    }

    /// Latest absolute offset (one past the newest byte).
    pub fn latest_offset(&self) -> u64 {
        self.latest
    }

    /// Whether the ring has discarded data since creation.
    pub fn has_wrapped(&self) -> bool {
        self.wrapped
    }

    /// Append bytes to the ring, advancing `earliest` past anything
    /// overwritten. Returns the new latest offset.
    pub fn append(&mut self, bytes: &[u8]) -> u64 {
        let cap = self.buffer.len();

        // Bytes that can never be served (a single append larger than the
        // ring) still advance the offsets; only the tail window lands.
        let effective = if bytes.len() > cap {
            &bytes[bytes.len() - cap..]
        } else {
            bytes
        };
        let skipped = (bytes.len() - effective.len()) as u64;

        let mut pos = ((self.latest + skipped) % cap as u64) as usize;
        let mut remaining = effective;
        while !remaining.is_empty() {
            let run = remaining.len().min(cap - pos);
            self.buffer[pos..pos + run].copy_from_slice(&remaining[..run]);
            remaining = &remaining[run..];
            pos = (pos + run) % cap;
        }

        self.latest += bytes.len() as u64;
        let floor = self.latest.saturating_sub(cap as u64);
        if floor > self.earliest {
            self.earliest = floor;
            self.wrapped = true;
        }
        self.latest
    }

    /// Whether `[from, latest)` can be served from the ring.
    pub fn can_serve(&self, from: u64) -> bool {
        from >= self.earliest && from <= self.latest
    }

    /// Copy out the bytes in `[from, latest)`.
    pub fn range_since(&self, from: u64) -> ReplResult<Vec<u8>> {
        if !self.can_serve(from) {
            return Err(ReplError::BacklogUnavailable {
                from,
                earliest: self.earliest,
                latest: self.latest,
            });
        }
        let cap = self.buffer.len();
        let len = (self.latest - from) as usize;
        let mut out = Vec::with_capacity(len);
        let mut pos = (from % cap as u64) as usize;
        let mut remaining = len;
        while remaining > 0 {
            let run = remaining.min(cap - pos);
            out.extend_from_slice(&self.buffer[pos..pos + run]);
            remaining -= run;
            pos = (pos + run) % cap;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_append_advances_latest() {
        let mut backlog = Backlog::new(64);
        assert_eq!(backlog.append(b"abcd"), 4);
        assert_eq!(backlog.append(b"efgh"), 8);
        assert_eq!(backlog.earliest_offset(), 0);
        assert!(!backlog.has_wrapped());
    }

    #[test]
    fn test_range_since_returns_exact_window() {
        let mut backlog = Backlog::new(64);
        backlog.append(b"hello ");
        backlog.append(b"world");
        assert_eq!(backlog.range_since(0).unwrap(), b"hello world");
        assert_eq!(backlog.range_since(6).unwrap(), b"world");
        assert_eq!(backlog.range_since(11).unwrap(), b"");
    }

    #[test]
    fn test_wrap_advances_earliest() {
        let mut backlog = Backlog::new(8);
        backlog.append(b"12345678");
        assert_eq!(backlog.earliest_offset(), 0);
        backlog.append(b"AB");
        assert_eq!(backlog.earliest_offset(), 2);
        assert!(backlog.has_wrapped());
        assert_eq!(backlog.range_since(2).unwrap(), b"345678AB");
        assert!(backlog.range_since(1).is_err());
    }

    #[test]
    fn test_oversized_append_keeps_tail_window() {
        let mut backlog = Backlog::new(8);
        let big: Vec<u8> = (0..20u8).collect();
        assert_eq!(backlog.append(&big), 20);
        assert_eq!(backlog.earliest_offset(), 12);
        assert_eq!(backlog.range_since(12).unwrap(), &big[12..]);
    }

    #[test]
    fn test_unservable_requests_rejected() {
        let mut backlog = Backlog::new(8);
        backlog.append(b"0123456789");
        // Before the window.
        assert!(matches!(
            backlog.range_since(1),
            Err(ReplError::BacklogUnavailable { .. })
        ));
        // After latest.
        assert!(backlog.range_since(11).is_err());
    }

    proptest! {
        // Invariant 6: after arbitrary appends, range_since(x) is valid iff
        // earliest <= x <= latest and its length is latest - x.
        #[test]
        fn prop_serve_law(chunks in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..40), 0..40))
        {
            let mut backlog = Backlog::new(64);
            let mut shadow: Vec<u8> = Vec::new();
            for chunk in &chunks {
                backlog.append(chunk);
                shadow.extend_from_slice(chunk);
            }
            let latest = backlog.latest_offset();
            let earliest = backlog.earliest_offset();
            prop_assert_eq!(latest as usize, shadow.len());
            prop_assert!(latest - earliest <= 64);

            for x in 0..=latest {
                match backlog.range_since(x) {
                    Ok(bytes) => {
                        prop_assert!(x >= earliest);
                        prop_assert_eq!(bytes.len() as u64, latest - x);
                        prop_assert_eq!(&bytes[..], &shadow[x as usize..]);
                    }
                    Err(_) => prop_assert!(x < earliest),
                }
            }
        }

        #[test]
        fn prop_latest_monotonic(chunks in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..200), 0..30))
        {
            let mut backlog = Backlog::new(32);
            let mut previous = 0u64;
            for chunk in &chunks {
                let latest = backlog.append(chunk);
                prop_assert!(latest >= previous);
                prop_assert!(latest - backlog.earliest_offset() <= 32);
                previous = latest;
            }
        }
    }
}
