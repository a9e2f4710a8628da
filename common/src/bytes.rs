//! Byte-key ranges used for storage scans.

use std::ops::{Bound, RangeBounds};

use bytes::Bytes;

/// A range over byte-string keys.
///
/// Keys compare lexicographically, so a prefix scan is the half-open range
/// from the prefix itself up to the prefix's lexicographic successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytesRange {
    start: Bound<Bytes>,
    end: Bound<Bytes>,
}

impl BytesRange {
    pub fn new(start: Bound<Bytes>, end: Bound<Bytes>) -> Self {
        Self { start, end }
    }

    /// Creates a range covering every key that starts with `prefix`.
    pub fn prefix(prefix: Bytes) -> Self {
        let end = match prefix_successor(&prefix) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        Self {
            start: Bound::Included(prefix),
            end,
        }
    }

    /// Returns true when no key can fall inside the range.
    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Included(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Included(e))
            | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
            _ => false,
        }
    }
}

impl RangeBounds<Bytes> for BytesRange {
    fn start_bound(&self) -> Bound<&Bytes> {
        self.start.as_ref()
    }

    fn end_bound(&self) -> Bound<&Bytes> {
        self.end.as_ref()
    }
}

/// Smallest key greater than every key carrying `prefix`, or `None` when the
/// prefix is all `0xFF` bytes (or empty).
fn prefix_successor(prefix: &[u8]) -> Option<Bytes> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xFF {
            end.push(last + 1);
            return Some(Bytes::from(end));
        }
    }
    None
}
