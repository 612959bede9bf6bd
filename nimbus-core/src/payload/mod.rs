//! Aggregation of per-call payloads into a single stored blob.
//!
//! Rather than uploading one object per call, a job concatenates every call's
//! serialized arguments into one buffer and records where each call's bytes
//! live. The runtime fetches only its own range.
//!
//! ```rust
//! use nimbus::payload::{AggregatedPayload, ByteRange};
//!
//! let payload = AggregatedPayload::aggregate(&[b"ab".to_vec(), vec![], b"cde".to_vec()]);
//! assert_eq!(payload.ranges()[2], ByteRange { offset: 2, length: 3 });
//! assert_eq!(payload.slice(2), Some(&b"cde"[..]));
//! assert_eq!(payload.len(), 5);
//! ```
use serde::{Deserialize, Serialize};

/// The location of one call's payload inside the aggregated buffer.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    /// Exclusive end of the range.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// The bytes covered by this range, if `buffer` is long enough.
    pub fn slice<'a>(&self, buffer: &'a [u8]) -> Option<&'a [u8]> {
        let start = usize::try_from(self.offset).ok()?;
        let end = usize::try_from(self.end()).ok()?;
        buffer.get(start..end)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct AggregatedPayload {
    buffer: Vec<u8>,
    ranges: Vec<ByteRange>,
}

impl AggregatedPayload {
    /// Concatenates `blobs` in order.
    pub fn aggregate<B: AsRef<[u8]>>(blobs: &[B]) -> Self {
        let total = blobs.iter().map(|b| b.as_ref().len()).sum();
        let mut buffer = Vec::with_capacity(total);
        let ranges = blobs
            .iter()
            .map(|blob| {
                let blob = blob.as_ref();
                let range = ByteRange {
                    offset: buffer.len() as u64,
                    length: blob.len() as u64,
                };
                buffer.extend_from_slice(blob);
                range
            })
            .collect();

        Self { buffer, ranges }
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    /// The payload of call `index`.
    pub fn slice(&self, index: usize) -> Option<&[u8]> {
        self.ranges.get(index)?.slice(&self.buffer)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<ByteRange>) {
        (self.buffer, self.ranges)
    }
}
