//! Block diffs: computing them with a rolling scan and replaying them.
//!
//! A diff is an ordered list of segments. Concatenating, in order, each
//! segment's literal bytes followed by the remote block it references
//! reconstructs the new content.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::checksum::calc_weak32;
use crate::error::{Result, SyncError};
use crate::protocol::uint8_array;
use crate::signature::{BlockChecksum, ChecksumTable};

/// One piece of a diff.
///
/// On the wire each variant is a plain object: `{data, index}`, `{index}` or
/// `{data}`, with `data` in the `Uint8Array` JSON convention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DiffSegment {
    /// Literal bytes immediately followed by a reused remote block.
    LiteralThenBlock {
        /// Bytes not found remotely.
        #[serde(with = "uint8_array")]
        data: Vec<u8>,
        /// Remote block to reuse after the literal bytes.
        index: u32,
    },
    /// Verbatim reuse of a remote block.
    Block {
        /// Remote block index.
        index: u32,
    },
    /// Literal bytes not found remotely.
    Literal {
        /// Bytes not found remotely.
        #[serde(with = "uint8_array")]
        data: Vec<u8>,
    },
}

impl DiffSegment {
    /// Segment for a block match preceded by `pending` unmatched bytes.
    #[must_use]
    pub fn matched(pending: &[u8], index: u32) -> Self {
        if pending.is_empty() {
            Self::Block { index }
        } else {
            Self::LiteralThenBlock {
                data: pending.to_vec(),
                index,
            }
        }
    }

    /// Literal bytes carried by this segment, if any.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::LiteralThenBlock { data, .. } | Self::Literal { data } => Some(data.as_slice()),
            Self::Block { .. } => None,
        }
    }

    /// Remote block referenced by this segment, if any.
    #[must_use]
    pub const fn index(&self) -> Option<u32> {
        match self {
            Self::LiteralThenBlock { index, .. } | Self::Block { index } => Some(*index),
            Self::Literal { .. } => None,
        }
    }
}

/// Diff `data` against the remote `checksums` generated with `block_size`.
///
/// A window of `block_size` bytes slides one byte at a time until a block
/// matches, then jumps past the match. The earliest matching position wins;
/// among candidates for one position, the first in checksum-list order wins.
/// Unmatched trailing bytes become a final literal segment. Empty input, or
/// input that never matches, yields a single literal segment.
///
/// # Errors
///
/// Returns `InvalidArgument` if `block_size` is zero.
///
/// # Example
///
/// ```rust
/// use vfsync::{block_checksums, roll, DiffSegment};
///
/// let old = b"aaaabbbbcccc";
/// let new = b"aaaaXbbbbcccc";
/// let diff = roll(new, &block_checksums(old, 4), 4).unwrap();
/// assert_eq!(diff[0], DiffSegment::Block { index: 0 });
/// assert_eq!(diff[1], DiffSegment::LiteralThenBlock { data: b"X".to_vec(), index: 1 });
/// ```
pub fn roll(data: &[u8], checksums: &[BlockChecksum], block_size: usize) -> Result<Vec<DiffSegment>> {
    if block_size == 0 {
        return Err(SyncError::InvalidArgument(
            "block size must be non-zero".to_string(),
        ));
    }

    let table = ChecksumTable::new(checksums);
    let mut segments = Vec::new();
    let mut last_match_end = 0usize;
    let mut start = 0usize;
    let mut prev = None;

    while !table.is_empty() && start + block_size <= data.len() {
        let end = start + block_size;
        let weak = calc_weak32(data, prev, start, end);

        if let Some(block) = table.find_match(weak.digest(), &data[start..end]) {
            trace!(start, index = block.index, "block match");
            segments.push(DiffSegment::matched(&data[last_match_end..start], block.index));
            last_match_end = end;
            start = end;
            prev = None;
        } else {
            prev = Some(weak);
            start += 1;
        }
    }

    if last_match_end < data.len() || segments.is_empty() {
        segments.push(DiffSegment::Literal {
            data: data[last_match_end..].to_vec(),
        });
    }

    Ok(segments)
}

/// Replay `segments` against `base`, cut into `block_size` blocks.
///
/// # Errors
///
/// Returns `InvalidArgument` if `block_size` is zero, or `InvalidBlockIndex`
/// if a segment references a block `base` does not have (the diff was
/// computed against different content).
pub fn patch(base: &[u8], segments: &[DiffSegment], block_size: usize) -> Result<Vec<u8>> {
    if block_size == 0 {
        return Err(SyncError::InvalidArgument(
            "block size must be non-zero".to_string(),
        ));
    }

    let block_count = base.len().div_ceil(block_size);
    let mut output = Vec::with_capacity(base.len());

    for segment in segments {
        if let Some(data) = segment.data() {
            output.extend_from_slice(data);
        }
        if let Some(index) = segment.index() {
            let start = index as usize * block_size;
            if start >= base.len() {
                return Err(SyncError::InvalidBlockIndex { index, block_count });
            }
            let end = (start + block_size).min(base.len());
            output.extend_from_slice(&base[start..end]);
        }
    }

    Ok(output)
}

/// Statistics from a computed diff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffStats {
    /// Number of remote blocks reused.
    pub blocks_reused: usize,
    /// Total literal bytes that must be transmitted.
    pub literal_bytes: u64,
    /// Fraction of the new content covered by reused blocks (0.0-1.0).
    pub ratio: f64,
}

impl DiffStats {
    /// Compute statistics for a diff of content `total_len` bytes long.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // acceptable for ratio calculation
    pub fn from_segments(segments: &[DiffSegment], total_len: u64) -> Self {
        let blocks_reused = segments.iter().filter(|s| s.index().is_some()).count();
        let literal_bytes: u64 = segments
            .iter()
            .filter_map(DiffSegment::data)
            .map(|d| d.len() as u64)
            .sum();
        let ratio = if total_len == 0 {
            1.0
        } else {
            total_len.saturating_sub(literal_bytes) as f64 / total_len as f64
        };

        Self {
            blocks_reused,
            literal_bytes,
            ratio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::block_checksums;

    // ==========================================================================
    // ROLL TESTS
    // ==========================================================================

    #[test]
    fn roll_identical_is_all_blocks() {
        let data = b"aaaabbbbcccc";
        let diff = roll(data, &block_checksums(data, 4), 4).unwrap();
        assert_eq!(
            diff,
            vec![
                DiffSegment::Block { index: 0 },
                DiffSegment::Block { index: 1 },
                DiffSegment::Block { index: 2 },
            ]
        );
    }

    #[test]
    fn roll_empty_input_single_literal() {
        let diff = roll(b"", &block_checksums(b"abcd", 4), 4).unwrap();
        assert_eq!(diff, vec![DiffSegment::Literal { data: Vec::new() }]);
    }

    #[test]
    fn roll_short_input_single_literal() {
        let diff = roll(b"ab", &block_checksums(b"ab", 4), 4).unwrap();
        assert_eq!(diff, vec![DiffSegment::Literal { data: b"ab".to_vec() }]);
    }

    #[test]
    fn roll_no_checksums_single_literal() {
        let diff = roll(b"abcdefgh", &[], 4).unwrap();
        assert_eq!(diff, vec![DiffSegment::Literal { data: b"abcdefgh".to_vec() }]);
    }

    #[test]
    fn roll_trailing_literal() {
        let diff = roll(b"aaaaZZ", &block_checksums(b"aaaa", 4), 4).unwrap();
        assert_eq!(
            diff,
            vec![
                DiffSegment::Block { index: 0 },
                DiffSegment::Literal { data: b"ZZ".to_vec() },
            ]
        );
    }

    #[test]
    fn roll_leading_literal_paired_with_match() {
        let diff = roll(b"XYaaaa", &block_checksums(b"aaaa", 4), 4).unwrap();
        assert_eq!(
            diff,
            vec![DiffSegment::LiteralThenBlock {
                data: b"XY".to_vec(),
                index: 0
            }]
        );
    }

    #[test]
    fn roll_jumps_past_match() {
        // Without the jump "aaaaa" would also match at offset 1.
        let diff = roll(b"aaaaaaaa", &block_checksums(b"aaaa", 4), 4).unwrap();
        assert_eq!(
            diff,
            vec![DiffSegment::Block { index: 0 }, DiffSegment::Block { index: 0 }]
        );
    }

    #[test]
    fn roll_reordered_blocks() {
        let diff = roll(b"ccccaaaa", &block_checksums(b"aaaacccc", 4), 4).unwrap();
        assert_eq!(
            diff,
            vec![DiffSegment::Block { index: 1 }, DiffSegment::Block { index: 0 }]
        );
    }

    #[test]
    fn roll_zero_block_size_rejected() {
        assert!(matches!(
            roll(b"abc", &[], 0),
            Err(SyncError::InvalidArgument(_))
        ));
    }

    // ==========================================================================
    // PATCH TESTS
    // ==========================================================================

    #[test]
    fn patch_reconstructs_modified_content() {
        let old = b"Hello, World! This is a test file with some content.";
        let new = b"Hello, Universe! This is a test file with some content.";
        let diff = roll(new, &block_checksums(old, 8), 8).unwrap();
        assert_eq!(patch(old, &diff, 8).unwrap(), new);
    }

    #[test]
    fn patch_short_last_block() {
        let old = b"aaaabb";
        let diff = vec![DiffSegment::Block { index: 1 }, DiffSegment::Block { index: 0 }];
        assert_eq!(patch(old, &diff, 4).unwrap(), b"bbaaaa");
    }

    #[test]
    fn patch_rejects_missing_block() {
        let diff = vec![DiffSegment::Block { index: 2 }];
        let err = patch(b"aaaabbbb", &diff, 4).unwrap_err();
        assert!(matches!(
            err,
            SyncError::InvalidBlockIndex {
                index: 2,
                block_count: 2
            }
        ));
        assert!(err.is_conflict());
    }

    // ==========================================================================
    // SEGMENT + STATS TESTS
    // ==========================================================================

    #[test]
    fn segment_wire_shapes() {
        let both = serde_json::to_value(DiffSegment::LiteralThenBlock {
            data: vec![1, 2],
            index: 3,
        })
        .unwrap();
        assert_eq!(both["index"], 3);
        assert_eq!(both["data"]["__isUint8Array"], true);
        assert_eq!(both["data"]["__array"], serde_json::json!([1, 2]));

        let block = serde_json::to_value(DiffSegment::Block { index: 4 }).unwrap();
        assert_eq!(block, serde_json::json!({ "index": 4 }));
    }

    #[test]
    fn segment_wire_decode_each_shape() {
        let json = r#"[
            {"data": {"__isUint8Array": true, "__array": [104, 105]}, "index": 0},
            {"index": 1},
            {"data": {"__isUint8Array": true, "__array": [33]}}
        ]"#;
        let segments: Vec<DiffSegment> = serde_json::from_str(json).unwrap();
        assert_eq!(
            segments,
            vec![
                DiffSegment::LiteralThenBlock {
                    data: b"hi".to_vec(),
                    index: 0
                },
                DiffSegment::Block { index: 1 },
                DiffSegment::Literal { data: b"!".to_vec() },
            ]
        );
    }

    #[test]
    fn stats_counts_reuse_and_literals() {
        let segments = vec![
            DiffSegment::Block { index: 0 },
            DiffSegment::LiteralThenBlock {
                data: vec![0; 2],
                index: 1,
            },
            DiffSegment::Literal { data: vec![0; 2] },
        ];
        let stats = DiffStats::from_segments(&segments, 12);
        assert_eq!(stats.blocks_reused, 2);
        assert_eq!(stats.literal_bytes, 4);
        assert!((stats.ratio - 8.0 / 12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stats_empty_content() {
        let stats = DiffStats::from_segments(&[DiffSegment::Literal { data: Vec::new() }], 0);
        assert!((stats.ratio - 1.0).abs() < f64::EPSILON);
    }
}
