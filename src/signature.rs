//! Block checksums and the bucketed lookup used during diffing.
//!
//! A file is cut into fixed-size blocks (the last one may be short) and each
//! block is described by its weak rolling checksum and strong digest.

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::checksum::{weak16, RollingChecksum};
use crate::hash::StrongHash;

/// Files larger than this are hashed block-parallel.
const PARALLEL_THRESHOLD: usize = 64 * 1024;

/// Checksum of a single block.
///
/// `index` is the block's position in the file at the time the checksums were
/// generated; it is reassigned on every regeneration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChecksum {
    /// Block index (0-based position in file).
    pub index: u32,
    /// Rolling checksum for fast matching.
    pub weak: u32,
    /// Strong digest for verification.
    pub strong: StrongHash,
}

impl BlockChecksum {
    /// Create a new block checksum.
    #[must_use]
    pub const fn new(index: u32, weak: u32, strong: StrongHash) -> Self {
        Self {
            index,
            weak,
            strong,
        }
    }

    /// Compute the checksum of a data block.
    #[must_use]
    pub fn compute(index: u32, data: &[u8]) -> Self {
        Self {
            index,
            weak: RollingChecksum::new(data).digest(),
            strong: StrongHash::compute(data),
        }
    }
}

/// Checksum every `block_size` block of `data`, in order.
///
/// Empty data has no blocks. Order (and therefore `index`) follows the data
/// even when the blocks are hashed in parallel.
///
/// # Panics
///
/// Panics if `block_size` is zero.
#[must_use]
pub fn block_checksums(data: &[u8], block_size: usize) -> Vec<BlockChecksum> {
    #[allow(clippy::cast_possible_truncation)]
    let compute = |(i, chunk): (usize, &[u8])| BlockChecksum::compute(i as u32, chunk);

    if data.len() > PARALLEL_THRESHOLD {
        data.par_chunks(block_size).enumerate().map(compute).collect()
    } else {
        data.chunks(block_size).enumerate().map(compute).collect()
    }
}

/// Lookup table keyed by the 16-bit fold of each block's weak checksum.
///
/// Blocks whose keys collide share a bucket, kept in checksum-list order so
/// that the first strong match in list order wins.
#[derive(Debug)]
pub struct ChecksumTable<'a> {
    buckets: FxHashMap<u16, Vec<&'a BlockChecksum>>,
    len: usize,
}

impl<'a> ChecksumTable<'a> {
    /// Build the table from a checksum list.
    #[must_use]
    pub fn new(checksums: &'a [BlockChecksum]) -> Self {
        let mut buckets: FxHashMap<u16, Vec<&'a BlockChecksum>> =
            FxHashMap::with_capacity_and_hasher(checksums.len(), rustc_hash::FxBuildHasher);

        for checksum in checksums {
            buckets.entry(weak16(checksum.weak)).or_default().push(checksum);
        }

        Self {
            buckets,
            len: checksums.len(),
        }
    }

    /// Find the block matching `window`, whose weak sum is `weak`.
    ///
    /// Candidates must agree on the full 32-bit weak sum before the strong
    /// digest is computed; the digest is computed at most once per call.
    #[must_use]
    pub fn find_match(&self, weak: u32, window: &[u8]) -> Option<&'a BlockChecksum> {
        let bucket = self.buckets.get(&weak16(weak))?;
        let mut strong = None;

        bucket.iter().copied().find(|candidate| {
            candidate.weak == weak
                && *strong.get_or_insert_with(|| StrongHash::compute(window)) == candidate.strong
        })
    }

    /// Get the number of block checksums in the table.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check if the table holds no checksums.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // BLOCK CHECKSUM TESTS
    // ==========================================================================

    #[test]
    fn block_checksum_compute() {
        let data = b"test block data";
        let checksum = BlockChecksum::compute(5, data);

        assert_eq!(checksum.index, 5);
        assert_eq!(checksum.weak, RollingChecksum::new(data).digest());
        assert_eq!(checksum.strong, StrongHash::compute(data));
    }

    #[test]
    fn block_checksum_json_shape() {
        let checksum = BlockChecksum::new(2, 7, StrongHash::zero());
        let json = serde_json::to_value(&checksum).unwrap();
        assert_eq!(json["index"], 2);
        assert_eq!(json["weak"], 7);
        assert_eq!(json["strong"], "0".repeat(32));
    }

    #[test]
    fn block_checksums_last_block_short() {
        let checksums = block_checksums(b"abcdefghij", 4);
        assert_eq!(checksums.len(), 3);
        assert_eq!(checksums[2], BlockChecksum::compute(2, b"ij"));
    }

    #[test]
    fn block_checksums_empty() {
        assert!(block_checksums(b"", 4).is_empty());
    }

    #[test]
    fn block_checksums_parallel_preserves_order() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let checksums = block_checksums(&data, 1024);
        for (i, checksum) in checksums.iter().enumerate() {
            assert_eq!(checksum.index as usize, i);
        }
        assert_eq!(checksums.len(), data.len().div_ceil(1024));
    }

    // ==========================================================================
    // TABLE TESTS
    // ==========================================================================

    #[test]
    fn table_finds_block() {
        let checksums = block_checksums(b"aaaabbbbcccc", 4);
        let table = ChecksumTable::new(&checksums);
        let weak = RollingChecksum::new(b"bbbb").digest();

        let found = table.find_match(weak, b"bbbb").unwrap();
        assert_eq!(found.index, 1);
    }

    #[test]
    fn table_first_in_list_order_wins() {
        let checksums = block_checksums(b"abababab", 2);
        let table = ChecksumTable::new(&checksums);
        let weak = RollingChecksum::new(b"ab").digest();

        assert_eq!(table.find_match(weak, b"ab").unwrap().index, 0);
    }

    #[test]
    fn table_rejects_strong_mismatch() {
        let checksums = vec![BlockChecksum::new(
            0,
            RollingChecksum::new(b"abcd").digest(),
            StrongHash::zero(),
        )];
        let table = ChecksumTable::new(&checksums);
        let weak = RollingChecksum::new(b"abcd").digest();

        assert!(table.find_match(weak, b"abcd").is_none());
    }

    #[test]
    fn table_empty() {
        let table = ChecksumTable::new(&[]);
        assert!(table.is_empty());
        assert!(table.find_match(0, b"").is_none());
    }
}
