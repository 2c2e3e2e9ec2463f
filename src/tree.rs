//! Checksum trees: per-path checksums or listings for a set of paths.
//!
//! The server builds a tree for the paths a client wants to sync; the client
//! diffs its local data against it. The same tree can later be re-checked
//! against live state to confirm two sides agree.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::fs::{FileSystem, Stat};
use crate::signature::{block_checksums, BlockChecksum};

/// What a tree records for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeEntry {
    /// Block checksums of a file or symlink. Empty for an absent path.
    Checksum(Vec<BlockChecksum>),
    /// Immediate child names of a directory, unordered.
    Contents(Vec<String>),
}

/// One record of a [`ChecksumTree`].
///
/// Serializes as `{"path": ..., "checksum": [...]}` or
/// `{"path": ..., "contents": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumNode {
    /// Path the record describes.
    pub path: String,
    /// Checksums or listing.
    #[serde(flatten)]
    pub entry: NodeEntry,
}

impl ChecksumNode {
    /// Record for a path that does not exist.
    #[must_use]
    pub fn absent(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            entry: NodeEntry::Checksum(Vec::new()),
        }
    }

    /// True for the absent-path sentinel (an empty checksum list).
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(&self.entry, NodeEntry::Checksum(blocks) if blocks.is_empty())
    }

    /// Block checksums, for file and symlink records.
    #[must_use]
    pub fn checksum(&self) -> Option<&[BlockChecksum]> {
        match &self.entry {
            NodeEntry::Checksum(blocks) => Some(blocks),
            NodeEntry::Contents(_) => None,
        }
    }

    /// Child names, for directory records.
    #[must_use]
    pub fn contents(&self) -> Option<&[String]> {
        match &self.entry {
            NodeEntry::Contents(names) => Some(names),
            NodeEntry::Checksum(_) => None,
        }
    }
}

/// One record per requested path, in request order.
pub type ChecksumTree = Vec<ChecksumNode>;

fn require_block_size(block_size: usize) -> Result<()> {
    if block_size == 0 {
        return Err(SyncError::InvalidArgument(
            "block size must be non-zero".to_string(),
        ));
    }
    Ok(())
}

/// Bytes checksummed for a non-directory entry. Links are described by their
/// target rather than by what they point at.
pub(crate) fn entry_bytes<F: FileSystem + ?Sized>(fs: &F, path: &str, stat: Stat) -> Result<Vec<u8>> {
    if stat.is_symlink() {
        Ok(fs.readlink(path)?.into_bytes())
    } else {
        Ok(fs.read_file(path)?)
    }
}

/// Stat `path`, folding "not found" into `None`.
pub(crate) fn lookup<F: FileSystem + ?Sized>(fs: &F, path: &str) -> Result<Option<Stat>> {
    match fs.stat(path) {
        Ok(stat) => Ok(Some(stat)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Build a [`ChecksumTree`] for `paths`.
///
/// Paths are visited one at a time, in order. An absent path yields the
/// empty-checksum sentinel, a directory its child names, anything else the
/// block checksums of its bytes.
///
/// # Errors
///
/// `InvalidArgument` for a zero block size (before any I/O); any filesystem
/// error other than "not found" aborts the whole batch.
///
/// # Example
///
/// ```rust
/// use vfsync::{generate_checksums, FileSystem, MemoryFs};
///
/// let fs = MemoryFs::new();
/// fs.write_file("/a.txt", b"hello world").unwrap();
///
/// let tree = generate_checksums(&fs, &["/a.txt", "/missing"], 4).unwrap();
/// assert_eq!(tree[0].checksum().unwrap().len(), 3);
/// assert!(tree[1].is_absent());
/// ```
pub fn generate_checksums<F, P>(fs: &F, paths: &[P], block_size: usize) -> Result<ChecksumTree>
where
    F: FileSystem + ?Sized,
    P: AsRef<str>,
{
    require_block_size(block_size)?;

    let mut tree = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        let entry = match lookup(fs, path)? {
            None => NodeEntry::Checksum(Vec::new()),
            Some(stat) if stat.is_directory() => NodeEntry::Contents(fs.readdir(path)?),
            Some(stat) => NodeEntry::Checksum(block_checksums(&entry_bytes(fs, path, stat)?, block_size)),
        };
        tree.push(ChecksumNode {
            path: path.to_string(),
            entry,
        });
    }

    debug!(paths = tree.len(), block_size, "generated checksum tree");
    Ok(tree)
}

/// Re-check `tree` against live state in `fs`.
///
/// Returns `true` only if every record still describes its path. Stops at the
/// first difference.
///
/// # Errors
///
/// `InvalidArgument` for a zero block size; filesystem errors other than
/// "not found" are propagated.
pub fn compare_contents<F>(fs: &F, tree: &[ChecksumNode], block_size: usize) -> Result<bool>
where
    F: FileSystem + ?Sized,
{
    require_block_size(block_size)?;

    for node in tree {
        if !node_matches(fs, node, block_size)? {
            debug!(path = %node.path, "content differs");
            return Ok(false);
        }
    }
    Ok(true)
}

fn node_matches<F: FileSystem + ?Sized>(fs: &F, node: &ChecksumNode, block_size: usize) -> Result<bool> {
    let Some(stat) = lookup(fs, &node.path)? else {
        return Ok(node.is_absent());
    };

    if stat.is_directory() {
        let Some(expected) = node.contents() else {
            return Ok(false);
        };
        let live: HashSet<String> = fs.readdir(&node.path)?.into_iter().collect();
        let expected: HashSet<String> = expected.iter().cloned().collect();
        return Ok(live == expected);
    }

    let Some(expected) = node.checksum() else {
        return Ok(false);
    };
    let live = block_checksums(&entry_bytes(fs, &node.path, stat)?, block_size);
    if live.len() != expected.len() {
        return Ok(false);
    }

    let mut expected: Vec<&BlockChecksum> = expected.iter().collect();
    let mut live: Vec<&BlockChecksum> = live.iter().collect();
    expected.sort_by_key(|b| b.index);
    live.sort_by_key(|b| b.index);

    Ok(expected
        .iter()
        .zip(&live)
        .all(|(e, l)| e.weak == l.weak && e.strong == l.strong))
}
