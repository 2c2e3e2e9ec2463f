//! # vfsync
//!
//! rsync-style differential synchronization of a virtual filesystem.
//!
//! A client keeps a tree in sync with a server copy without shipping whole
//! files: it fetches block checksums of the server's tree, diffs local data
//! against them, and sends only changed bytes plus references to blocks the
//! server already has.
//!
//! ## Features
//!
//! - **Rolling Checksum**: Adler-32 style weak sum, slid in O(1) per byte
//! - **Strong Hash**: MD5 per block to confirm weak matches
//! - **Checksum Trees**: per-path checksums or listings for a subtree
//! - **Sync Protocol**: validated message envelope and a round state machine
//! - **Admission Control**: one preemptive sync slot per user
//! - **Conflicted Copies**: stale server copies are preserved, never clobbered
//!
//! ## Example
//!
//! ```rust
//! use vfsync::{block_checksums, patch, roll};
//!
//! let block_size = 4;
//! let server = b"original file content";
//! let client = b"original file CONTENT";
//!
//! // Server side: checksum its copy
//! let checksums = block_checksums(server, block_size);
//!
//! // Client side: diff local data against the server's blocks
//! let segments = roll(client, &checksums, block_size).unwrap();
//!
//! // Server side: replay the diff over its copy
//! let rebuilt = patch(server, &segments, block_size).unwrap();
//! assert_eq!(rebuilt, client);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

mod active;
mod checksum;
mod config;
mod conflict;
mod delta;
mod error;
pub mod fs;
mod hash;
pub mod protocol;
mod resolver;
pub mod service;
pub mod session;
mod signature;
mod tree;
pub mod vpath;
pub mod watch;

pub use active::ActiveSyncManager;
pub use checksum::{calc_weak32, weak16, RollingChecksum};
pub use config::{SyncBuilder, SyncConfig, CONFIG_FILE, DEFAULT_BLOCK_SIZE};
pub use conflict::{
    conflicted_name, path_contains_conflicted, ConflictResolver, CONFLICT_ATTRIBUTE,
    DEFAULT_MAX_RENAME_ATTEMPTS,
};
pub use delta::{patch, roll, DiffSegment, DiffStats};
pub use error::{Result, SyncError};
pub use fs::{DiskFs, FileSystem, FsError, MemoryFs};
pub use hash::{ContentHash, StrongHash};
pub use protocol::{Codec, MessageName, MessageType, SyncMessage};
pub use resolver::{filter_synced, resolve};
pub use service::{ApiError, SyncService};
pub use session::{ConnectionId, SessionState, SyncId, SyncSession};
pub use signature::{block_checksums, BlockChecksum, ChecksumTable};
pub use tree::{compare_contents, generate_checksums, ChecksumNode, ChecksumTree, NodeEntry};
