//! Conflicted copies.
//!
//! When incoming changes cannot be reconciled with a file, the server keeps
//! its version as a *conflicted copy*: the file is renamed to
//! `name (Conflicted Copy YYYY-MM-DD HH:MM:SS).ext` and tagged with the
//! `makedrive-conflict` extended attribute. Conflicted copies are never used
//! as sync sources.

use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::fs::{FileSystem, FsError};
use crate::vpath;

/// Extended attribute marking a conflicted copy.
pub const CONFLICT_ATTRIBUTE: &str = "makedrive-conflict";

/// Default bound on rename attempts when the destination keeps reappearing.
pub const DEFAULT_MAX_RENAME_ATTEMPTS: u32 = 3;

const CONFLICT_PREFIX: &str = " (Conflicted Copy ";

const CONFLICT_STAMP_FORMAT: &[FormatItem<'static>] = format_description!(
    "[year]-[month padding:zero]-[day padding:zero] [hour padding:zero]:[minute padding:zero]:[second padding:zero]"
);

/// Shape of a formatted stamp; `9` is a digit, anything else is literal.
const STAMP_SHAPE: &[u8] = b"9999-99-99 99:99:99";

/// Marks, detects and clears conflicted copies on a filesystem.
///
/// # Example
///
/// ```rust
/// use vfsync::{ConflictResolver, FileSystem, MemoryFs};
///
/// let fs = MemoryFs::new();
/// fs.write_file("/notes.txt", b"server copy").unwrap();
///
/// let resolver = ConflictResolver::default();
/// let copy = resolver.mark_conflicted(&fs, "/notes.txt").unwrap();
/// assert!(copy.starts_with("/notes (Conflicted Copy "));
/// assert!(resolver.is_conflicted(&fs, &copy).unwrap());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    max_rename_attempts: u32,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RENAME_ATTEMPTS)
    }
}

impl ConflictResolver {
    /// Resolver that gives up a rename after `max_rename_attempts` tries.
    /// A bound of zero is treated as one.
    #[must_use]
    pub fn new(max_rename_attempts: u32) -> Self {
        Self {
            max_rename_attempts: max_rename_attempts.max(1),
        }
    }

    /// Configured rename bound.
    #[must_use]
    pub const fn max_rename_attempts(&self) -> u32 {
        self.max_rename_attempts
    }

    /// True if `path` carries a truthy conflict marker. A missing marker is
    /// simply "not conflicted".
    ///
    /// # Errors
    ///
    /// Filesystem errors, including a missing `path`.
    pub fn is_conflicted<F: FileSystem + ?Sized>(&self, fs: &F, path: &str) -> Result<bool> {
        Ok(fs
            .get_xattr(path, CONFLICT_ATTRIBUTE)?
            .is_some_and(|value| is_truthy(&value)))
    }

    /// Rename `path` to a conflicted-copy name stamped with the current local
    /// time, mark it, and return the new path.
    ///
    /// # Errors
    ///
    /// Filesystem errors, or `RenameRetriesExhausted` if the destination
    /// could not be cleared.
    pub fn mark_conflicted<F: FileSystem + ?Sized>(&self, fs: &F, path: &str) -> Result<String> {
        self.mark_conflicted_at(fs, path, now())
    }

    /// [`mark_conflicted`](Self::mark_conflicted) with an explicit timestamp.
    ///
    /// An existing file at the conflicted-copy name is deleted and replaced.
    ///
    /// # Errors
    ///
    /// Same as [`mark_conflicted`](Self::mark_conflicted).
    pub fn mark_conflicted_at<F: FileSystem + ?Sized>(
        &self,
        fs: &F,
        path: &str,
        at: OffsetDateTime,
    ) -> Result<String> {
        let target = conflicted_name(path, at)?;
        self.force_rename(fs, path, &target)?;
        fs.set_xattr(&target, CONFLICT_ATTRIBUTE, b"true")?;
        info!(from = %path, to = %target, "preserved conflicted copy");
        Ok(target)
    }

    /// Clear the conflict marker. A missing marker is not an error.
    ///
    /// # Errors
    ///
    /// Filesystem errors, including a missing `path`.
    pub fn remove_conflict<F: FileSystem + ?Sized>(&self, fs: &F, path: &str) -> Result<()> {
        match fs.remove_xattr(path, CONFLICT_ATTRIBUTE) {
            Ok(()) | Err(FsError::NoAttribute { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Rename `from` to `to`, deleting whatever occupies `to` first.
    ///
    /// # Errors
    ///
    /// Filesystem errors other than "already exists", or
    /// `RenameRetriesExhausted` once the bound is reached.
    pub fn force_rename<F: FileSystem + ?Sized>(&self, fs: &F, from: &str, to: &str) -> Result<()> {
        for attempt in 1..=self.max_rename_attempts {
            match fs.rename(from, to) {
                Ok(()) => return Ok(()),
                Err(FsError::AlreadyExists(_)) => {
                    warn!(%to, attempt, "rename destination exists, removing it");
                    match fs.remove(to) {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SyncError::RenameRetriesExhausted {
            from: from.to_string(),
            to: to.to_string(),
            attempts: self.max_rename_attempts,
        })
    }
}

fn is_truthy(value: &[u8]) -> bool {
    !matches!(value, b"" | b"false" | b"0" | b"null")
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|e| {
        debug!(error = %e, "local offset unavailable, using UTC");
        OffsetDateTime::now_utc()
    })
}

/// Conflicted-copy name for `path` at time `at`.
///
/// The stamp goes before the extension of the final segment. A leading dot
/// does not start an extension.
///
/// # Errors
///
/// `InvalidArgument` if `path` is the root or the timestamp cannot be
/// formatted.
///
/// # Example
///
/// ```rust
/// use time::macros::datetime;
/// use vfsync::conflicted_name;
///
/// let name = conflicted_name("/docs/a.txt", datetime!(2026-03-07 09:05:03 UTC)).unwrap();
/// assert_eq!(name, "/docs/a (Conflicted Copy 2026-03-07 09:05:03).txt");
/// ```
pub fn conflicted_name(path: &str, at: OffsetDateTime) -> Result<String> {
    let name = vpath::basename(path);
    if name.is_empty() {
        return Err(SyncError::InvalidArgument(
            "the root cannot be a conflicted copy".to_string(),
        ));
    }
    let stamp = at
        .format(CONFLICT_STAMP_FORMAT)
        .map_err(|e| SyncError::InvalidArgument(format!("cannot format timestamp: {e}")))?;

    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => name.split_at(i),
        _ => (name, ""),
    };
    Ok(vpath::join(
        &vpath::dirname(path),
        &format!("{stem}{CONFLICT_PREFIX}{stamp}){ext}"),
    ))
}

/// True if any part of `path` follows the conflicted-copy naming pattern.
#[must_use]
pub fn path_contains_conflicted(path: &str) -> bool {
    path.match_indices(CONFLICT_PREFIX).any(|(i, _)| {
        let rest = path[i + CONFLICT_PREFIX.len()..].as_bytes();
        rest.len() > STAMP_SHAPE.len()
            && rest[STAMP_SHAPE.len()] == b')'
            && STAMP_SHAPE.iter().zip(rest).all(|(shape, byte)| match shape {
                b'9' => byte.is_ascii_digit(),
                literal => literal == byte,
            })
    })
}
