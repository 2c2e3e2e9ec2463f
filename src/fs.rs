//! The filesystem the sync engine reads and mutates.
//!
//! The engine only talks to storage through [`FileSystem`]. Two
//! implementations ship with the crate: [`MemoryFs`], a self-contained
//! in-memory tree, and [`DiskFs`], which maps the virtual namespace onto a
//! host directory.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use thiserror::Error;

use crate::vpath;

/// Errors raised by a [`FileSystem`].
#[derive(Error, Debug)]
pub enum FsError {
    /// Path does not exist.
    #[error("no such file or directory: {0}")]
    NotFound(String),

    /// Destination already exists.
    #[error("file exists: {0}")]
    AlreadyExists(String),

    /// A path component is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// A file operation was attempted on a directory.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// The extended attribute is not set.
    #[error("no attribute {key} on {path}")]
    NoAttribute {
        /// Path queried
        path: String,
        /// Attribute name
        key: String,
    },

    /// Any other I/O failure.
    #[error("{path}: {source}")]
    Io {
        /// Path being accessed
        path: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

impl FsError {
    /// True when the error only says the path is absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for filesystem operations.
pub type FsResult<T> = std::result::Result<T, FsError>;

/// Kind of filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link (not followed).
    Symlink,
}

/// Result of [`FileSystem::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Entry kind.
    pub kind: FileKind,
    /// Size in bytes (0 for directories).
    pub size: u64,
}

impl Stat {
    /// True for directories.
    #[must_use]
    pub const fn is_directory(&self) -> bool {
        matches!(self.kind, FileKind::Directory)
    }

    /// True for symbolic links.
    #[must_use]
    pub const fn is_symlink(&self) -> bool {
        matches!(self.kind, FileKind::Symlink)
    }
}

/// Storage contract consumed by the sync engine.
///
/// Paths are `/`-rooted virtual paths. `stat` does not follow symlinks.
pub trait FileSystem: Send + Sync {
    /// Describe the entry at `path`.
    ///
    /// # Errors
    ///
    /// `NotFound` when absent.
    fn stat(&self, path: &str) -> FsResult<Stat>;

    /// Read a file's full contents.
    ///
    /// # Errors
    ///
    /// `NotFound`, `IsADirectory` or `Io`.
    fn read_file(&self, path: &str) -> FsResult<Vec<u8>>;

    /// Create or replace a file. The parent directory must exist.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing parent, `IsADirectory` or `Io`.
    fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()>;

    /// Create a directory. The parent directory must exist.
    ///
    /// # Errors
    ///
    /// `AlreadyExists`, `NotFound` for a missing parent, or `Io`.
    fn mkdir(&self, path: &str) -> FsResult<()>;

    /// Immediate child names of a directory, in no particular order.
    ///
    /// # Errors
    ///
    /// `NotFound`, `NotADirectory` or `Io`.
    fn readdir(&self, path: &str) -> FsResult<Vec<String>>;

    /// Target of a symbolic link.
    ///
    /// # Errors
    ///
    /// `NotFound` or `Io` (including when `path` is not a link).
    fn readlink(&self, path: &str) -> FsResult<String>;

    /// Create a symbolic link at `path` pointing at `target`.
    ///
    /// # Errors
    ///
    /// `AlreadyExists`, `NotFound` for a missing parent, or `Io`.
    fn symlink(&self, target: &str, path: &str) -> FsResult<()>;

    /// Move an entry. Fails if `to` already exists.
    ///
    /// # Errors
    ///
    /// `NotFound`, `AlreadyExists` or `Io`.
    fn rename(&self, from: &str, to: &str) -> FsResult<()>;

    /// Remove a file, link, or directory with everything below it.
    ///
    /// # Errors
    ///
    /// `NotFound` or `Io`.
    fn remove(&self, path: &str) -> FsResult<()>;

    /// Read an extended attribute; `None` when it is not set.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing path, or `Io`.
    fn get_xattr(&self, path: &str, key: &str) -> FsResult<Option<Vec<u8>>>;

    /// Set an extended attribute.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing path, or `Io`.
    fn set_xattr(&self, path: &str, key: &str, value: &[u8]) -> FsResult<()>;

    /// Remove an extended attribute.
    ///
    /// # Errors
    ///
    /// `NoAttribute` when it is not set, `NotFound` for a missing path, or `Io`.
    fn remove_xattr(&self, path: &str, key: &str) -> FsResult<()>;

    /// Whether anything exists at `path`.
    ///
    /// # Errors
    ///
    /// Propagates failures other than `NotFound`.
    fn exists(&self, path: &str) -> FsResult<bool> {
        match self.stat(path) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create a directory and any missing ancestors.
    ///
    /// # Errors
    ///
    /// `NotADirectory` if an ancestor is a file, or `Io`.
    fn mkdir_all(&self, path: &str) -> FsResult<()> {
        let mut current = String::new();
        for segment in vpath::segments(path) {
            current.push('/');
            current.push_str(segment);
            match self.stat(&current) {
                Ok(stat) if stat.is_directory() => {}
                Ok(_) => return Err(FsError::NotADirectory(current)),
                Err(e) if e.is_not_found() => self.mkdir(&current)?,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

// =============================================================================
// IN-MEMORY FILESYSTEM
// =============================================================================

#[derive(Debug, Clone)]
enum NodeData {
    File(Vec<u8>),
    Directory,
    Symlink(String),
}

#[derive(Debug, Clone)]
struct Node {
    data: NodeData,
    xattrs: BTreeMap<String, Vec<u8>>,
}

impl Node {
    const fn new(data: NodeData) -> Self {
        Self {
            data,
            xattrs: BTreeMap::new(),
        }
    }
}

/// Thread-safe in-memory filesystem.
///
/// # Example
///
/// ```rust
/// use vfsync::{FileSystem, MemoryFs};
///
/// let fs = MemoryFs::new();
/// fs.mkdir("/docs").unwrap();
/// fs.write_file("/docs/a.txt", b"hello").unwrap();
/// assert_eq!(fs.readdir("/docs").unwrap(), vec!["a.txt".to_string()]);
/// ```
#[derive(Debug)]
pub struct MemoryFs {
    nodes: RwLock<BTreeMap<String, Node>>,
}

impl MemoryFs {
    /// Create a filesystem holding only the root directory.
    #[must_use]
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(vpath::ROOT.to_string(), Node::new(NodeData::Directory));
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Node>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Node>> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_parent(nodes: &BTreeMap<String, Node>, path: &str) -> FsResult<()> {
        let parent = vpath::dirname(path);
        match nodes.get(&parent) {
            Some(Node {
                data: NodeData::Directory,
                ..
            }) => Ok(()),
            Some(_) => Err(FsError::NotADirectory(parent)),
            None => Err(FsError::NotFound(parent)),
        }
    }

    fn subtree_keys(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
        nodes
            .keys()
            .filter(|key| vpath::is_within(key, path))
            .cloned()
            .collect()
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for MemoryFs {
    fn stat(&self, path: &str) -> FsResult<Stat> {
        let path = vpath::normalize(path);
        let nodes = self.read();
        let node = nodes.get(&path).ok_or(FsError::NotFound(path.clone()))?;
        Ok(match &node.data {
            NodeData::File(data) => Stat {
                kind: FileKind::File,
                size: data.len() as u64,
            },
            NodeData::Directory => Stat {
                kind: FileKind::Directory,
                size: 0,
            },
            NodeData::Symlink(target) => Stat {
                kind: FileKind::Symlink,
                size: target.len() as u64,
            },
        })
    }

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let path = vpath::normalize(path);
        let nodes = self.read();
        match nodes.get(&path).map(|n| &n.data) {
            Some(NodeData::File(data)) => Ok(data.clone()),
            Some(NodeData::Directory) => Err(FsError::IsADirectory(path)),
            Some(NodeData::Symlink(target)) => {
                let resolved = vpath::join(&vpath::dirname(&path), target);
                match nodes.get(&resolved).map(|n| &n.data) {
                    Some(NodeData::File(data)) => Ok(data.clone()),
                    _ => Err(FsError::NotFound(resolved)),
                }
            }
            None => Err(FsError::NotFound(path)),
        }
    }

    fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let path = vpath::normalize(path);
        let mut nodes = self.write();
        Self::check_parent(&nodes, &path)?;
        match nodes.get_mut(&path) {
            Some(Node {
                data: NodeData::Directory,
                ..
            }) => Err(FsError::IsADirectory(path)),
            Some(node) => {
                node.data = NodeData::File(data.to_vec());
                Ok(())
            }
            None => {
                nodes.insert(path, Node::new(NodeData::File(data.to_vec())));
                Ok(())
            }
        }
    }

    fn mkdir(&self, path: &str) -> FsResult<()> {
        let path = vpath::normalize(path);
        let mut nodes = self.write();
        if nodes.contains_key(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        Self::check_parent(&nodes, &path)?;
        nodes.insert(path, Node::new(NodeData::Directory));
        Ok(())
    }

    fn readdir(&self, path: &str) -> FsResult<Vec<String>> {
        let path = vpath::normalize(path);
        let nodes = self.read();
        match nodes.get(&path).map(|n| &n.data) {
            Some(NodeData::Directory) => {}
            Some(_) => return Err(FsError::NotADirectory(path)),
            None => return Err(FsError::NotFound(path)),
        }
        Ok(nodes
            .keys()
            .filter(|key| key.as_str() != vpath::ROOT && vpath::dirname(key) == path)
            .map(|key| vpath::basename(key).to_string())
            .collect())
    }

    fn readlink(&self, path: &str) -> FsResult<String> {
        let path = vpath::normalize(path);
        match self.read().get(&path).map(|n| &n.data) {
            Some(NodeData::Symlink(target)) => Ok(target.clone()),
            Some(_) => Err(FsError::Io {
                path,
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a symbolic link"),
            }),
            None => Err(FsError::NotFound(path)),
        }
    }

    fn symlink(&self, target: &str, path: &str) -> FsResult<()> {
        let path = vpath::normalize(path);
        let mut nodes = self.write();
        if nodes.contains_key(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        Self::check_parent(&nodes, &path)?;
        nodes.insert(path, Node::new(NodeData::Symlink(target.to_string())));
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let from = vpath::normalize(from);
        let to = vpath::normalize(to);
        if from == vpath::ROOT || vpath::is_within(&to, &from) {
            return Err(FsError::Io {
                path: from,
                source: io::Error::new(io::ErrorKind::InvalidInput, "cannot move into itself"),
            });
        }
        let mut nodes = self.write();
        if !nodes.contains_key(&from) {
            return Err(FsError::NotFound(from));
        }
        if nodes.contains_key(&to) {
            return Err(FsError::AlreadyExists(to));
        }
        Self::check_parent(&nodes, &to)?;

        for key in Self::subtree_keys(&nodes, &from) {
            if let Some(node) = nodes.remove(&key) {
                let moved = format!("{to}{}", &key[from.len()..]);
                nodes.insert(moved, node);
            }
        }
        Ok(())
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        let path = vpath::normalize(path);
        let mut nodes = self.write();
        if !nodes.contains_key(&path) {
            return Err(FsError::NotFound(path));
        }
        for key in Self::subtree_keys(&nodes, &path) {
            if key != vpath::ROOT {
                nodes.remove(&key);
            }
        }
        Ok(())
    }

    fn get_xattr(&self, path: &str, key: &str) -> FsResult<Option<Vec<u8>>> {
        let path = vpath::normalize(path);
        let nodes = self.read();
        let node = nodes.get(&path).ok_or(FsError::NotFound(path.clone()))?;
        Ok(node.xattrs.get(key).cloned())
    }

    fn set_xattr(&self, path: &str, key: &str, value: &[u8]) -> FsResult<()> {
        let path = vpath::normalize(path);
        let mut nodes = self.write();
        let node = nodes.get_mut(&path).ok_or(FsError::NotFound(path.clone()))?;
        node.xattrs.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove_xattr(&self, path: &str, key: &str) -> FsResult<()> {
        let path = vpath::normalize(path);
        let mut nodes = self.write();
        let node = nodes.get_mut(&path).ok_or(FsError::NotFound(path.clone()))?;
        match node.xattrs.remove(key) {
            Some(_) => Ok(()),
            None => Err(FsError::NoAttribute {
                path,
                key: key.to_string(),
            }),
        }
    }
}

// =============================================================================
// ON-DISK FILESYSTEM
// =============================================================================

/// Filesystem rooted at a host directory.
///
/// Virtual `/a/b` maps to `<root>/a/b`. Extended attributes live in the
/// `user.` namespace and are only available on unix hosts.
#[derive(Debug, Clone)]
pub struct DiskFs {
    root: PathBuf,
}

impl DiskFs {
    /// Use `root` as the virtual `/`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Host directory backing the virtual root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, path: &str) -> FsResult<PathBuf> {
        if vpath::has_relative_segments(path) {
            return Err(FsError::Io {
                path: path.to_string(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "relative segment in path"),
            });
        }
        Ok(vpath::segments(path).fold(self.root.clone(), |acc, s| acc.join(s)))
    }

    fn map_err(path: &str, source: io::Error) -> FsError {
        let path = vpath::normalize(path);
        match source.kind() {
            io::ErrorKind::NotFound => FsError::NotFound(path),
            io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path),
            _ => FsError::Io { path, source },
        }
    }

    #[cfg(unix)]
    fn xattr_name(key: &str) -> String {
        format!("user.{key}")
    }
}

impl FileSystem for DiskFs {
    fn stat(&self, path: &str) -> FsResult<Stat> {
        let meta = std::fs::symlink_metadata(self.host_path(path)?).map_err(|e| Self::map_err(path, e))?;
        let file_type = meta.file_type();
        let kind = if file_type.is_dir() {
            FileKind::Directory
        } else if file_type.is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::File
        };
        Ok(Stat {
            kind,
            size: if file_type.is_dir() { 0 } else { meta.len() },
        })
    }

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        if self.stat(path)?.is_directory() {
            return Err(FsError::IsADirectory(vpath::normalize(path)));
        }
        std::fs::read(self.host_path(path)?).map_err(|e| Self::map_err(path, e))
    }

    fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()> {
        if matches!(self.stat(path), Ok(stat) if stat.is_directory()) {
            return Err(FsError::IsADirectory(vpath::normalize(path)));
        }
        std::fs::write(self.host_path(path)?, data).map_err(|e| Self::map_err(path, e))
    }

    fn mkdir(&self, path: &str) -> FsResult<()> {
        std::fs::create_dir(self.host_path(path)?).map_err(|e| Self::map_err(path, e))
    }

    fn readdir(&self, path: &str) -> FsResult<Vec<String>> {
        if !self.stat(path)?.is_directory() {
            return Err(FsError::NotADirectory(vpath::normalize(path)));
        }
        let entries = std::fs::read_dir(self.host_path(path)?).map_err(|e| Self::map_err(path, e))?;
        entries
            .map(|entry| {
                entry
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .map_err(|e| Self::map_err(path, e))
            })
            .collect()
    }

    fn readlink(&self, path: &str) -> FsResult<String> {
        let target = std::fs::read_link(self.host_path(path)?).map_err(|e| Self::map_err(path, e))?;
        Ok(target.to_string_lossy().into_owned())
    }

    #[cfg(unix)]
    fn symlink(&self, target: &str, path: &str) -> FsResult<()> {
        std::os::unix::fs::symlink(target, self.host_path(path)?).map_err(|e| Self::map_err(path, e))
    }

    #[cfg(not(unix))]
    fn symlink(&self, _target: &str, path: &str) -> FsResult<()> {
        Err(FsError::Io {
            path: vpath::normalize(path),
            source: io::Error::new(io::ErrorKind::Unsupported, "symlinks need a unix host"),
        })
    }

    fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        if self.exists(to)? {
            return Err(FsError::AlreadyExists(vpath::normalize(to)));
        }
        std::fs::rename(self.host_path(from)?, self.host_path(to)?).map_err(|e| Self::map_err(from, e))
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        let host = self.host_path(path)?;
        let result = if self.stat(path)?.is_directory() {
            std::fs::remove_dir_all(host)
        } else {
            std::fs::remove_file(host)
        };
        result.map_err(|e| Self::map_err(path, e))
    }

    #[cfg(unix)]
    fn get_xattr(&self, path: &str, key: &str) -> FsResult<Option<Vec<u8>>> {
        xattr::get(self.host_path(path)?, Self::xattr_name(key)).map_err(|e| Self::map_err(path, e))
    }

    #[cfg(unix)]
    fn set_xattr(&self, path: &str, key: &str, value: &[u8]) -> FsResult<()> {
        xattr::set(self.host_path(path)?, Self::xattr_name(key), value)
            .map_err(|e| Self::map_err(path, e))
    }

    #[cfg(unix)]
    fn remove_xattr(&self, path: &str, key: &str) -> FsResult<()> {
        if self.get_xattr(path, key)?.is_none() {
            return Err(FsError::NoAttribute {
                path: vpath::normalize(path),
                key: key.to_string(),
            });
        }
        xattr::remove(self.host_path(path)?, Self::xattr_name(key))
            .map_err(|e| Self::map_err(path, e))
    }

    #[cfg(not(unix))]
    fn get_xattr(&self, path: &str, _key: &str) -> FsResult<Option<Vec<u8>>> {
        self.stat(path).map(|_| None)
    }

    #[cfg(not(unix))]
    fn set_xattr(&self, path: &str, _key: &str, _value: &[u8]) -> FsResult<()> {
        Err(FsError::Io {
            path: vpath::normalize(path),
            source: io::Error::new(io::ErrorKind::Unsupported, "xattrs need a unix host"),
        })
    }

    #[cfg(not(unix))]
    fn remove_xattr(&self, path: &str, key: &str) -> FsResult<()> {
        Err(FsError::NoAttribute {
            path: vpath::normalize(path),
            key: key.to_string(),
        })
    }
}
