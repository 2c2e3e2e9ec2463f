//! Sync rounds over the message protocol.
//!
//! A round moves through `LINKED → LISTING → CHECKSUMMING → DIFFING →
//! PATCHING → COMPLETED`:
//!
//! 1. the client sends `REQUEST SOURCE_LIST` with its root and paths, the
//!    server answers `ACK`;
//! 2. the client sends `REQUEST CHECKSUM`, the server answers with its
//!    checksum tree for those paths;
//! 3. the client diffs local data against the tree and sends `REQUEST DIFF`;
//! 4. the server applies the diffs and answers `PATCH`, which the client
//!    acknowledges.
//!
//! `RESET` is accepted in any state and returns the round to `LISTING`,
//! discarding whatever was in flight. Out-of-order messages are answered with
//! `ERROR` and end the round without touching server state.
//!
//! [`SyncSession`] is the server half, shared behind an `Arc` by the service
//! and the [`ActiveSyncManager`](crate::ActiveSyncManager). [`ClientSession`]
//! is the client half.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::conflict::{path_contains_conflicted, ConflictResolver};
use crate::delta::{patch, roll};
use crate::error::{Result, SyncError};
use crate::fs::{FileSystem, Stat};
use crate::hash::ContentHash;
use crate::protocol::{
    AckPayload, Change, ChecksumsPayload, DiffsPayload, ErrorPayload, MessageName, MessageType,
    PatchPayload, PathDiff, SourceList, SyncMessage,
};
use crate::tree::{compare_contents, entry_bytes, generate_checksums, lookup, ChecksumNode, ChecksumTree};
use crate::vpath;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifies a client connection.
    ConnectionId
);
id_type!(
    /// Identifies a sync session bound to a connection.
    SyncId
);

/// Where a round stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// Connection has a sync identity, no round in progress.
    #[default]
    Linked,
    /// Source list known; checksums not yet exchanged.
    Listing,
    /// Checksum tree being built or awaited.
    Checksumming,
    /// Diff being computed or awaited.
    Diffing,
    /// Diff being applied or its result awaited.
    Patching,
    /// Patch applied.
    Completed,
}

impl SessionState {
    /// True while a diff is in flight. A new round may not start and another
    /// connection may not take over.
    #[must_use]
    pub const fn is_mid_round(self) -> bool {
        matches!(self, Self::Diffing | Self::Patching)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Linked => "LINKED",
            Self::Listing => "LISTING",
            Self::Checksumming => "CHECKSUMMING",
            Self::Diffing => "DIFFING",
            Self::Patching => "PATCHING",
            Self::Completed => "COMPLETED",
        })
    }
}

// =============================================================================
// SERVER
// =============================================================================

#[derive(Debug, Default)]
struct Round {
    state: SessionState,
    source: Option<SourceList>,
    sent: Option<ChecksumTree>,
    resets: u64,
}

impl Round {
    fn end(&mut self) {
        self.state = SessionState::Linked;
        self.source = None;
        self.sent = None;
    }
}

/// Server half of one connection's sync rounds.
///
/// All round state sits behind one lock, and a patch is applied while that
/// lock is held, so a reset either happens entirely before a patch (which is
/// then out of order and rejected) or entirely after it.
#[derive(Debug)]
pub struct SyncSession {
    id: SyncId,
    connection: ConnectionId,
    username: String,
    config: SyncConfig,
    round: Mutex<Round>,
}

enum Applied {
    Synced,
    Conflicted,
}

impl SyncSession {
    /// Create a session in the `LINKED` state.
    #[must_use]
    pub fn new(id: SyncId, connection: ConnectionId, username: impl Into<String>, config: SyncConfig) -> Self {
        Self {
            id,
            connection,
            username: username.into(),
            config,
            round: Mutex::new(Round::default()),
        }
    }

    /// Session id.
    #[must_use]
    pub const fn id(&self) -> SyncId {
        self.id
    }

    /// Connection the session belongs to.
    #[must_use]
    pub const fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Owning user.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// How many times the session has been reset.
    #[must_use]
    pub fn reset_count(&self) -> u64 {
        self.lock().resets
    }

    /// Source list of the current round.
    #[must_use]
    pub fn source(&self) -> Option<SourceList> {
        self.lock().source.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Round> {
        self.round.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail(&self, round: &mut Round, error: SyncError) -> SyncError {
        warn!(sync = %self.id, state = %round.state, %error, "ending sync round");
        round.end();
        error
    }

    /// Abandon the in-flight round. Checksums already sent and any pending
    /// diff are discarded; the source list survives.
    pub fn reset(&self) {
        let mut round = self.lock();
        round.sent = None;
        round.resets += 1;
        round.state = if round.source.is_some() {
            SessionState::Listing
        } else {
            SessionState::Linked
        };
        info!(sync = %self.id, user = %self.username, state = %round.state, "sync round reset");
    }

    /// Register the client's root and paths for a new round.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if a diff is in flight, the list is empty, a path
    /// has a `.` or `..` segment, or a path lies outside the root. The round
    /// ends.
    pub fn register_sources(&self, sources: SourceList) -> Result<()> {
        let mut round = self.lock();
        if round.state.is_mid_round() {
            let state = round.state;
            return Err(self.fail(
                &mut round,
                SyncError::protocol(format!("SOURCE_LIST while {state}")),
            ));
        }

        if sources.src_list.is_empty() {
            return Err(self.fail(&mut round, SyncError::protocol("empty source list")));
        }
        if let Some(path) = std::iter::once(&sources.path)
            .chain(&sources.src_list)
            .find(|path| vpath::has_relative_segments(path))
        {
            let error = SyncError::protocol(format!("relative segment in {path}"));
            return Err(self.fail(&mut round, error));
        }
        let root = vpath::normalize(&sources.path);
        let mut src_list = Vec::with_capacity(sources.src_list.len());
        for path in &sources.src_list {
            let path = vpath::normalize(path);
            if !vpath::is_within(&path, &root) {
                return Err(self.fail(
                    &mut round,
                    SyncError::protocol(format!("{path} is outside {root}")),
                ));
            }
            src_list.push(path);
        }

        debug!(sync = %self.id, %root, paths = src_list.len(), "registered sources");
        round.source = Some(SourceList { path: root, src_list });
        round.sent = None;
        round.state = SessionState::Listing;
        Ok(())
    }

    /// Build the checksum tree for the registered paths.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if no source list is registered or checksums were
    /// already sent; filesystem errors. Either ends the round.
    pub fn checksums<F: FileSystem + ?Sized>(&self, fs: &F) -> Result<ChecksumTree> {
        let mut round = self.lock();
        let state = round.state;
        let paths = round
            .source
            .as_ref()
            .filter(|_| state == SessionState::Listing)
            .map(|source| source.src_list.clone());
        let Some(paths) = paths else {
            return Err(self.fail(&mut round, SyncError::protocol(format!("CHECKSUM while {state}"))));
        };

        round.state = SessionState::Checksumming;
        match generate_checksums(fs, &paths, self.config.block_size) {
            Ok(tree) => {
                round.sent = Some(tree.clone());
                round.state = SessionState::Diffing;
                Ok(tree)
            }
            Err(e) => Err(self.fail(&mut round, e)),
        }
    }

    /// Apply the client's diffs.
    ///
    /// Every path must belong to the checksum tree sent this round; this is
    /// checked before anything is written. A file whose server copy changed
    /// since its checksums were sent, or whose reconstruction fails, is kept
    /// as a conflicted copy and reported back instead of failing the round.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` when out of order or for unknown paths;
    /// filesystem errors. Either ends the round.
    pub fn apply<F: FileSystem + ?Sized>(&self, fs: &F, diffs: &[PathDiff]) -> Result<PatchPayload> {
        let mut round = self.lock();
        let state = round.state;
        let sent = round.sent.take();
        let root = round.source.as_ref().map(|source| source.path.clone());
        let (SessionState::Diffing, Some(sent), Some(root)) = (state, sent, root) else {
            return Err(self.fail(&mut round, SyncError::protocol(format!("DIFF while {state}"))));
        };

        let bases: HashMap<&str, &ChecksumNode> = sent.iter().map(|node| (node.path.as_str(), node)).collect();
        if let Some(unknown) = diffs.iter().find(|d| !bases.contains_key(d.path.as_str())) {
            let error = SyncError::protocol(format!("diff for unlisted path {}", unknown.path));
            return Err(self.fail(&mut round, error));
        }

        round.state = SessionState::Patching;
        let mut result = PatchPayload {
            path: root,
            ..PatchPayload::default()
        };
        let resolver = ConflictResolver::new(self.config.max_rename_attempts);
        let mut outcome = Ok(());
        for diff in diffs {
            let base = bases[diff.path.as_str()];
            match self.apply_one(fs, &resolver, base, diff) {
                Ok(Applied::Synced) => result.synced.push(diff.path.clone()),
                Ok(Applied::Conflicted) => result.conflicted.push(diff.path.clone()),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        if let Err(e) = outcome {
            return Err(self.fail(&mut round, e));
        }
        round.state = SessionState::Completed;
        info!(
            sync = %self.id,
            root = %result.path,
            synced = result.synced.len(),
            conflicted = result.conflicted.len(),
            "patch applied"
        );
        Ok(result)
    }

    fn apply_one<F: FileSystem + ?Sized>(
        &self,
        fs: &F,
        resolver: &ConflictResolver,
        base: &ChecksumNode,
        diff: &PathDiff,
    ) -> Result<Applied> {
        let path = diff.path.as_str();
        let current = lookup(fs, path)?;

        match &diff.change {
            Change::File { diffs, digest } => {
                let block_size = self.config.block_size;
                let unchanged = compare_contents(fs, std::slice::from_ref(base), block_size)?;
                let rebuilt = if unchanged {
                    let old = match current {
                        Some(stat) if !stat.is_directory() => entry_bytes(fs, path, stat)?,
                        _ => Vec::new(),
                    };
                    patch(&old, diffs, block_size).and_then(|data| self.verify(data, digest))
                } else {
                    Err(SyncError::Conflict {
                        path: path.to_string(),
                        reason: "changed since checksums were sent".to_string(),
                    })
                };

                match rebuilt {
                    Ok(data) => {
                        if !clear(fs, path, current)? {
                            warn!(%path, "conflicted copies block the file");
                            return Ok(Applied::Conflicted);
                        }
                        fs.mkdir_all(&vpath::dirname(path))?;
                        fs.write_file(path, &data)?;
                        Ok(Applied::Synced)
                    }
                    Err(e) if e.is_conflict() => {
                        warn!(%path, error = %e, "conflict while patching");
                        if current.is_some_and(|stat| !stat.is_directory()) {
                            resolver.mark_conflicted(fs, path)?;
                        }
                        Ok(Applied::Conflicted)
                    }
                    Err(e) => Err(e),
                }
            }
            Change::Symlink { target } => {
                if current.is_some_and(|stat| stat.is_symlink()) && fs.readlink(path)? == *target {
                    return Ok(Applied::Synced);
                }
                if !clear(fs, path, current)? {
                    warn!(%path, "conflicted copies block the symlink");
                    return Ok(Applied::Conflicted);
                }
                fs.mkdir_all(&vpath::dirname(path))?;
                fs.symlink(target, path)?;
                Ok(Applied::Synced)
            }
            Change::Directory { contents } => {
                if current.is_some_and(|stat| !stat.is_directory()) {
                    fs.remove(path)?;
                }
                fs.mkdir_all(path)?;
                for name in fs.readdir(path)? {
                    if !contents.contains(&name) {
                        debug!(%path, %name, "removing child absent on client");
                        remove_keeping_conflicts(fs, &vpath::join(path, &name))?;
                    }
                }
                Ok(Applied::Synced)
            }
            Change::Removed => {
                remove_keeping_conflicts(fs, path)?;
                Ok(Applied::Synced)
            }
        }
    }

    fn verify(&self, data: Vec<u8>, expected: &ContentHash) -> Result<Vec<u8>> {
        if self.config.verify_digest {
            let actual = ContentHash::compute(&data);
            if actual != *expected {
                return Err(SyncError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        Ok(data)
    }

    /// Handle one client message and produce the reply, if any.
    ///
    /// Failures are answered with `ERROR`.
    pub fn handle<F: FileSystem + ?Sized>(&self, fs: &F, message: &SyncMessage) -> Option<SyncMessage> {
        match self.dispatch(fs, message) {
            Ok(reply) => reply,
            Err(e) => Some(SyncMessage::error(&e)),
        }
    }

    fn dispatch<F: FileSystem + ?Sized>(&self, fs: &F, message: &SyncMessage) -> Result<Option<SyncMessage>> {
        debug!(sync = %self.id, %message, "server received");
        match (message.kind(), message.name()) {
            (MessageType::Request, MessageName::SourceList) => {
                self.register_sources(message.payload()?)?;
                Ok(Some(SyncMessage::ack(MessageName::SourceList)))
            }
            (MessageType::Request, MessageName::Checksum) => {
                let checksums = self.checksums(fs)?;
                SyncMessage::response(MessageName::Checksum, &ChecksumsPayload { checksums }).map(Some)
            }
            (MessageType::Request, MessageName::Diff) => {
                let payload: DiffsPayload = message.payload()?;
                let result = self.apply(fs, &payload.diffs)?;
                SyncMessage::response(MessageName::Patch, &result).map(Some)
            }
            (MessageType::Request, MessageName::Reset) => {
                self.reset();
                Ok(Some(SyncMessage::new(
                    MessageType::Response,
                    MessageName::Reset,
                    serde_json::Value::Null,
                )))
            }
            (MessageType::Response, MessageName::Ack) => Ok(None),
            _ => {
                let mut round = self.lock();
                Err(self.fail(&mut round, SyncError::protocol(format!("unexpected {message}"))))
            }
        }
    }
}

/// Remove whatever sits at `path` so a different kind of entry can replace it.
///
/// Returns `false` when conflicted copies below `path` keep it in place.
fn clear<F: FileSystem + ?Sized>(fs: &F, path: &str, current: Option<Stat>) -> Result<bool> {
    match current {
        Some(stat) if stat.is_directory() => remove_keeping_conflicts(fs, path),
        Some(stat) if stat.is_symlink() => {
            fs.remove(path)?;
            Ok(true)
        }
        _ => Ok(true),
    }
}

/// Remove `path` and everything below it except conflicted copies, which
/// survive together with the directories leading to them.
///
/// Returns whether `path` is gone.
fn remove_keeping_conflicts<F: FileSystem + ?Sized>(fs: &F, path: &str) -> Result<bool> {
    let Some(stat) = lookup(fs, path)? else {
        return Ok(true);
    };
    if path_contains_conflicted(path) {
        return Ok(false);
    }
    if stat.is_directory() {
        let mut emptied = true;
        for name in fs.readdir(path)? {
            emptied &= remove_keeping_conflicts(fs, &vpath::join(path, &name))?;
        }
        if !emptied {
            debug!(%path, "keeping directory that holds conflicted copies");
            return Ok(false);
        }
    }
    fs.remove(path)?;
    Ok(true)
}

// =============================================================================
// CLIENT
// =============================================================================

/// Enumerate `root` and everything below it, parents before children.
///
/// Conflicted copies and their contents are skipped. An absent root is listed
/// on its own so its removal can be synced.
///
/// # Errors
///
/// `InvalidArgument` if the root is itself a conflicted copy; filesystem
/// errors other than "not found".
pub fn source_list<F: FileSystem + ?Sized>(fs: &F, root: &str) -> Result<SourceList> {
    let root = vpath::normalize(root);
    if path_contains_conflicted(&root) {
        return Err(SyncError::InvalidArgument(format!(
            "{root} is a conflicted copy"
        )));
    }

    let mut src_list = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(path) = stack.pop() {
        if path_contains_conflicted(&path) {
            continue;
        }
        let stat = lookup(fs, &path)?;
        if stat.is_some_and(|s| s.is_directory()) {
            let mut names = fs.readdir(&path)?;
            names.sort();
            stack.extend(names.iter().rev().map(|name| vpath::join(&path, name)));
        }
        src_list.push(path);
    }

    Ok(SourceList { path: root, src_list })
}

/// Diff local state against the server's checksum tree.
///
/// One entry per tree node that differs, in tree order. Conflicted copies are
/// left out of directory listings.
///
/// # Errors
///
/// `InvalidArgument` for a zero block size; filesystem errors other than
/// "not found".
pub fn compute_diffs<F: FileSystem + ?Sized>(
    fs: &F,
    tree: &[ChecksumNode],
    block_size: usize,
) -> Result<Vec<PathDiff>> {
    let mut diffs = Vec::new();
    for node in tree {
        let path = node.path.as_str();
        let local = lookup(fs, path)?;
        let same = compare_contents(fs, std::slice::from_ref(node), block_size)?;
        // An empty file and an absent path share the empty checksum list, so
        // such a node is always resent. Removing an absent path is a no-op.
        if same && !node.is_absent() {
            continue;
        }

        let change = match local {
            None => Change::Removed,
            Some(stat) if stat.is_directory() => Change::Directory {
                contents: fs
                    .readdir(path)?
                    .into_iter()
                    .filter(|name| !path_contains_conflicted(name))
                    .collect(),
            },
            Some(stat) if stat.is_symlink() => Change::Symlink {
                target: fs.readlink(path)?,
            },
            Some(_) => {
                let data = fs.read_file(path)?;
                Change::File {
                    diffs: roll(&data, node.checksum().unwrap_or_default(), block_size)?,
                    digest: ContentHash::compute(&data),
                }
            }
        };
        diffs.push(PathDiff {
            path: path.to_string(),
            change,
        });
    }
    debug!(nodes = tree.len(), changed = diffs.len(), "computed diffs");
    Ok(diffs)
}

/// What the client should do after handling a server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientStep {
    /// Send this message to the server.
    Send(SyncMessage),
    /// The round completed. Acknowledge with `ACK PATCH`; paths in
    /// `conflicted` need another round.
    Completed(PatchPayload),
    /// Another connection of the same user changed the server tree.
    RemoteChanged(PatchPayload),
    /// The server ended the round with an error.
    Ended(String),
    /// Nothing to do.
    Wait,
}

/// Client half of a connection's sync rounds.
#[derive(Debug)]
pub struct ClientSession {
    block_size: usize,
    state: SessionState,
    root: Option<String>,
}

impl ClientSession {
    /// Create a client session in the `LINKED` state.
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            block_size: config.block_size,
            state: SessionState::Linked,
            root: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Start a round for `root`, producing the `SOURCE_LIST` request.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if a diff is in flight; errors from
    /// [`source_list`].
    pub fn start<F: FileSystem + ?Sized>(&mut self, fs: &F, root: &str) -> Result<SyncMessage> {
        if self.state.is_mid_round() {
            return Err(SyncError::protocol(format!(
                "cannot start a round while {}",
                self.state
            )));
        }
        let sources = source_list(fs, root)?;
        let message = SyncMessage::request(MessageName::SourceList, &sources)?;
        self.root = Some(sources.path);
        self.state = SessionState::Listing;
        Ok(message)
    }

    /// Abandon the current round, producing the `RESET` request.
    pub fn reset(&mut self) -> SyncMessage {
        self.state = if self.root.is_some() {
            SessionState::Listing
        } else {
            SessionState::Linked
        };
        SyncMessage::new(MessageType::Request, MessageName::Reset, serde_json::Value::Null)
    }

    /// Advance on a message from the server.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` for a message that does not fit the current
    /// state; errors while listing or diffing local data. The round ends.
    pub fn handle<F: FileSystem + ?Sized>(&mut self, fs: &F, message: &SyncMessage) -> Result<ClientStep> {
        let result = self.advance(fs, message);
        if result.is_err() {
            self.state = SessionState::Linked;
        }
        result
    }

    fn advance<F: FileSystem + ?Sized>(&mut self, fs: &F, message: &SyncMessage) -> Result<ClientStep> {
        debug!(state = %self.state, %message, "client received");
        match (message.kind(), message.name(), self.state) {
            (MessageType::Response, MessageName::Ack, SessionState::Listing) => {
                let ack: AckPayload = message.payload()?;
                if ack.name != MessageName::SourceList {
                    return Ok(ClientStep::Wait);
                }
                self.state = SessionState::Checksumming;
                Ok(ClientStep::Send(SyncMessage::new(
                    MessageType::Request,
                    MessageName::Checksum,
                    serde_json::Value::Null,
                )))
            }
            (MessageType::Response, MessageName::Checksum, SessionState::Checksumming) => {
                let payload: ChecksumsPayload = message.payload()?;
                self.state = SessionState::Diffing;
                let diffs = compute_diffs(fs, &payload.checksums, self.block_size)?;
                let request = SyncMessage::request(MessageName::Diff, &DiffsPayload { diffs })?;
                self.state = SessionState::Patching;
                Ok(ClientStep::Send(request))
            }
            (MessageType::Response, MessageName::Patch, SessionState::Patching) => {
                self.state = SessionState::Completed;
                Ok(ClientStep::Completed(message.payload()?))
            }
            (MessageType::Response | MessageType::Stream, MessageName::Reset, _) => {
                let Some(root) = self.root.clone() else {
                    self.state = SessionState::Linked;
                    return Ok(ClientStep::Wait);
                };
                self.state = SessionState::Linked;
                self.start(fs, &root).map(ClientStep::Send)
            }
            (MessageType::Response, MessageName::Error, _) => {
                let payload: ErrorPayload = message.payload()?;
                self.state = SessionState::Linked;
                Ok(ClientStep::Ended(payload.message))
            }
            (MessageType::Stream, MessageName::Patch, _) => Ok(ClientStep::RemoteChanged(message.payload()?)),
            (MessageType::Response, MessageName::Ack, _) => Ok(ClientStep::Wait),
            (_, _, state) => Err(SyncError::protocol(format!("unexpected {message} while {state}"))),
        }
    }
}

/// Run one complete round between a local client tree and a server session.
///
/// # Errors
///
/// `RoundAbandoned` if the server ended the round; any client-side error.
pub fn sync_round<C, S>(client_fs: &C, session: &SyncSession, server_fs: &S, root: &str) -> Result<PatchPayload>
where
    C: FileSystem + ?Sized,
    S: FileSystem + ?Sized,
{
    let config = SyncConfig {
        block_size: session.config.block_size,
        ..SyncConfig::default()
    };
    let mut client = ClientSession::new(&config);
    let mut outgoing = client.start(client_fs, root)?;

    loop {
        let Some(reply) = session.handle(server_fs, &outgoing) else {
            return Err(SyncError::protocol(format!("no reply to {outgoing}")));
        };
        match client.handle(client_fs, &reply)? {
            ClientStep::Send(next) => outgoing = next,
            ClientStep::Completed(result) => {
                session.handle(server_fs, &SyncMessage::ack(MessageName::Patch));
                return Ok(result);
            }
            ClientStep::Ended(reason) => return Err(SyncError::RoundAbandoned(reason)),
            ClientStep::RemoteChanged(_) | ClientStep::Wait => {
                return Err(SyncError::protocol(format!("stalled after {reply}")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;
    use crate::protocol::SourceList;

    const BLOCK: usize = 4;

    fn config() -> SyncConfig {
        SyncConfig {
            block_size: BLOCK,
            ..SyncConfig::default()
        }
    }

    fn session() -> SyncSession {
        SyncSession::new(SyncId(1), ConnectionId(1), "alice", config())
    }

    fn tree(files: &[(&str, &[u8])]) -> MemoryFs {
        let fs = MemoryFs::new();
        for (path, data) in files {
            fs.mkdir_all(&vpath::dirname(path)).unwrap();
            fs.write_file(path, data).unwrap();
        }
        fs
    }

    fn sources(root: &str, paths: &[&str]) -> SourceList {
        SourceList {
            path: root.to_string(),
            src_list: paths.iter().map(|p| (*p).to_string()).collect(),
        }
    }

    // ==========================================================================
    // STATE MACHINE
    // ==========================================================================

    #[test]
    fn new_session_is_linked() {
        let s = session();
        assert_eq!(s.state(), SessionState::Linked);
        assert_eq!(s.username(), "alice");
        assert_eq!(s.reset_count(), 0);
    }

    #[test]
    fn happy_path_transitions() {
        let server = tree(&[("/d/a.txt", b"old contents")]);
        let client = tree(&[("/d/a.txt", b"new contents")]);
        let s = session();

        s.register_sources(source_list(&client, "/d").unwrap()).unwrap();
        assert_eq!(s.state(), SessionState::Listing);

        let checksums = s.checksums(&server).unwrap();
        assert_eq!(s.state(), SessionState::Diffing);

        let diffs = compute_diffs(&client, &checksums, BLOCK).unwrap();
        let result = s.apply(&server, &diffs).unwrap();
        assert_eq!(s.state(), SessionState::Completed);
        assert_eq!(result.synced, vec!["/d/a.txt"]);
        assert_eq!(server.read_file("/d/a.txt").unwrap(), b"new contents");
    }

    #[test]
    fn checksum_before_sources_is_rejected() {
        let s = session();
        let err = s.checksums(&MemoryFs::new()).unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(s.state(), SessionState::Linked);
    }

    #[test]
    fn diff_before_checksum_is_rejected_without_mutation() {
        let server = tree(&[("/a", b"keep")]);
        let s = session();
        s.register_sources(sources("/", &["/a"])).unwrap();

        let diffs = vec![PathDiff {
            path: "/a".to_string(),
            change: Change::Removed,
        }];
        assert!(s.apply(&server, &diffs).unwrap_err().is_protocol_violation());
        assert_eq!(server.read_file("/a").unwrap(), b"keep");
        assert_eq!(s.state(), SessionState::Linked);
    }

    #[test]
    fn source_list_while_diffing_is_rejected() {
        let s = session();
        s.register_sources(sources("/", &["/"])).unwrap();
        s.checksums(&MemoryFs::new()).unwrap();
        assert!(s.state().is_mid_round());

        let err = s.register_sources(sources("/", &["/"])).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn sources_outside_root_are_rejected() {
        let s = session();
        let err = s.register_sources(sources("/a", &["/a", "/b"])).unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(s.source().is_none());
    }

    #[test]
    fn sources_with_relative_segments_are_rejected() {
        let s = session();
        for (root, paths) in [("/..", vec!["/../x"]), ("/a", vec!["/a/../b"]), ("/a/.", vec!["/a"])] {
            let err = s.register_sources(sources(root, &paths)).unwrap_err();
            assert!(err.is_protocol_violation(), "{root}: {err}");
            assert!(s.source().is_none());
            assert_eq!(s.state(), SessionState::Linked);
        }
    }

    #[test]
    fn unlisted_diff_path_is_rejected_before_any_write() {
        let server = tree(&[("/a", b"keep"), ("/b", b"keep")]);
        let s = session();
        s.register_sources(sources("/", &["/a"])).unwrap();
        s.checksums(&server).unwrap();

        let diffs = vec![
            PathDiff {
                path: "/a".to_string(),
                change: Change::Removed,
            },
            PathDiff {
                path: "/b".to_string(),
                change: Change::Removed,
            },
        ];
        assert!(s.apply(&server, &diffs).unwrap_err().is_protocol_violation());
        assert!(server.exists("/a").unwrap());
        assert!(server.exists("/b").unwrap());
    }

    #[test]
    fn reset_discards_pending_patch() {
        let server = tree(&[("/a", b"keep")]);
        let s = session();
        s.register_sources(sources("/", &["/a"])).unwrap();
        s.checksums(&server).unwrap();

        s.reset();
        assert_eq!(s.state(), SessionState::Listing);
        assert_eq!(s.reset_count(), 1);

        let diffs = vec![PathDiff {
            path: "/a".to_string(),
            change: Change::Removed,
        }];
        assert!(s.apply(&server, &diffs).is_err());
        assert!(server.exists("/a").unwrap());
    }

    #[test]
    fn reset_keeps_source_list() {
        let s = session();
        s.register_sources(sources("/", &["/"])).unwrap();
        s.reset();
        assert_eq!(s.source().unwrap().path, "/");
        assert!(s.checksums(&MemoryFs::new()).is_ok());
    }

    // ==========================================================================
    // APPLYING
    // ==========================================================================

    #[test]
    fn stale_base_preserves_server_copy() {
        let server = tree(&[("/a.txt", b"server v1")]);
        let client = tree(&[("/a.txt", b"client edit")]);
        let s = session();
        s.register_sources(sources("/", &["/a.txt"])).unwrap();
        let checksums = s.checksums(&server).unwrap();

        server.write_file("/a.txt", b"server v2, written meanwhile").unwrap();
        let diffs = compute_diffs(&client, &checksums, BLOCK).unwrap();
        let result = s.apply(&server, &diffs).unwrap();

        assert_eq!(result.conflicted, vec!["/a.txt"]);
        assert!(!server.exists("/a.txt").unwrap());
        let names = server.readdir("/").unwrap();
        assert_eq!(names.len(), 1);
        assert!(path_contains_conflicted(&names[0]));
        assert_eq!(s.state(), SessionState::Completed);
    }

    #[test]
    fn digest_mismatch_is_a_conflict() {
        let server = tree(&[("/a", b"abcd")]);
        let s = session();
        s.register_sources(sources("/", &["/a"])).unwrap();
        s.checksums(&server).unwrap();

        let diffs = vec![PathDiff {
            path: "/a".to_string(),
            change: Change::File {
                diffs: vec![crate::delta::DiffSegment::Block { index: 0 }],
                digest: ContentHash::compute(b"something else"),
            },
        }];
        let result = s.apply(&server, &diffs).unwrap();
        assert_eq!(result.conflicted, vec!["/a"]);
    }

    #[test]
    fn directory_change_removes_extra_children_but_keeps_conflicted_copies() {
        let server = tree(&[
            ("/d/keep", b"1"),
            ("/d/gone", b"2"),
            ("/d/x (Conflicted Copy 2026-01-01 00:00:00)", b"3"),
        ]);
        let client = tree(&[("/d/keep", b"1")]);
        let s = session();
        s.register_sources(source_list(&client, "/d").unwrap()).unwrap();
        let checksums = s.checksums(&server).unwrap();
        let diffs = compute_diffs(&client, &checksums, BLOCK).unwrap();
        s.apply(&server, &diffs).unwrap();

        let mut names = server.readdir("/d").unwrap();
        names.sort();
        assert_eq!(names, vec!["keep", "x (Conflicted Copy 2026-01-01 00:00:00)"]);
    }

    #[test]
    fn removed_subdirectory_keeps_nested_conflicted_copies() {
        let server = tree(&[
            ("/d/keep", b"1"),
            ("/d/sub/plain", b"2"),
            ("/d/sub/x (Conflicted Copy 2026-01-01 00:00:00)", b"3"),
        ]);
        let client = tree(&[("/d/keep", b"1")]);
        let s = session();

        sync_round(&client, &s, &server, "/d").unwrap();

        assert!(server.exists("/d/sub/x (Conflicted Copy 2026-01-01 00:00:00)").unwrap());
        assert!(!server.exists("/d/sub/plain").unwrap());
        assert!(server.exists("/d/keep").unwrap());
    }

    #[test]
    fn removed_root_keeps_nested_conflicted_copies() {
        let server = tree(&[
            ("/d/a", b"x"),
            ("/d/b/c", b"y"),
            ("/d/b/y (Conflicted Copy 2026-01-01 00:00:00).txt", b"z"),
        ]);
        let s = session();

        sync_round(&MemoryFs::new(), &s, &server, "/d").unwrap();

        assert!(!server.exists("/d/a").unwrap());
        assert!(!server.exists("/d/b/c").unwrap());
        assert!(server
            .exists("/d/b/y (Conflicted Copy 2026-01-01 00:00:00).txt")
            .unwrap());
    }

    #[test]
    fn file_over_directory_with_conflicted_copy_is_conflicted() {
        let server = tree(&[("/p/x (Conflicted Copy 2026-01-01 00:00:00)", b"kept")]);
        let client = tree(&[("/p", b"now a file")]);
        let s = session();

        let result = sync_round(&client, &s, &server, "/p").unwrap();

        assert_eq!(result.conflicted, vec!["/p"]);
        assert!(server.exists("/p/x (Conflicted Copy 2026-01-01 00:00:00)").unwrap());
    }

    #[test]
    fn deleted_empty_file_is_removed() {
        let server = tree(&[("/e", b"")]);
        let s = session();

        let result = sync_round(&MemoryFs::new(), &s, &server, "/e").unwrap();

        assert_eq!(result.synced, vec!["/e"]);
        assert!(!server.exists("/e").unwrap());
    }

    #[test]
    fn new_files_and_symlinks_are_created() {
        let server = MemoryFs::new();
        let client = tree(&[("/d/sub/new.txt", b"fresh")]);
        client.symlink("/d/sub/new.txt", "/d/link").unwrap();
        let s = session();

        let result = sync_round(&client, &s, &server, "/d").unwrap();
        assert!(result.conflicted.is_empty());
        assert_eq!(server.read_file("/d/sub/new.txt").unwrap(), b"fresh");
        assert_eq!(server.readlink("/d/link").unwrap(), "/d/sub/new.txt");
    }

    #[test]
    fn removed_root_is_deleted() {
        let server = tree(&[("/d/a", b"x")]);
        let client = MemoryFs::new();
        let s = session();

        sync_round(&client, &s, &server, "/d").unwrap();
        assert!(!server.exists("/d").unwrap());
    }

    // ==========================================================================
    // CLIENT
    // ==========================================================================

    #[test]
    fn source_list_parents_first_skipping_conflicted() {
        let fs = tree(&[
            ("/r/b.txt", b"1"),
            ("/r/a/c.txt", b"2"),
            ("/r/a (Conflicted Copy 2026-01-01 00:00:00)/d.txt", b"3"),
        ]);
        let list = source_list(&fs, "/r").unwrap();
        assert_eq!(list.path, "/r");
        assert_eq!(list.src_list, vec!["/r", "/r/a", "/r/a/c.txt", "/r/b.txt"]);
    }

    #[test]
    fn source_list_of_absent_root() {
        let list = source_list(&MemoryFs::new(), "/gone").unwrap();
        assert_eq!(list.src_list, vec!["/gone"]);
    }

    #[test]
    fn compute_diffs_skips_identical_paths() {
        let fs = tree(&[("/a", b"same"), ("/b", b"client")]);
        let server = tree(&[("/a", b"same"), ("/b", b"server")]);
        let checksums = generate_checksums(&server, &["/a", "/b"], BLOCK).unwrap();

        let diffs = compute_diffs(&fs, &checksums, BLOCK).unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "/b");
    }

    #[test]
    fn compute_diffs_sends_empty_file_for_absent_node() {
        let fs = tree(&[("/empty", b"")]);
        let checksums = vec![ChecksumNode::absent("/empty")];
        let diffs = compute_diffs(&fs, &checksums, BLOCK).unwrap();
        assert_eq!(diffs.len(), 1);
        assert!(matches!(diffs[0].change, Change::File { .. }));
    }

    #[test]
    fn compute_diffs_removes_absent_node_missing_locally() {
        let checksums = vec![ChecksumNode::absent("/gone")];
        let diffs = compute_diffs(&MemoryFs::new(), &checksums, BLOCK).unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].change, Change::Removed);
    }

    #[test]
    fn client_rejects_out_of_order_reply() {
        let fs = MemoryFs::new();
        let mut client = ClientSession::new(&config());
        client.start(&fs, "/").unwrap();

        let stray = SyncMessage::response(MessageName::Patch, &PatchPayload::default()).unwrap();
        assert!(client.handle(&fs, &stray).unwrap_err().is_protocol_violation());
        assert_eq!(client.state(), SessionState::Linked);
    }

    #[test]
    fn client_restarts_after_stream_reset() {
        let fs = tree(&[("/a", b"x")]);
        let mut client = ClientSession::new(&config());
        client.start(&fs, "/").unwrap();

        let reset = SyncMessage::new(MessageType::Stream, MessageName::Reset, serde_json::Value::Null);
        let ClientStep::Send(next) = client.handle(&fs, &reset).unwrap() else {
            panic!("expected a new SOURCE_LIST");
        };
        assert!(next.is(MessageType::Request, MessageName::SourceList));
        assert_eq!(client.state(), SessionState::Listing);
    }

    #[test]
    fn server_answers_protocol_errors_with_error_message() {
        let s = session();
        let stray = SyncMessage::new(MessageType::Stream, MessageName::Diff, serde_json::Value::Null);
        let reply = s.handle(&MemoryFs::new(), &stray).unwrap();
        assert_eq!(reply.name(), MessageName::Error);
    }

    #[test]
    fn second_round_reuses_server_blocks() {
        let original: Vec<u8> = (0..64u8).collect();
        let mut edited = original.clone();
        edited[40] = 0xFF;
        let server = tree(&[("/f", &original)]);
        let client = tree(&[("/f", &edited)]);
        let s = session();

        sync_round(&client, &s, &server, "/f").unwrap();
        assert_eq!(server.read_file("/f").unwrap(), edited);
    }
}
