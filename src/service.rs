//! Sync service: connections, session admission and the push channel.
//!
//! This is the request surface a transport maps onto:
//!
//! | Operation | HTTP equivalent |
//! |---|---|
//! | [`SyncService::open_sync`] | `GET /api/sync/:connectionId` |
//! | [`SyncService::post_sources`] | `POST /api/sync/:syncId/sources` |
//! | [`SyncService::get_checksums`] | `GET /api/sync/:syncId/checksums` |
//! | [`SyncService::put_diffs`] | `PUT /api/sync/:syncId/diffs` |
//!
//! A session holds its user's slot from admission until its round completes
//! or fails; the next `post_sources` admits it again.
//!
//! Failures carry an HTTP-style status via [`ApiError::status`]. Each
//! connection gets a push channel that yields `{connectionId}` first, then
//! `STREAM` messages: `PATCH` when another connection of the same user
//! changed the tree, `RESET` when the connection's session was preempted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::active::ActiveSyncManager;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::fs::{FileSystem, MemoryFs};
use crate::protocol::{
    ChecksumsPayload, DiffsPayload, MessageName, MessageType, PatchPayload, SourceList, SyncMessage,
};
use crate::session::{ConnectionId, SessionState, SyncId, SyncSession};

/// Errors returned by [`SyncService`] operations.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The connection id is not known.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// The sync id is not known.
    #[error("unknown sync {0}")]
    UnknownSync(SyncId),

    /// Another connection of the same user is mid-round.
    #[error("sync for {username} is locked by connection {holder}")]
    Locked {
        /// User whose slot is busy.
        username: String,
        /// Connection holding it.
        holder: ConnectionId,
    },

    /// The session does not hold its user's slot, so its round is over.
    #[error("sync {0} has no active round")]
    Inactive(SyncId),

    /// The round itself failed.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl ApiError {
    /// HTTP-style status code.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::UnknownConnection(_) => 400,
            Self::UnknownSync(_) => 404,
            Self::Locked { .. } => 423,
            Self::Inactive(_) => 409,
            Self::Sync(e) if e.is_protocol_violation() => 400,
            Self::Sync(SyncError::InvalidArgument(_)) => 400,
            Self::Sync(e) if e.is_conflict() => 409,
            Self::Sync(SyncError::RoundAbandoned(_)) => 409,
            Self::Sync(_) => 500,
        }
    }
}

/// Result type for service operations.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Item delivered on a connection's push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PushEvent {
    /// First item on every channel.
    Connected {
        /// Id of the new connection.
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
    },
    /// A `STREAM` message.
    Message(SyncMessage),
}

/// Supplies each user's server-side tree.
pub trait FsProvider: Send + Sync {
    /// Filesystem holding `username`'s tree.
    fn filesystem(&self, username: &str) -> Arc<dyn FileSystem>;
}

/// One [`MemoryFs`] per user, created on first use.
#[derive(Debug, Default)]
pub struct MemoryFsProvider {
    trees: DashMap<String, Arc<MemoryFs>>,
}

impl MemoryFsProvider {
    /// Create a provider with no trees.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The user's tree as its concrete type.
    #[must_use]
    pub fn tree(&self, username: &str) -> Arc<MemoryFs> {
        Arc::clone(self.trees.entry(username.to_string()).or_default().value())
    }
}

impl FsProvider for MemoryFsProvider {
    fn filesystem(&self, username: &str) -> Arc<dyn FileSystem> {
        self.tree(username)
    }
}

#[derive(Debug)]
struct Connection {
    username: String,
    push: mpsc::UnboundedSender<PushEvent>,
}

/// Server-side entry point for sync clients.
#[derive(Debug)]
pub struct SyncService<P> {
    config: SyncConfig,
    provider: P,
    manager: ActiveSyncManager,
    connections: DashMap<ConnectionId, Connection>,
    sessions: DashMap<SyncId, Arc<SyncSession>>,
    next_connection: AtomicU64,
    next_sync: AtomicU64,
}

impl<P: FsProvider> SyncService<P> {
    /// Create a service serving trees from `provider`.
    #[must_use]
    pub fn new(config: SyncConfig, provider: P) -> Self {
        Self {
            config,
            provider,
            manager: ActiveSyncManager::new(),
            connections: DashMap::new(),
            sessions: DashMap::new(),
            next_connection: AtomicU64::new(1),
            next_sync: AtomicU64::new(1),
        }
    }

    /// The admission registry.
    #[must_use]
    pub const fn manager(&self) -> &ActiveSyncManager {
        &self.manager
    }

    /// The tree provider.
    #[must_use]
    pub const fn provider(&self) -> &P {
        &self.provider
    }

    /// Open a connection for `username` and its push channel.
    pub fn connect(&self, username: &str) -> (ConnectionId, mpsc::UnboundedReceiver<PushEvent>) {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let (push, events) = mpsc::unbounded_channel();
        // The receiver is still held here, so this cannot fail.
        let _ = push.send(PushEvent::Connected { connection_id: id });
        self.connections.insert(
            id,
            Connection {
                username: username.to_string(),
                push,
            },
        );
        info!(connection = %id, user = %username, "client connected");
        (id, events)
    }

    /// Drop a connection and release any session it holds.
    pub fn disconnect(&self, connection: ConnectionId) {
        if self.connections.remove(&connection).is_none() {
            return;
        }
        let owned: Vec<SyncId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().connection() == connection)
            .map(|entry| *entry.key())
            .collect();
        for id in owned {
            if let Some((_, session)) = self.sessions.remove(&id) {
                self.manager.release(&session);
                session.reset();
            }
        }
        info!(%connection, "client disconnected");
    }

    /// Give `connection` a sync session and its user's slot.
    ///
    /// Earlier sessions of the same connection are dropped.
    ///
    /// # Errors
    ///
    /// 400 for an unknown connection; 423 while another connection of the
    /// same user is mid-round.
    pub fn open_sync(&self, connection: ConnectionId) -> ApiResult<SyncId> {
        let username = self
            .connections
            .get(&connection)
            .map(|conn| conn.username.clone())
            .ok_or(ApiError::UnknownConnection(connection))?;

        let id = SyncId(self.next_sync.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(SyncSession::new(id, connection, username, self.config.clone()));
        self.sessions.insert(id, Arc::clone(&session));
        if let Err(e) = self.admit(&session) {
            self.sessions.remove(&id);
            return Err(e);
        }

        let stale: Vec<SyncId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().connection() == connection && *entry.key() != id)
            .map(|entry| *entry.key())
            .collect();
        for old in stale {
            self.sessions.remove(&old);
        }
        debug!(%connection, sync = %id, "opened sync");
        Ok(id)
    }

    /// Put `session` in its user's slot, preempting an idle holder.
    fn admit(&self, session: &Arc<SyncSession>) -> ApiResult<()> {
        match self.manager.try_set(Arc::clone(session)) {
            Ok(Some(evicted)) => {
                self.sessions.remove(&evicted.id());
                if evicted.connection() != session.connection() {
                    self.push(
                        evicted.connection(),
                        SyncMessage::new(MessageType::Stream, MessageName::Reset, serde_json::Value::Null),
                    );
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(holder) => {
                warn!(user = %holder.username(), holder = %holder.connection(), "sync locked");
                Err(ApiError::Locked {
                    username: holder.username().to_string(),
                    holder: holder.connection(),
                })
            }
        }
    }

    /// Give the slot back once the session's round has completed or failed.
    fn settle(&self, session: &SyncSession) {
        if matches!(session.state(), SessionState::Linked | SessionState::Completed) {
            self.manager.release(session);
        }
    }

    fn session(&self, sync: SyncId) -> ApiResult<Arc<SyncSession>> {
        self.sessions
            .get(&sync)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ApiError::UnknownSync(sync))
    }

    /// Session that must hold its slot to continue a round.
    fn holder(&self, sync: SyncId) -> ApiResult<Arc<SyncSession>> {
        let session = self.session(sync)?;
        match self.manager.by_username(session.username()) {
            Some(held) if held.id() == sync => Ok(session),
            _ => Err(ApiError::Inactive(sync)),
        }
    }

    /// Register the client's root and paths, starting a round.
    ///
    /// # Errors
    ///
    /// 404 for an unknown session; 423 while another connection of the same
    /// user is mid-round; 400 when out of order.
    pub fn post_sources(&self, sync: SyncId, sources: SourceList) -> ApiResult<()> {
        let session = self.session(sync)?;
        self.admit(&session)?;
        let registered = session.register_sources(sources);
        self.settle(&session);
        registered.map_err(ApiError::from)
    }

    /// Server checksum tree for the registered paths.
    ///
    /// # Errors
    ///
    /// 404 for an unknown session; 409 without an active round; 400 when out
    /// of order; 500 for filesystem failures.
    pub fn get_checksums(&self, sync: SyncId) -> ApiResult<ChecksumsPayload> {
        let session = self.holder(sync)?;
        let fs = self.provider.filesystem(session.username());
        let checksums = session.checksums(&*fs);
        self.settle(&session);
        Ok(ChecksumsPayload { checksums: checksums? })
    }

    /// Apply the client's diffs and tell the user's other connections.
    ///
    /// # Errors
    ///
    /// 404 for an unknown session; 409 without an active round; 400 when out
    /// of order; 500 for filesystem failures.
    pub fn put_diffs(&self, sync: SyncId, diffs: &DiffsPayload) -> ApiResult<PatchPayload> {
        let session = self.holder(sync)?;
        let fs = self.provider.filesystem(session.username());
        let applied = session.apply(&*fs, &diffs.diffs);
        self.settle(&session);
        let result = applied?;
        self.notify_patched(&session, &result);
        Ok(result)
    }

    /// Abandon the session's current round.
    ///
    /// # Errors
    ///
    /// 404 for an unknown session.
    pub fn reset(&self, sync: SyncId) -> ApiResult<()> {
        let session = self.session(sync)?;
        session.reset();
        self.settle(&session);
        Ok(())
    }

    /// Message-oriented entry point for stream transports.
    ///
    /// # Errors
    ///
    /// 404 for an unknown session; 423 for a `SOURCE_LIST` while another
    /// connection is mid-round; 409 for `CHECKSUM` or `DIFF` without an
    /// active round. Round failures are answered with an `ERROR` message
    /// instead.
    pub fn handle_message(&self, sync: SyncId, message: &SyncMessage) -> ApiResult<Option<SyncMessage>> {
        let session = match (message.kind(), message.name()) {
            (MessageType::Request, MessageName::SourceList) => {
                let session = self.session(sync)?;
                self.admit(&session)?;
                session
            }
            (MessageType::Request, MessageName::Checksum | MessageName::Diff) => self.holder(sync)?,
            _ => self.session(sync)?,
        };
        let fs = self.provider.filesystem(session.username());
        let reply = session.handle(&*fs, message);
        self.settle(&session);
        if let Some(reply) = &reply {
            if reply.is(MessageType::Response, MessageName::Patch) {
                let result: PatchPayload = reply.payload()?;
                self.notify_patched(&session, &result);
            }
        }
        Ok(reply)
    }

    fn notify_patched(&self, session: &SyncSession, result: &PatchPayload) {
        let message = match SyncMessage::stream(MessageName::Patch, result) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "cannot encode patch notification");
                return;
            }
        };
        let peers: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| entry.username == session.username() && *entry.key() != session.connection())
            .map(|entry| *entry.key())
            .collect();
        for peer in peers {
            self.push(peer, message.clone());
        }
    }

    fn push(&self, connection: ConnectionId, message: SyncMessage) {
        let Some(sender) = self.connections.get(&connection).map(|conn| conn.push.clone()) else {
            return;
        };
        debug!(%connection, %message, "push");
        if sender.send(PushEvent::Message(message)).is_err() {
            debug!(%connection, "push channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{compute_diffs, source_list, SessionState};

    fn service() -> SyncService<MemoryFsProvider> {
        let config = SyncConfig {
            block_size: 4,
            ..SyncConfig::default()
        };
        SyncService::new(config, MemoryFsProvider::new())
    }

    fn client_tree() -> MemoryFs {
        let fs = MemoryFs::new();
        fs.mkdir("/docs").unwrap();
        fs.write_file("/docs/a.txt", b"client text").unwrap();
        fs
    }

    fn expect_stream(events: &mut mpsc::UnboundedReceiver<PushEvent>, name: MessageName) {
        match events.try_recv() {
            Ok(PushEvent::Message(message)) => {
                assert!(message.is(MessageType::Stream, name), "got {message}");
            }
            other => panic!("expected STREAM {name}, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn push_channel_starts_with_connection_id() {
        let service = service();
        let (id, mut events) = service.connect("alice");
        assert_eq!(
            events.recv().await,
            Some(PushEvent::Connected { connection_id: id })
        );
    }

    #[test]
    fn connected_event_wire_shape() {
        let json = serde_json::to_value(PushEvent::Connected {
            connection_id: ConnectionId(7),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"connectionId": 7}));
    }

    #[test]
    fn open_sync_unknown_connection_is_400() {
        let err = service().open_sync(ConnectionId(99)).unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn unknown_sync_is_404() {
        let err = service().get_checksums(SyncId(99)).unwrap_err();
        assert_eq!(err.status(), 404);
    }

    #[test]
    fn out_of_order_request_is_400() {
        let service = service();
        let (conn, _events) = service.connect("alice");
        let sync = service.open_sync(conn).unwrap();
        assert_eq!(service.get_checksums(sync).unwrap_err().status(), 400);
    }

    #[tokio::test]
    async fn full_round_notifies_other_connections() {
        let service = service();
        let client = client_tree();
        let (c1, _e1) = service.connect("alice");
        let (_c2, mut e2) = service.connect("alice");
        let (_c3, mut e3) = service.connect("bob");
        e2.recv().await.unwrap();
        e3.recv().await.unwrap();

        let sync = service.open_sync(c1).unwrap();
        service.post_sources(sync, source_list(&client, "/docs").unwrap()).unwrap();
        let checksums = service.get_checksums(sync).unwrap().checksums;
        let diffs = compute_diffs(&client, &checksums, 4).unwrap();
        let result = service.put_diffs(sync, &DiffsPayload { diffs }).unwrap();

        assert!(result.synced.contains(&"/docs/a.txt".to_string()));
        let tree = service.provider().tree("alice");
        assert_eq!(tree.read_file("/docs/a.txt").unwrap(), b"client text");

        expect_stream(&mut e2, MessageName::Patch);
        assert!(e3.try_recv().is_err());
        assert!(!service.manager().any_syncs_active());
    }

    #[test]
    fn completed_session_is_readmitted_for_next_round() {
        let service = service();
        let client = client_tree();
        let (conn, _events) = service.connect("alice");
        let sync = service.open_sync(conn).unwrap();

        for text in [&b"first"[..], &b"second"[..]] {
            client.write_file("/docs/a.txt", text).unwrap();
            service.post_sources(sync, source_list(&client, "/docs").unwrap()).unwrap();
            assert_eq!(service.manager().by_username("alice").unwrap().id(), sync);
            let checksums = service.get_checksums(sync).unwrap().checksums;
            let diffs = compute_diffs(&client, &checksums, 4).unwrap();
            service.put_diffs(sync, &DiffsPayload { diffs }).unwrap();
            assert!(!service.manager().any_syncs_active());
        }
        assert_eq!(service.provider().tree("alice").read_file("/docs/a.txt").unwrap(), b"second");
    }

    #[test]
    fn failed_round_releases_slot() {
        let service = service();
        let (conn, _events) = service.connect("alice");
        let sync = service.open_sync(conn).unwrap();
        assert!(service.manager().any_syncs_active());

        assert_eq!(service.get_checksums(sync).unwrap_err().status(), 400);
        assert!(!service.manager().any_syncs_active());
        assert_eq!(service.get_checksums(sync).unwrap_err().status(), 409);
    }

    #[test]
    fn released_session_cannot_resume_after_reset() {
        let service = service();
        let client = client_tree();
        let (conn, _events) = service.connect("alice");
        let sync = service.open_sync(conn).unwrap();
        service.post_sources(sync, source_list(&client, "/docs").unwrap()).unwrap();
        let checksums = service.get_checksums(sync).unwrap().checksums;
        let diffs = compute_diffs(&client, &checksums, 4).unwrap();
        service.put_diffs(sync, &DiffsPayload { diffs }).unwrap();

        service.reset(sync).unwrap();
        assert!(service.manager().is_empty());
        assert_eq!(service.get_checksums(sync).unwrap_err().status(), 409);
    }

    #[test]
    fn post_sources_waits_for_other_connection_mid_round() {
        let service = service();
        let client = client_tree();
        let (c1, _e1) = service.connect("alice");
        let (c2, _e2) = service.connect("alice");

        let first = service.open_sync(c1).unwrap();
        assert_eq!(service.get_checksums(first).unwrap_err().status(), 400);

        let second = service.open_sync(c2).unwrap();
        service.post_sources(second, source_list(&client, "/docs").unwrap()).unwrap();
        service.get_checksums(second).unwrap();

        let err = service
            .post_sources(first, source_list(&client, "/docs").unwrap())
            .unwrap_err();
        assert_eq!(err.status(), 423);
        assert_eq!(service.manager().by_username("alice").unwrap().id(), second);
    }

    #[test]
    fn message_round_releases_slot() {
        let service = service();
        let client = client_tree();
        let (conn, _events) = service.connect("alice");
        let sync = service.open_sync(conn).unwrap();

        let mut round = crate::session::ClientSession::new(&service.config);
        let mut outgoing = round.start(&client, "/docs").unwrap();
        loop {
            let reply = service.handle_message(sync, &outgoing).unwrap().unwrap();
            match round.handle(&client, &reply).unwrap() {
                crate::session::ClientStep::Send(next) => outgoing = next,
                crate::session::ClientStep::Completed(_) => break,
                other => panic!("unexpected step {other:?}"),
            }
        }
        assert!(!service.manager().any_syncs_active());
        assert!(service
            .handle_message(sync, &SyncMessage::ack(MessageName::Patch))
            .unwrap()
            .is_none());
    }

    #[test]
    fn second_connection_locked_while_mid_round() {
        let service = service();
        let client = client_tree();
        let (c1, _e1) = service.connect("alice");
        let (c2, _e2) = service.connect("alice");

        let sync = service.open_sync(c1).unwrap();
        service.post_sources(sync, source_list(&client, "/docs").unwrap()).unwrap();
        service.get_checksums(sync).unwrap();

        let err = service.open_sync(c2).unwrap_err();
        assert_eq!(err.status(), 423);
    }

    #[test]
    fn idle_session_is_preempted() {
        let service = service();
        let (c1, mut e1) = service.connect("alice");
        let (c2, _e2) = service.connect("alice");
        e1.try_recv().unwrap();

        let first = service.open_sync(c1).unwrap();
        let second = service.open_sync(c2).unwrap();

        expect_stream(&mut e1, MessageName::Reset);
        assert_eq!(service.reset(first).unwrap_err().status(), 404);
        assert_eq!(
            service.manager().by_username("alice").unwrap().id(),
            second
        );
    }

    #[test]
    fn preempted_session_is_reset_and_forgotten() {
        let service = service();
        let client = client_tree();
        let (c1, _e1) = service.connect("alice");
        let (c2, _e2) = service.connect("alice");

        let first = service.open_sync(c1).unwrap();
        service.post_sources(first, source_list(&client, "/docs").unwrap()).unwrap();
        let held = service.manager().by_username("alice").unwrap();
        service.open_sync(c2).unwrap();

        assert_eq!(held.reset_count(), 1);
        assert_eq!(held.state(), SessionState::Listing);
        assert_eq!(service.get_checksums(first).unwrap_err().status(), 404);
    }

    #[test]
    fn disconnect_releases_slot() {
        let service = service();
        let (conn, _events) = service.connect("alice");
        service.open_sync(conn).unwrap();
        assert!(service.manager().any_syncs_active());

        service.disconnect(conn);
        assert!(!service.manager().any_syncs_active());
        assert_eq!(service.open_sync(conn).unwrap_err().status(), 400);
    }

    #[test]
    fn handle_message_answers_errors_in_band() {
        let service = service();
        let (conn, _events) = service.connect("alice");
        let sync = service.open_sync(conn).unwrap();

        let reply = service
            .handle_message(
                sync,
                &SyncMessage::new(MessageType::Request, MessageName::Diff, serde_json::json!({"diffs": []})),
            )
            .unwrap()
            .unwrap();
        assert_eq!(reply.name(), MessageName::Error);
    }

    #[test]
    fn status_codes() {
        assert_eq!(ApiError::Sync(SyncError::protocol("x")).status(), 400);
        assert_eq!(
            ApiError::Sync(SyncError::Conflict {
                path: "/a".to_string(),
                reason: "stale".to_string()
            })
            .status(),
            409
        );
        assert_eq!(
            ApiError::Sync(SyncError::Io(std::io::Error::other("disk"))).status(),
            500
        );
    }
}
