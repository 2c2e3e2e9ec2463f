//! Per-user admission control for sync sessions.
//!
//! Each user has at most one slot, and only the session in it may mutate the
//! user's tree. A session holds the slot from admission until its round
//! completes, fails or is preempted. Admission is preemptive: a newer session
//! takes the slot and the session it displaces is reset. [`try_set`] refuses
//! to displace another connection's session while its diff is in flight.
//!
//! [`try_set`]: ActiveSyncManager::try_set

use std::sync::Arc;

use dashmap::mapref::entry::{Entry, OccupiedEntry, VacantEntry};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::session::SyncSession;

/// Registry of the session holding each user's slot.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use vfsync::{ActiveSyncManager, ConnectionId, SyncConfig, SyncId, SyncSession};
///
/// let manager = ActiveSyncManager::new();
/// let first = Arc::new(SyncSession::new(SyncId(1), ConnectionId(1), "alice", SyncConfig::default()));
/// let second = Arc::new(SyncSession::new(SyncId(2), ConnectionId(2), "alice", SyncConfig::default()));
///
/// manager.set(Arc::clone(&first));
/// manager.set(Arc::clone(&second));
///
/// assert_eq!(manager.by_username("alice").unwrap().id(), SyncId(2));
/// assert_eq!(first.reset_count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct ActiveSyncManager {
    slots: DashMap<String, Arc<SyncSession>>,
}

impl ActiveSyncManager {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `session` in its user's slot.
    ///
    /// A different session already in the slot is reset, evicted and
    /// returned.
    pub fn set(&self, session: Arc<SyncSession>) -> Option<Arc<SyncSession>> {
        match self.slots.entry(session.username().to_string()) {
            Entry::Occupied(slot) => Self::replace(slot, session),
            Entry::Vacant(slot) => Self::admit(slot, session),
        }
    }

    /// Install `session` unless another connection's session is mid-round.
    ///
    /// The holder's state is checked while the slot is locked, so a holder
    /// cannot move into a diff between the check and the eviction.
    ///
    /// # Errors
    ///
    /// Returns the holder when it blocks admission.
    pub fn try_set(&self, session: Arc<SyncSession>) -> Result<Option<Arc<SyncSession>>, Arc<SyncSession>> {
        match self.slots.entry(session.username().to_string()) {
            Entry::Occupied(slot) => {
                let held = slot.get();
                if !Arc::ptr_eq(held, &session)
                    && held.connection() != session.connection()
                    && held.state().is_mid_round()
                {
                    debug!(user = %held.username(), holder = %held.id(), "slot locked mid-round");
                    return Err(Arc::clone(held));
                }
                Ok(Self::replace(slot, session))
            }
            Entry::Vacant(slot) => Ok(Self::admit(slot, session)),
        }
    }

    fn admit(slot: VacantEntry<'_, String, Arc<SyncSession>>, session: Arc<SyncSession>) -> Option<Arc<SyncSession>> {
        debug!(user = %session.username(), sync = %session.id(), "admitted sync");
        slot.insert(session);
        None
    }

    fn replace(
        mut slot: OccupiedEntry<'_, String, Arc<SyncSession>>,
        session: Arc<SyncSession>,
    ) -> Option<Arc<SyncSession>> {
        if Arc::ptr_eq(slot.get(), &session) {
            return None;
        }
        slot.get().reset();
        let evicted = slot.insert(session);
        info!(
            user = %evicted.username(),
            evicted = %evicted.id(),
            installed = %slot.get().id(),
            "preempted active sync"
        );
        Some(evicted)
    }

    /// Reset and clear the user's slot. No-op when it is empty.
    pub fn remove(&self, username: &str) -> Option<Arc<SyncSession>> {
        let (_, session) = self.slots.remove(username)?;
        session.reset();
        debug!(user = %username, sync = %session.id(), "removed active sync");
        Some(session)
    }

    /// Clear the slot only if `session` still holds it.
    ///
    /// Returns `false` when the slot is empty or held by a successor.
    pub fn release(&self, session: &SyncSession) -> bool {
        let released = self
            .slots
            .remove_if(session.username(), |_, held| held.id() == session.id())
            .is_some();
        if released {
            debug!(user = %session.username(), sync = %session.id(), "released active sync");
        }
        released
    }

    /// Session holding the user's slot.
    #[must_use]
    pub fn by_username(&self, username: &str) -> Option<Arc<SyncSession>> {
        self.slots.get(username).map(|slot| Arc::clone(slot.value()))
    }

    /// True if any user's slot is occupied.
    ///
    /// Checked at startup: a slot that survived means a round was
    /// interrupted and must be negotiated again.
    #[must_use]
    pub fn any_syncs_active(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if no slot is occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Reset and clear every slot.
    pub fn drain(&self) -> Vec<Arc<SyncSession>> {
        let users: Vec<String> = self.slots.iter().map(|slot| slot.key().clone()).collect();
        let drained: Vec<Arc<SyncSession>> = users.iter().filter_map(|user| self.remove(user)).collect();
        if !drained.is_empty() {
            info!(sessions = drained.len(), "drained active syncs");
        }
        drained
    }
}
