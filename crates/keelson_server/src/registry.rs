//! The dual-indexed player registry.
//!
//! The only structure shared between the transport worker and the
//! simulation thread, so one mutex guards both indices. The user-id
//! index holds only authenticated sessions and never maps one user to
//! two peers; that is what makes duplicate logins detectable in O(1).

use std::collections::HashMap;

use keelson_transport::PeerId;
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::session::{PlayerSession, SessionState};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("user {0} is already connected as {1}")]
pub struct DuplicateLogin(pub Uuid, pub PeerId);

#[derive(Default)]
struct RegistryInner {
    by_peer: HashMap<PeerId, PlayerSession>,
    by_user: HashMap<Uuid, PeerId>,
}

/// Sessions indexed by peer id and, once authenticated, by user id.
#[derive(Default)]
pub struct PlayerRegistry {
    inner: Mutex<RegistryInner>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, session: PlayerSession) {
        let mut inner = self.inner.lock();

        debug_assert!(
            !inner.by_peer.contains_key(&session.peer),
            "peer inserted twice"
        );
        inner.by_peer.insert(session.peer, session);
    }

    /// Removes the session and, if authenticated, its user index entry.
    pub fn remove(&self, peer: PeerId) -> Option<PlayerSession> {
        let mut inner = self.inner.lock();

        let session = inner.by_peer.remove(&peer)?;
        if let Some(user_id) = session.user_id {
            // Only clear the index if it still points at this peer; a
            // duplicate-login refusal must not evict the original.
            if inner.by_user.get(&user_id) == Some(&peer) {
                inner.by_user.remove(&user_id);
            }
        }

        Some(session)
    }

    /// Runs `f` against the session for `peer`, if any.
    pub fn with_session<R>(&self, peer: PeerId, f: impl FnOnce(&mut PlayerSession) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        inner.by_peer.get_mut(&peer).map(f)
    }

    /// Claims `user_id` for `peer`. Fails if another live session
    /// already holds it.
    pub fn bind_user(&self, peer: PeerId, user_id: Uuid) -> Result<(), DuplicateLogin> {
        let mut inner = self.inner.lock();

        if let Some(&holder) = inner.by_user.get(&user_id) {
            if holder != peer {
                return Err(DuplicateLogin(user_id, holder));
            }
            return Ok(());
        }

        inner.by_user.insert(user_id, peer);
        Ok(())
    }

    /// Releases `user_id` if `peer` holds it. Used when a join fails
    /// after the binding was claimed.
    pub fn unbind_user(&self, user_id: Uuid, peer: PeerId) {
        let mut inner = self.inner.lock();
        if inner.by_user.get(&user_id) == Some(&peer) {
            inner.by_user.remove(&user_id);
        }
    }

    pub fn peer_of_user(&self, user_id: Uuid) -> Option<PeerId> {
        self.inner.lock().by_user.get(&user_id).copied()
    }

    /// Peers currently in game.
    pub fn in_game_peers(&self) -> Vec<PeerId> {
        self.inner
            .lock()
            .by_peer
            .values()
            .filter(|s| s.state == SessionState::InGame)
            .map(|s| s.peer)
            .collect()
    }

    /// Runs `f` over every session. Used by the maintenance and
    /// broadcast passes on the simulation thread.
    pub fn for_each(&self, mut f: impl FnMut(&mut PlayerSession)) {
        let mut inner = self.inner.lock();
        for session in inner.by_peer.values_mut() {
            f(session);
        }
    }
}
