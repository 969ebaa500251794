//! Per-connection session state and its legal transitions.

use std::net::IpAddr;
use std::time::Instant;

use glam::Vec3;
use keelson_protocol::{StateFlags, StateSnapshot};
use keelson_transport::PeerId;
use uuid::Uuid;

/// Where a connection stands between admission and teardown.
///
/// The graph is acyclic except that `Disconnecting` is reachable from
/// everywhere and a failed authentication falls back to `Connected`:
///
/// ```text
/// Connected → Authenticating → Authenticated → InGame
///      ↑______________|              |            |
///        (fail-auth)                 └→ Disconnecting ←┘  (from any)
/// ```
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum SessionState {
    Connected,
    Authenticating,
    Authenticated,
    InGame,
    Disconnecting,
}

/// One admitted peer, as the simulation sees it.
#[derive(Debug)]
pub struct PlayerSession {
    pub peer: PeerId,
    pub ip: IpAddr,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub state: SessionState,

    /// Set on `complete_auth`, never before.
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
    pub token: Option<String>,

    pub position: Vec3,
    pub velocity: Vec3,
    pub rotation: f32,
    pub flags: StateFlags,
    /// Sequence of the most recent accepted input.
    pub last_processed_input: u32,
}

impl PlayerSession {
    pub fn new(peer: PeerId, ip: IpAddr, now: Instant) -> Self {
        Self {
            peer,
            ip,
            connected_at: now,
            last_activity: now,
            state: SessionState::Connected,
            user_id: None,
            username: None,
            token: None,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            rotation: 0.0,
            flags: StateFlags::new(),
            last_processed_input: 0,
        }
    }

    /// Records traffic from the peer; the maintenance pass compares this
    /// against the disconnect timeout.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state,
            SessionState::Authenticated | SessionState::InGame
        )
    }

    /// Attempts a transition, returning whether `to` is a legal successor
    /// of the current state.
    pub fn transition(&mut self, to: SessionState) -> bool {
        use SessionState::*;

        let legal = matches!(
            (self.state, to),
            (Connected, Authenticating)
                | (Authenticating, Authenticated)
                | (Authenticated, InGame)
                | (Connected | Authenticating, Connected)
                | (_, Disconnecting)
        );

        if legal {
            self.state = to;
        }

        legal
    }

    /// Stores the verified identity and moves to `Authenticated`.
    pub fn complete_auth(&mut self, user_id: Uuid, username: String, token: String) -> bool {
        if !self.transition(SessionState::Authenticated) {
            return false;
        }

        self.user_id = Some(user_id);
        self.username = Some(username);
        self.token = Some(token);
        true
    }

    /// Drops any partial identity and falls back to `Connected`.
    pub fn fail_auth(&mut self) -> bool {
        if !self.transition(SessionState::Connected) {
            return false;
        }

        self.user_id = None;
        self.username = None;
        self.token = None;
        true
    }

    /// Moves to `InGame` and resets movement state to the spawn point.
    pub fn enter_game(&mut self) -> bool {
        if !self.transition(SessionState::InGame) {
            return false;
        }

        self.position = Vec3::ZERO;
        self.velocity = Vec3::ZERO;
        self.rotation = 0.0;
        self.flags = StateFlags::new().with_grounded(true);
        self.last_processed_input = 0;
        true
    }

    /// The session's movement state as a snapshot at `tick`.
    pub fn snapshot(&self, tick: u32) -> StateSnapshot {
        StateSnapshot {
            tick,
            last_processed_input: self.last_processed_input,
            position: self.position,
            velocity: self.velocity,
            rotation: self.rotation,
            flags: self.flags,
        }
    }

    /// Commits an accepted simulation result.
    pub fn apply_snapshot(&mut self, snapshot: &StateSnapshot) {
        self.position = snapshot.position;
        self.velocity = snapshot.velocity;
        self.rotation = snapshot.rotation;
        self.flags = snapshot.flags;
        self.last_processed_input = snapshot.last_processed_input;
    }
}
