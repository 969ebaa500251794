//! The fixed-tick game server.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use keelson_auth::TokenAuthority;
use keelson_protocol::messages::{WorldPlayer, WorldSnapshot};
use keelson_protocol::{
    encode_message, ChannelTag, Encode, Message, MessageKind, PacketKind, PacketPool,
};
use keelson_transport::{PeerId, ServerTransport, TransportEvent};
use tracing::{debug, error, info, warn};

use crate::config::GameConfig;
use crate::dispatch::Dispatcher;
use crate::handlers;
use crate::registry::PlayerRegistry;
use crate::session::{PlayerSession, SessionState};
use crate::tick::TickStats;

/// Everything handlers operate on: configuration, the registry, the
/// transport, and the pool. Constructed once and passed by reference;
/// nothing here is discovered through globals.
pub struct ServerState {
    pub config: GameConfig,
    pub transport: ServerTransport,
    pub pool: Arc<PacketPool>,
    pub registry: PlayerRegistry,
    pub tokens: TokenAuthority,
    pub current_tick: u32,
    /// Fixed step size: `1 / tick_rate`.
    pub dt: f32,
}

impl ServerState {
    /// Sends one application message to one peer.
    pub fn send_message<M: Message + Encode>(&self, peer: PeerId, msg: &M, channel: ChannelTag) {
        let payload = match encode_message(msg) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode {}: {e:#}", M::NAME);
                return;
            }
        };

        self.send_payload(peer, PacketKind::Data, &payload, channel);
    }

    /// Sends a packet-level body (ping/pong style, no message kind tag).
    pub fn send_body<B: Encode>(
        &self,
        peer: PeerId,
        kind: PacketKind,
        body: &B,
        channel: ChannelTag,
    ) {
        let mut payload = Vec::new();
        if let Err(e) = body.encode(&mut payload) {
            warn!("failed to encode {kind:?} body: {e:#}");
            return;
        }

        self.send_payload(peer, kind, &payload, channel);
    }

    /// Sends one message to every in-game peer.
    pub fn broadcast_to_in_game<M: Message + Encode>(&self, msg: &M, channel: ChannelTag) {
        self.broadcast_filtered(msg, channel, None);
    }

    /// Sends one message to every in-game peer except `except`.
    pub fn broadcast_except<M: Message + Encode>(
        &self,
        except: PeerId,
        msg: &M,
        channel: ChannelTag,
    ) {
        self.broadcast_filtered(msg, channel, Some(except));
    }

    fn broadcast_filtered<M: Message + Encode>(
        &self,
        msg: &M,
        channel: ChannelTag,
        except: Option<PeerId>,
    ) {
        let payload = match encode_message(msg) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode {}: {e:#}", M::NAME);
                return;
            }
        };

        for peer in self.registry.in_game_peers() {
            if Some(peer) != except {
                self.send_payload(peer, PacketKind::Data, &payload, channel);
            }
        }
    }

    fn send_payload(&self, peer: PeerId, kind: PacketKind, payload: &[u8], channel: ChannelTag) {
        let mut packet = self.pool.rent();
        packet.kind = kind;

        if let Err(e) = packet.set_payload(payload) {
            warn!("oversized {kind:?} payload: {e:#}");
            self.pool.give(packet);
            return;
        }

        if let Err(e) = self.transport.send_to(peer, packet, channel) {
            debug!("send to {peer} failed: {e}");
        }
    }

    /// Marks the session as going away and tells the transport to close
    /// it. The registry entry is removed when the resulting
    /// `PeerDisconnected` event drains.
    pub fn disconnect(&self, peer: PeerId, reason: &str) {
        self.registry.with_session(peer, |session| {
            session.transition(SessionState::Disconnecting);
        });

        self.transport.disconnect(peer, reason);
    }
}

/// The authoritative game service: a tick loop over transport events,
/// session maintenance, simulation, and broadcast.
pub struct GameServer {
    state: ServerState,
    dispatch: Dispatcher,
    stats: TickStats,
    tick_period: Duration,
}

impl GameServer {
    pub fn new(
        config: GameConfig,
        tokens: TokenAuthority,
        transport: ServerTransport,
        pool: Arc<PacketPool>,
    ) -> Self {
        let mut dispatch = Dispatcher::new();

        dispatch.on_packet(PacketKind::Ping, Box::new(handlers::liveness::handle_ping));
        dispatch.on_message(
            MessageKind::GameAuthRequest,
            Box::new(handlers::auth::handle_game_auth),
        );
        dispatch.on_message(
            MessageKind::PlayerInput,
            Box::new(handlers::input::handle_input),
        );
        dispatch.on_message(
            MessageKind::PlayerInputBatch,
            Box::new(handlers::input::handle_input_batch),
        );

        let tick_period = Duration::from_secs_f64(f64::from(config.tick_rate).recip());
        let dt = 1.0 / config.tick_rate as f32;

        Self {
            state: ServerState {
                config,
                transport,
                pool,
                registry: PlayerRegistry::new(),
                tokens,
                current_tick: 0,
                dt,
            },
            dispatch,
            stats: TickStats::new(),
            tick_period,
        }
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn stats(&self) -> &TickStats {
        &self.stats
    }

    /// Runs until the shutdown flag flips, finishing the tick in
    /// progress, then closes the transport.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        info!(
            addr = %self.state.transport.local_addr(),
            tick_rate = self.state.config.tick_rate,
            "game server running"
        );

        while !shutdown.load(Ordering::Relaxed) {
            let tick_start = Instant::now();

            self.run_tick();

            std::thread::sleep(self.tick_period.saturating_sub(tick_start.elapsed()));
        }

        info!("game server shutting down");
        self.state.transport.close();
    }

    /// One full tick: drain, dispatch, maintain, broadcast.
    ///
    /// A panicking handler is contained here and logged; the simulation
    /// carries on with the next tick.
    pub fn run_tick(&mut self) {
        let tick_start = Instant::now();
        self.state.current_tick = self.state.current_tick.wrapping_add(1);

        let caught = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let mut events = Vec::new();
            self.state.transport.process_incoming(|event| events.push(event));

            for event in events {
                self.handle_event(event);
            }

            self.maintenance();
            self.broadcast_world();
        }));

        if caught.is_err() {
            error!(
                tick = self.state.current_tick,
                "handler panicked; continuing with the next tick"
            );
        }

        if self.stats.record(tick_start.elapsed(), self.tick_period) {
            warn!(
                tick = self.state.current_tick,
                elapsed_ms = self.stats.last_duration().as_millis() as u64,
                smoothed_ms = self.stats.smoothed().as_millis() as u64,
                "tick exceeded its budget"
            );
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected { peer, addr } => {
                info!(%peer, %addr, "peer connected");
                self.state
                    .registry
                    .insert(PlayerSession::new(peer, addr.ip(), Instant::now()));
            }
            TransportEvent::PeerDisconnected { peer, reason } => {
                info!(%peer, reason, "peer disconnected");
                self.state.registry.remove(peer);
            }
            TransportEvent::PacketReceived { peer, packet } => {
                let known = self
                    .state
                    .registry
                    .with_session(peer, |session| session.touch(Instant::now()))
                    .is_some();

                if !known {
                    debug!(%peer, "packet for a session that no longer exists");
                    self.state.pool.give(packet);
                    return;
                }

                self.dispatch.dispatch(&mut self.state, peer, packet);
            }
            TransportEvent::Error { message } => {
                warn!("transport error: {message}");
            }
        }
    }

    /// Drops idle sessions and unauthenticated sessions that outlived
    /// the grace period.
    fn maintenance(&mut self) {
        let now = Instant::now();
        let timeout = self.state.config.disconnect_timeout;
        let grace = self.state.config.auth_grace_period;

        let mut drops: Vec<(PeerId, &'static str)> = Vec::new();

        self.state.registry.for_each(|session| {
            if session.state == SessionState::Disconnecting {
                return;
            }

            if now.saturating_duration_since(session.last_activity) > timeout {
                session.state = SessionState::Disconnecting;
                drops.push((session.peer, "timed out"));
            } else if !session.is_authenticated()
                && now.saturating_duration_since(session.connected_at) > grace
            {
                session.state = SessionState::Disconnecting;
                drops.push((session.peer, "auth timeout"));
            }
        });

        for (peer, reason) in drops {
            warn!(%peer, reason, "maintenance disconnect");
            self.state.transport.disconnect(peer, reason);
        }
    }

    /// Transient world state for everyone in game, on the unreliable
    /// channel.
    fn broadcast_world(&mut self) {
        let tick = self.state.current_tick;
        let mut players = Vec::new();

        self.state.registry.for_each(|session| {
            if session.state == SessionState::InGame {
                if let Some(user_id) = session.user_id {
                    players.push(WorldPlayer {
                        user_id,
                        snapshot: session.snapshot(tick),
                    });
                }
            }
        });

        if players.is_empty() {
            return;
        }

        self.state.broadcast_to_in_game(
            &WorldSnapshot { tick, players },
            ChannelTag::Unreliable,
        );
    }
}
