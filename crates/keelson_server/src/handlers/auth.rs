//! The game-join authentication handler.

use keelson_auth::token::{unix_now, TokenError};
use keelson_protocol::messages::{GameAuthRequest, GameAuthResponse, GameAuthResult};
use keelson_protocol::{decode_message, ChannelTag, Packet};
use keelson_transport::PeerId;
use tracing::{info, warn};

use crate::config::ClientVersion;
use crate::dispatch::Context;
use crate::server::ServerState;
use crate::session::SessionState;

pub(crate) fn handle_game_auth(ctx: Context<'_>, packet: Packet) {
    let Context { peer, tick, state } = ctx;

    let req = match decode_message::<GameAuthRequest>(packet.payload()) {
        Ok(req) => req,
        Err(e) => {
            warn!(%peer, "malformed join request: {e:#}");
            state.pool.give(packet);
            return;
        }
    };
    state.pool.give(packet);

    // A join request only makes sense on a fresh session.
    let begun = state.registry.with_session(peer, |session| {
        if session.is_authenticated() {
            false
        } else {
            session.transition(SessionState::Authenticating)
        }
    });

    match begun {
        None => {
            state.disconnect(peer, "no session");
            return;
        }
        Some(false) => {
            warn!(%peer, "join request on an already authenticated session");
            refuse(
                state,
                peer,
                GameAuthResult::AlreadyConnected,
                "already authenticated",
            );
            return;
        }
        Some(true) => {}
    }

    match req.client_version.parse::<ClientVersion>() {
        Ok(version) if version >= state.config.min_client_version => {}
        _ => {
            warn!(%peer, version = %req.client_version, "client version refused");
            refuse(state, peer, GameAuthResult::VersionMismatch, "version mismatch");
            return;
        }
    }

    let claims = match state.tokens.verify(&req.token, unix_now()) {
        Ok(claims) => claims,
        Err(e) => {
            let result = match e {
                TokenError::Expired => GameAuthResult::TokenExpired,
                TokenError::InvalidSignature
                | TokenError::Malformed
                | TokenError::WrongIssuer
                | TokenError::NotYetValid => GameAuthResult::InvalidToken,
            };

            warn!(%peer, "join token rejected: {e}");
            refuse(state, peer, result, "invalid token");
            return;
        }
    };

    if let Err(e) = state.registry.bind_user(peer, claims.sub) {
        warn!(%peer, user = %claims.sub, "duplicate login refused: {e}");
        refuse(state, peer, GameAuthResult::AlreadyConnected, "duplicate login");
        return;
    }

    let entered = state
        .registry
        .with_session(peer, |session| {
            session.complete_auth(claims.sub, claims.name.clone(), req.token.clone())
                && session.enter_game()
        })
        .unwrap_or(false);

    if !entered {
        state.registry.unbind_user(claims.sub, peer);
        refuse(
            state,
            peer,
            GameAuthResult::InternalError,
            "session in an unexpected state",
        );
        return;
    }

    info!(%peer, user = %claims.sub, username = %claims.name, "player joined");

    state.send_message(
        peer,
        &GameAuthResponse {
            result: GameAuthResult::Success,
            user_id: Some(claims.sub),
            username: claims.name,
            server_tick: tick,
            ping_interval_secs: state.config.ping_interval.as_secs() as u32,
        },
        ChannelTag::Reliable,
    );
}

/// Sends the failure result, rolls the session back, and closes.
fn refuse(state: &mut ServerState, peer: PeerId, result: GameAuthResult, reason: &str) {
    state.send_message(
        peer,
        &GameAuthResponse::failure(result),
        ChannelTag::Reliable,
    );

    state.registry.with_session(peer, |session| {
        session.fail_auth();
    });

    state.disconnect(peer, reason);
}
