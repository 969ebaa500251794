//! Application messages carried inside [`PacketKind::Data`] packets.
//!
//! Every message serializes as its `u16` [`MessageKind`] followed by a
//! positional body; [`peek_message_kind`](crate::peek_message_kind) reads
//! the tag without touching the body. Numeric assignments are stable and
//! grouped by range: 0-99 system, 100-199 auth, 200-299 gameplay, 300+
//! chat.
//!
//! [`PacketKind::Data`]: crate::PacketKind::Data

use std::io::Write;

use anyhow::bail;
use uuid::Uuid;

use crate::{Decode, Encode, InputData, Message, StateSnapshot};

/// The semantic tag leading every serialized application message.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[repr(u16)]
pub enum MessageKind {
    Unknown = 0,
    Ping = 1,
    Pong = 2,
    Disconnect = 3,
    RegisterRequest = 100,
    RegisterResponse = 101,
    LoginRequest = 102,
    LoginResponse = 103,
    TokenValidationRequest = 104,
    TokenValidationResponse = 105,
    GameAuthRequest = 110,
    GameAuthResponse = 111,
    PlayerInput = 200,
    PlayerInputBatch = 201,
    PlayerState = 202,
    WorldSnapshot = 203,
    ChatMessage = 300,
}

impl MessageKind {
    /// Maps a raw tag to its kind. Unassigned tags map to
    /// [`MessageKind::Unknown`] so unknown messages can be counted and
    /// dropped without failing the peek.
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            1 => Self::Ping,
            2 => Self::Pong,
            3 => Self::Disconnect,
            100 => Self::RegisterRequest,
            101 => Self::RegisterResponse,
            102 => Self::LoginRequest,
            103 => Self::LoginResponse,
            104 => Self::TokenValidationRequest,
            105 => Self::TokenValidationResponse,
            110 => Self::GameAuthRequest,
            111 => Self::GameAuthResponse,
            200 => Self::PlayerInput,
            201 => Self::PlayerInputBatch,
            202 => Self::PlayerState,
            203 => Self::WorldSnapshot,
            300 => Self::ChatMessage,
            _ => Self::Unknown,
        }
    }
}

/// Outcome of the game-join handshake.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum GameAuthResult {
    Success = 0,
    InvalidToken = 1,
    TokenExpired = 2,
    AlreadyConnected = 3,
    ServerFull = 4,
    VersionMismatch = 5,
    Banned = 6,
    InternalError = 99,
}

impl GameAuthResult {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Success,
            1 => Self::InvalidToken,
            2 => Self::TokenExpired,
            3 => Self::AlreadyConnected,
            4 => Self::ServerFull,
            5 => Self::VersionMismatch,
            6 => Self::Banned,
            99 => Self::InternalError,
            _ => return None,
        })
    }
}

impl Encode for GameAuthResult {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        (*self as u8).encode(w)
    }
}

impl Decode<'_> for GameAuthResult {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let raw = u8::decode(r)?;
        match Self::from_raw(raw) {
            Some(v) => Ok(v),
            None => bail!("unknown game auth result {raw}"),
        }
    }
}

/// Outcome of account registration.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum RegisterResult {
    Success = 0,
    UsernameTaken = 1,
    EmailTaken = 2,
    PasswordMismatch = 3,
    PasswordTooShort = 4,
    InvalidUsername = 5,
    InternalError = 99,
}

impl RegisterResult {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Success,
            1 => Self::UsernameTaken,
            2 => Self::EmailTaken,
            3 => Self::PasswordMismatch,
            4 => Self::PasswordTooShort,
            5 => Self::InvalidUsername,
            99 => Self::InternalError,
            _ => return None,
        })
    }
}

impl Encode for RegisterResult {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        (*self as u8).encode(w)
    }
}

impl Decode<'_> for RegisterResult {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let raw = u8::decode(r)?;
        match Self::from_raw(raw) {
            Some(v) => Ok(v),
            None => bail!("unknown register result {raw}"),
        }
    }
}

/// Outcome of a credentials login.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum LoginResult {
    Success = 0,
    InvalidCredentials = 1,
    RateLimited = 2,
    InternalError = 99,
}

impl LoginResult {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Success,
            1 => Self::InvalidCredentials,
            2 => Self::RateLimited,
            99 => Self::InternalError,
            _ => return None,
        })
    }
}

impl Encode for LoginResult {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        (*self as u8).encode(w)
    }
}

impl Decode<'_> for LoginResult {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let raw = u8::decode(r)?;
        match Self::from_raw(raw) {
            Some(v) => Ok(v),
            None => bail!("unknown login result {raw}"),
        }
    }
}

macro_rules! message {
    ($ty:ident, $kind:ident) => {
        impl Message for $ty {
            const KIND: MessageKind = MessageKind::$kind;
            const NAME: &'static str = stringify!($ty);
        }
    };
}

/// Liveness probe. Carried as the payload of a `Ping` packet on the
/// unreliable channel.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Ping {
    /// Sender's clock in milliseconds; echoed verbatim in the pong.
    pub client_time_ms: u64,
}

message!(Ping, Ping);

impl Encode for Ping {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.client_time_ms.encode(w)
    }
}

impl Decode<'_> for Ping {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            client_time_ms: u64::decode(r)?,
        })
    }
}

/// Echo of a [`Ping`], plus the server tick for clock synchronization.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Pong {
    pub client_time_ms: u64,
    pub server_tick: u32,
}

message!(Pong, Pong);

impl Encode for Pong {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.client_time_ms.encode(&mut w)?;
        self.server_tick.encode(w)
    }
}

impl Decode<'_> for Pong {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            client_time_ms: u64::decode(r)?,
            server_tick: u32::decode(r)?,
        })
    }
}

/// Connection teardown notice. Carried as the payload of a `Disconnect`
/// packet in either direction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Disconnect {
    pub reason: String,
}

message!(Disconnect, Disconnect);

impl Encode for Disconnect {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.reason.encode(w)
    }
}

impl Decode<'_> for Disconnect {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            reason: String::decode(r)?,
        })
    }
}

/// Payload of a `Handshake` packet: the transport admission request.
///
/// Not a `Data` message; it exists before a peer does.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Handshake {
    pub protocol_version: u16,
    pub connection_key: String,
}

impl Encode for Handshake {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.protocol_version.encode(&mut w)?;
        self.connection_key.encode(w)
    }
}

impl Decode<'_> for Handshake {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            protocol_version: u16::decode(r)?,
            connection_key: String::decode(r)?,
        })
    }
}

/// Account creation request.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub confirm: String,
}

message!(RegisterRequest, RegisterRequest);

impl Encode for RegisterRequest {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.username.encode(&mut w)?;
        self.email.encode(&mut w)?;
        self.password.encode(&mut w)?;
        self.confirm.encode(w)
    }
}

impl Decode<'_> for RegisterRequest {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            username: String::decode(r)?,
            email: String::decode(r)?,
            password: String::decode(r)?,
            confirm: String::decode(r)?,
        })
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct RegisterResponse {
    pub result: RegisterResult,
    pub user_id: Option<Uuid>,
    pub username: String,
}

message!(RegisterResponse, RegisterResponse);

impl Encode for RegisterResponse {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.result.encode(&mut w)?;
        self.user_id.encode(&mut w)?;
        self.username.encode(w)
    }
}

impl Decode<'_> for RegisterResponse {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            result: RegisterResult::decode(r)?,
            user_id: Option::<Uuid>::decode(r)?,
            username: String::decode(r)?,
        })
    }
}

/// Credentials login. The identifier is a username, or an email when it
/// contains `@`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LoginRequest {
    pub identifier: String,
    pub password: String,
}

message!(LoginRequest, LoginRequest);

impl Encode for LoginRequest {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.identifier.encode(&mut w)?;
        self.password.encode(w)
    }
}

impl Decode<'_> for LoginRequest {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            identifier: String::decode(r)?,
            password: String::decode(r)?,
        })
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct LoginResponse {
    pub result: LoginResult,
    /// Signed bearer token; empty unless `result` is `Success`.
    pub token: String,
    /// Unix seconds at which the token expires; zero unless successful.
    pub expires_at: u64,
    /// Seconds until another attempt is allowed; zero unless rate
    /// limited.
    pub retry_after_secs: u32,
}

message!(LoginResponse, LoginResponse);

impl Encode for LoginResponse {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.result.encode(&mut w)?;
        self.token.encode(&mut w)?;
        self.expires_at.encode(&mut w)?;
        self.retry_after_secs.encode(w)
    }
}

impl Decode<'_> for LoginResponse {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            result: LoginResult::decode(r)?,
            token: String::decode(r)?,
            expires_at: u64::decode(r)?,
            retry_after_secs: u32::decode(r)?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TokenValidationRequest {
    pub token: String,
}

message!(TokenValidationRequest, TokenValidationRequest);

impl Encode for TokenValidationRequest {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.token.encode(w)
    }
}

impl Decode<'_> for TokenValidationRequest {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            token: String::decode(r)?,
        })
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct TokenValidationResponse {
    pub valid: bool,
    pub user_id: Option<Uuid>,
    pub username: String,
    pub expires_at: u64,
    /// Human-readable failure kind; empty when valid.
    pub error: String,
}

message!(TokenValidationResponse, TokenValidationResponse);

impl Encode for TokenValidationResponse {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.valid.encode(&mut w)?;
        self.user_id.encode(&mut w)?;
        self.username.encode(&mut w)?;
        self.expires_at.encode(&mut w)?;
        self.error.encode(w)
    }
}

impl Decode<'_> for TokenValidationResponse {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            valid: bool::decode(r)?,
            user_id: Option::<Uuid>::decode(r)?,
            username: String::decode(r)?,
            expires_at: u64::decode(r)?,
            error: String::decode(r)?,
        })
    }
}

/// Game-join request presenting a token issued by the auth service.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct GameAuthRequest {
    pub token: String,
    pub client_version: String,
}

message!(GameAuthRequest, GameAuthRequest);

impl Encode for GameAuthRequest {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.token.encode(&mut w)?;
        self.client_version.encode(w)
    }
}

impl Decode<'_> for GameAuthRequest {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            token: String::decode(r)?,
            client_version: String::decode(r)?,
        })
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct GameAuthResponse {
    pub result: GameAuthResult,
    pub user_id: Option<Uuid>,
    pub username: String,
    /// The server's current tick, for initial clock alignment.
    pub server_tick: u32,
    /// How often the server expects the client to ping, in seconds.
    pub ping_interval_secs: u32,
}

message!(GameAuthResponse, GameAuthResponse);

impl GameAuthResponse {
    /// A failure response carrying only the result code.
    pub fn failure(result: GameAuthResult) -> Self {
        Self {
            result,
            user_id: None,
            username: String::new(),
            server_tick: 0,
            ping_interval_secs: 0,
        }
    }
}

impl Encode for GameAuthResponse {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.result.encode(&mut w)?;
        self.user_id.encode(&mut w)?;
        self.username.encode(&mut w)?;
        self.server_tick.encode(&mut w)?;
        self.ping_interval_secs.encode(w)
    }
}

impl Decode<'_> for GameAuthResponse {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            result: GameAuthResult::decode(r)?,
            user_id: Option::<Uuid>::decode(r)?,
            username: String::decode(r)?,
            server_tick: u32::decode(r)?,
            ping_interval_secs: u32::decode(r)?,
        })
    }
}

/// A single movement input.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct PlayerInput {
    pub input: InputData,
}

message!(PlayerInput, PlayerInput);

impl Encode for PlayerInput {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.input.encode(w)
    }
}

impl Decode<'_> for PlayerInput {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            input: InputData::decode(r)?,
        })
    }
}

/// A burst of inputs, e.g. after a send hiccup. The server applies them
/// in ascending sequence order and acknowledges the last applied one.
#[derive(Clone, PartialEq, Debug)]
pub struct PlayerInputBatch {
    pub inputs: Vec<InputData>,
}

message!(PlayerInputBatch, PlayerInputBatch);

impl Encode for PlayerInputBatch {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.inputs.encode(w)
    }
}

impl Decode<'_> for PlayerInputBatch {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            inputs: Vec::<InputData>::decode(r)?,
        })
    }
}

/// Authoritative per-peer state, sent reliably so the client can prune
/// its pending inputs against `snapshot.last_processed_input`.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct PlayerState {
    pub snapshot: StateSnapshot,
}

message!(PlayerState, PlayerState);

impl Encode for PlayerState {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.snapshot.encode(w)
    }
}

impl Decode<'_> for PlayerState {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            snapshot: StateSnapshot::decode(r)?,
        })
    }
}

/// One player's entry in a world broadcast.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct WorldPlayer {
    pub user_id: Uuid,
    pub snapshot: StateSnapshot,
}

impl Encode for WorldPlayer {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.user_id.encode(&mut w)?;
        self.snapshot.encode(w)
    }
}

impl Decode<'_> for WorldPlayer {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            user_id: Uuid::decode(r)?,
            snapshot: StateSnapshot::decode(r)?,
        })
    }
}

/// Transient world state, broadcast on the unreliable channel to every
/// in-game peer.
#[derive(Clone, PartialEq, Debug)]
pub struct WorldSnapshot {
    pub tick: u32,
    pub players: Vec<WorldPlayer>,
}

message!(WorldSnapshot, WorldSnapshot);

impl Encode for WorldSnapshot {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.tick.encode(&mut w)?;
        self.players.encode(w)
    }
}

impl Decode<'_> for WorldSnapshot {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            tick: u32::decode(r)?,
            players: Vec::<WorldPlayer>::decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use glam::{Vec2, Vec3};

    use super::*;
    use crate::{decode_message, encode_message, InputFlags, StateFlags};

    #[test]
    fn kind_ranges_are_stable() {
        assert_eq!(MessageKind::RegisterRequest as u16, 100);
        assert_eq!(MessageKind::PlayerInput as u16, 200);
        assert_eq!(MessageKind::WorldSnapshot as u16, 203);
        assert_eq!(MessageKind::ChatMessage as u16, 300);
        assert_eq!(MessageKind::from_raw(7777), MessageKind::Unknown);
    }

    #[test]
    fn auth_round_trips() {
        let req = GameAuthRequest {
            token: "header.claims.sig".to_owned(),
            client_version: "1.4.2".to_owned(),
        };
        let bytes = encode_message(&req).unwrap();
        assert_eq!(decode_message::<GameAuthRequest>(&bytes).unwrap(), req);

        let resp = GameAuthResponse {
            result: GameAuthResult::Success,
            user_id: Some(Uuid::new_v4()),
            username: "alice".to_owned(),
            server_tick: 900,
            ping_interval_secs: 1,
        };
        let bytes = encode_message(&resp).unwrap();
        assert_eq!(decode_message::<GameAuthResponse>(&bytes).unwrap(), resp);
    }

    #[test]
    fn login_round_trips() {
        let resp = LoginResponse {
            result: LoginResult::RateLimited,
            token: String::new(),
            expires_at: 0,
            retry_after_secs: 57,
        };

        let bytes = encode_message(&resp).unwrap();
        assert_eq!(decode_message::<LoginResponse>(&bytes).unwrap(), resp);
    }

    #[test]
    fn input_batch_round_trips() {
        let batch = PlayerInputBatch {
            inputs: (1..=4)
                .map(|seq| InputData {
                    tick: seq,
                    sequence: seq,
                    move_dir: Vec2::new(0.0, 1.0),
                    rotation: 0.0,
                    flags: InputFlags::new().with_sprint(seq % 2 == 0),
                })
                .collect(),
        };

        let bytes = encode_message(&batch).unwrap();
        assert_eq!(decode_message::<PlayerInputBatch>(&bytes).unwrap(), batch);
    }

    #[test]
    fn world_snapshot_round_trips() {
        let world = WorldSnapshot {
            tick: 1234,
            players: vec![WorldPlayer {
                user_id: Uuid::new_v4(),
                snapshot: StateSnapshot {
                    tick: 1234,
                    last_processed_input: 55,
                    position: Vec3::new(1.0, 0.0, -3.0),
                    velocity: Vec3::ZERO,
                    rotation: 0.7,
                    flags: StateFlags::new().with_grounded(true),
                },
            }],
        };

        let bytes = encode_message(&world).unwrap();
        assert_eq!(decode_message::<WorldSnapshot>(&bytes).unwrap(), world);
    }

    #[test]
    fn trailing_bytes_fail_decode() {
        let req = TokenValidationRequest {
            token: "t".to_owned(),
        };

        let mut bytes = encode_message(&req).unwrap();
        bytes.push(0);

        assert!(decode_message::<TokenValidationRequest>(&bytes).is_err());
    }
}
