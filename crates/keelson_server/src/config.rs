//! Game service configuration.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{ensure, Context};
use clap::Parser;
use keelson_protocol::MovementSettings;

/// A dotted client version, compared as a tuple.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct ClientVersion(pub u32, pub u32, pub u32);

impl FromStr for ClientVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let mut parts = s.split('.');

        let mut next = |name| {
            parts
                .next()
                .with_context(|| format!("version is missing its {name} component"))?
                .parse::<u32>()
                .with_context(|| format!("version has a non-numeric {name} component"))
        };

        let version = Self(next("major")?, next("minor")?, next("patch")?);
        ensure!(parts.next().is_none(), "version has trailing components");
        Ok(version)
    }
}

impl std::fmt::Display for ClientVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// Options for `keelson-gameserver`, from flags or environment.
#[derive(Parser, Clone, Debug)]
#[command(name = "keelson-gameserver", version, about)]
pub struct ServerConfig {
    /// UDP port to listen on.
    #[arg(long, env = "KEELSON_GAME_PORT", default_value_t = 7777)]
    pub port: u16,

    /// Registry capacity.
    #[arg(long, env = "KEELSON_MAX_PLAYERS", default_value_t = 100)]
    pub max_players: usize,

    /// Simulation rate in Hz.
    #[arg(long, env = "KEELSON_GAME_TICK_RATE", default_value_t = 30)]
    pub tick_rate: u32,

    /// Preshared transport admission key.
    #[arg(long, env = "KEELSON_CONNECTION_KEY", default_value = "")]
    pub connection_key: String,

    /// Token verification secret; must match the auth service.
    #[arg(long, env = "KEELSON_JWT_SECRET")]
    pub jwt_secret: String,

    #[arg(long, env = "KEELSON_JWT_ISSUER", default_value = "keelson-auth")]
    pub jwt_issuer: String,

    #[arg(long, env = "KEELSON_JWT_AUDIENCE", default_value = "keelson-game")]
    pub jwt_audience: String,

    /// Seconds of silence before a session is forcibly dropped.
    #[arg(long, env = "KEELSON_DISCONNECT_TIMEOUT_SECONDS", default_value_t = 10)]
    pub disconnect_timeout_seconds: u64,

    /// Seconds an unauthenticated session may linger.
    #[arg(long, env = "KEELSON_AUTH_GRACE_PERIOD_SECONDS", default_value_t = 10)]
    pub auth_grace_period_seconds: u64,

    /// Interval at which clients are expected to ping. Advertised in
    /// the join response.
    #[arg(long, env = "KEELSON_PING_INTERVAL_SECONDS", default_value_t = 1)]
    pub ping_interval_seconds: u64,

    /// Oldest client version admitted to the game.
    #[arg(long, env = "KEELSON_MIN_CLIENT_VERSION", default_value = "1.0.0")]
    pub min_client_version: String,
}

impl ServerConfig {
    /// Fails closed on anything out of range, before a socket is bound.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            (10..=128).contains(&self.tick_rate),
            "tick-rate must be within 10..=128 (got {})",
            self.tick_rate
        );
        ensure!(
            self.jwt_secret.len() >= 32,
            "jwt-secret must be at least 32 bytes (got {})",
            self.jwt_secret.len()
        );
        ensure!(self.max_players > 0, "max-players must be positive");
        ensure!(
            self.disconnect_timeout_seconds > 0,
            "disconnect-timeout-seconds must be positive"
        );
        ensure!(
            self.auth_grace_period_seconds > 0,
            "auth-grace-period-seconds must be positive"
        );
        ensure!(
            self.ping_interval_seconds > 0,
            "ping-interval-seconds must be positive"
        );

        self.min_client_version
            .parse::<ClientVersion>()
            .context("min-client-version is not a dotted version")?;

        Ok(())
    }

    /// The validated runtime configuration.
    pub fn game_config(&self) -> anyhow::Result<GameConfig> {
        self.validate()?;

        Ok(GameConfig {
            tick_rate: self.tick_rate,
            disconnect_timeout: Duration::from_secs(self.disconnect_timeout_seconds),
            auth_grace_period: Duration::from_secs(self.auth_grace_period_seconds),
            ping_interval: Duration::from_secs(self.ping_interval_seconds),
            min_client_version: self.min_client_version.parse()?,
            movement: MovementSettings::default(),
        })
    }
}

/// Runtime simulation settings, decoupled from flag parsing so tests can
/// construct them directly.
#[derive(Clone, Debug)]
pub struct GameConfig {
    pub tick_rate: u32,
    pub disconnect_timeout: Duration,
    pub auth_grace_period: Duration,
    /// Ping cadence clients are told to keep, advertised in the join
    /// response.
    pub ping_interval: Duration,
    pub min_client_version: ClientVersion,
    pub movement: MovementSettings,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            tick_rate: 30,
            disconnect_timeout: Duration::from_secs(10),
            auth_grace_period: Duration::from_secs(10),
            ping_interval: Duration::from_secs(1),
            min_client_version: ClientVersion(1, 0, 0),
            movement: MovementSettings::default(),
        }
    }
}
