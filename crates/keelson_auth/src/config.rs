//! Auth service configuration.

use anyhow::ensure;
use clap::Parser;

/// Options for `keelson-authserver`, from flags or environment.
#[derive(Parser, Clone, Debug)]
#[command(name = "keelson-authserver", version, about)]
pub struct AuthConfig {
    /// UDP port to listen on.
    #[arg(long, env = "KEELSON_AUTH_PORT", default_value_t = 2106)]
    pub port: u16,

    /// Maximum simultaneous clients.
    #[arg(long, env = "KEELSON_MAX_CLIENTS", default_value_t = 1000)]
    pub max_clients: usize,

    /// Drain-loop rate in Hz.
    #[arg(long, env = "KEELSON_AUTH_TICK_RATE", default_value_t = 10)]
    pub tick_rate: u32,

    /// Preshared transport admission key.
    #[arg(long, env = "KEELSON_CONNECTION_KEY", default_value = "")]
    pub connection_key: String,

    /// Token signing secret; at least 32 bytes.
    #[arg(long, env = "KEELSON_JWT_SECRET")]
    pub jwt_secret: String,

    #[arg(long, env = "KEELSON_JWT_ISSUER", default_value = "keelson-auth")]
    pub jwt_issuer: String,

    #[arg(long, env = "KEELSON_JWT_AUDIENCE", default_value = "keelson-game")]
    pub jwt_audience: String,

    #[arg(long, env = "KEELSON_JWT_EXPIRATION_MINUTES", default_value_t = 60)]
    pub jwt_expiration_minutes: u64,

    #[arg(long, env = "KEELSON_RATE_LIMIT_WINDOW_MINUTES", default_value_t = 15)]
    pub rate_limit_window_minutes: u64,

    #[arg(long, env = "KEELSON_RATE_LIMIT_MAX_ATTEMPTS", default_value_t = 5)]
    pub rate_limit_max_attempts: u32,

    /// Connection string for an external account repository. This build
    /// bundles only the in-memory repository; deployments with a
    /// database link their own implementation.
    #[arg(long, env = "KEELSON_DATABASE_CONNECTION")]
    pub database_connection: Option<String>,
}

impl AuthConfig {
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
        ensure!(
            self.jwt_expiration_minutes > 0,
            "jwt-expiration-minutes must be positive"
        );
        ensure!(
            self.rate_limit_window_minutes > 0,
            "rate-limit-window-minutes must be positive"
        );
        ensure!(
            self.rate_limit_max_attempts > 0,
            "rate-limit-max-attempts must be positive"
        );
        ensure!(self.max_clients > 0, "max-clients must be positive");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> AuthConfig {
        AuthConfig::parse_from([
            "keelson-authserver",
            "--jwt-secret",
            "0123456789abcdef0123456789abcdef",
        ])
    }

    #[test]
    fn defaults_validate() {
        let config = base();
        assert_eq!(config.port, 2106);
        assert_eq!(config.tick_rate, 10);
        config.validate().unwrap();
    }

    #[test]
    fn short_secret_fails_closed() {
        let mut config = base();
        config.jwt_secret = "too-short".to_owned();
        assert!(config.validate().is_err());
    }

    #[test]
    fn out_of_range_tick_rate_fails_closed() {
        let mut config = base();
        config.tick_rate = 9;
        assert!(config.validate().is_err());

        config.tick_rate = 129;
        assert!(config.validate().is_err());
    }
}
