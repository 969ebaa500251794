use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use keelson_auth::{
    AccountPolicy, AuthConfig, AuthEndpoints, AuthService, MemoryRepository, TokenAuthority,
};
use keelson_protocol::PacketPool;
use keelson_transport::{ServerTransport, TransportConfig};
use tokio::runtime::Handle;
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::INFO)
        .init();

    let config = AuthConfig::parse();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AuthConfig) -> anyhow::Result<()> {
    config.validate()?;

    let repository = match &config.database_connection {
        Some(_) => {
            // The repository trait is the deployment seam; this build
            // links no database backend.
            bail!(
                "no external repository backend is linked into this build; \
                 drop --database-connection or deploy a build that bundles one"
            );
        }
        None => {
            warn!("no database-connection configured; accounts are in-memory and volatile");
            Arc::new(MemoryRepository::new())
        }
    };

    let tokens = TokenAuthority::new(
        config.jwt_secret.clone().into_bytes(),
        config.jwt_issuer.clone(),
        config.jwt_audience.clone(),
        Duration::from_secs(config.jwt_expiration_minutes * 60),
    );

    let policy = AccountPolicy {
        min_password_len: 8,
        rate_limit_window: Duration::from_secs(config.rate_limit_window_minutes * 60),
        rate_limit_max_attempts: config.rate_limit_max_attempts,
    };

    let endpoints = Arc::new(AuthEndpoints::new(repository, tokens, policy));

    let pool = Arc::new(PacketPool::new());
    let transport = ServerTransport::bind(
        TransportConfig {
            port: config.port,
            max_peers: config.max_clients,
            connection_key: config.connection_key.clone(),
            tokio_handle: Some(Handle::current()),
            ..TransportConfig::default()
        },
        Arc::clone(&pool),
    )?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let service = AuthService::new(transport, pool, endpoints, config.tick_rate);
    service.run(shutdown_rx).await
}
