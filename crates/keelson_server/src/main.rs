use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use keelson_auth::TokenAuthority;
use keelson_protocol::PacketPool;
use keelson_server::{GameServer, ServerConfig};
use keelson_transport::{ServerTransport, TransportConfig};
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::INFO)
        .init();

    let config = ServerConfig::parse();

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: ServerConfig) -> anyhow::Result<()> {
    let game_config = config.game_config()?;

    let tokens = TokenAuthority::verifier(
        config.jwt_secret.clone().into_bytes(),
        config.jwt_issuer.clone(),
        config.jwt_audience.clone(),
    );

    let runtime = tokio::runtime::Runtime::new()?;

    let pool = Arc::new(PacketPool::new());
    let transport = ServerTransport::bind(
        TransportConfig {
            port: config.port,
            max_peers: config.max_players,
            connection_key: config.connection_key.clone(),
            tokio_handle: Some(runtime.handle().clone()),
            ..TransportConfig::default()
        },
        Arc::clone(&pool),
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.store(true, Ordering::Relaxed);
            }
        });
    }

    // The simulation loop owns the main thread; tokio only drives IO.
    let mut server = GameServer::new(game_config, tokens, transport, pool);
    server.run(&shutdown);

    Ok(())
}
