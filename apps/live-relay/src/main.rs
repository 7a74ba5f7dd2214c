use std::net::SocketAddr;
use std::sync::Arc;

use live_relay::auth::authority_from_config;
use live_relay::{build_router, AppState, MemoryStore, Registry, RelayConfig};
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cfg = RelayConfig::from_env();
    let registry = Arc::new(Registry::new(cfg.registry_settings()));
    let state = AppState::new(
        Arc::clone(&registry),
        Arc::new(MemoryStore::new()),
        authority_from_config(&cfg),
    );
    registry.start();

    let app = build_router(state);
    let addr: SocketAddr = cfg.bind_addr.parse()?;
    info!(
        %addr,
        prune_after_secs = cfg.prune_after_secs,
        game_heartbeat_secs = cfg.game_heartbeat_secs,
        "starting live relay"
    );

    let shutdown_registry = Arc::clone(&registry);
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service(),
    )
    .with_graceful_shutdown(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        // Open streams never finish on their own; closing them lets the server drain.
        shutdown_registry.destroy();
    })
    .await?;

    info!("live relay stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
