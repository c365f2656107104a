mod failover;
mod handlers;
mod state;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::state::{AppState, MasterConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mr_master=debug,mr_common=info,tower_http=info,axum=info")),
        )
        .init();

    let config = MasterConfig::from_env();
    std::fs::create_dir_all(&config.work_dir)?;
    info!(
        "directorio de trabajo {} (sweep cada {:?}, worker muerto tras {:?})",
        config.work_dir.display(),
        config.sweep_interval,
        config.worker_dead_timeout
    );

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config);

    // router HTTP
    let app = handlers::build_router(state.clone());

    // failover y timeouts en segundo plano
    let failover_state = state.clone();
    tokio::spawn(async move {
        failover::run_failover_loop(failover_state).await;
    });

    let listener = TcpListener::bind(&bind_addr).await?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
