use std::net::SocketAddr;
use std::sync::Arc;

use orchestrator::config::Config;
use orchestrator::events::EventListener;
use orchestrator::{api, persistence, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    let addr = config.http_addr;
    let snapshot_path = config.snapshot_path.clone();
    let state = AppState::from_config(config)?;

    match persistence::load(&snapshot_path) {
        Ok(Some(snapshot)) => {
            tracing::info!(
                jobs = snapshot.jobs.len(),
                machines = snapshot.machines.len(),
                "restored snapshot"
            );
            persistence::restore(&state, snapshot);
        }
        Ok(None) => tracing::info!("no snapshot found, starting fresh"),
        Err(e) => tracing::warn!(error = %e, "snapshot restore failed, starting fresh"),
    }
    persistence::spawn_snapshot_task(state.clone(), snapshot_path);

    let listener = Arc::new(EventListener::new(state.clone()));
    listener.start();

    let app = api::router(state);
    let tcp = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %tcp.local_addr()?, "orchestrator listening");
    axum::serve(
        tcp,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
