use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use atelier_core::agent::ModelClient;
use atelier_core::flags::BIND_ADDR;
use atelier_core::flags::DATABASE_URL;
use atelier_core::sandbox::SandboxManager;

use atelier_server::AppState;
use atelier_server::Store;
use atelier_server::routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let store = Store::open(*DATABASE_URL)?;
    let sandboxes = Arc::new(SandboxManager::from_flags());
    let model = ModelClient::from_flags();
    let state = AppState::new(store, Arc::clone(&sandboxes), model);

    let app = routes::router(state);
    let listener = TcpListener::bind(*BIND_ADDR).await?;
    info!("listening on {}", *BIND_ADDR);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Sandboxes do not outlive the process.
    let destroyed = sandboxes.destroy_all().await;
    info!(destroyed, "cleaned up sandboxes");

    Ok(())
}
