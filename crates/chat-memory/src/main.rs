use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use chat_memory::config::Settings;
use chat_memory::handlers::build_router;
use chat_memory::services::SessionManager;
use chat_memory::state::AppState;
use chat_memory::utils::logger::init_logger;

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_logger()?;

    info!("🚀 Starting chat memory server...");

    let settings = Settings::load()?;
    info!("✅ Configuration loaded");

    let session_manager = Arc::new(SessionManager::from_settings(&settings).await?);
    if session_manager.start_background_persist() {
        info!("✅ Background persistence started");
    }

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    let app = build_router(AppState::new(session_manager.clone()));

    info!("🎯 Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Shutting down, flushing sessions...");
    let report = session_manager.close().await;
    if report.failed > 0 {
        warn!("Shutdown flush incomplete: {}", report);
    } else {
        info!("✅ Shutdown flush done: {}", report);
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
}
