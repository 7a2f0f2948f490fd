use std::sync::Arc;

use mcp_protocol_engine::{
    build_app,
    catalog::{builtin::register_builtin, Catalog},
    config::Config,
    logging, AppState,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    logging::init_logging(&config.log_directive);

    let catalog = Arc::new(Catalog::new());
    register_builtin(&catalog);

    let bind_socket = config.bind_socket()?;
    let state = AppState::new(catalog, &config).await?;
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(bind_socket).await?;

    info!(
        bind_addr = %config.bind_addr,
        bind_port = config.bind_port,
        page_size = ?config.page_size,
        "server starting"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }
}
