use ralph_command_center::automation;
use ralph_command_center::config::ServerConfig;
use ralph_command_center::control::ControlPlane;
use ralph_command_center::errors::AppResult;
use ralph_command_center::server;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> AppResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();
    let plane = ControlPlane::new(&config)?;

    automation::start(&plane);

    let router = server::build_router(plane.clone());
    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    tracing::info!(
        addr = %config.bind_address(),
        db = %config.db_path.display(),
        max_concurrent = config.max_concurrent,
        "ralphd listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(plane.clone()))
        .await?;

    Ok(())
}

async fn shutdown_signal(plane: Arc<ControlPlane>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested; cancelling running loops");
    plane.shutdown();
}
