//! `escrowlined`: HTTP server plus the periodic auto-release task.

use std::sync::Arc;

use escrowline_api::config::LoggingConfig;
use escrowline_api::{AppState, ServerConfig, StaticSessions, create_router};
use escrowline_settlement::{AutoReleaseScheduler, SettlementEngine};
use escrowline_types::constants;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::load()?;
    init_logging(&config.logging);

    let engine = Arc::new(SettlementEngine::builder(config.engine.clone()).build()?);
    let sessions = StaticSessions::new(&config.sessions);
    if sessions.is_empty() {
        warn!("No sessions configured; every authenticated route will answer 401");
    }

    let scheduler = AutoReleaseScheduler::spawn(engine.clone(), config.engine.auto_release_interval());
    let app = create_router(AppState::new(engine, Arc::new(sessions)));

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!(
        addr = %config.listen_addr,
        version = constants::VERSION,
        "{} listening",
        constants::ENGINE_NAME
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}
