use std::net::SocketAddr;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wait0::app;
use wait0::config::{Config, LoggingConfig};

#[tokio::main]
async fn main() {
    let config = match load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config.logging);

    info!("starting wait0 v{}", env!("CARGO_PKG_VERSION"));

    let (router, handles) = match app::build(config.clone()).await {
        Ok(built) => built,
        Err(e) => {
            error!(error = %e, "failed to build cache engine");
            std::process::exit(1);
        }
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind listener");
            std::process::exit(1);
        }
    };

    info!(%addr, "listening");

    if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await {
        error!(error = %e, "server error");
    }

    handles.shutdown().await;
    info!("shutdown complete");
}

fn load_config() -> Result<Config, wait0::error::Error> {
    let config_path = std::env::var("WAIT0_CONFIG").unwrap_or_else(|_| "./config/wait0.yaml".to_string());

    if std::path::Path::new(&config_path).exists() {
        info!(path = %config_path, "loading configuration");
        Config::load(&config_path)
    } else {
        info!("no config file found at {config_path}, using default configuration");
        Ok(Config::default())
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json_format {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, starting graceful shutdown");
}
