//! Zeoxy Proxy Server - Entry Point
//!
//! Binds the proxy listener and drains it on Ctrl+C or SIGTERM.

use std::process::ExitCode;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zeoxy::config::{Config, LogConfig, LogFormat};
use zeoxy::proxy::ProxyListener;

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine; the environment may be set directly.
    dotenvy::dotenv().ok();

    let config = Config::from_env();
    match &config {
        Ok(config) => init_tracing(&config.log),
        Err(_) => init_tracing(&LogConfig::default()),
    }

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to start proxy server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut listener = ProxyListener::new(config.proxy);
    if let Err(e) = listener.bind().await {
        error!("Failed to start proxy server: {}", e);
        return ExitCode::FAILURE;
    }

    let handle = listener.shutdown_handle();
    let mut server = tokio::spawn(listener.run());

    tokio::select! {
        _ = shutdown_signal() => {}
        joined = &mut server => {
            error!("Proxy server stopped unexpectedly: {:?}", joined);
            return ExitCode::FAILURE;
        }
    }

    info!("SIGINT signal received. Closing the server.");
    if let Err(e) = handle.shutdown() {
        error!("Error closing server: {}", e);
        return ExitCode::FAILURE;
    }

    match server.await {
        Ok(Ok(())) => {
            info!("Closed the server.");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!("Error closing server: {}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Error closing server: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("zeoxy={}", config.level).into());
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
