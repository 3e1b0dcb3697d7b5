//! Notification Hub - Entry Point
//!
//! Loads configuration, starts the Hub actor, and accepts WebSocket
//! connections until interrupted.

use std::env;
use std::path::PathBuf;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mailhub_notify::{handle_connection, Config, Hub, LoggingConfig};

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG takes precedence over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mailhub_notify={}", logging.level)));

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Config path from command line or MAILHUB_CONFIG, else defaults + env
    let config = match env::args()
        .nth(1)
        .or_else(|| env::var("MAILHUB_CONFIG").ok())
    {
        Some(path) => Config::load_with_env(&PathBuf::from(path))?,
        None => Config::from_env()?,
    };

    init_tracing(&config.logging);

    let addr = config.server.bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("Notification hub listening on {}", addr);

    let (hub, hub_task) = Hub::spawn(&config.hub);

    // Connection accept loop
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("New connection from {}", addr);
                    let hub = hub.clone();
                    let hub_config = config.hub.clone();

                    // Spawn handler task for each connection
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, hub, hub_config).await {
                            warn!("Connection handler error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    if hub.stop().await.is_err() {
        warn!("Hub already stopped");
    }
    hub_task.await?;

    info!("Notification hub stopped");
    Ok(())
}
