//! termgate-server: browser terminal bridge.
//!
//! Accepts WebSocket connections from browser terminals, opens SSH shells on
//! configured network appliances, and keeps those shells alive across client
//! reconnects.

mod config;
mod device;
mod gateway;
mod server;
mod session;
mod shell;
mod store;
#[cfg(test)]
mod testing;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::TermgateServer;
use std::path::PathBuf;
use tracing::{error, info};

/// termgate-server: browser terminal bridge
#[derive(Parser, Debug)]
#[command(name = "termgate-server", version, about = "Browser terminal bridge")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.termgate/config.toml")]
    config: String,

    /// SQLite session store path (in-memory if unset)
    #[arg(long)]
    store: Option<String>,

    /// Idle timeout in seconds (detached sessions)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting termgate-server");

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        CliOverrides {
            port: cli.port,
            bind: cli.bind,
            store: cli.store,
            idle_timeout: cli.idle_timeout,
        },
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = match TermgateServer::new(server_config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                server.shutdown().await;
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.shutdown().await;
    info!("termgate-server stopped");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
