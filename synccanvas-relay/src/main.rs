//! SyncCanvas relay: hosts document topics for remote collaboration
//! sessions.
//!
//! ```text
//! RUST_LOG=info SYNCCANVAS_RELAY_BIND_ADDR=0.0.0.0:9090 synccanvas-relay
//! ```

mod config;

use std::process::ExitCode;
use synccanvas_collab::RelayServer;

#[tokio::main]
async fn main() -> ExitCode {
    config::load_env_file();
    env_logger::init();

    let config = match config::load() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    log::info!(
        "Starting SyncCanvas relay (max {} subscribers/topic, buffer {})",
        config.max_subscribers_per_topic,
        config.broadcast_capacity
    );

    let server = RelayServer::new(config);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Relay stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            log::info!(
                "Shutting down ({} connections served, {} messages)",
                stats.total_connections,
                stats.total_messages
            );
        }
    }
    ExitCode::SUCCESS
}
