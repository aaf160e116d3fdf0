//! Standalone sync server.
//!
//! Configured through `FLOWDRAFT_*` environment variables, optionally
//! loaded from a `.env` file. Log level follows `RUST_LOG` (default `info`).

use std::process::ExitCode;
use std::sync::Arc;

use flowdraft_collab::server::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Bad configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    match &config.storage_path {
        Some(path) => log::info!("Persisting drafts to {}", path.display()),
        None => log::warn!("FLOWDRAFT_STORAGE_PATH not set, drafts live in memory only"),
    }

    let server = match SyncServer::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            log::error!("Failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    let runner = server.clone();
    let result = tokio::select! {
        result = runner.run() => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, shutting down");
            Ok(())
        }
    };

    server.shutdown().await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Server failed: {e}");
            ExitCode::FAILURE
        }
    }
}
