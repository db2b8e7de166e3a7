//! `betterish-store`: serves task documents to Betterish clients.
//!
//! ```bash
//! cargo run --bin betterish-store -- --listen 127.0.0.1:9400
//! ```
//!
//! Runs until Ctrl-C. See [`betterish_store::config`] for the settings file.

use std::process::ExitCode;
use std::sync::Arc;

use betterish_store::config::{Settings, StoreArgs};
use betterish_store::server::{self, ServerState};
use betterish_store::store::DocumentDb;
use clap::Parser;

#[tokio::main]
async fn main() -> ExitCode {
    let args = StoreArgs::parse();
    let settings = match Settings::from_args(&args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("betterish-store: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&settings.log_level);

    let db = DocumentDb::with_max_documents(settings.limits.documents);
    let state = Arc::new(ServerState::with_config(settings.limits.frame_bytes, db));

    let (addr, mut serving) = match server::start_server_with_state(&settings.listen, state).await {
        Ok(started) => started,
        Err(e) => {
            tracing::error!(listen = %settings.listen, error = %e, "cannot listen");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        %addr,
        frame_bytes = settings.limits.frame_bytes,
        documents = settings.limits.documents,
        "store ready"
    );

    tokio::select! {
        finished = &mut serving => {
            if let Err(e) = finished {
                tracing::error!(error = %e, "server task ended abnormally");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            serving.abort();
        }
    }
    ExitCode::SUCCESS
}

/// `RUST_LOG` wins over `--log-level` when set.
fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
