use std::sync::Arc;

use anyhow::{Context, Result};
use roster_core::{OnnxEncoder, SystemClock};
use roster_store::{EmbeddingCipher, Store};
use rosterd::config::Config;
use rosterd::engine::spawn_engine;
use rosterd::state::AppState;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rosterd starting");

    let config = Config::from_env();
    tracing::debug!(?config, "configuration loaded");

    // Fail fast on missing models rather than on the first upload.
    let encoder = OnnxEncoder::from_model_dir(&config.model_dir)
        .with_context(|| format!("failed to load models from {}", config.model_dir.display()))?;
    let engine = spawn_engine(encoder, config.encode_timeout())?;

    let cipher = config
        .embedding_key
        .as_deref()
        .map(EmbeddingCipher::from_passphrase)
        .transpose()?;
    let store = Store::open(&config.db_path, cipher)
        .with_context(|| format!("failed to open registry at {}", config.db_path.display()))?;
    let registered = store.count_users()?;
    tracing::info!(
        path = %config.db_path.display(),
        users = registered,
        encrypted = store.is_encrypted(),
        "registry opened"
    );

    if config.api_token.is_none() {
        tracing::warn!("ROSTER_API_TOKEN not set, API is unauthenticated");
    }
    tracing::info!(
        tolerance = config.tolerance,
        cosine_floor = roster_core::cosine_equivalent(config.tolerance),
        policy = %config.match_policy,
        "matching on unit-length embeddings"
    );
    if config.kiosk_mode {
        tracing::info!("kiosk mode: /mark-attendance accepts unauthenticated requests");
    }

    let bind_addr = config.bind_addr;
    let state = AppState::new(config, store, engine, Arc::new(SystemClock));
    let app = rosterd::app(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "rosterd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("rosterd shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
