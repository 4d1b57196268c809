//! NoChat Keycore - Key lifecycle and session consistency engine
//!
//! Client-side key management for NoChat's Signal-style end-to-end
//! encryption: identity, prekey and sender key lifecycles, pairwise
//! sessions, self-healing against the key server, and the background
//! maintenance that keeps all of it fresh.
//!
//! Everything runs on tokio. Keys persist through a [`KeyStore`]
//! (SQLite via sqlx in production) and reach the server through
//! [`KeyServer`] (reqwest in production).

pub mod api;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod models;
pub mod store;

use std::sync::Arc;

use anyhow::Context;

pub use api::{ApiClient, KeyServer};
pub use config::EngineConfig;
pub use engine::CryptoService;
pub use error::{EngineError, EngineResult};
pub use models::ProtocolAddress;
pub use store::{KeyStore, MemoryKeyStore, SqliteKeyStore, StoreName};

/// Install the global tracing subscriber
///
/// Reads `RUST_LOG`; defaults to `nochat_keycore=info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nochat_keycore=info".into()),
        )
        .init();
}

/// Run the engine for one device until Ctrl-C
///
/// The device comes from `NOCHAT_USER_ID`, `NOCHAT_DEVICE_ID` (default 1)
/// and `NOCHAT_TOKEN`; everything else from [`EngineConfig::from_env`].
pub async fn run() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!("Starting NoChat key engine");

    let config = EngineConfig::from_env()?;
    let user_id = std::env::var("NOCHAT_USER_ID").context("NOCHAT_USER_ID is not set")?;
    let device_id = match std::env::var("NOCHAT_DEVICE_ID") {
        Ok(value) => value
            .parse::<u32>()
            .with_context(|| format!("Invalid NOCHAT_DEVICE_ID: {}", value))?,
        Err(_) => 1,
    };
    let token = std::env::var("NOCHAT_TOKEN").context("NOCHAT_TOKEN is not set")?;

    tracing::info!("Database path: {}", config.db_path);
    let store = Arc::new(
        SqliteKeyStore::open(&config.db_path)
            .await
            .context("Failed to open key store")?,
    );
    let server = Arc::new(ApiClient::new(&config, &token)?);
    let service = CryptoService::new(config, store, server)?;

    let report = service.on_login(&user_id, device_id).await?;
    if let Some(verification) = &report.verification {
        tracing::info!(
            valid = verification.is_valid,
            reason = %verification.reason,
            "Initial key verification"
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");
    service.on_logout().await;
    Ok(())
}
