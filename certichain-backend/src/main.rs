//! certichain-backend
//!
//! HTTP service for CertiChain groups, claims, minting and verification.

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use certichain_backend::{config::BackendConfig, serve};

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            eprintln!("ignoring unreadable .env file: {err}");
        }
    }

    let config = BackendConfig::from_env()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "certichain_backend=info,tower_http=info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(config.log_json.then(|| fmt::layer().json()))
        .with((!config.log_json).then(fmt::layer))
        .init();

    tracing::debug!(?config, "loaded configuration");
    serve(config).await
}
