//! CertiChain HTTP service.
//!
//! Instructors create groups, lay out a certificate template, and deploy the
//! group under a join code. Learners claim certificates with that code; each
//! claim is signed by the instructor's sealed wallet, stored, and handed to a
//! [`mint::Minter`] for NFT minting. Anyone can verify a certificate id.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use certichain_common::CertError;
use chrono::Utc;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

pub mod claims;
pub mod config;
pub mod groups;
pub mod mint;
pub mod render;
pub mod store;
pub mod subscription;
pub mod templates;
pub mod vault;
pub mod verify;
pub mod wallets;

use config::{BackendConfig, ServiceConfig};
use mint::{CrossmintMinter, MintDispatch, MintError, MintQueue, MintService, Minter, OfflineMinter};
use render::RenderError;
use store::{Store, StoreConflict, StoreError};
use vault::{KeyVault, VaultError};

pub(crate) const CODE_INTERNAL: &str = "INTERNAL_SERVER_ERROR";
pub(crate) const CODE_STORE_ERROR: &str = "STORE_ERROR";
pub(crate) const CODE_VAULT_ERROR: &str = "VAULT_ERROR";
pub(crate) const CODE_INVALID_INPUT: &str = "INVALID_INPUT";
pub(crate) const CODE_GROUP_NOT_FOUND: &str = "GROUP_NOT_FOUND";
pub(crate) const CODE_GROUP_NOT_ACTIVE: &str = "GROUP_NOT_ACTIVE";
pub(crate) const CODE_GROUP_LOCKED: &str = "GROUP_LOCKED";
pub(crate) const CODE_GROUP_FULL: &str = "GROUP_FULL";
pub(crate) const CODE_GROUP_LIMIT: &str = "GROUP_LIMIT_REACHED";
pub(crate) const CODE_TEMPLATE_NOT_FOUND: &str = "TEMPLATE_NOT_FOUND";
pub(crate) const CODE_CERTIFICATE_NOT_FOUND: &str = "CERTIFICATE_NOT_FOUND";
pub(crate) const CODE_ALREADY_CLAIMED: &str = "ALREADY_CLAIMED";
pub(crate) const CODE_MISSING_FIELDS: &str = "MISSING_FIELDS";
pub(crate) const CODE_UNKNOWN_FIELDS: &str = "UNKNOWN_FIELDS";
pub(crate) const CODE_INVALID_EMAIL: &str = "INVALID_EMAIL";
pub(crate) const CODE_ISSUER_NOT_CONFIGURED: &str = "ISSUER_NOT_CONFIGURED";
pub(crate) const CODE_INSTRUCTOR_NOT_FOUND: &str = "INSTRUCTOR_NOT_FOUND";
pub(crate) const CODE_WALLET_NOT_FOUND: &str = "WALLET_NOT_FOUND";
pub(crate) const CODE_WALLET_REQUIRED: &str = "WALLET_REQUIRED";
pub(crate) const CODE_INVALID_ADDRESS: &str = "INVALID_ADDRESS";
pub(crate) const CODE_INVALID_PACKAGE: &str = "INVALID_PACKAGE";
pub(crate) const CODE_MINT_LIMIT: &str = "MINT_LIMIT_REACHED";
pub(crate) const CODE_ALREADY_MINTED: &str = "ALREADY_MINTED";
pub(crate) const CODE_MINT_IN_PROGRESS: &str = "MINT_IN_PROGRESS";
pub(crate) const CODE_MINTER_ERROR: &str = "MINTER_ERROR";
pub(crate) const CODE_RENDER_ERROR: &str = "RENDER_ERROR";

#[derive(Clone)]
pub struct AppState {
    store: Store,
    vault: KeyVault,
    mint: MintService,
    dispatch: MintDispatch,
    config: Arc<ServiceConfig>,
}

impl AppState {
    /// State that mints inline on the request path.
    pub fn new(store: Store, vault: KeyVault, minter: Arc<dyn Minter>, config: ServiceConfig) -> Self {
        let config = Arc::new(config);
        let mint = MintService::new(store.clone(), minter, config.clone());
        Self::with_components(store, vault, mint, MintDispatch::Inline, config)
    }

    pub fn with_components(
        store: Store,
        vault: KeyVault,
        mint: MintService,
        dispatch: MintDispatch,
        config: Arc<ServiceConfig>,
    ) -> Self {
        Self {
            store,
            vault,
            mint,
            dispatch,
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn vault(&self) -> &KeyVault {
        &self.vault
    }

    pub fn mint_service(&self) -> &MintService {
        &self.mint
    }

    pub fn dispatch(&self) -> &MintDispatch {
        &self.dispatch
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }
}

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub(crate) fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub(crate) fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub(crate) fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub(crate) fn internal(err: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, CODE_INTERNAL, err)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    error_code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(code = self.code, "{}", self.message);
        }
        let body = ErrorResponse {
            error: self.message,
            error_code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<CertError> for ApiError {
    fn from(err: CertError) -> Self {
        let status = StatusCode::from_u16(err.suggested_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, err.error_code(), err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(conflict) => conflict.into(),
            StoreError::JoinCodesExhausted => Self::internal(err.to_string()),
            other => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                CODE_STORE_ERROR,
                other.to_string(),
            ),
        }
    }
}

impl From<StoreConflict> for ApiError {
    fn from(conflict: StoreConflict) -> Self {
        let message = conflict.to_string();
        match conflict {
            StoreConflict::GroupNotFound(_) => Self::not_found(CODE_GROUP_NOT_FOUND, message),
            StoreConflict::GroupNotActive => Self::conflict(CODE_GROUP_NOT_ACTIVE, message),
            StoreConflict::GroupLocked => Self::conflict(CODE_GROUP_LOCKED, message),
            StoreConflict::TemplateNotFound(_) => Self::not_found(CODE_TEMPLATE_NOT_FOUND, message),
            StoreConflict::GroupFull => Self::conflict(CODE_GROUP_FULL, message),
            StoreConflict::AlreadyClaimed => Self::conflict(CODE_ALREADY_CLAIMED, message),
            StoreConflict::GroupLimitReached { .. } => {
                Self::new(StatusCode::FORBIDDEN, CODE_GROUP_LIMIT, message)
            }
            StoreConflict::NoCredits => Self::new(StatusCode::FORBIDDEN, CODE_MINT_LIMIT, message),
            StoreConflict::Rejected(err) => err.into(),
        }
    }
}

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            CODE_VAULT_ERROR,
            err.to_string(),
        )
    }
}

impl From<MintError> for ApiError {
    fn from(err: MintError) -> Self {
        match err {
            MintError::Store(err) => err.into(),
            MintError::UnknownCertificate(_) => {
                Self::not_found(CODE_CERTIFICATE_NOT_FOUND, err.to_string())
            }
            MintError::InProgress(_) => Self::conflict(CODE_MINT_IN_PROGRESS, err.to_string()),
            MintError::NotConfigured(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                CODE_MINTER_ERROR,
                err.to_string(),
            ),
            other => Self::new(StatusCode::BAD_GATEWAY, CODE_MINTER_ERROR, other.to_string()),
        }
    }
}

impl From<RenderError> for ApiError {
    fn from(err: RenderError) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            CODE_RENDER_ERROR,
            err.to_string(),
        )
    }
}

/// Loose syntactic check: one `@`, non-empty local part, dotted domain.
pub(crate) fn looks_like_email(value: &str) -> bool {
    let value = value.trim();
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && !value.contains(char::is_whitespace)
                && domain
                    .split('.')
                    .filter(|part| !part.is_empty())
                    .count()
                    >= 2
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now().to_rfc3339(),
    })
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .merge(wallets::routes())
        .merge(groups::routes())
        .merge(templates::routes())
        .merge(claims::routes())
        .merge(mint::routes())
        .merge(verify::routes())
        .merge(subscription::routes())
        .with_state(state)
}

/// Build the full service from `config` and serve until ctrl-c.
pub async fn serve(config: BackendConfig) -> Result<()> {
    let store = Store::open(&config.db_path)
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))?;

    let vault = match &config.vault_key {
        Some(secret) => KeyVault::from_secret(secret),
        None => {
            warn!("CERTICHAIN_VAULT_KEY is not set; sealed wallet keys will not survive a restart");
            KeyVault::ephemeral()
        }
    };

    let minter: Arc<dyn Minter> = match &config.crossmint {
        Some(crossmint) => {
            info!(base_url = %crossmint.base_url, "minting through Crossmint");
            Arc::new(CrossmintMinter::new(crossmint.clone()).context("failed to build HTTP client")?)
        }
        None => {
            warn!("CROSSMINT_API_KEY is not set; certificates stay pending until minted manually");
            Arc::new(OfflineMinter)
        }
    };

    let service_config = Arc::new(config.service.clone());
    let mint = MintService::new(store.clone(), minter, service_config.clone());
    let (dispatch, worker) = MintQueue::spawn(mint.clone(), config.mint_queue);
    let state = AppState::with_components(store.clone(), vault, mint, dispatch, service_config);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = app_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "CertiChain backend listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Dropping the router closed the queue sender; let in-flight jobs finish.
    if let Err(err) = worker.await {
        warn!(%err, "mint worker exited abnormally");
    }
    store.flush().await.context("failed to flush database")?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to install CTRL+C signal handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
