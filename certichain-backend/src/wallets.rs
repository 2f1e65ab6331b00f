//! User receiving wallets and instructor signing wallets.
//!
//! Every user gets one wallet record. Instructors additionally get a signing
//! wallet whose private key is sealed by the [`KeyVault`] and never leaves the
//! server.

use axum::{
    extract::{Path, State},
    routing::{get, post, put},
    Json, Router,
};
use certichain_common::{is_address, to_checksum_address, SigningWallet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    looks_like_email,
    vault::{KeyVault, SealedKey, VaultError},
    ApiError, AppState, CODE_INSTRUCTOR_NOT_FOUND, CODE_INVALID_ADDRESS, CODE_INVALID_EMAIL,
    CODE_INVALID_INPUT, CODE_WALLET_NOT_FOUND, CODE_WALLET_REQUIRED,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletType {
    /// Created by the service; key sealed in the vault.
    Generated,
    /// Connected by the user; the service never sees the key.
    External,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserWallet {
    pub user_id: String,
    pub wallet_address: String,
    pub wallet_type: WalletType,
    pub sealed_key: Option<SealedKey>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub department: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instructor {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub department: Option<String>,
    pub wallet_address: String,
    pub sealed_key: SealedKey,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Instructor {
    /// Unseal the signing wallet for issuing certificates.
    pub fn signing_wallet(&self, vault: &KeyVault) -> Result<SigningWallet, VaultError> {
        vault.open(&self.sealed_key)
    }
}

#[derive(Serialize)]
pub struct UserWalletView {
    pub user_id: String,
    pub wallet_address: String,
    pub wallet_type: WalletType,
    pub name: Option<String>,
    pub email: Option<String>,
    pub department: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&UserWallet> for UserWalletView {
    fn from(wallet: &UserWallet) -> Self {
        Self {
            user_id: wallet.user_id.clone(),
            wallet_address: wallet.wallet_address.clone(),
            wallet_type: wallet.wallet_type,
            name: wallet.name.clone(),
            email: wallet.email.clone(),
            department: wallet.department.clone(),
            created_at: wallet.created_at,
            updated_at: wallet.updated_at,
        }
    }
}

#[derive(Serialize)]
pub struct InstructorView {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub department: Option<String>,
    pub wallet_address: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Instructor> for InstructorView {
    fn from(instructor: &Instructor) -> Self {
        Self {
            user_id: instructor.user_id.clone(),
            name: instructor.name.clone(),
            email: instructor.email.clone(),
            department: instructor.department.clone(),
            wallet_address: instructor.wallet_address.clone(),
            is_active: instructor.is_active,
            created_at: instructor.created_at,
        }
    }
}

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/instructor/generate-wallet", post(generate_wallet))
        .route(
            "/api/users/:user_id/wallet",
            get(get_user_wallet).post(create_user_wallet),
        )
        .route("/api/users/:user_id/wallet/external", put(connect_external_wallet))
        .route("/api/instructors", post(register_instructor))
        .route("/api/instructors/:user_id", get(get_instructor))
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn require_user_id(user_id: &str) -> Result<(), ApiError> {
    if user_id.trim().is_empty() {
        return Err(ApiError::bad_request(CODE_INVALID_INPUT, "user_id is required"));
    }
    Ok(())
}

#[derive(Serialize)]
struct GeneratedWalletResponse {
    address: String,
    private_key: String,
}

/// A throwaway keypair for users who want to self-custody. Nothing is stored.
async fn generate_wallet() -> Json<GeneratedWalletResponse> {
    let wallet = SigningWallet::generate();
    Json(GeneratedWalletResponse {
        address: wallet.address(),
        private_key: wallet.private_key_hex(),
    })
}

async fn get_user_wallet(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserWalletView>, ApiError> {
    let wallet = state.store().user_wallet(&user_id)?.ok_or_else(|| {
        ApiError::not_found(CODE_WALLET_NOT_FOUND, format!("no wallet for user {user_id}"))
    })?;
    Ok(Json(UserWalletView::from(&wallet)))
}

#[derive(Debug, Default, Deserialize)]
struct CreateWalletRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    department: Option<String>,
}

#[derive(Serialize)]
struct UserWalletResponse {
    created: bool,
    wallet: UserWalletView,
}

async fn create_user_wallet(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    body: Option<Json<CreateWalletRequest>>,
) -> Result<Json<UserWalletResponse>, ApiError> {
    require_user_id(&user_id)?;
    let request = body.map(|Json(request)| request).unwrap_or_default();

    if let Some(existing) = state.store().user_wallet(&user_id)? {
        return Ok(Json(UserWalletResponse {
            created: false,
            wallet: UserWalletView::from(&existing),
        }));
    }

    let email = clean(request.email);
    if let Some(email) = &email {
        if !looks_like_email(email) {
            return Err(ApiError::bad_request(
                CODE_INVALID_EMAIL,
                format!("'{email}' is not a valid email address"),
            ));
        }
    }

    let signing = SigningWallet::generate();
    let sealed = state.vault().seal(&signing)?;
    let now = Utc::now();
    let wallet = UserWallet {
        user_id: user_id.clone(),
        wallet_address: signing.address(),
        wallet_type: WalletType::Generated,
        sealed_key: Some(sealed),
        name: clean(request.name),
        email,
        department: clean(request.department),
        created_at: now,
        updated_at: now,
    };
    let (stored, created) = state.store().create_user_wallet(&wallet)?;
    if created {
        info!(%user_id, address = %stored.wallet_address, "generated user wallet");
    }
    Ok(Json(UserWalletResponse {
        created,
        wallet: UserWalletView::from(&stored),
    }))
}

#[derive(Debug, Deserialize)]
struct ExternalWalletRequest {
    wallet_address: String,
}

async fn connect_external_wallet(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<ExternalWalletRequest>,
) -> Result<Json<UserWalletView>, ApiError> {
    require_user_id(&user_id)?;
    let address = request.wallet_address.trim();
    if !is_address(address) {
        return Err(ApiError::bad_request(
            CODE_INVALID_ADDRESS,
            format!("'{address}' is not a valid wallet address"),
        ));
    }
    let address = to_checksum_address(address)?;

    let now = Utc::now();
    let wallet = match state.store().user_wallet(&user_id)? {
        Some(existing) => UserWallet {
            wallet_address: address,
            wallet_type: WalletType::External,
            sealed_key: None,
            updated_at: now,
            ..existing
        },
        None => UserWallet {
            user_id: user_id.clone(),
            wallet_address: address,
            wallet_type: WalletType::External,
            sealed_key: None,
            name: None,
            email: None,
            department: None,
            created_at: now,
            updated_at: now,
        },
    };
    state.store().put_user_wallet(&wallet)?;
    info!(%user_id, address = %wallet.wallet_address, "connected external wallet");
    Ok(Json(UserWalletView::from(&wallet)))
}

#[derive(Debug, Deserialize)]
struct RegisterInstructorRequest {
    user_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    department: Option<String>,
}

#[derive(Serialize)]
struct InstructorResponse {
    created: bool,
    instructor: InstructorView,
}

async fn register_instructor(
    State(state): State<AppState>,
    Json(request): Json<RegisterInstructorRequest>,
) -> Result<Json<InstructorResponse>, ApiError> {
    let user_id = request.user_id.trim().to_string();
    require_user_id(&user_id)?;

    if let Some(existing) = state.store().instructor(&user_id)? {
        return Ok(Json(InstructorResponse {
            created: false,
            instructor: InstructorView::from(&existing),
        }));
    }

    let user_wallet = state.store().user_wallet(&user_id)?.ok_or_else(|| {
        ApiError::conflict(
            CODE_WALLET_REQUIRED,
            "create a user wallet before registering as an instructor",
        )
    })?;

    // Identity recorded on the wallet wins over the request.
    let name = clean(user_wallet.name.clone()).or_else(|| clean(request.name));
    let email = clean(user_wallet.email.clone()).or_else(|| clean(request.email));
    let (Some(name), Some(email)) = (name, email) else {
        return Err(ApiError::bad_request(
            CODE_INVALID_INPUT,
            "instructor name and email are required",
        ));
    };
    if !looks_like_email(&email) {
        return Err(ApiError::bad_request(
            CODE_INVALID_EMAIL,
            format!("'{email}' is not a valid email address"),
        ));
    }

    let signing = SigningWallet::generate();
    let sealed_key = state.vault().seal(&signing)?;
    let instructor = Instructor {
        user_id: user_id.clone(),
        name,
        email,
        department: clean(user_wallet.department.clone()).or_else(|| clean(request.department)),
        wallet_address: signing.address(),
        sealed_key,
        is_active: true,
        created_at: Utc::now(),
    };

    let (stored, created) = state.store().register_instructor(&instructor, Utc::now())?;
    if created {
        info!(%user_id, address = %stored.wallet_address, "registered instructor");
    }
    Ok(Json(InstructorResponse {
        created,
        instructor: InstructorView::from(&stored),
    }))
}

async fn get_instructor(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<InstructorView>, ApiError> {
    let instructor = state.store().instructor(&user_id)?.ok_or_else(|| {
        ApiError::not_found(
            CODE_INSTRUCTOR_NOT_FOUND,
            format!("user {user_id} is not an instructor"),
        )
    })?;
    Ok(Json(InstructorView::from(&instructor)))
}
