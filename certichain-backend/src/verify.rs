//! Public certificate verification and the verification log.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap},
    routing::{get, post},
    Json, Router,
};
use certichain_common::{assess, Assessment, CertificateRecord, CheckResult, PENDING_TOKEN_ID};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{claims::load_certificate, ApiError, AppState, CODE_INVALID_INPUT};

const MAX_USER_AGENT_LEN: usize = 512;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerificationLog {
    pub id: Uuid,
    pub certificate_id: String,
    pub trust_score: u8,
    pub user_agent: Option<String>,
    pub verified_at: DateTime<Utc>,
}

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/certificates/verify/:certificate_id", get(verify_certificate))
        .route("/api/certificates/verify/:certificate_id/log", post(log_verification))
        .route(
            "/api/certificates/:certificate_id/verifications",
            get(list_verifications),
        )
}

/// Block explorer link for a transaction, when the chain has a known explorer.
pub fn explorer_url(chain: &str, transaction_hash: &str) -> Option<String> {
    if transaction_hash.is_empty() || transaction_hash == PENDING_TOKEN_ID {
        return None;
    }
    let base = match chain.to_ascii_lowercase().as_str() {
        "polygon" | "matic" => "https://polygonscan.com",
        "polygon-amoy" | "amoy" => "https://amoy.polygonscan.com",
        _ => return None,
    };
    Some(format!("{base}/tx/{transaction_hash}"))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecipientView {
    name: String,
    email: String,
    student_id: String,
    wallet: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CourseView {
    name: String,
    completion_date: String,
}

#[derive(Serialize)]
struct IssuerView {
    name: String,
    wallet: String,
    verified: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CertificateView {
    id: String,
    recipient: RecipientView,
    course: CourseView,
    issuer: IssuerView,
    field_data: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct ChainCheck {
    #[serde(flatten)]
    check: CheckResult,
    chain: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChecksView {
    data_integrity: CheckResult,
    issuer_signature: CheckResult,
    #[serde(rename = "blockchainNFT")]
    blockchain_nft: ChainCheck,
    receiver_ownership: CheckResult,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BlockchainView {
    chain: String,
    contract_address: Option<String>,
    token_id: Option<String>,
    transaction_hash: Option<String>,
    explorer_url: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StorageView {
    image_url: String,
    ipfs_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    verified: bool,
    trust_score: u8,
    certificate: CertificateView,
    verification: ChecksView,
    blockchain: BlockchainView,
    storage: StorageView,
}

fn build_response(record: CertificateRecord, assessment: Assessment, owner_wallet: Option<String>) -> VerifyResponse {
    let certificate_id = record.certificate_id.clone();
    let receipt = record.mint.clone();
    let wallet = receipt
        .as_ref()
        .filter(|r| r.recipient_wallet != PENDING_TOKEN_ID)
        .map(|r| r.recipient_wallet.clone())
        .or(owner_wallet);
    let explorer = receipt
        .as_ref()
        .and_then(|r| explorer_url(&record.chain, &r.transaction_hash));

    VerifyResponse {
        verified: assessment.verified,
        trust_score: assessment.trust_score,
        certificate: CertificateView {
            id: certificate_id.clone(),
            recipient: RecipientView {
                name: record.recipient_name,
                email: record.recipient_email,
                student_id: record.student_id,
                wallet,
            },
            course: CourseView {
                name: record.course_name,
                completion_date: record.issue_date,
            },
            issuer: IssuerView {
                name: record.issuer_name,
                wallet: record.issuer_wallet,
                verified: assessment.issuer_signature.passed(),
            },
            field_data: record.field_data,
        },
        verification: ChecksView {
            data_integrity: assessment.data_integrity,
            issuer_signature: assessment.issuer_signature,
            blockchain_nft: ChainCheck {
                check: assessment.blockchain_nft,
                chain: record.chain.clone(),
            },
            receiver_ownership: assessment.receiver_ownership,
        },
        blockchain: BlockchainView {
            chain: record.chain,
            contract_address: receipt.as_ref().map(|r| r.contract_address.clone()),
            token_id: receipt.as_ref().map(|r| r.token_id.clone()),
            transaction_hash: receipt.as_ref().map(|r| r.transaction_hash.clone()),
            explorer_url: explorer,
        },
        storage: StorageView {
            image_url: format!("/api/certificates/{certificate_id}/render"),
            ipfs_url: record.pdf_ipfs_url,
        },
    }
}

async fn verify_certificate(
    State(state): State<AppState>,
    Path(certificate_id): Path<String>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let record = load_certificate(&state, &certificate_id)?;

    let issuer_active = match state.store().group(record.group_id)? {
        Some(group) => state
            .store()
            .instructor(&group.created_by)?
            .map_or(false, |i| {
                i.is_active && i.wallet_address.eq_ignore_ascii_case(&record.issuer_wallet)
            }),
        None => false,
    };
    let owner_wallet = match &record.claimed_by {
        Some(user_id) => state
            .store()
            .user_wallet(user_id)?
            .map(|w| format!("{}:{}", record.chain, w.wallet_address)),
        None => None,
    };

    let assessment = assess(&record, issuer_active, owner_wallet.as_deref());
    debug!(
        %certificate_id,
        verified = assessment.verified,
        trust_score = assessment.trust_score,
        "certificate verified"
    );
    Ok(Json(build_response(record, assessment, owner_wallet)))
}

#[derive(Debug, Deserialize)]
struct LogRequest {
    trust_score: u8,
    #[serde(default)]
    user_agent: Option<String>,
}

async fn log_verification(
    State(state): State<AppState>,
    Path(certificate_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<LogRequest>,
) -> Result<Json<VerificationLog>, ApiError> {
    load_certificate(&state, &certificate_id)?;
    if request.trust_score > 100 {
        return Err(ApiError::bad_request(
            CODE_INVALID_INPUT,
            "trust_score must be between 0 and 100",
        ));
    }
    let user_agent = request
        .user_agent
        .or_else(|| {
            headers
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .map(|ua| ua.chars().take(MAX_USER_AGENT_LEN).collect::<String>());

    let log = VerificationLog {
        id: Uuid::new_v4(),
        certificate_id,
        trust_score: request.trust_score,
        user_agent,
        verified_at: Utc::now(),
    };
    state.store().append_verification_log(&log)?;
    Ok(Json(log))
}

#[derive(Serialize)]
struct VerificationsResponse {
    total: usize,
    logs: Vec<VerificationLog>,
}

async fn list_verifications(
    State(state): State<AppState>,
    Path(certificate_id): Path<String>,
) -> Result<Json<VerificationsResponse>, ApiError> {
    load_certificate(&state, &certificate_id)?;
    let logs = state.store().verification_logs(&certificate_id)?;
    Ok(Json(VerificationsResponse {
        total: logs.len(),
        logs,
    }))
}
