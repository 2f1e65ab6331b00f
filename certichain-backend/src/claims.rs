//! Learner claims and certificate artifacts (record, QR code, rendering).

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use certichain_common::{
    format_issue_date, generate_certificate_id, normalize_join_code, verification_url,
    CertificateData, CertificateRecord, CertificateStatus, GroupStatus, Template,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{
    looks_like_email,
    render::{certificate_svg, qr_base64, qr_png, QR_SIZE_PX},
    store::StoreConflict,
    ApiError, AppState, CODE_ALREADY_MINTED, CODE_CERTIFICATE_NOT_FOUND, CODE_GROUP_NOT_FOUND,
    CODE_INVALID_EMAIL, CODE_INVALID_INPUT, CODE_ISSUER_NOT_CONFIGURED, CODE_MISSING_FIELDS,
    CODE_UNKNOWN_FIELDS,
};

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/certificates/claim", post(claim))
        .route("/api/certificates/:certificate_id", get(get_certificate))
        .route("/api/certificates/:certificate_id/qr", get(certificate_qr))
        .route("/api/certificates/:certificate_id/render", get(render_certificate))
        .route("/api/certificates/:certificate_id/mint", post(retry_mint))
}

pub(crate) fn load_certificate(state: &AppState, certificate_id: &str) -> Result<CertificateRecord, ApiError> {
    state.store().certificate(certificate_id)?.ok_or_else(|| {
        ApiError::not_found(
            CODE_CERTIFICATE_NOT_FOUND,
            format!("certificate {certificate_id} not found"),
        )
    })
}

fn render_url(certificate_id: &str) -> String {
    format!("/api/certificates/{certificate_id}/render")
}

#[derive(Debug, Deserialize)]
struct ClaimRequest {
    join_code: String,
    recipient_name: String,
    recipient_email: String,
    #[serde(default)]
    student_id: Option<String>,
    #[serde(default)]
    claimed_by: Option<String>,
    #[serde(default)]
    field_data: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct ClaimResponse {
    success: bool,
    certificate_id: String,
    verification_url: String,
    status: CertificateStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    nft_id: Option<String>,
    qr_code: String,
    pdf_download_url: String,
    message: String,
}

/// Match submitted values to the template's text fields. Keys are matched
/// case-insensitively and rewritten to the template's own label.
fn collect_field_values(
    template: Option<&Template>,
    submitted: BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, ApiError> {
    let labels = template.map(Template::text_labels).unwrap_or_default();

    let mut values = BTreeMap::new();
    let mut unknown = Vec::new();
    for (key, value) in submitted {
        match labels.iter().find(|label| label.eq_ignore_ascii_case(key.trim())) {
            Some(label) => {
                values.insert(label.to_string(), value.trim().to_string());
            }
            None => unknown.push(key),
        }
    }
    if !unknown.is_empty() {
        return Err(ApiError::bad_request(
            CODE_UNKNOWN_FIELDS,
            format!("Unknown fields: {}", unknown.join(", ")),
        ));
    }

    let missing: Vec<&str> = labels
        .iter()
        .copied()
        .filter(|label| values.get(*label).map_or(true, |v| v.is_empty()))
        .collect();
    if !missing.is_empty() {
        return Err(ApiError::bad_request(
            CODE_MISSING_FIELDS,
            format!("Missing required fields: {}", missing.join(", ")),
        ));
    }
    Ok(values)
}

async fn claim(
    State(state): State<AppState>,
    Json(request): Json<ClaimRequest>,
) -> Result<Json<ClaimResponse>, ApiError> {
    let code = normalize_join_code(&request.join_code)?;
    let group = state
        .store()
        .group_by_join_code(&code)?
        .filter(|g| g.status == GroupStatus::Active)
        .ok_or_else(|| {
            ApiError::not_found(CODE_GROUP_NOT_FOUND, format!("no active group with join code {code}"))
        })?;
    if group.is_full() {
        return Err(StoreConflict::GroupFull.into());
    }

    let template = state.store().template(group.id)?;
    let field_data = collect_field_values(template.as_ref(), request.field_data)?;

    let recipient_name = request.recipient_name.trim().to_string();
    if recipient_name.is_empty() {
        return Err(ApiError::bad_request(CODE_INVALID_INPUT, "recipient_name is required"));
    }
    let email = request.recipient_email.trim().to_ascii_lowercase();
    if !looks_like_email(&email) {
        return Err(ApiError::bad_request(
            CODE_INVALID_EMAIL,
            format!("'{email}' is not a valid email address"),
        ));
    }
    if state.store().has_claim(group.id, &email)? {
        return Err(StoreConflict::AlreadyClaimed.into());
    }

    let instructor = state
        .store()
        .instructor(&group.created_by)?
        .filter(|i| i.is_active)
        .ok_or_else(|| {
            ApiError::bad_request(
                CODE_ISSUER_NOT_CONFIGURED,
                "the group's instructor has no active signing wallet",
            )
        })?;
    let issuer = instructor.signing_wallet(state.vault())?;

    let now = Utc::now();
    let certificate_id = generate_certificate_id(now.timestamp());
    let data = CertificateData {
        certificate_id: certificate_id.clone(),
        recipient_name,
        recipient_email: email,
        student_id: request.student_id.unwrap_or_default().trim().to_string(),
        course_name: group.name.clone(),
        issuer_name: instructor.name.clone(),
        issuer_wallet: issuer.address(),
        issue_date: format_issue_date(now),
        group_id: group.id.to_string(),
        verification_url: verification_url(&state.config().app_url, &certificate_id),
        field_data,
    };
    let claimed_by = request
        .claimed_by
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty());
    let record = CertificateRecord::issue(
        data,
        &issuer,
        group.id,
        template.as_ref().map(|t| t.id),
        &state.config().chain,
        claimed_by,
    )?;
    let qr_code = qr_base64(&record.qr_code_data)?;

    let group = state.store().insert_claim(&record)?;
    info!(
        %certificate_id,
        group_id = %group.id,
        learners = group.learner_count,
        "certificate claimed"
    );

    let record = match state
        .dispatch()
        .dispatch(state.mint_service(), &certificate_id)
        .await
    {
        Ok(Some(updated)) => updated,
        Ok(None) => record,
        Err(err) => {
            error!(%certificate_id, %err, "failed to start minting");
            record
        }
    };

    let message = match record.status {
        CertificateStatus::Minted => "Certificate claimed and minted",
        CertificateStatus::Claimed
        | CertificateStatus::Minting
        | CertificateStatus::MintPending => "Certificate claimed; NFT minting is in progress",
        CertificateStatus::AwaitingCredits => {
            "Certificate claimed; minting waits for the issuer's mint credits"
        }
        CertificateStatus::MintFailed => "Certificate claimed; NFT minting failed and can be retried",
    };

    Ok(Json(ClaimResponse {
        success: true,
        verification_url: record.verification_url.clone(),
        status: record.status,
        nft_id: record.mint.as_ref().map(|m| m.nft_id.clone()),
        qr_code,
        pdf_download_url: render_url(&certificate_id),
        message: message.to_string(),
        certificate_id,
    }))
}

async fn get_certificate(
    State(state): State<AppState>,
    Path(certificate_id): Path<String>,
) -> Result<Json<CertificateRecord>, ApiError> {
    Ok(Json(load_certificate(&state, &certificate_id)?))
}

async fn certificate_qr(
    State(state): State<AppState>,
    Path(certificate_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = load_certificate(&state, &certificate_id)?;
    let png = qr_png(&record.qr_code_data, QR_SIZE_PX)?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png))
}

async fn render_certificate(
    State(state): State<AppState>,
    Path(certificate_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = load_certificate(&state, &certificate_id)?;
    let template = state.store().template(record.group_id)?;
    let svg = certificate_svg(&record, template.as_ref())?;
    Ok(([(header::CONTENT_TYPE, "image/svg+xml")], svg))
}

#[derive(Serialize)]
struct MintStatusResponse {
    certificate_id: String,
    status: CertificateStatus,
    nft_id: Option<String>,
    mint_attempts: u32,
    mint_error: Option<String>,
}

async fn retry_mint(
    State(state): State<AppState>,
    Path(certificate_id): Path<String>,
) -> Result<Json<MintStatusResponse>, ApiError> {
    let record = load_certificate(&state, &certificate_id)?;
    if record.is_minted() {
        return Err(ApiError::conflict(
            CODE_ALREADY_MINTED,
            format!("certificate {certificate_id} is already minted"),
        ));
    }

    let record = state.mint_service().process(&certificate_id).await?;
    if record.status == CertificateStatus::AwaitingCredits {
        return Err(StoreConflict::NoCredits.into());
    }
    Ok(Json(MintStatusResponse {
        nft_id: record.mint.as_ref().map(|m| m.nft_id.clone()),
        certificate_id: record.certificate_id,
        status: record.status,
        mint_attempts: record.mint_attempts,
        mint_error: record.mint_error,
    }))
}
