//! Group lifecycle: creation, the authoring wizard, deployment under a join
//! code, and the learner-facing join view.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use certichain_common::{
    normalize_join_code, CanvasSize, CertificateRecord, CertificateStatus,
    FieldKind, Group, GroupStatus, Template, WizardState, DEFAULT_MAX_LEARNERS,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::{
    ApiError, AppState, CODE_GROUP_NOT_FOUND, CODE_INSTRUCTOR_NOT_FOUND, CODE_INVALID_INPUT,
};

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/groups", post(create_group).get(list_groups))
        .route("/api/groups/join-code/:code", get(group_by_join_code))
        .route("/api/groups/:group_id", get(get_group))
        .route("/api/groups/:group_id/wizard", get(wizard))
        .route("/api/groups/:group_id/deploy", post(deploy))
        .route("/api/groups/:group_id/close", post(close))
        .route("/api/groups/:group_id/certificates", get(group_certificates))
}

/// Load a group or fail with 404.
pub(crate) fn load_group(state: &AppState, group_id: Uuid) -> Result<Group, ApiError> {
    state.store().group(group_id)?.ok_or_else(|| {
        ApiError::not_found(CODE_GROUP_NOT_FOUND, format!("group {group_id} not found"))
    })
}

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_max_learners")]
    max_learners: u32,
    creator_user_id: String,
}

fn default_max_learners() -> u32 {
    DEFAULT_MAX_LEARNERS
}

#[derive(Serialize)]
struct CreateGroupResponse {
    group: Group,
    groups_created: u32,
    groups_limit: u32,
}

async fn create_group(
    State(state): State<AppState>,
    Json(request): Json<CreateGroupRequest>,
) -> Result<Json<CreateGroupResponse>, ApiError> {
    let creator = request.creator_user_id.trim();
    if creator.is_empty() {
        return Err(ApiError::bad_request(
            CODE_INVALID_INPUT,
            "creator_user_id is required",
        ));
    }
    if state.store().instructor(creator)?.is_none() {
        return Err(ApiError::not_found(
            CODE_INSTRUCTOR_NOT_FOUND,
            format!("user {creator} is not a registered instructor"),
        ));
    }

    let group = Group::new(
        &request.name,
        request.description.as_deref(),
        request.max_learners,
        creator,
    )?;
    let now = Utc::now();
    let subscription = state.store().create_group(&group, now)?;
    info!(group_id = %group.id, creator = %group.created_by, "created group");

    Ok(Json(CreateGroupResponse {
        group,
        groups_created: subscription.groups_created,
        groups_limit: subscription.groups_limit(now),
    }))
}

async fn get_group(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<Group>, ApiError> {
    Ok(Json(load_group(&state, group_id)?))
}

#[derive(Debug, Deserialize)]
struct ListGroupsQuery {
    created_by: String,
}

async fn list_groups(
    State(state): State<AppState>,
    Query(query): Query<ListGroupsQuery>,
) -> Result<Json<Vec<Group>>, ApiError> {
    Ok(Json(state.store().groups_created_by(&query.created_by)?))
}

#[derive(Serialize)]
struct JoinField {
    label: String,
    kind: FieldKind,
}

/// What a learner sees after entering a join code.
#[derive(Serialize)]
struct JoinView {
    group_id: Uuid,
    name: String,
    description: String,
    join_code: String,
    seats_remaining: u32,
    template_image_url: Option<String>,
    canvas: Option<CanvasSize>,
    fields: Vec<JoinField>,
    required_fields: Vec<String>,
}

async fn group_by_join_code(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<JoinView>, ApiError> {
    let code = normalize_join_code(&code)?;
    let not_found =
        || ApiError::not_found(CODE_GROUP_NOT_FOUND, format!("no active group with join code {code}"));
    let group = state
        .store()
        .group_by_join_code(&code)?
        .filter(|g| g.status == GroupStatus::Active)
        .ok_or_else(not_found)?;
    let template = state.store().template(group.id)?;

    let (template_image_url, canvas, fields, required_fields) = match &template {
        Some(template) => (
            Some(template.image_url.clone()),
            Some(template.canvas),
            template
                .fields
                .iter()
                .map(|f| JoinField {
                    label: f.label.clone(),
                    kind: f.kind,
                })
                .collect(),
            template.text_labels().into_iter().map(str::to_string).collect(),
        ),
        None => (None, None, Vec::new(), Vec::new()),
    };

    Ok(Json(JoinView {
        group_id: group.id,
        seats_remaining: group.seats_remaining(),
        name: group.name,
        description: group.description,
        join_code: code,
        template_image_url,
        canvas,
        fields,
        required_fields,
    }))
}

#[derive(Serialize)]
struct WizardResponse {
    #[serde(flatten)]
    state: WizardState,
    group: Group,
    template: Option<Template>,
}

async fn wizard(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<WizardResponse>, ApiError> {
    let group = load_group(&state, group_id)?;
    let template = state.store().template(group_id)?;
    Ok(Json(WizardResponse {
        state: WizardState::for_group(&group, template.as_ref()),
        group,
        template,
    }))
}

async fn deploy(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<Group>, ApiError> {
    let group = state.store().deploy_group(group_id)?;
    info!(
        %group_id,
        join_code = group.join_code.as_deref().unwrap_or_default(),
        "group deployed"
    );
    Ok(Json(group))
}

async fn close(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<Group>, ApiError> {
    let group = state.store().close_group(group_id)?;
    info!(%group_id, learners = group.learner_count, "group closed");
    Ok(Json(group))
}

#[derive(Serialize)]
struct CertificateSummary {
    certificate_id: String,
    recipient_name: String,
    recipient_email: String,
    status: CertificateStatus,
    nft_id: Option<String>,
    claimed_at: DateTime<Utc>,
    verification_url: String,
}

impl From<CertificateRecord> for CertificateSummary {
    fn from(record: CertificateRecord) -> Self {
        Self {
            nft_id: record.mint.as_ref().map(|m| m.nft_id.clone()),
            certificate_id: record.certificate_id,
            recipient_name: record.recipient_name,
            recipient_email: record.recipient_email,
            status: record.status,
            claimed_at: record.claimed_at,
            verification_url: record.verification_url,
        }
    }
}

#[derive(Serialize)]
struct GroupCertificatesResponse {
    total: usize,
    certificates: Vec<CertificateSummary>,
}

async fn group_certificates(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<GroupCertificatesResponse>, ApiError> {
    load_group(&state, group_id)?;
    let certificates: Vec<CertificateSummary> = state
        .store()
        .certificates_for_group(group_id)?
        .into_iter()
        .map(CertificateSummary::from)
        .collect();
    Ok(Json(GroupCertificatesResponse {
        total: certificates.len(),
        certificates,
    }))
}
