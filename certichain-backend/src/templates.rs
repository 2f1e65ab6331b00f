//! Template editor API. Geometry is stored in base pixels; move and resize
//! gestures arrive in display pixels together with the editor's display width.

use axum::{
    extract::{Path, Query, State},
    routing::{patch, post, put},
    Json, Router,
};
use certichain_common::{
    CanvasSize, DisplayField, FieldKind, FieldRect, Template, TemplateField, Viewport,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{ApiError, AppState, CODE_INVALID_INPUT, CODE_TEMPLATE_NOT_FOUND};

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/groups/:group_id/template",
            put(put_template).get(get_template),
        )
        .route("/api/groups/:group_id/template/fields", post(add_field))
        .route(
            "/api/groups/:group_id/template/fields/:field_id",
            patch(update_field).delete(remove_field),
        )
        .route(
            "/api/groups/:group_id/template/fields/:field_id/move",
            post(move_field),
        )
        .route(
            "/api/groups/:group_id/template/fields/:field_id/resize",
            post(resize_field),
        )
}

fn load_template(state: &AppState, group_id: Uuid) -> Result<Template, ApiError> {
    state.store().template(group_id)?.ok_or_else(|| {
        ApiError::not_found(
            CODE_TEMPLATE_NOT_FOUND,
            format!("group {group_id} has no template yet"),
        )
    })
}

#[derive(Debug, Deserialize)]
struct PutTemplateRequest {
    image_url: String,
    #[serde(default)]
    width: Option<f64>,
    #[serde(default)]
    height: Option<f64>,
}

async fn put_template(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Json(request): Json<PutTemplateRequest>,
) -> Result<Json<Template>, ApiError> {
    let image_url = request.image_url.trim();
    if image_url.is_empty() {
        return Err(ApiError::bad_request(CODE_INVALID_INPUT, "image_url is required"));
    }
    let canvas = match (request.width, request.height) {
        (Some(width), Some(height)) => Some(CanvasSize::new(width, height)?),
        (None, None) => None,
        _ => {
            return Err(ApiError::bad_request(
                CODE_INVALID_INPUT,
                "width and height must be given together",
            ))
        }
    };

    let template = state.store().set_template_image(group_id, image_url, canvas)?;
    info!(
        %group_id,
        width = template.canvas.width,
        height = template.canvas.height,
        "template image set"
    );
    Ok(Json(template))
}

#[derive(Debug, Deserialize)]
struct DisplayQuery {
    display_width: Option<f64>,
}

#[derive(Serialize)]
struct TemplateResponse {
    #[serde(flatten)]
    template: Template,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_height: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_fields: Option<Vec<DisplayField>>,
}

async fn get_template(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Query(query): Query<DisplayQuery>,
) -> Result<Json<TemplateResponse>, ApiError> {
    let template = load_template(&state, group_id)?;
    let (display_height, display_fields) = match query.display_width {
        Some(width) => {
            let viewport = Viewport::new(template.canvas, width)?;
            (
                Some(viewport.display_height()),
                Some(template.display_fields(width)?),
            )
        }
        None => (None, None),
    };
    Ok(Json(TemplateResponse {
        template,
        display_height,
        display_fields,
    }))
}

#[derive(Debug, Deserialize)]
struct AddFieldRequest {
    label: String,
    kind: FieldKind,
    #[serde(default)]
    rect: Option<FieldRect>,
}

async fn add_field(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Json(request): Json<AddFieldRequest>,
) -> Result<Json<TemplateField>, ApiError> {
    let field = state.store().edit_template(group_id, |template| {
        template.add_field(&request.label, request.kind, request.rect)
    })?;
    debug!(%group_id, field_id = %field.id, label = %field.label, "field added");
    Ok(Json(field))
}

#[derive(Debug, Deserialize)]
struct UpdateFieldRequest {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    rect: Option<FieldRect>,
}

async fn update_field(
    State(state): State<AppState>,
    Path((group_id, field_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<UpdateFieldRequest>,
) -> Result<Json<TemplateField>, ApiError> {
    let field = state.store().edit_template(group_id, |template| {
        template.update_field(field_id, request.label.as_deref(), request.rect)
    })?;
    Ok(Json(field))
}

#[derive(Debug, Deserialize)]
struct MoveRequest {
    dx: f64,
    dy: f64,
    display_width: f64,
}

async fn move_field(
    State(state): State<AppState>,
    Path((group_id, field_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<MoveRequest>,
) -> Result<Json<TemplateField>, ApiError> {
    let field = state.store().edit_template(group_id, |template| {
        template.move_field(field_id, request.display_width, request.dx, request.dy)
    })?;
    Ok(Json(field))
}

#[derive(Debug, Deserialize)]
struct ResizeRequest {
    dw: f64,
    dh: f64,
    display_width: f64,
}

async fn resize_field(
    State(state): State<AppState>,
    Path((group_id, field_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<ResizeRequest>,
) -> Result<Json<TemplateField>, ApiError> {
    let field = state.store().edit_template(group_id, |template| {
        template.resize_field(field_id, request.display_width, request.dw, request.dh)
    })?;
    Ok(Json(field))
}

async fn remove_field(
    State(state): State<AppState>,
    Path((group_id, field_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<TemplateField>, ApiError> {
    let removed = state
        .store()
        .edit_template(group_id, |template| template.remove_field(field_id))?;
    debug!(%group_id, %field_id, "field removed");
    Ok(Json(removed))
}
