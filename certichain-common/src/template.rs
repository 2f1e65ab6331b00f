//! Certificate templates: a background image plus positioned fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{CertError, CertResult},
    layout::{
        clamp_to_canvas, font_size_px, square_if_qr, validate_rect, CanvasSize, FieldKind,
        FieldRect, TemplateField, Viewport,
    },
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub group_id: Uuid,
    pub image_url: String,
    pub canvas: CanvasSize,
    /// Fields in creation order.
    pub fields: Vec<TemplateField>,
    pub updated_at: DateTime<Utc>,
}

/// A field as the editor should draw it at a given display width.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DisplayField {
    pub id: Uuid,
    pub label: String,
    pub kind: FieldKind,
    pub rect: FieldRect,
    pub font_size_px: f64,
}

impl Template {
    pub fn new(group_id: Uuid, image_url: impl Into<String>, canvas: Option<CanvasSize>) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id,
            image_url: image_url.into(),
            canvas: canvas.unwrap_or_default(),
            fields: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Swap the background image. Existing fields are pulled back inside the
    /// new canvas.
    pub fn replace_image(&mut self, image_url: impl Into<String>, canvas: Option<CanvasSize>) {
        self.image_url = image_url.into();
        self.canvas = canvas.unwrap_or_default();
        let canvas = self.canvas;
        for field in &mut self.fields {
            field.rect = square_if_qr(field.kind, clamp_to_canvas(field.rect, canvas), canvas);
        }
        self.touch();
    }

    pub fn field(&self, field_id: Uuid) -> CertResult<&TemplateField> {
        self.fields
            .iter()
            .find(|f| f.id == field_id)
            .ok_or_else(|| CertError::NotFound(format!("field {field_id}")))
    }

    fn field_mut(&mut self, field_id: Uuid) -> CertResult<&mut TemplateField> {
        self.fields
            .iter_mut()
            .find(|f| f.id == field_id)
            .ok_or_else(|| CertError::NotFound(format!("field {field_id}")))
    }

    fn ensure_label_free(&self, label: &str, except: Option<Uuid>) -> CertResult<()> {
        let taken = self
            .fields
            .iter()
            .any(|f| Some(f.id) != except && f.label.eq_ignore_ascii_case(label.trim()));
        if taken {
            return Err(CertError::DuplicateField(label.trim().to_string()));
        }
        Ok(())
    }

    pub fn add_field(
        &mut self,
        label: &str,
        kind: FieldKind,
        rect: Option<FieldRect>,
    ) -> CertResult<TemplateField> {
        self.ensure_label_free(label, None)?;
        let field = TemplateField::new(label, kind, rect, self.canvas)?;
        self.fields.push(field.clone());
        self.touch();
        Ok(field)
    }

    /// Rename and/or reposition a field using base-pixel geometry.
    pub fn update_field(
        &mut self,
        field_id: Uuid,
        label: Option<&str>,
        rect: Option<FieldRect>,
    ) -> CertResult<TemplateField> {
        if let Some(label) = label {
            if label.trim().is_empty() {
                return Err(CertError::InvalidLayout("field label must not be empty".into()));
            }
            self.ensure_label_free(label, Some(field_id))?;
        }
        if let Some(rect) = &rect {
            validate_rect(rect, self.canvas)?;
        }

        let canvas = self.canvas;
        let field = self.field_mut(field_id)?;
        if let Some(label) = label {
            field.label = label.trim().to_string();
        }
        if let Some(rect) = rect {
            field.rect = square_if_qr(field.kind, rect, canvas);
        }
        let updated = field.clone();
        self.touch();
        Ok(updated)
    }

    pub fn move_field(
        &mut self,
        field_id: Uuid,
        display_width: f64,
        dx: f64,
        dy: f64,
    ) -> CertResult<TemplateField> {
        let viewport = Viewport::new(self.canvas, display_width)?;
        let field = self.field_mut(field_id)?;
        field.rect = viewport.drag(field.rect, dx, dy)?;
        let updated = field.clone();
        self.touch();
        Ok(updated)
    }

    pub fn resize_field(
        &mut self,
        field_id: Uuid,
        display_width: f64,
        dw: f64,
        dh: f64,
    ) -> CertResult<TemplateField> {
        let viewport = Viewport::new(self.canvas, display_width)?;
        let field = self.field_mut(field_id)?;
        field.rect = viewport.resize(field.rect, field.kind, dw, dh)?;
        let updated = field.clone();
        self.touch();
        Ok(updated)
    }

    pub fn remove_field(&mut self, field_id: Uuid) -> CertResult<TemplateField> {
        let index = self
            .fields
            .iter()
            .position(|f| f.id == field_id)
            .ok_or_else(|| CertError::NotFound(format!("field {field_id}")))?;
        let removed = self.fields.remove(index);
        self.touch();
        Ok(removed)
    }

    /// Labels learners must fill in, in field order.
    pub fn text_labels(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.kind == FieldKind::Text)
            .map(|f| f.label.as_str())
            .collect()
    }

    pub fn has_qr_field(&self) -> bool {
        self.fields.iter().any(|f| f.kind == FieldKind::Qr)
    }

    pub fn display_fields(&self, display_width: f64) -> CertResult<Vec<DisplayField>> {
        let viewport = Viewport::new(self.canvas, display_width)?;
        Ok(self
            .fields
            .iter()
            .map(|f| {
                let rect = viewport.to_display(f.rect);
                DisplayField {
                    id: f.id,
                    label: f.label.clone(),
                    kind: f.kind,
                    rect,
                    font_size_px: font_size_px(rect.height),
                }
            })
            .collect())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
