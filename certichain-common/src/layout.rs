//! Certificate template geometry.
//!
//! Field rectangles are stored in *base* pixels, the native resolution of the
//! uploaded template image. Editors render the template at some responsive
//! display width; a [`Viewport`] maps between the two spaces and applies drag
//! and resize gestures, which arrive in display pixels, back onto base rects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CertError, CertResult};

/// Canvas used when the template image dimensions are unknown.
pub const FALLBACK_CANVAS: CanvasSize = CanvasSize {
    width: 800.0,
    height: 560.0,
};
pub const MIN_FIELD_WIDTH: f64 = 20.0;
pub const MIN_FIELD_HEIGHT: f64 = 10.0;
pub const MIN_FONT_SIZE_PX: f64 = 12.0;
const FONT_HEIGHT_RATIO: f64 = 0.4;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanvasSize {
    pub width: f64,
    pub height: f64,
}

impl CanvasSize {
    pub fn new(width: f64, height: f64) -> CertResult<Self> {
        if !(width.is_finite() && height.is_finite()) || width <= 0.0 || height <= 0.0 {
            return Err(CertError::InvalidLayout(format!(
                "canvas must have positive dimensions, got {width}x{height}"
            )));
        }
        Ok(Self { width, height })
    }
}

impl Default for CanvasSize {
    fn default() -> Self {
        FALLBACK_CANVAS
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl FieldRect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.width.is_finite() && self.height.is_finite()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// A learner-supplied text value rendered at the rect.
    Text,
    /// The verification QR code; always square.
    Qr,
}

impl FieldKind {
    pub fn default_rect(self) -> FieldRect {
        match self {
            FieldKind::Text => FieldRect::new(50.0, 50.0, 200.0, 40.0),
            FieldKind::Qr => FieldRect::new(50.0, 50.0, 120.0, 120.0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TemplateField {
    pub id: Uuid,
    pub label: String,
    pub kind: FieldKind,
    pub rect: FieldRect,
    pub created_at: DateTime<Utc>,
}

impl TemplateField {
    /// Create a field, falling back to the kind's default rect and clamping
    /// it into `canvas`.
    pub fn new(
        label: impl Into<String>,
        kind: FieldKind,
        rect: Option<FieldRect>,
        canvas: CanvasSize,
    ) -> CertResult<Self> {
        let label = label.into().trim().to_string();
        if label.is_empty() {
            return Err(CertError::InvalidLayout("field label must not be empty".into()));
        }
        let rect = match rect {
            Some(rect) => {
                validate_rect(&rect, canvas)?;
                rect
            }
            None => clamp_to_canvas(kind.default_rect(), canvas),
        };
        Ok(Self {
            id: Uuid::new_v4(),
            label,
            kind,
            rect: square_if_qr(kind, rect, canvas),
            created_at: Utc::now(),
        })
    }
}

/// A QR side has to satisfy both the width and the height minimum.
fn min_qr_side() -> f64 {
    MIN_FIELD_WIDTH.max(MIN_FIELD_HEIGHT)
}

/// Square a QR rect on its larger side, no smaller than the minimum field
/// size and shifted back inside `canvas` if it grew past an edge.
pub(crate) fn square_if_qr(kind: FieldKind, rect: FieldRect, canvas: CanvasSize) -> FieldRect {
    match kind {
        FieldKind::Text => rect,
        FieldKind::Qr => {
            let room = canvas.width.min(canvas.height);
            let side = rect.width.max(rect.height).clamp(min_qr_side().min(room), room);
            FieldRect {
                x: rect.x.clamp(0.0, canvas.width - side),
                y: rect.y.clamp(0.0, canvas.height - side),
                width: side,
                height: side,
            }
        }
    }
}

/// Reject rects that are non-finite, degenerate, or leave the canvas.
pub fn validate_rect(rect: &FieldRect, canvas: CanvasSize) -> CertResult<()> {
    if !rect.is_finite() {
        return Err(CertError::InvalidLayout("field rect must be finite".into()));
    }
    if rect.width < MIN_FIELD_WIDTH || rect.height < MIN_FIELD_HEIGHT {
        return Err(CertError::InvalidLayout(format!(
            "field must be at least {MIN_FIELD_WIDTH}x{MIN_FIELD_HEIGHT}, got {}x{}",
            rect.width, rect.height
        )));
    }
    if rect.x < 0.0
        || rect.y < 0.0
        || rect.x + rect.width > canvas.width
        || rect.y + rect.height > canvas.height
    {
        return Err(CertError::InvalidLayout(format!(
            "field ({}, {}, {}x{}) exceeds canvas {}x{}",
            rect.x, rect.y, rect.width, rect.height, canvas.width, canvas.height
        )));
    }
    Ok(())
}

/// Shrink and shift `rect` until it lies within `canvas`.
pub fn clamp_to_canvas(rect: FieldRect, canvas: CanvasSize) -> FieldRect {
    let width = rect.width.clamp(MIN_FIELD_WIDTH.min(canvas.width), canvas.width);
    let height = rect
        .height
        .clamp(MIN_FIELD_HEIGHT.min(canvas.height), canvas.height);
    FieldRect {
        x: rect.x.clamp(0.0, canvas.width - width),
        y: rect.y.clamp(0.0, canvas.height - height),
        width,
        height,
    }
}

/// Font size for a text field rendered `display_height` pixels tall.
pub fn font_size_px(display_height: f64) -> f64 {
    (display_height * FONT_HEIGHT_RATIO).max(MIN_FONT_SIZE_PX)
}

/// A template canvas rendered at a particular display width.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    canvas: CanvasSize,
    display_width: f64,
}

impl Viewport {
    pub fn new(canvas: CanvasSize, display_width: f64) -> CertResult<Self> {
        if !display_width.is_finite() || display_width <= 0.0 {
            return Err(CertError::InvalidLayout(format!(
                "display width must be positive, got {display_width}"
            )));
        }
        Ok(Self {
            canvas,
            display_width,
        })
    }

    pub fn canvas(&self) -> CanvasSize {
        self.canvas
    }

    /// Display pixels per base pixel.
    pub fn scale(&self) -> f64 {
        self.display_width / self.canvas.width
    }

    pub fn display_height(&self) -> f64 {
        self.canvas.height * self.scale()
    }

    pub fn to_display(&self, rect: FieldRect) -> FieldRect {
        let s = self.scale();
        FieldRect::new(rect.x * s, rect.y * s, rect.width * s, rect.height * s)
    }

    pub fn to_base(&self, rect: FieldRect) -> FieldRect {
        let s = self.scale();
        FieldRect::new(rect.x / s, rect.y / s, rect.width / s, rect.height / s)
    }

    /// Translate `rect` (base px) by a pointer delta in display px.
    pub fn drag(&self, rect: FieldRect, dx: f64, dy: f64) -> CertResult<FieldRect> {
        ensure_finite(&[dx, dy])?;
        let s = self.scale();
        let width = rect.width.min(self.canvas.width);
        let height = rect.height.min(self.canvas.height);
        Ok(FieldRect {
            x: (rect.x + dx / s).clamp(0.0, self.canvas.width - width),
            y: (rect.y + dy / s).clamp(0.0, self.canvas.height - height),
            width,
            height,
        })
    }

    /// Resize `rect` (base px) from its bottom-right handle by a display-px
    /// delta. QR fields stay square.
    pub fn resize(&self, rect: FieldRect, kind: FieldKind, dw: f64, dh: f64) -> CertResult<FieldRect> {
        ensure_finite(&[dw, dh])?;
        let s = self.scale();
        let max_width = self.canvas.width - rect.x;
        let max_height = self.canvas.height - rect.y;

        let width = rect.width + dw / s;
        let height = rect.height + dh / s;
        if kind == FieldKind::Qr {
            let room = max_width.min(max_height);
            let side = width.max(height).clamp(min_qr_side().min(room), room);
            return Ok(FieldRect {
                width: side,
                height: side,
                ..rect
            });
        }

        Ok(FieldRect {
            width: width.clamp(MIN_FIELD_WIDTH.min(max_width), max_width),
            height: height.clamp(MIN_FIELD_HEIGHT.min(max_height), max_height),
            ..rect
        })
    }
}

fn ensure_finite(values: &[f64]) -> CertResult<()> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(CertError::InvalidLayout("pointer delta must be finite".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canvas() -> CanvasSize {
        CanvasSize::new(2000.0, 1400.0).unwrap()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn scale_maps_base_to_display_and_back() {
        let viewport = Viewport::new(canvas(), 800.0).unwrap();
        assert!(approx(viewport.scale(), 0.4));
        assert!(approx(viewport.display_height(), 560.0));

        let base = FieldRect::new(100.0, 200.0, 500.0, 100.0);
        let display = viewport.to_display(base);
        assert_eq!(display, FieldRect::new(40.0, 80.0, 200.0, 40.0));

        let back = viewport.to_base(display);
        assert!(approx(back.x, base.x) && approx(back.width, base.width));
    }

    #[test]
    fn drag_converts_display_delta_and_clamps() {
        let viewport = Viewport::new(canvas(), 800.0).unwrap();
        let rect = FieldRect::new(100.0, 100.0, 400.0, 100.0);

        let moved = viewport.drag(rect, 40.0, -20.0).unwrap();
        assert!(approx(moved.x, 200.0));
        assert!(approx(moved.y, 50.0));

        let pinned = viewport.drag(rect, 10_000.0, 10_000.0).unwrap();
        assert!(approx(pinned.x, 1600.0));
        assert!(approx(pinned.y, 1300.0));

        let origin = viewport.drag(rect, -10_000.0, -10_000.0).unwrap();
        assert!(approx(origin.x, 0.0) && approx(origin.y, 0.0));
    }

    #[test]
    fn resize_respects_minimum_and_canvas_edge() {
        let viewport = Viewport::new(canvas(), 1000.0).unwrap();
        let rect = FieldRect::new(1800.0, 100.0, 100.0, 50.0);

        let grown = viewport.resize(rect, FieldKind::Text, 500.0, 0.0).unwrap();
        assert!(approx(grown.width, 200.0));

        let shrunk = viewport.resize(rect, FieldKind::Text, -1000.0, -1000.0).unwrap();
        assert!(approx(shrunk.width, MIN_FIELD_WIDTH));
        assert!(approx(shrunk.height, MIN_FIELD_HEIGHT));
    }

    #[test]
    fn qr_fields_stay_square() {
        let viewport = Viewport::new(canvas(), 2000.0).unwrap();
        let rect = FieldRect::new(10.0, 10.0, 100.0, 100.0);
        let resized = viewport.resize(rect, FieldKind::Qr, 50.0, 10.0).unwrap();
        assert!(approx(resized.width, 150.0));
        assert!(approx(resized.height, 150.0));

        let field = TemplateField::new(
            "QR",
            FieldKind::Qr,
            Some(FieldRect::new(0.0, 0.0, 200.0, 120.0)),
            canvas(),
        )
        .unwrap();
        assert!(approx(field.rect.width, field.rect.height));
    }

    #[test]
    fn qr_fields_never_drop_below_the_minimum_size() {
        let c = canvas();
        let flat = TemplateField::new(
            "QR",
            FieldKind::Qr,
            Some(FieldRect::new(0.0, 0.0, 200.0, 10.0)),
            c,
        )
        .unwrap();
        assert!(approx(flat.rect.width, 200.0));
        assert!(approx(flat.rect.height, 200.0));
        assert!(validate_rect(&flat.rect, c).is_ok());

        let viewport = Viewport::new(c, 2000.0).unwrap();
        let rect = FieldRect::new(10.0, 10.0, 100.0, 100.0);
        let shrunk = viewport.resize(rect, FieldKind::Qr, -1000.0, -1000.0).unwrap();
        assert!(approx(shrunk.width, MIN_FIELD_WIDTH));
        assert!(approx(shrunk.height, MIN_FIELD_WIDTH));
        assert!(validate_rect(&shrunk, c).is_ok());
    }

    #[test]
    fn validate_rejects_out_of_bounds() {
        let c = canvas();
        assert!(validate_rect(&FieldRect::new(0.0, 0.0, 100.0, 40.0), c).is_ok());
        assert!(validate_rect(&FieldRect::new(1950.0, 0.0, 100.0, 40.0), c).is_err());
        assert!(validate_rect(&FieldRect::new(-1.0, 0.0, 100.0, 40.0), c).is_err());
        assert!(validate_rect(&FieldRect::new(0.0, 0.0, 5.0, 40.0), c).is_err());
        assert!(validate_rect(&FieldRect::new(f64::NAN, 0.0, 100.0, 40.0), c).is_err());
    }

    #[test]
    fn default_rect_is_clamped_into_small_canvas() {
        let small = CanvasSize::new(150.0, 60.0).unwrap();
        let field = TemplateField::new("Name", FieldKind::Text, None, small).unwrap();
        assert!(validate_rect(&field.rect, small).is_ok());
    }

    #[test]
    fn font_size_has_a_floor() {
        assert!(approx(font_size_px(10.0), MIN_FONT_SIZE_PX));
        assert!(approx(font_size_px(100.0), 40.0));
    }

    #[test]
    fn rejects_degenerate_canvas_and_viewport() {
        assert!(CanvasSize::new(0.0, 10.0).is_err());
        assert!(Viewport::new(canvas(), 0.0).is_err());
    }
}
