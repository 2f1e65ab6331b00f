//! QR codes and the SVG rendering of a claimed certificate.

use std::fmt::Write as _;

use base64::{engine::general_purpose::STANDARD, Engine};
use certichain_common::{font_size_px, CanvasSize, CertificateRecord, FieldKind, FieldRect, Template};
use image::{codecs::png::PngEncoder, ExtendedColorType, ImageEncoder, Luma};
use qrcode::QrCode;
use thiserror::Error;

pub const QR_SIZE_PX: u32 = 256;
const CORNER_QR_PX: f64 = 120.0;
const CORNER_MARGIN_PX: f64 = 24.0;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("QR generation failed: {0}")]
    Qr(#[from] qrcode::types::QrError),
    #[error("PNG encoding failed: {0}")]
    Png(#[from] image::ImageError),
}

pub fn qr_png(data: &str, size: u32) -> Result<Vec<u8>, RenderError> {
    let code = QrCode::new(data.as_bytes())?;
    let image = code
        .render::<Luma<u8>>()
        .quiet_zone(true)
        .min_dimensions(size, size)
        .build();

    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes).write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        ExtendedColorType::L8,
    )?;
    Ok(bytes)
}

pub fn qr_base64(data: &str) -> Result<String, RenderError> {
    Ok(STANDARD.encode(qr_png(data, QR_SIZE_PX)?))
}

fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn push_text(svg: &mut String, rect: FieldRect, value: &str) {
    let _ = writeln!(
        svg,
        r#"  <text x="{:.1}" y="{:.1}" font-size="{:.1}" font-family="serif" text-anchor="middle" dominant-baseline="middle">{}</text>"#,
        rect.x + rect.width / 2.0,
        rect.y + rect.height / 2.0,
        font_size_px(rect.height),
        escape_xml(value)
    );
}

fn push_qr(svg: &mut String, rect: FieldRect, qr_b64: &str) {
    let _ = writeln!(
        svg,
        r#"  <image x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" href="data:image/png;base64,{}"/>"#,
        rect.x, rect.y, rect.width, rect.height, qr_b64
    );
}

/// Draw `record` onto its template. Without a template the certificate is
/// laid out on a plain fallback canvas. A QR code is always present: in the
/// template's QR fields, or in the bottom-right corner when it has none.
pub fn certificate_svg(record: &CertificateRecord, template: Option<&Template>) -> Result<String, RenderError> {
    let canvas = template.map(|t| t.canvas).unwrap_or_default();
    let qr_b64 = qr_base64(&record.qr_code_data)?;

    let mut svg = String::new();
    let _ = writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
        w = canvas.width,
        h = canvas.height
    );

    match template {
        Some(template) => {
            let _ = writeln!(
                svg,
                r#"  <image x="0" y="0" width="{}" height="{}" href="{}"/>"#,
                canvas.width,
                canvas.height,
                escape_xml(&template.image_url)
            );
            for field in &template.fields {
                match field.kind {
                    FieldKind::Text => {
                        let value = record
                            .field_data
                            .get(&field.label)
                            .map(String::as_str)
                            .unwrap_or_default();
                        push_text(&mut svg, field.rect, value);
                    }
                    FieldKind::Qr => push_qr(&mut svg, field.rect, &qr_b64),
                }
            }
            if !template.has_qr_field() {
                push_qr(&mut svg, corner_qr(canvas), &qr_b64);
            }
        }
        None => {
            let _ = writeln!(
                svg,
                r#"  <rect x="0" y="0" width="{}" height="{}" fill="white" stroke="black"/>"#,
                canvas.width, canvas.height
            );
            let line = |row: f64| FieldRect::new(0.0, canvas.height * row, canvas.width, 40.0);
            push_text(&mut svg, line(0.2), "Certificate of Completion");
            push_text(&mut svg, line(0.4), &record.recipient_name);
            push_text(&mut svg, line(0.55), &record.course_name);
            push_text(&mut svg, line(0.7), &format!("Issued by {}", record.issuer_name));
            push_text(&mut svg, line(0.8), &record.certificate_id);
            push_qr(&mut svg, corner_qr(canvas), &qr_b64);
        }
    }

    svg.push_str("</svg>\n");
    Ok(svg)
}

fn corner_qr(canvas: CanvasSize) -> FieldRect {
    let side = CORNER_QR_PX.min(canvas.width / 4.0).min(canvas.height / 4.0);
    FieldRect::new(
        (canvas.width - side - CORNER_MARGIN_PX).max(0.0),
        (canvas.height - side - CORNER_MARGIN_PX).max(0.0),
        side,
        side,
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use certichain_common::{verification_url, CertificateData, SigningWallet};
    use uuid::Uuid;

    use super::*;

    fn record(name: &str) -> CertificateRecord {
        let issuer = SigningWallet::generate();
        let data = CertificateData {
            certificate_id: "CERT-1700000000-ABC123".into(),
            recipient_name: name.into(),
            recipient_email: "r@example.com".into(),
            student_id: String::new(),
            course_name: "Course".into(),
            issuer_name: "Issuer".into(),
            issuer_wallet: issuer.address(),
            issue_date: "2024-01-01T00:00:00Z".into(),
            group_id: Uuid::nil().to_string(),
            verification_url: verification_url("http://localhost:3000", "CERT-1700000000-ABC123"),
            field_data: BTreeMap::from([("Full Name".to_string(), name.to_string())]),
        };
        CertificateRecord::issue(data, &issuer, Uuid::nil(), None, "polygon", None).unwrap()
    }

    #[test]
    fn qr_png_has_png_magic() {
        let png = qr_png("hello", 128).unwrap();
        assert!(png.starts_with(&[0x89, 0x50, 0x4E, 0x47]));
        assert!(!qr_base64("hello").unwrap().is_empty());
    }

    #[test]
    fn svg_places_field_values_and_escapes_them() {
        let mut template = Template::new(Uuid::nil(), "https://img.example/a.png?x=1&y=2", None);
        template.add_field("Full Name", FieldKind::Text, None).unwrap();
        template.add_field("Verify", FieldKind::Qr, None).unwrap();

        let svg = certificate_svg(&record("Tom & <Jerry>"), Some(&template)).unwrap();
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("Tom &amp; &lt;Jerry&gt;"));
        assert!(svg.contains("x=1&amp;y=2"));
        assert_eq!(svg.matches("data:image/png;base64,").count(), 1);
    }

    #[test]
    fn svg_without_template_uses_fallback_canvas() {
        let svg = certificate_svg(&record("Ada"), None).unwrap();
        assert!(svg.contains(r#"width="800" height="560""#));
        assert!(svg.contains("Ada"));
        assert!(svg.contains("data:image/png;base64,"));
    }
}
