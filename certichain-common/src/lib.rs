//! Shared domain types for CertiChain.
//!
//! Everything here is pure: identifiers, the canonical signed certificate
//! payload, EIP-191 wallets, template geometry, the group wizard, and the
//! trust assessment run by verifiers. Storage and HTTP live in
//! `certichain-backend`.

use std::{fs, path::Path};

use anyhow::{Context, Result};

pub mod canonical;
pub mod certificate;
pub mod error;
pub mod ids;
pub mod layout;
pub mod template;
pub mod verification;
pub mod wallet;
pub mod wizard;

pub use canonical::{canonical_json, keccak256, keccak_hex};
pub use certificate::{
    format_issue_date, storage_cid, verification_url, CertificateData, CertificateRecord,
    CertificateStatus, MintReceipt, QrPayload, PENDING_TOKEN_ID,
};
pub use error::{CertError, CertResult};
pub use ids::{
    generate_certificate_id, generate_join_code, is_certificate_id, normalize_join_code,
    JOIN_CODE_LEN,
};
pub use layout::{
    clamp_to_canvas, font_size_px, validate_rect, CanvasSize, FieldKind, FieldRect,
    TemplateField, Viewport, FALLBACK_CANVAS,
};
pub use template::{DisplayField, Template};
pub use verification::{assess, Assessment, CheckResult, CheckStatus};
pub use wallet::{
    eip191_hash, is_address, recover_address, to_checksum_address, verify_signature,
    SigningWallet,
};
pub use wizard::{
    ensure_deployable, Group, GroupStatus, WizardState, WizardStep, DEFAULT_MAX_LEARNERS,
    MAX_LEARNERS_LIMIT,
};

/// Write an exported certificate record as pretty JSON.
pub fn write_record(path: impl AsRef<Path>, record: &CertificateRecord) -> Result<()> {
    let json = serde_json::to_vec_pretty(record).context("failed to serialize certificate")?;
    fs::write(path.as_ref(), json).context("failed to write certificate file")
}

pub fn read_record(path: impl AsRef<Path>) -> Result<CertificateRecord> {
    let bytes = fs::read(path.as_ref()).context("failed to read certificate file")?;
    serde_json::from_slice(&bytes).context("failed to parse certificate json")
}
