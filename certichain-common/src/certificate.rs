//! Certificate payloads, issuer signatures and stored records.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    canonical::{canonical_json, keccak_hex},
    error::CertResult,
    wallet::SigningWallet,
};

const STORAGE_CID_PREFIX: &str = "Qm";
const STORAGE_CID_BODY_LEN: usize = 40;
/// Token id reported by minting backends before the NFT lands on chain.
pub const PENDING_TOKEN_ID: &str = "pending";

/// The signed certificate payload. Key names are part of the signature and
/// must not change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateData {
    pub certificate_id: String,
    pub recipient_name: String,
    pub recipient_email: String,
    pub student_id: String,
    pub course_name: String,
    pub issuer_name: String,
    pub issuer_wallet: String,
    pub issue_date: String,
    pub group_id: String,
    pub verification_url: String,
    pub field_data: BTreeMap<String, String>,
}

impl CertificateData {
    pub fn canonical(&self) -> CertResult<String> {
        canonical_json(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    Claimed,
    AwaitingCredits,
    /// A mint call is in flight; `mint_started_at` says since when.
    Minting,
    MintPending,
    Minted,
    MintFailed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintReceipt {
    pub nft_id: String,
    pub token_id: String,
    pub transaction_hash: String,
    pub recipient_wallet: String,
    pub contract_address: String,
}

impl MintReceipt {
    pub fn is_pending(&self) -> bool {
        self.token_id == PENDING_TOKEN_ID
    }
}

/// Payload encoded into the certificate's QR code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrPayload {
    pub certificate_id: String,
    pub verification_url: String,
    pub certificate_hash: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub certificate_id: String,
    pub group_id: Uuid,
    pub template_id: Option<Uuid>,
    pub recipient_name: String,
    pub recipient_email: String,
    pub student_id: String,
    pub course_name: String,
    pub issuer_name: String,
    pub issuer_wallet: String,
    pub issue_date: String,
    pub verification_url: String,
    pub field_data: BTreeMap<String, String>,
    pub canonical_payload: String,
    pub certificate_hash: String,
    pub issuer_signature: String,
    pub qr_code_data: String,
    pub pdf_ipfs_cid: String,
    pub pdf_ipfs_url: String,
    pub chain: String,
    pub status: CertificateStatus,
    pub mint: Option<MintReceipt>,
    pub mint_error: Option<String>,
    pub mint_attempts: u32,
    pub claimed_by: Option<String>,
    pub claimed_at: DateTime<Utc>,
    pub minted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mint_started_at: Option<DateTime<Utc>>,
}

pub fn verification_url(app_url: &str, certificate_id: &str) -> String {
    format!("{}/verify/{}", app_url.trim_end_matches('/'), certificate_id)
}

/// Content id under which the rendered certificate is published.
pub fn storage_cid(certificate_id: &str) -> String {
    let body: String = certificate_id.chars().take(STORAGE_CID_BODY_LEN).collect();
    format!("{STORAGE_CID_PREFIX}{body}")
}

pub fn format_issue_date(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl CertificateRecord {
    /// Canonicalize, hash and sign `data`, producing a freshly claimed record.
    pub fn issue(
        data: CertificateData,
        issuer: &SigningWallet,
        group_id: Uuid,
        template_id: Option<Uuid>,
        chain: &str,
        claimed_by: Option<String>,
    ) -> CertResult<Self> {
        let canonical_payload = data.canonical()?;
        let certificate_hash = keccak_hex(canonical_payload.as_bytes());
        let issuer_signature = issuer.sign_message(canonical_payload.as_bytes())?;
        let qr_code_data = serde_json::to_string(&QrPayload {
            certificate_id: data.certificate_id.clone(),
            verification_url: data.verification_url.clone(),
            certificate_hash: certificate_hash.clone(),
        })?;
        let pdf_ipfs_cid = storage_cid(&data.certificate_id);
        let pdf_ipfs_url = format!("ipfs://{pdf_ipfs_cid}");

        Ok(Self {
            certificate_id: data.certificate_id,
            group_id,
            template_id,
            recipient_name: data.recipient_name,
            recipient_email: data.recipient_email,
            student_id: data.student_id,
            course_name: data.course_name,
            issuer_name: data.issuer_name,
            issuer_wallet: data.issuer_wallet,
            issue_date: data.issue_date,
            verification_url: data.verification_url,
            field_data: data.field_data,
            canonical_payload,
            certificate_hash,
            issuer_signature,
            qr_code_data,
            pdf_ipfs_cid,
            pdf_ipfs_url,
            chain: chain.to_string(),
            status: CertificateStatus::Claimed,
            mint: None,
            mint_error: None,
            mint_attempts: 0,
            claimed_by,
            claimed_at: Utc::now(),
            minted_at: None,
            mint_started_at: None,
        })
    }

    /// Rebuild the signed payload from the stored columns.
    pub fn data(&self) -> CertificateData {
        CertificateData {
            certificate_id: self.certificate_id.clone(),
            recipient_name: self.recipient_name.clone(),
            recipient_email: self.recipient_email.clone(),
            student_id: self.student_id.clone(),
            course_name: self.course_name.clone(),
            issuer_name: self.issuer_name.clone(),
            issuer_wallet: self.issuer_wallet.clone(),
            issue_date: self.issue_date.clone(),
            group_id: self.group_id.to_string(),
            verification_url: self.verification_url.clone(),
            field_data: self.field_data.clone(),
        }
    }

    pub fn is_minted(&self) -> bool {
        self.status == CertificateStatus::Minted
    }

    /// True while another worker holds the mint. A mint older than `lease`
    /// is considered abandoned and may be taken over.
    pub fn mint_in_flight(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        self.status == CertificateStatus::Minting
            && self.mint_started_at.map_or(false, |at| now - at < lease)
    }

    pub fn start_mint(&mut self, now: DateTime<Utc>) {
        self.status = CertificateStatus::Minting;
        self.mint_started_at = Some(now);
        self.mint_attempts += 1;
    }

    pub fn record_receipt(&mut self, receipt: MintReceipt) {
        self.status = if receipt.is_pending() {
            CertificateStatus::MintPending
        } else {
            CertificateStatus::Minted
        };
        if self.status == CertificateStatus::Minted {
            self.minted_at = Some(Utc::now());
        }
        self.mint = Some(receipt);
        self.mint_error = None;
        self.mint_started_at = None;
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.status = CertificateStatus::MintFailed;
        self.mint_error = Some(error.into());
        self.mint_started_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::recover_address;

    fn sample_data(issuer: &SigningWallet) -> CertificateData {
        let mut field_data = BTreeMap::new();
        field_data.insert("Full Name".to_string(), "Ada Lovelace".to_string());
        CertificateData {
            certificate_id: "CERT-1700000000-ABC123".into(),
            recipient_name: "Ada Lovelace".into(),
            recipient_email: "ada@example.com".into(),
            student_id: "S-1".into(),
            course_name: "Analytical Engines".into(),
            issuer_name: "Charles Babbage".into(),
            issuer_wallet: issuer.address(),
            issue_date: "2024-01-01T00:00:00Z".into(),
            group_id: Uuid::nil().to_string(),
            verification_url: verification_url("http://localhost:3000/", "CERT-1700000000-ABC123"),
            field_data,
        }
    }

    #[test]
    fn issue_signs_the_canonical_payload() {
        let issuer = SigningWallet::generate();
        let data = sample_data(&issuer);
        let record =
            CertificateRecord::issue(data.clone(), &issuer, Uuid::nil(), None, "polygon", None).unwrap();

        assert!(record.canonical_payload.starts_with("{\"certificateId\":"));
        assert_eq!(record.certificate_hash, keccak_hex(record.canonical_payload.as_bytes()));
        assert_eq!(
            recover_address(record.canonical_payload.as_bytes(), &record.issuer_signature).unwrap(),
            issuer.address()
        );
        assert_eq!(record.data(), data);
        assert_eq!(record.status, CertificateStatus::Claimed);
    }

    #[test]
    fn qr_payload_carries_hash_and_url() {
        let issuer = SigningWallet::generate();
        let record =
            CertificateRecord::issue(sample_data(&issuer), &issuer, Uuid::nil(), None, "polygon", None)
                .unwrap();
        let qr: QrPayload = serde_json::from_str(&record.qr_code_data).unwrap();
        assert_eq!(qr.certificate_hash, record.certificate_hash);
        assert_eq!(qr.verification_url, "http://localhost:3000/verify/CERT-1700000000-ABC123");
        assert!(record.qr_code_data.contains("\"certificateHash\""));
    }

    #[test]
    fn storage_cid_is_prefixed_and_truncated() {
        assert_eq!(storage_cid("CERT-1-ABCDEF"), "QmCERT-1-ABCDEF");
        let long = "X".repeat(64);
        assert_eq!(storage_cid(&long).len(), 2 + 40);
    }

    #[test]
    fn receipts_drive_status() {
        let issuer = SigningWallet::generate();
        let mut record =
            CertificateRecord::issue(sample_data(&issuer), &issuer, Uuid::nil(), None, "polygon", None)
                .unwrap();
        let mut receipt = MintReceipt {
            nft_id: "nft-1".into(),
            token_id: PENDING_TOKEN_ID.into(),
            transaction_hash: "pending".into(),
            recipient_wallet: "pending".into(),
            contract_address: "pending".into(),
        };
        record.record_receipt(receipt.clone());
        assert_eq!(record.status, CertificateStatus::MintPending);
        assert!(record.minted_at.is_none());

        record.record_failure("boom");
        assert_eq!(record.status, CertificateStatus::MintFailed);

        receipt.token_id = "42".into();
        record.record_receipt(receipt);
        assert!(record.is_minted());
        assert!(record.mint_error.is_none());
        assert!(record.minted_at.is_some());
    }

    #[test]
    fn in_flight_mint_expires_after_its_lease() {
        let issuer = SigningWallet::generate();
        let mut record =
            CertificateRecord::issue(sample_data(&issuer), &issuer, Uuid::nil(), None, "polygon", None)
                .unwrap();
        let started = Utc::now();
        let lease = Duration::minutes(10);
        assert!(!record.mint_in_flight(started, lease));

        record.start_mint(started);
        assert_eq!(record.status, CertificateStatus::Minting);
        assert_eq!(record.mint_attempts, 1);
        assert!(record.mint_in_flight(started + Duration::minutes(1), lease));
        assert!(!record.mint_in_flight(started + Duration::minutes(11), lease));

        record.record_failure("boom");
        assert!(record.mint_started_at.is_none());
        assert!(!record.mint_in_flight(started, lease));
    }
}
