//! Trust assessment of a stored certificate record.
//!
//! Four independent checks each contribute points to a trust score out of
//! 100. A certificate is `verified` only when both the payload integrity and
//! the issuer signature hold; the chain and ownership checks only move the
//! score.

use serde::{Deserialize, Serialize};

use crate::{
    canonical::keccak_hex,
    certificate::{CertificateRecord, CertificateStatus},
    wallet::recover_address,
};

const INTEGRITY_POINTS: u8 = 35;
const SIGNATURE_POINTS: u8 = 35;
const MINTED_POINTS: u8 = 20;
const MINT_PENDING_POINTS: u8 = 5;
const OWNERSHIP_POINTS: u8 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Verified,
    Tampered,
    Invalid,
    Unverified,
    Minted,
    Pending,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub message: String,
    #[serde(skip)]
    points: u8,
}

impl CheckResult {
    fn new(status: CheckStatus, points: u8, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            points,
        }
    }

    pub fn points(&self) -> u8 {
        self.points
    }

    pub fn passed(&self) -> bool {
        matches!(self.status, CheckStatus::Verified | CheckStatus::Minted)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assessment {
    pub verified: bool,
    pub trust_score: u8,
    pub data_integrity: CheckResult,
    pub issuer_signature: CheckResult,
    #[serde(rename = "blockchainNFT")]
    pub blockchain_nft: CheckResult,
    pub receiver_ownership: CheckResult,
}

/// Assess `record`.
///
/// `issuer_active` is false when the issuing instructor has been deactivated
/// or is unknown. `owner_wallet` is the claimant's known receiving wallet.
pub fn assess(
    record: &CertificateRecord,
    issuer_active: bool,
    owner_wallet: Option<&str>,
) -> Assessment {
    let data_integrity = check_integrity(record);
    let issuer_signature = check_signature(record, issuer_active);
    let blockchain_nft = check_chain(record);
    let receiver_ownership = check_ownership(record, owner_wallet);

    let trust_score = [
        &data_integrity,
        &issuer_signature,
        &blockchain_nft,
        &receiver_ownership,
    ]
    .iter()
    .map(|check| check.points())
    .sum::<u8>()
    .min(100);

    Assessment {
        verified: data_integrity.passed() && issuer_signature.passed(),
        trust_score,
        data_integrity,
        issuer_signature,
        blockchain_nft,
        receiver_ownership,
    }
}

fn check_integrity(record: &CertificateRecord) -> CheckResult {
    let hash_matches = keccak_hex(record.canonical_payload.as_bytes())
        .eq_ignore_ascii_case(&record.certificate_hash);
    let payload_matches = match record.data().canonical() {
        Ok(recomputed) => recomputed == record.canonical_payload,
        Err(_) => false,
    };

    if hash_matches && payload_matches {
        CheckResult::new(
            CheckStatus::Verified,
            INTEGRITY_POINTS,
            "Certificate data matches its recorded hash",
        )
    } else if !hash_matches {
        CheckResult::new(
            CheckStatus::Tampered,
            0,
            "Certificate hash does not match the signed payload",
        )
    } else {
        CheckResult::new(
            CheckStatus::Tampered,
            0,
            "Stored certificate fields differ from the signed payload",
        )
    }
}

fn check_signature(record: &CertificateRecord, issuer_active: bool) -> CheckResult {
    let recovered = recover_address(
        record.canonical_payload.as_bytes(),
        &record.issuer_signature,
    );
    match recovered {
        Ok(address) if address.eq_ignore_ascii_case(&record.issuer_wallet) => {
            if issuer_active {
                CheckResult::new(
                    CheckStatus::Verified,
                    SIGNATURE_POINTS,
                    format!("Signed by issuer wallet {address}"),
                )
            } else {
                CheckResult::new(
                    CheckStatus::Unverified,
                    0,
                    "Signature is valid but the issuer is no longer active",
                )
            }
        }
        Ok(address) => CheckResult::new(
            CheckStatus::Invalid,
            0,
            format!(
                "Signature recovers to {address}, expected {}",
                record.issuer_wallet
            ),
        ),
        Err(err) => CheckResult::new(CheckStatus::Invalid, 0, err.to_string()),
    }
}

fn check_chain(record: &CertificateRecord) -> CheckResult {
    match record.status {
        CertificateStatus::Minted => CheckResult::new(
            CheckStatus::Minted,
            MINTED_POINTS,
            format!("NFT minted on {}", record.chain),
        ),
        CertificateStatus::MintFailed => CheckResult::new(
            CheckStatus::Failed,
            0,
            record
                .mint_error
                .clone()
                .unwrap_or_else(|| "NFT minting failed".to_string()),
        ),
        CertificateStatus::AwaitingCredits => CheckResult::new(
            CheckStatus::Pending,
            MINT_PENDING_POINTS,
            "Waiting for the issuer to top up mint credits",
        ),
        CertificateStatus::Claimed | CertificateStatus::Minting | CertificateStatus::MintPending => {
            CheckResult::new(
                CheckStatus::Pending,
                MINT_PENDING_POINTS,
                "NFT minting is in progress",
            )
        }
    }
}

/// Strip a `<chain>:` prefix from a recipient locator.
fn bare_wallet(value: &str) -> &str {
    value.rsplit(':').next().unwrap_or(value)
}

fn check_ownership(record: &CertificateRecord, owner_wallet: Option<&str>) -> CheckResult {
    let Some(receipt) = record.mint.as_ref().filter(|_| record.is_minted()) else {
        return CheckResult::new(
            CheckStatus::Pending,
            0,
            "Ownership can be checked once the NFT is minted",
        );
    };
    let recipient = bare_wallet(&receipt.recipient_wallet);
    match owner_wallet {
        Some(owner) if bare_wallet(owner).eq_ignore_ascii_case(recipient) => CheckResult::new(
            CheckStatus::Verified,
            OWNERSHIP_POINTS,
            format!("NFT held by the recipient's wallet {recipient}"),
        ),
        Some(_) => CheckResult::new(
            CheckStatus::Unverified,
            0,
            "NFT is held by a wallet not linked to the recipient",
        ),
        None => CheckResult::new(
            CheckStatus::Unverified,
            0,
            "NFT is held in custody for the recipient's email",
        ),
    }
}
