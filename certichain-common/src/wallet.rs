//! Ethereum-compatible signing wallets.
//!
//! Issuers sign the canonical certificate payload with EIP-191 `personal_sign`
//! semantics so any Ethereum tooling can recover the issuer address from the
//! signature.

use k256::{
    ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
};
use rand::rngs::OsRng;

use crate::{
    canonical::keccak256,
    error::{CertError, CertResult},
};

const EIP191_PREFIX: &str = "\x19Ethereum Signed Message:\n";

/// A secp256k1 key able to produce EIP-191 signatures.
#[derive(Clone)]
pub struct SigningWallet {
    key: SigningKey,
}

impl std::fmt::Debug for SigningWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningWallet")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

impl SigningWallet {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    /// Load a wallet from a 32-byte hex private key (with or without `0x`).
    pub fn from_private_key_hex(value: &str) -> CertResult<Self> {
        let bytes = decode_hex(value)?;
        if bytes.len() != 32 {
            return Err(CertError::Wallet(format!(
                "private key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let key = SigningKey::from_slice(&bytes)
            .map_err(|err| CertError::Wallet(format!("invalid private key: {err}")))?;
        Ok(Self { key })
    }

    pub fn private_key_hex(&self) -> String {
        format!("0x{}", hex::encode(self.key.to_bytes()))
    }

    /// EIP-55 checksummed address.
    pub fn address(&self) -> String {
        address_of(self.key.verifying_key())
    }

    /// Sign `message` as `personal_sign` does; returns `0x` + 65 bytes hex.
    pub fn sign_message(&self, message: &[u8]) -> CertResult<String> {
        let digest = eip191_hash(message);
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(&digest)
            .map_err(|err| CertError::Wallet(format!("signing failed: {err}")))?;

        let mut out = Vec::with_capacity(65);
        out.extend_from_slice(&signature.to_bytes());
        out.push(recovery_id.to_byte() + 27);
        Ok(format!("0x{}", hex::encode(out)))
    }
}

/// Keccak-256 of the EIP-191 prefixed message.
pub fn eip191_hash(message: &[u8]) -> [u8; 32] {
    let mut prefixed = format!("{}{}", EIP191_PREFIX, message.len()).into_bytes();
    prefixed.extend_from_slice(message);
    keccak256(&prefixed)
}

/// Recover the checksummed signer address of an EIP-191 signature.
pub fn recover_address(message: &[u8], signature_hex: &str) -> CertResult<String> {
    let bytes = decode_hex(signature_hex).map_err(|err| CertError::Signature(err.to_string()))?;
    if bytes.len() != 65 {
        return Err(CertError::Signature(format!(
            "signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }

    let v = match bytes[64] {
        0 | 1 => bytes[64],
        27 | 28 => bytes[64] - 27,
        other => {
            return Err(CertError::Signature(format!(
                "unsupported recovery byte {other}"
            )))
        }
    };
    let recovery_id = RecoveryId::from_byte(v)
        .ok_or_else(|| CertError::Signature("invalid recovery id".into()))?;
    let signature = Signature::from_slice(&bytes[..64])
        .map_err(|err| CertError::Signature(format!("malformed signature: {err}")))?;

    let digest = eip191_hash(message);
    let key = VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id)
        .map_err(|err| CertError::Signature(format!("recovery failed: {err}")))?;
    Ok(address_of(&key))
}

/// True when `signature` recovers to `expected_address` (case-insensitive).
pub fn verify_signature(message: &[u8], signature: &str, expected_address: &str) -> bool {
    match recover_address(message, signature) {
        Ok(recovered) => recovered.eq_ignore_ascii_case(expected_address),
        Err(_) => false,
    }
}

pub fn is_address(value: &str) -> bool {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(body) => body.len() == 40 && body.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

/// Apply EIP-55 mixed-case checksumming to an address.
pub fn to_checksum_address(value: &str) -> CertResult<String> {
    if !is_address(value) {
        return Err(CertError::InvalidInput(format!(
            "'{value}' is not a 20-byte hex address"
        )));
    }
    let lower = value[2..].to_ascii_lowercase();
    let hash = keccak256(lower.as_bytes());

    let checksummed: String = lower
        .chars()
        .enumerate()
        .map(|(i, c)| {
            let nibble = (hash[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
            if c.is_ascii_alphabetic() && nibble >= 8 {
                c.to_ascii_uppercase()
            } else {
                c
            }
        })
        .collect();
    Ok(format!("0x{checksummed}"))
}

fn address_of(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let raw = format!("0x{}", hex::encode(&hash[12..]));
    // `raw` is always a well-formed address here.
    to_checksum_address(&raw).unwrap_or(raw)
}

fn decode_hex(value: &str) -> CertResult<Vec<u8>> {
    let trimmed = value.trim();
    let body = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    hex::decode(body).map_err(|err| CertError::InvalidInput(format!("invalid hex: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known test key from the web3 account documentation.
    const DOC_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
    const DOC_ADDRESS: &str = "0x2c7536E3605D9C16a7a3D7b1898e529396a65c23";
    const DOC_SIGNATURE: &str = "0xb91467e570a6466aa9e9876cbcd013baba02900b8979d43fe208a4a4f339f5fd6007e74cd82e037b800186422fc2da167c747ef045e5d18a5f5d4300f8e1a0291c";

    #[test]
    fn derives_known_address() {
        let wallet = SigningWallet::from_private_key_hex(DOC_KEY).unwrap();
        assert_eq!(wallet.address(), DOC_ADDRESS);
        assert_eq!(wallet.private_key_hex(), DOC_KEY);
    }

    #[test]
    fn eip191_hash_matches_reference() {
        assert_eq!(
            hex::encode(eip191_hash(b"Some data")),
            "1da44b586eb0729ff70a73c326926f6ed5a25f5b056e7f47fbc6e58d86871655"
        );
    }

    #[test]
    fn recovers_reference_signature() {
        let recovered = recover_address(b"Some data", DOC_SIGNATURE).unwrap();
        assert_eq!(recovered, DOC_ADDRESS);
    }

    #[test]
    fn sign_then_recover_returns_signer() {
        let wallet = SigningWallet::generate();
        let signature = wallet.sign_message(b"{\"certificateId\":\"CERT-1-ABCDEF\"}").unwrap();
        assert_eq!(signature.len(), 2 + 130);
        assert!(verify_signature(
            b"{\"certificateId\":\"CERT-1-ABCDEF\"}",
            &signature,
            &wallet.address().to_lowercase()
        ));
        assert!(!verify_signature(b"tampered", &signature, &wallet.address()));
    }

    #[test]
    fn rejects_short_signatures() {
        assert!(recover_address(b"x", "0x1234").is_err());
    }

    #[test]
    fn checksums_eip55_vectors() {
        for expected in [
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
            "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359",
            "0xdbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB",
        ] {
            assert_eq!(to_checksum_address(&expected.to_lowercase()).unwrap(), expected);
        }
        assert!(to_checksum_address("0x123").is_err());
    }
}
