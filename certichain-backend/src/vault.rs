//! Server-side sealing of wallet private keys.
//!
//! Keys are encrypted with AES-256-GCM under a process-held vault key. The
//! wallet address is bound in as associated data, so a sealed key copied onto
//! another wallet record fails to open.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use certichain_common::SigningWallet;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const NONCE_LEN: usize = 12;
const KDF_CONTEXT: &str = "certichain vault v1 wallet sealing key";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("failed to seal wallet key")]
    Seal,
    #[error("failed to open sealed key for {0}")]
    Open(String),
    #[error("sealed key record is malformed: {0}")]
    Malformed(String),
}

/// An encrypted private key as persisted next to its wallet record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    pub address: String,
    /// Hex-encoded 96-bit nonce.
    pub nonce: String,
    /// Base64 ciphertext including the GCM tag.
    pub ciphertext: String,
}

#[derive(Clone)]
pub struct KeyVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyVault { .. }")
    }
}

impl KeyVault {
    pub fn from_key_bytes(key: [u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    /// Build a vault from configuration: 32 bytes of hex are used directly,
    /// anything else is treated as a passphrase and stretched with BLAKE3.
    pub fn from_secret(secret: &str) -> Self {
        let trimmed = secret.trim();
        let body = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let key = match hex::decode(body) {
            Ok(bytes) if bytes.len() == 32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(&bytes);
                key
            }
            _ => blake3::derive_key(KDF_CONTEXT, trimmed.as_bytes()),
        };
        Self::from_key_bytes(key)
    }

    /// A random vault key that lives only as long as this process.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill(&mut key);
        Self::from_key_bytes(key)
    }

    pub fn seal(&self, wallet: &SigningWallet) -> Result<SealedKey, VaultError> {
        let address = wallet.address();
        let secret = wallet.private_key_hex();

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: secret.as_bytes(),
                    aad: address.as_bytes(),
                },
            )
            .map_err(|_| VaultError::Seal)?;

        Ok(SealedKey {
            address,
            nonce: hex::encode(nonce_bytes),
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    pub fn open(&self, sealed: &SealedKey) -> Result<SigningWallet, VaultError> {
        let nonce = hex::decode(&sealed.nonce)
            .map_err(|err| VaultError::Malformed(format!("nonce: {err}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(VaultError::Malformed(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        let ciphertext = STANDARD
            .decode(&sealed.ciphertext)
            .map_err(|err| VaultError::Malformed(format!("ciphertext: {err}")))?;

        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: sealed.address.as_bytes(),
                },
            )
            .map_err(|_| VaultError::Open(sealed.address.clone()))?;

        let secret = String::from_utf8(plaintext)
            .map_err(|_| VaultError::Malformed("key is not utf-8".into()))?;
        let wallet = SigningWallet::from_private_key_hex(&secret)
            .map_err(|err| VaultError::Malformed(err.to_string()))?;
        if !wallet.address().eq_ignore_ascii_case(&sealed.address) {
            return Err(VaultError::Open(sealed.address.clone()));
        }
        Ok(wallet)
    }
}
