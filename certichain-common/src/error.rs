//! Error types shared by the CertiChain crates.

use thiserror::Error;

/// Aggregated error type for the domain library.
#[derive(Debug, Error)]
pub enum CertError {
    /// Malformed or unknown join code.
    #[error("invalid join code: {0}")]
    InvalidJoinCode(String),

    /// Template geometry that does not fit the canvas.
    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    /// Key material or signature problems.
    #[error("wallet error: {0}")]
    Wallet(String),

    /// Signature bytes that cannot be parsed or recovered.
    #[error("invalid signature: {0}")]
    Signature(String),

    /// Wizard step prerequisites that are not met.
    #[error("wizard incomplete at {step}: {reason}")]
    Wizard { step: &'static str, reason: String },

    /// A template field with the same label already exists.
    #[error("duplicate field label: {0}")]
    DuplicateField(String),

    /// Lookup of a template field or record that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Generic validation error in inputs.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// JSON encoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CertError {
    /// Get a machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            CertError::InvalidJoinCode(_) => "INVALID_JOIN_CODE",
            CertError::InvalidLayout(_) => "INVALID_LAYOUT",
            CertError::Wallet(_) => "WALLET_ERROR",
            CertError::Signature(_) => "SIGNATURE_INVALID",
            CertError::Wizard { .. } => "WIZARD_INCOMPLETE",
            CertError::DuplicateField(_) => "DUPLICATE_FIELD",
            CertError::NotFound(_) => "NOT_FOUND",
            CertError::InvalidInput(_) => "INVALID_INPUT",
            CertError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Get HTTP status code suggestion.
    pub fn suggested_status_code(&self) -> u16 {
        match self {
            CertError::InvalidJoinCode(_) => 400,
            CertError::InvalidLayout(_) => 400,
            CertError::Wallet(_) => 500,
            CertError::Signature(_) => 400,
            CertError::Wizard { .. } => 409,
            CertError::DuplicateField(_) => 409,
            CertError::NotFound(_) => 404,
            CertError::InvalidInput(_) => 400,
            CertError::Serialization(_) => 500,
        }
    }
}

pub type CertResult<T> = Result<T, CertError>;
