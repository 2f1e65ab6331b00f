//! Join codes and certificate identifiers.

use rand::{distributions::Uniform, Rng};

use crate::error::{CertError, CertResult};

/// Alphabet shared by join codes and certificate id suffixes.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const JOIN_CODE_LEN: usize = 8;
const CERT_SUFFIX_LEN: usize = 6;
const CERT_PREFIX: &str = "CERT-";

fn random_code(len: usize) -> String {
    let dist = Uniform::from(0..CODE_ALPHABET.len());
    rand::thread_rng()
        .sample_iter(dist)
        .take(len)
        .map(|idx| CODE_ALPHABET[idx] as char)
        .collect()
}

fn is_code_char(c: char) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit()
}

/// Generate a random 8-character join code.
pub fn generate_join_code() -> String {
    random_code(JOIN_CODE_LEN)
}

/// Normalize user input into a join code.
///
/// Accepts the bare code in any case, or a pasted join link containing
/// `/join/<code>`.
pub fn normalize_join_code(input: &str) -> CertResult<String> {
    let trimmed = input.trim();
    let candidate = match trimmed.find("/join/") {
        Some(pos) => {
            let rest = &trimmed[pos + "/join/".len()..];
            rest.split(|c: char| c == '/' || c == '?' || c == '#')
                .next()
                .unwrap_or_default()
        }
        None => trimmed,
    };
    let code = candidate.to_ascii_uppercase();

    if code.len() != JOIN_CODE_LEN || !code.chars().all(is_code_char) {
        return Err(CertError::InvalidJoinCode(format!(
            "join code must be {} characters of A-Z and 0-9",
            JOIN_CODE_LEN
        )));
    }
    Ok(code)
}

/// Generate a certificate id of the form `CERT-{unix_secs}-{XXXXXX}`.
pub fn generate_certificate_id(unix_secs: i64) -> String {
    format!("{}{}-{}", CERT_PREFIX, unix_secs, random_code(CERT_SUFFIX_LEN))
}

pub fn is_certificate_id(value: &str) -> bool {
    let Some(rest) = value.strip_prefix(CERT_PREFIX) else {
        return false;
    };
    let Some((timestamp, suffix)) = rest.split_once('-') else {
        return false;
    };
    !timestamp.is_empty()
        && timestamp.chars().all(|c| c.is_ascii_digit())
        && suffix.len() == CERT_SUFFIX_LEN
        && suffix.chars().all(is_code_char)
}
