//! Hashing helpers: code lookup hashes, content-addressed ids and request
//! fingerprints.

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::{EngineError, ResultEngine};

type HmacSha256 = Hmac<Sha256>;

/// Longest id accepted for values and transactions.
pub const MAX_ID_LEN: usize = 64;

/// Secret used to key code lookup hashes.
///
/// Codes are looked up by hash only; the plaintext is never stored by the
/// engine.
#[derive(Clone)]
pub struct CodeHasher {
    secret: Vec<u8>,
}

impl std::fmt::Debug for CodeHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeHasher").finish_non_exhaustive()
    }
}

impl CodeHasher {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Keyed lookup hash of a normalized code, hex encoded.
    pub fn hash(&self, normalized_code: &str) -> ResultEngine<String> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| EngineError::InvariantViolation("invalid code hash key".to_string()))?;
        mac.update(normalized_code.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl Default for CodeHasher {
    fn default() -> Self {
        Self::new(b"stored-value-dev-secret")
    }
}

/// NFC-normalizes and trims a code. Codes are case sensitive.
pub fn normalize_code(code: &str) -> ResultEngine<String> {
    let normalized: String = code.trim().nfc().collect();
    if normalized.is_empty() {
        return Err(EngineError::InvalidRequest(
            "code must not be empty".to_string(),
        ));
    }
    if normalized.chars().any(char::is_whitespace) {
        return Err(EngineError::InvalidRequest(
            "code must not contain whitespace".to_string(),
        ));
    }
    Ok(normalized)
}

/// Last four characters of a normalized code.
pub fn last_four(normalized_code: &str) -> String {
    let chars: Vec<char> = normalized_code.chars().collect();
    let start = chars.len().saturating_sub(4);
    chars[start..].iter().collect()
}

/// Display form of a code: `…ABCD`.
pub fn masked(last_four: &str) -> String {
    format!("…{last_four}")
}

/// Id of the per-contact Value (or link) derived from a generic code.
///
/// The same `(generic, contact)` pair always yields the same id.
pub fn derived_value_id(generic_value_id: &str, contact_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(generic_value_id.as_bytes());
    hasher.update(b"/");
    hasher.update(contact_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic id for the transaction that voids `transaction_id`.
pub fn void_transaction_id(transaction_id: &str) -> String {
    let candidate = format!("{transaction_id}-void");
    if candidate.len() <= MAX_ID_LEN {
        return candidate;
    }
    let digest = hex::encode(Sha256::digest(transaction_id.as_bytes()));
    format!("{}-void", &digest[..MAX_ID_LEN - 5])
}

/// Fingerprint of a request body, used to tell a replay from a collision.
pub fn request_hash<T: Serialize>(kind: &str, request: &T) -> ResultEngine<String> {
    let body = serde_json::to_vec(request)
        .map_err(|err| EngineError::InvalidRequest(format!("unserializable request: {err}")))?;
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b"\n");
    hasher.update(&body);
    Ok(hex::encode(hasher.finalize()))
}

/// Validates a caller supplied id.
pub fn validate_id(id: &str, label: &str) -> ResultEngine<()> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(EngineError::InvalidRequest(format!(
            "{label} id must be 1..={MAX_ID_LEN} characters"
        )));
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(EngineError::InvalidRequest(format!(
            "{label} id must not contain whitespace"
        )));
    }
    Ok(())
}
