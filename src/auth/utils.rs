//! Token generation, hashing and comparison helpers.

use base64::Engine;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::store::StoreError;

const TOKEN_BYTES: usize = 32;

/// Create a new opaque token (session id or CSRF token) with 256 bits of
/// entropy, base64url encoded without padding.
pub(crate) fn generate_token() -> Result<String, StoreError> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| StoreError::Crypto(err.to_string()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a session token so raw values never touch the database.
pub(crate) fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// Hash a client-supplied signal (IP or user agent). Missing values hash to a
/// fixed marker so "absent" is still comparable.
pub(crate) fn fingerprint(value: Option<&str>) -> Vec<u8> {
    let mut hasher = Sha256::new();
    match value {
        Some(value) => {
            hasher.update(b"v:");
            hasher.update(value.trim().as_bytes());
        }
        None => hasher.update(b"none"),
    }
    hasher.finalize().to_vec()
}

/// Constant-time equality for secrets. Length differences short-circuit,
/// which only leaks the (public) token length.
pub(crate) fn constant_time_eq(expected: &[u8], presented: &[u8]) -> bool {
    if expected.len() != presented.len() {
        return false;
    }
    expected.ct_eq(presented).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    #[test]
    fn generate_token_has_256_bits() {
        let decoded_len = generate_token()
            .ok()
            .and_then(|token| URL_SAFE_NO_PAD.decode(token.as_bytes()).ok())
            .map(|bytes| bytes.len());
        assert_eq!(decoded_len, Some(32));
    }

    #[test]
    fn generate_token_is_unique() {
        let first = generate_token().ok();
        let second = generate_token().ok();
        assert!(first.is_some());
        assert_ne!(first, second);
    }

    #[test]
    fn hash_token_stable() {
        assert_eq!(hash_token("token"), hash_token("token"));
        assert_ne!(hash_token("token"), hash_token("other"));
    }

    #[test]
    fn fingerprint_distinguishes_absent_from_empty() {
        assert_ne!(fingerprint(None), fingerprint(Some("")));
        assert_eq!(fingerprint(Some(" agent ")), fingerprint(Some("agent")));
    }

    #[test]
    fn constant_time_eq_compares_bytes() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(!constant_time_eq(b"", b"a"));
    }
}
