//! Argon2id password hashing with opportunistic parameter upgrades.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier as _, SaltString},
    Algorithm, Argon2, Params, Version,
};
use once_cell::sync::OnceCell;
use rand::rngs::OsRng;
use tracing::warn;

/// Upper bound on accepted plaintext length, in bytes.
pub const MAX_PASSWORD_BYTES: usize = 1024;

const DUMMY_PASSWORD: &str = "gatehouse-timing-equalization";

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("password exceeds {MAX_PASSWORD_BYTES} bytes")]
    TooLong,
    #[error("password hashing failed: {0}")]
    Hash(String),
}

#[derive(Debug)]
pub struct PasswordHasher {
    params: Params,
    dummy: OnceCell<String>,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::with_params(default_params())
    }
}

#[cfg(not(test))]
fn default_params() -> Params {
    // m=19456 KiB, t=2, p=1
    Params::DEFAULT
}

#[cfg(test)]
fn default_params() -> Params {
    // Reduced cost so the test suite stays fast. Never used in release builds.
    Params::new(1024, 1, 1, None).unwrap_or_default()
}

impl PasswordHasher {
    #[must_use]
    pub fn with_params(params: Params) -> Self {
        Self {
            params,
            dummy: OnceCell::new(),
        }
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Hash `plaintext` with a fresh random salt into a PHC string.
    ///
    /// # Errors
    /// [`PasswordError::TooLong`] for input over [`MAX_PASSWORD_BYTES`].
    pub fn hash(&self, plaintext: &str) -> Result<String, PasswordError> {
        if plaintext.len() > MAX_PASSWORD_BYTES {
            return Err(PasswordError::TooLong);
        }
        let salt = SaltString::generate(&mut OsRng);
        self.argon2()
            .hash_password(plaintext.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| PasswordError::Hash(err.to_string()))
    }

    /// Check `plaintext` against a stored digest. The comparison itself is
    /// done by argon2 in constant time. Unparseable digests never verify.
    #[must_use]
    pub fn verify(&self, plaintext: &str, digest: &str) -> bool {
        if plaintext.len() > MAX_PASSWORD_BYTES {
            return false;
        }
        let parsed = match PasswordHash::new(digest) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("Stored password hash is not a valid PHC string: {err}");
                return false;
            }
        };
        // Verification uses the parameters encoded in the digest, so hashes
        // made with older settings still verify.
        Argon2::default()
            .verify_password(plaintext.as_bytes(), &parsed)
            .is_ok()
    }

    /// Burn one verification against a fixed digest so unknown identifiers
    /// take as long as wrong passwords.
    pub fn verify_dummy(&self, plaintext: &str) {
        match self.dummy.get_or_try_init(|| self.hash(DUMMY_PASSWORD)) {
            Ok(digest) => {
                let _ = self.verify(plaintext, digest);
            }
            Err(err) => warn!("Failed to prepare dummy password hash: {err}"),
        }
    }

    /// True when `digest` was not produced with the current algorithm,
    /// version and cost parameters.
    #[must_use]
    pub fn needs_rehash(&self, digest: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(digest) else {
            return true;
        };
        if parsed.algorithm != argon2::ARGON2ID_IDENT {
            return true;
        }
        if parsed.version != Some(Version::V0x13.into()) {
            return true;
        }
        match Params::try_from(&parsed) {
            Ok(params) => {
                params.m_cost() != self.params.m_cost()
                    || params.t_cost() != self.params.t_cost()
                    || params.p_cost() != self.params.p_cost()
            }
            Err(_) => true,
        }
    }
}
