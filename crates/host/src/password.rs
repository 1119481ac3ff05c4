//! Password hashing and verification.
//!
//! Stored hashes are self-describing: new hashes are Argon2id in PHC string
//! format, and legacy bcrypt (`$2…`) hashes verify transparently. The
//! plaintext only exists in memory until the hash is computed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("stored hash is malformed")]
    MalformedHash,
}

/// Hash a password with Argon2id and a fresh random salt.
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    use argon2::{
        Argon2, PasswordHasher,
        password_hash::{SaltString, rand_core::OsRng},
    };

    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| PasswordError::Hash(e.to_string()))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored hash, dispatching on the hash prefix.
///
/// Returns `false` for a mismatch; `Err` only when the stored hash itself
/// cannot be parsed.
pub fn verify_password(password: &str, stored: &str) -> Result<bool, PasswordError> {
    if stored.starts_with("$2") {
        return bcrypt::verify(password, stored).map_err(|_| PasswordError::MalformedHash);
    }

    use argon2::{Argon2, PasswordVerifier, password_hash::PasswordHash};
    let parsed = PasswordHash::new(stored).map_err(|_| PasswordError::MalformedHash)?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argon2_hash_roundtrip() {
        let hash = hash_password("secret").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("secret", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn hashes_are_salted() {
        let a = hash_password("secret").unwrap();
        let b = hash_password("secret").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn bcrypt_hash_verifies() {
        let hash = bcrypt::hash("secret", 4).unwrap();
        assert!(hash.starts_with("$2"));
        assert!(verify_password("secret", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn malformed_hash_is_an_error_not_a_match() {
        assert!(matches!(
            verify_password("secret", "not-a-hash"),
            Err(PasswordError::MalformedHash)
        ));
        assert!(matches!(
            verify_password("secret", "$2-bogus"),
            Err(PasswordError::MalformedHash)
        ));
    }
}
