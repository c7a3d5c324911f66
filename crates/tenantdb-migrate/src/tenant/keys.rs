//! Tenant key generation and hashing.
//!
//! A tenant key is a random 256-bit secret handed to the caller exactly
//! once. Only `SHA-256(salt || secret)` is persisted, alongside the salt,
//! so a database dump cannot be replayed as credentials.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

const SECRET_BYTES: usize = 32;
const SALT_BYTES: usize = 32;

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Generate a fresh tenant secret. Shown to the caller once, never stored.
pub fn generate_secret() -> String {
    random_hex(SECRET_BYTES)
}

/// Generate a per-key salt.
pub fn generate_salt() -> String {
    random_hex(SALT_BYTES)
}

/// Hash a secret under a salt. This is what the keys table stores and what
/// authentication compares against.
pub fn hash_secret(salt: &str, secret: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(secret.as_bytes());
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_hex_of_expected_length() {
        let secret = generate_secret();
        assert_eq!(secret.len(), SECRET_BYTES * 2);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_secrets_are_unique() {
        assert_ne!(generate_secret(), generate_secret());
    }

    #[test]
    fn test_hash_is_stable_and_salt_sensitive() {
        let secret = "deadbeef";
        let hash = hash_secret("salt-a", secret);
        assert_eq!(hash.len(), 32);
        assert_eq!(hash, hash_secret("salt-a", secret));
        assert_ne!(hash, hash_secret("salt-b", secret));
        assert_ne!(hash, hash_secret("salt-a", "cafebabe"));
    }
}
