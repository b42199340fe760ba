use crate::{DmsError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use ring::pbkdf2;
use sha2::{Digest, Sha256};
use std::num::NonZeroU32;

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;
const CREDENTIAL_LEN: usize = ring::digest::SHA256_OUTPUT_LEN;
const SALT_LEN: usize = 16;
const TOKEN_LEN: usize = 32; // 256 bits of entropy

/// PBKDF2 credential hasher.
///
/// Hash and salt are stored separately on the principal record; the same
/// verification path serves both login and e-signature re-verification.
#[derive(Clone, Copy)]
pub struct CredentialHasher {
    iterations: NonZeroU32,
}

impl CredentialHasher {
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations: NonZeroU32::new(iterations).unwrap_or(NonZeroU32::MIN),
        }
    }

    /// Hash a plaintext credential with a fresh random salt.
    /// Returns (hash, salt), both base64.
    pub fn hash(&self, credential: &str) -> Result<(String, String)> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        let mut out = [0u8; CREDENTIAL_LEN];
        pbkdf2::derive(
            PBKDF2_ALG,
            self.iterations,
            &salt,
            credential.as_bytes(),
            &mut out,
        );

        Ok((URL_SAFE_NO_PAD.encode(out), URL_SAFE_NO_PAD.encode(salt)))
    }

    /// Verify a plaintext credential against a stored hash and salt
    pub fn verify(&self, credential: &str, hash: &str, salt: &str) -> Result<bool> {
        let hash_bytes = URL_SAFE_NO_PAD.decode(hash).map_err(|e| DmsError::Config {
            message: format!("stored credential hash is not valid base64: {}", e),
        })?;
        let salt_bytes = URL_SAFE_NO_PAD.decode(salt).map_err(|e| DmsError::Config {
            message: format!("stored salt is not valid base64: {}", e),
        })?;

        Ok(pbkdf2::verify(
            PBKDF2_ALG,
            self.iterations,
            &salt_bytes,
            credential.as_bytes(),
            &hash_bytes,
        )
        .is_ok())
    }
}

/// Generate an opaque unguessable token (sessions, edit locks)
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 over exact byte content, lowercase hex.
///
/// Used as the optimistic-concurrency token for version content and as the
/// dedup key for attachment blobs.
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Minimum-length check applied when a credential is first set
pub fn validate_credential(credential: &str, min_length: usize) -> Result<()> {
    if credential.len() < min_length {
        return Err(DmsError::validation(
            "credential",
            format!("credential must be at least {} characters", min_length),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify_credential() {
        let hasher = CredentialHasher::new(1000);
        let (hash, salt) = hasher.hash("CorrectHorseBattery1!").unwrap();

        assert!(hasher.verify("CorrectHorseBattery1!", &hash, &salt).unwrap());
        assert!(!hasher.verify("WrongPassword", &hash, &salt).unwrap());
    }

    #[test]
    fn test_hashes_are_salted() {
        let hasher = CredentialHasher::new(1000);
        let (hash_a, salt_a) = hasher.hash("same-credential").unwrap();
        let (hash_b, salt_b) = hasher.hash("same-credential").unwrap();
        assert_ne!(salt_a, salt_b);
        assert_ne!(hash_a, hash_b);
    }

    #[test]
    fn test_token_entropy_and_uniqueness() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        // 32 url-safe base64 chars encode 192 bits; ours encodes 256
        assert!(a.len() >= 32);
    }

    #[test]
    fn test_content_hash_known_vector() {
        // SHA-256 of the empty string
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_content_hash_is_deterministic() {
        let h1 = content_hash(b"<h1>QC</h1>");
        let h2 = content_hash(b"<h1>QC</h1>");
        assert_eq!(h1, h2);
        assert_ne!(h1, content_hash(b"<h1>QC!</h1>"));
    }

    #[test]
    fn test_validate_credential_length() {
        assert!(validate_credential("short", 12).is_err());
        assert!(validate_credential("LongEnoughCredential", 12).is_ok());
    }
}
