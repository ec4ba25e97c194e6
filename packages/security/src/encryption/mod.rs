// ABOUTME: Token record encryption using ChaCha20-Poly1305 AEAD
// ABOUTME: Seals serialized credentials under a password-derived key with a random nonce per write
//
// SECURITY MODEL:
//
// - The key is derived from a user-supplied secret and a per-installation salt (see kdf.rs)
// - Every seal uses a fresh 96-bit random nonce, stored in front of the ciphertext
// - The Poly1305 tag detects tampering, truncation, and wrong keys alike
// - Output is base64 text, so a sealed record never parses as JSON
// - Losing the salt file makes existing ciphertext permanently unreadable

pub mod kdf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::{
    aead::{self, Aad, LessSafeKey, Nonce, UnboundKey},
    error::Unspecified,
    rand::{SecureRandom, SystemRandom},
};
use std::sync::Arc;

pub use kdf::DerivedKey;

/// Nonce size for ChaCha20-Poly1305
const NONCE_SIZE: usize = 12;

/// Associated data binding ciphertext to its purpose and format version
const TOKEN_AAD: &[u8] = b"courier-token-record-v1";

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("Failed to generate random data: {0}")]
    RandomGeneration(String),

    #[error("Failed to encrypt data: {0}")]
    Encryption(String),

    #[error("Failed to decrypt data: {0}")]
    Decryption(String),

    #[error("Invalid encrypted data format")]
    InvalidFormat,

    #[error("Encryption secret is required")]
    SecretRequired,

    #[error("Salt file is invalid: expected {expected} bytes, found {actual}")]
    InvalidSalt { expected: usize, actual: usize },

    #[error("Salt file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Unspecified> for EncryptionError {
    fn from(_: Unspecified) -> Self {
        EncryptionError::Encryption("Cryptographic operation failed".to_string())
    }
}

/// Authenticated cipher for serialized token records
pub struct TokenCipher {
    rng: Arc<SystemRandom>,
    key: DerivedKey,
}

impl TokenCipher {
    pub fn new(key: DerivedKey) -> Self {
        Self {
            rng: Arc::new(SystemRandom::new()),
            key,
        }
    }

    fn aead_key(&self) -> Result<LessSafeKey, EncryptionError> {
        let unbound_key = UnboundKey::new(&aead::CHACHA20_POLY1305, self.key.as_bytes())?;
        Ok(LessSafeKey::new(unbound_key))
    }

    /// Encrypt plaintext bytes.
    /// Returns base64-encoded: nonce || ciphertext || tag
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, EncryptionError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        self.rng.fill(&mut nonce_bytes).map_err(|_| {
            EncryptionError::RandomGeneration("Failed to generate nonce".to_string())
        })?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let sealing_key = self.aead_key()?;

        let mut in_out = plaintext.to_vec();
        sealing_key
            .seal_in_place_append_tag(nonce, Aad::from(TOKEN_AAD), &mut in_out)
            .map_err(|_| EncryptionError::Encryption("Seal operation failed".to_string()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + in_out.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&in_out);

        Ok(BASE64.encode(&result))
    }

    /// Decrypt output produced by [`TokenCipher::seal`].
    ///
    /// Any mismatch (wrong key, altered bytes, truncated input) is a `Decryption`
    /// or `InvalidFormat` error; garbled plaintext is never returned.
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, EncryptionError> {
        let encrypted_data = BASE64
            .decode(sealed.trim())
            .map_err(|_| EncryptionError::InvalidFormat)?;

        if encrypted_data.len() < NONCE_SIZE + aead::CHACHA20_POLY1305.tag_len() {
            return Err(EncryptionError::InvalidFormat);
        }

        let (nonce_bytes, ciphertext_and_tag) = encrypted_data.split_at(NONCE_SIZE);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| EncryptionError::InvalidFormat)?;

        let opening_key = self.aead_key()?;

        let mut in_out = ciphertext_and_tag.to_vec();
        let plaintext = opening_key
            .open_in_place(nonce, Aad::from(TOKEN_AAD), &mut in_out)
            .map_err(|_| EncryptionError::Decryption("Open operation failed".to_string()))?;

        Ok(plaintext.to_vec())
    }
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}
