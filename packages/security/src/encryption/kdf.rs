// ABOUTME: Password-based key derivation with a per-installation salt file
// ABOUTME: PBKDF2-HMAC-SHA256 turns the user's encryption secret into a 256-bit key

use ring::{
    pbkdf2,
    rand::{SecureRandom, SystemRandom},
};
use std::io::ErrorKind;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::EncryptionError;
use crate::files;

/// Salt length in bytes
pub const SALT_LEN: usize = 16;

/// Derived key length in bytes (256 bits)
pub const KEY_LEN: usize = 32;

/// Salt file name, stored next to the token file
pub const SALT_FILE_NAME: &str = "encryption_salt";

const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(100_000) {
    Some(n) => n,
    None => panic!("iteration count must be non-zero"),
};

/// A derived symmetric key. Never printed.
#[derive(Clone)]
pub struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

/// Location of the salt file for a given token file
pub fn salt_path_for(token_path: &Path) -> PathBuf {
    match token_path.parent() {
        Some(parent) => parent.join(SALT_FILE_NAME),
        None => PathBuf::from(SALT_FILE_NAME),
    }
}

/// Derive a key from `secret` using the salt stored at `salt_path`, creating the
/// salt on first use.
pub fn derive_key(secret: &str, salt_path: &Path) -> Result<DerivedKey, EncryptionError> {
    if secret.is_empty() {
        return Err(EncryptionError::SecretRequired);
    }
    let salt = load_or_create_salt(salt_path)?;
    derive_key_with_salt(secret, &salt)
}

/// Deterministic PBKDF2 derivation from a secret and an explicit salt
pub fn derive_key_with_salt(secret: &str, salt: &[u8]) -> Result<DerivedKey, EncryptionError> {
    if secret.is_empty() {
        return Err(EncryptionError::SecretRequired);
    }
    if salt.len() != SALT_LEN {
        return Err(EncryptionError::InvalidSalt {
            expected: SALT_LEN,
            actual: salt.len(),
        });
    }

    let mut key = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        PBKDF2_ITERATIONS,
        salt,
        secret.as_bytes(),
        &mut key,
    );
    Ok(DerivedKey(key))
}

/// Read the installation salt, or create it atomically with owner-only permissions.
///
/// If another writer wins the creation race, its salt is used.
pub fn load_or_create_salt(salt_path: &Path) -> Result<Vec<u8>, EncryptionError> {
    match std::fs::read(salt_path) {
        Ok(salt) => {
            debug!("Using existing encryption salt at {}", salt_path.display());
            validate_salt(salt)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            if let Some(parent) = salt_path.parent() {
                files::ensure_private_dir(parent)?;
            }

            let salt = generate_salt()?;
            match files::create_private_file(salt_path, &salt) {
                Ok(()) => {
                    info!("Generated new encryption salt at {}", salt_path.display());
                    Ok(salt)
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!("Salt created concurrently, reading {}", salt_path.display());
                    validate_salt(std::fs::read(salt_path)?)
                }
                Err(e) => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn validate_salt(salt: Vec<u8>) -> Result<Vec<u8>, EncryptionError> {
    if salt.len() != SALT_LEN {
        return Err(EncryptionError::InvalidSalt {
            expected: SALT_LEN,
            actual: salt.len(),
        });
    }
    Ok(salt)
}

fn generate_salt() -> Result<Vec<u8>, EncryptionError> {
    let mut salt = vec![0u8; SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| EncryptionError::RandomGeneration("Failed to generate salt".to_string()))?;
    Ok(salt)
}
