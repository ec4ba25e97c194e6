// ABOUTME: Encrypted file-backed store for the single local credential record
// ABOUTME: Also holds the in-memory anti-CSRF state slot consumed on first successful verification

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use courier_config::AuthConfig;
use courier_security::{constant_time_eq, derive_key, files, salt_path_for, TokenCipher};
use tracing::{debug, error, info, warn};

use crate::{
    error::{AuthError, AuthResult},
    oauth::types::CredentialRecord,
};

/// Secure credential store
pub struct CredentialStore {
    token_path: PathBuf,
    cipher: TokenCipher,
    state: Mutex<Option<String>>,
}

impl CredentialStore {
    /// Open the store at `token_path`, deriving the key from `secret`.
    ///
    /// An empty secret is a configuration error; tokens are never written unencrypted.
    pub fn open(token_path: impl Into<PathBuf>, secret: &str) -> AuthResult<Self> {
        let token_path = token_path.into();
        let key = derive_key(secret, &salt_path_for(&token_path))?;
        debug!("Credential store ready at {}", token_path.display());

        Ok(Self {
            token_path,
            cipher: TokenCipher::new(key),
            state: Mutex::new(None),
        })
    }

    pub fn from_config(config: &AuthConfig) -> AuthResult<Self> {
        let secret = config.encryption_secret()?;
        Self::open(&config.token_storage_path, secret)
    }

    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    /// Encrypt and persist `record`, replacing any previous one
    pub fn store(&self, record: &CredentialRecord) -> AuthResult<()> {
        let plaintext = serde_json::to_vec(record)?;
        let sealed = self.cipher.seal(&plaintext)?;

        files::write_private_file(&self.token_path, sealed.as_bytes()).map_err(|e| {
            error!(
                "Failed to write token file {}: {}",
                self.token_path.display(),
                e
            );
            AuthError::Storage(format!(
                "Failed to write {}: {}",
                self.token_path.display(),
                e
            ))
        })?;

        info!("Stored credentials at {}", self.token_path.display());
        Ok(())
    }

    /// Load the stored record, or `None` if there is no token file.
    ///
    /// A file that cannot be decrypted or parsed is reported as `CorruptToken`
    /// and left on disk.
    pub fn load(&self) -> AuthResult<Option<CredentialRecord>> {
        let sealed = match std::fs::read_to_string(&self.token_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No token file at {}", self.token_path.display());
                return Ok(None);
            }
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                return Err(self.corrupt("token file is not valid text"));
            }
            Err(e) => return Err(e.into()),
        };

        let plaintext = self
            .cipher
            .open(&sealed)
            .map_err(|e| self.corrupt(&e.to_string()))?;

        let record: CredentialRecord = serde_json::from_slice(&plaintext)
            .map_err(|_| self.corrupt("decrypted record is not a credential record"))?;

        Ok(Some(record))
    }

    fn corrupt(&self, reason: &str) -> AuthError {
        warn!(
            "Token file {} is unreadable ({}); leaving it in place",
            self.token_path.display(),
            reason
        );
        AuthError::CorruptToken(self.token_path.display().to_string())
    }

    /// Delete the token file. Succeeds when there is nothing to delete.
    pub fn clear(&self) -> AuthResult<()> {
        match std::fs::remove_file(&self.token_path) {
            Ok(()) => {
                info!("Removed token file {}", self.token_path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AuthError::Storage(format!(
                "Failed to remove {}: {}",
                self.token_path.display(),
                e
            ))),
        }
    }

    pub fn exists(&self) -> bool {
        self.token_path.is_file()
    }

    /// Remember the state of the authorization attempt in flight
    pub fn store_state(&self, state: &str) {
        let mut slot = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(state.to_string());
        debug!("Stored OAuth state for pending authorization");
    }

    /// Forget any pending state, e.g. when a flow times out
    pub fn clear_state(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Check `candidate` against the stored state.
    ///
    /// Succeeds at most once per stored state: a match clears the slot.
    pub fn verify_state(&self, candidate: &str) -> bool {
        let mut slot = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let matches = match slot.as_deref() {
            Some(expected) if !expected.is_empty() && !candidate.is_empty() => {
                constant_time_eq(expected.as_bytes(), candidate.as_bytes())
            }
            _ => false,
        };

        if matches {
            *slot = None;
        }
        matches
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("token_path", &self.token_path)
            .finish_non_exhaustive()
    }
}
