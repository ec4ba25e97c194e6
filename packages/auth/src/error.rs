// ABOUTME: Error types for the OAuth flow and the encrypted credential store
// ABOUTME: Separates configuration, CSRF, corrupt-token, network, and port-exhaustion failures

use courier_config::ConfigError;
use courier_security::EncryptionError;
use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Error, Debug)]
pub enum AuthError {
    /// A required identifier or secret is missing. Never retried.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("State mismatch: CSRF protection failed")]
    StateMismatch,

    /// The token file exists but cannot be decrypted or parsed. The file is left in place.
    #[error("Stored credentials at {0} could not be decrypted; run login again")]
    CorruptToken(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("No free callback port after {attempts} attempts starting at {port}")]
    PortInUse { port: u16, attempts: u16 },

    /// The provider answered with a non-success status
    #[error("Provider rejected the request with status {status}{}", error_code_suffix(.error_code))]
    Provider {
        status: u16,
        error_code: Option<String>,
    },

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Callback server error: {0}")]
    CallbackServer(String),

    #[error("Failed to open browser: {0}")]
    BrowserOpen(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConfigError> for AuthError {
    fn from(err: ConfigError) -> Self {
        AuthError::Configuration(err.to_string())
    }
}

impl From<EncryptionError> for AuthError {
    fn from(err: EncryptionError) -> Self {
        match err {
            EncryptionError::SecretRequired => AuthError::Configuration(format!(
                "{} is required; refusing to store tokens without encryption",
                courier_config::constants::TOKEN_ENCRYPTION_KEY
            )),
            other => AuthError::Storage(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        // Strip the URL so query strings never end up in logs
        AuthError::Network(err.without_url().to_string())
    }
}

fn error_code_suffix(code: &Option<String>) -> String {
    code.as_ref()
        .map(|c| format!(" ({})", c))
        .unwrap_or_default()
}

impl AuthError {
    pub fn is_network(&self) -> bool {
        matches!(self, AuthError::Network(_))
    }
}
