// ABOUTME: OAuth client, endpoint, and token storage settings loaded from the environment
// ABOUTME: Secrets are kept optional at load time and enforced by the operations that need them

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::constants;

/// Port used when the redirect URI does not carry one explicitly
pub const DEFAULT_CALLBACK_PORT: u16 = 8000;

const DEFAULT_REDIRECT_URI: &str = "http://localhost:8000/auth/callback";
const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";
const DEFAULT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_TOKEN_DIR: &str = ".courier";
const DEFAULT_TOKEN_FILE: &str = "tokens.json";

const DEFAULT_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/gmail.send",
    "https://www.googleapis.com/auth/gmail.labels",
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/gmail.settings.basic",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
    "openid",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Settings for the OAuth flow and the encrypted token store
#[derive(Clone)]
pub struct AuthConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub encryption_key: Option<String>,
    pub token_storage_path: PathBuf,
    pub auth_url: String,
    pub token_url: String,
    pub revoke_url: String,
    pub flow_timeout: Duration,
    /// Let a callback listener dispatch to a callback registered under the empty state.
    /// Weakens CSRF protection. Flows started by the manager always register a
    /// state, so this only affects callers driving a `CallbackServer` directly.
    pub allow_stateless_callback: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            encryption_key: None,
            token_storage_path: default_token_path(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            revoke_url: DEFAULT_REVOKE_URL.to_string(),
            flow_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            allow_stateless_callback: false,
        }
    }
}

impl AuthConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    ///
    /// Empty values are treated the same as unset ones.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let defaults = Self::default();

        let redirect_uri = get(constants::GOOGLE_REDIRECT_URI).unwrap_or(defaults.redirect_uri);
        Url::parse(&redirect_uri).map_err(|e| ConfigError::Invalid {
            name: constants::GOOGLE_REDIRECT_URI,
            reason: e.to_string(),
        })?;

        let scopes = match get(constants::COURIER_AUTH_SCOPES) {
            Some(raw) => parse_scopes(&raw),
            None => defaults.scopes,
        };

        let token_storage_path = get(constants::TOKEN_STORAGE_PATH)
            .map(|p| expand_home(&p))
            .unwrap_or(defaults.token_storage_path);

        let flow_timeout = match get(constants::COURIER_AUTH_TIMEOUT_SECS) {
            Some(raw) => {
                let secs = raw.parse::<u64>().map_err(|e| ConfigError::Invalid {
                    name: constants::COURIER_AUTH_TIMEOUT_SECS,
                    reason: e.to_string(),
                })?;
                if secs == 0 {
                    return Err(ConfigError::Invalid {
                        name: constants::COURIER_AUTH_TIMEOUT_SECS,
                        reason: "timeout must be greater than zero".to_string(),
                    });
                }
                Duration::from_secs(secs)
            }
            None => defaults.flow_timeout,
        };

        let allow_stateless_callback = match get(constants::COURIER_ALLOW_STATELESS_CALLBACK) {
            Some(raw) => raw.parse::<bool>().map_err(|e| ConfigError::Invalid {
                name: constants::COURIER_ALLOW_STATELESS_CALLBACK,
                reason: e.to_string(),
            })?,
            None => false,
        };

        let config = Self {
            client_id: get(constants::GOOGLE_CLIENT_ID),
            client_secret: get(constants::GOOGLE_CLIENT_SECRET),
            redirect_uri,
            scopes,
            encryption_key: get(constants::TOKEN_ENCRYPTION_KEY),
            token_storage_path,
            auth_url: get(constants::COURIER_AUTH_URL).unwrap_or(defaults.auth_url),
            token_url: get(constants::COURIER_TOKEN_URL).unwrap_or(defaults.token_url),
            revoke_url: get(constants::COURIER_REVOKE_URL).unwrap_or(defaults.revoke_url),
            flow_timeout,
            allow_stateless_callback,
        };

        debug!("Loaded auth configuration: {:?}", config);
        Ok(config)
    }

    /// Client identifier and secret, both of which are mandatory for the OAuth flow
    pub fn client_credentials(&self) -> Result<(&str, &str), ConfigError> {
        let client_id = self
            .client_id
            .as_deref()
            .ok_or(ConfigError::Missing(constants::GOOGLE_CLIENT_ID))?;
        let client_secret = self
            .client_secret
            .as_deref()
            .ok_or(ConfigError::Missing(constants::GOOGLE_CLIENT_SECRET))?;
        Ok((client_id, client_secret))
    }

    /// Encryption secret for the token store
    pub fn encryption_secret(&self) -> Result<&str, ConfigError> {
        self.encryption_key
            .as_deref()
            .ok_or(ConfigError::Missing(constants::TOKEN_ENCRYPTION_KEY))
    }

    /// Local port the callback listener should try first.
    ///
    /// `Url` drops an explicit scheme default such as `:80`, so the raw
    /// authority is checked before falling back to `DEFAULT_CALLBACK_PORT`.
    pub fn redirect_port(&self) -> u16 {
        let Ok(url) = Url::parse(&self.redirect_uri) else {
            return DEFAULT_CALLBACK_PORT;
        };
        match url.port() {
            Some(port) => port,
            None if has_explicit_port(&self.redirect_uri) => url
                .port_or_known_default()
                .unwrap_or(DEFAULT_CALLBACK_PORT),
            None => DEFAULT_CALLBACK_PORT,
        }
    }

    /// Path component of the redirect URI, e.g. `/auth/callback`
    pub fn callback_path(&self) -> String {
        Url::parse(&self.redirect_uri)
            .map(|url| url.path().to_string())
            .unwrap_or_else(|_| "/auth/callback".to_string())
    }
}

/// True when the authority of `uri` ends in `:<digits>`
fn has_explicit_port(uri: &str) -> bool {
    let authority = uri
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(uri)
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("");
    match authority.rsplit_once(':') {
        Some((_, port)) => !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &redacted(&self.client_secret))
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("encryption_key", &redacted(&self.encryption_key))
            .field("token_storage_path", &self.token_storage_path)
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("revoke_url", &self.revoke_url)
            .field("flow_timeout", &self.flow_timeout)
            .field("allow_stateless_callback", &self.allow_stateless_callback)
            .finish()
    }
}

fn redacted(value: &Option<String>) -> &'static str {
    match value {
        Some(_) => "<redacted>",
        None => "<unset>",
    }
}

fn parse_scopes(raw: &str) -> Vec<String> {
    let mut scopes: Vec<String> = Vec::new();
    for scope in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !scopes.iter().any(|existing| existing == scope) {
            scopes.push(scope.to_string());
        }
    }
    scopes
}

fn default_token_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_TOKEN_DIR)
        .join(DEFAULT_TOKEN_FILE)
}

/// Expand a leading `~` to the user's home directory
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    match path.strip_prefix("~/") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => Path::new(path).to_path_buf(),
        },
        None => PathBuf::from(path),
    }
}
