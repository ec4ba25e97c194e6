// ABOUTME: Core type definitions for the OAuth flow and the stored credential record
// ABOUTME: Includes the persisted record, token endpoint responses, and flow/status outcomes

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// The credential record kept (encrypted) in the token file
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(rename = "token")]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    /// Check if the access token is expired with a 5-minute buffer.
    /// A record without an expiry is treated as valid.
    pub fn is_expired(&self) -> bool {
        match self.expiry {
            Some(expiry) => expiry < Utc::now() + Duration::minutes(5),
            None => false,
        }
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("token_uri", &self.token_uri)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("scopes", &self.scopes)
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// Token endpoint response (code exchange and refresh)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Absolute expiry from `expires_in`. An out-of-range lifetime is treated as no expiry.
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        let secs = self.expires_in?;
        let expiry = Duration::try_seconds(secs).and_then(|ttl| Utc::now().checked_add_signed(ttl));
        if expiry.is_none() {
            warn!("Ignoring out-of-range expires_in from token endpoint: {}", secs);
        }
        expiry
    }

    /// Space separated scopes granted by the provider, if reported
    pub fn granted_scopes(&self) -> Option<Vec<String>> {
        self.scope.as_ref().map(|s| {
            s.split_whitespace()
                .map(|scope| scope.to_string())
                .collect()
        })
    }
}

/// An authorization URL together with the state it carries
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// Result of exchanging an authorization code.
///
/// Failures render with an `Error:` prefix and never include secrets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Authenticated,
    InvalidState,
    MissingConfiguration(String),
    ProviderRejected { status: u16 },
    NetworkFailure,
    StorageFailed,
}

impl ExchangeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExchangeOutcome::Authenticated)
    }
}

impl fmt::Display for ExchangeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeOutcome::Authenticated => {
                write!(f, "Authentication successful! You can close this window.")
            }
            ExchangeOutcome::InvalidState => {
                write!(f, "Error: Invalid state parameter. Authentication rejected.")
            }
            ExchangeOutcome::MissingConfiguration(detail) => {
                write!(f, "Error: OAuth client is not configured ({})", detail)
            }
            ExchangeOutcome::ProviderRejected { status } => write!(
                f,
                "Error: Token exchange was rejected by the provider (status {})",
                status
            ),
            ExchangeOutcome::NetworkFailure => {
                write!(f, "Error: Could not reach the token endpoint")
            }
            ExchangeOutcome::StorageFailed => {
                write!(f, "Error: Credentials could not be saved")
            }
        }
    }
}

/// How the wait loop of a browser flow ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowFinish {
    Completed,
    ListenerExited,
    TimedOut,
}

/// Summary of one browser-based login attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowOutcome {
    pub authenticated: bool,
    /// Port the listener actually bound
    pub port: u16,
    /// True when the listener could not use the port of the configured redirect URI
    pub redirect_uri_mismatch: bool,
    pub finish: FlowFinish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Valid,
    Refreshed,
    Expired,
    NotAuthenticated,
    Unreadable,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StatusKind::Valid => "valid",
            StatusKind::Refreshed => "refreshed",
            StatusKind::Expired => "expired",
            StatusKind::NotAuthenticated => "not_authenticated",
            StatusKind::Unreadable => "unreadable",
        };
        f.write_str(label)
    }
}

/// Authentication status report for callers and the CLI
#[derive(Debug, Clone)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub status: StatusKind,
    pub message: String,
    pub next_steps: Vec<String>,
    pub expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutOutcome {
    NoSession,
    LoggedOut { revoked: bool },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(expiry: Option<DateTime<Utc>>) -> CredentialRecord {
        CredentialRecord {
            access_token: "AT1".to_string(),
            refresh_token: Some("RT1".to_string()),
            token_uri: "https://oauth2.googleapis.com/token".to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            scopes: vec!["a".to_string(), "b".to_string()],
            expiry,
        }
    }

    #[test]
    fn test_expiry_buffer() {
        assert!(record(Some(Utc::now() - Duration::hours(1))).is_expired());
        assert!(record(Some(Utc::now() + Duration::minutes(2))).is_expired());
        assert!(!record(Some(Utc::now() + Duration::hours(1))).is_expired());
        assert!(!record(None).is_expired());
    }

    #[test]
    fn test_record_serializes_access_token_as_token() {
        let json = serde_json::to_value(record(None)).unwrap();
        assert_eq!(json["token"], "AT1");
        assert!(json.get("access_token").is_none());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let rendered = format!("{:?}", record(None));
        assert!(!rendered.contains("AT1"));
        assert!(!rendered.contains("RT1"));
        assert!(!rendered.contains("secret\""));
    }

    #[test]
    fn test_granted_scopes_split_on_whitespace() {
        let response = TokenResponse {
            access_token: "AT".to_string(),
            refresh_token: None,
            expires_in: Some(3600),
            token_type: Some("Bearer".to_string()),
            scope: Some("openid email".to_string()),
        };
        assert_eq!(
            response.granted_scopes(),
            Some(vec!["openid".to_string(), "email".to_string()])
        );
        assert!(response.expiry().is_some());
    }

    #[test]
    fn test_out_of_range_expires_in_has_no_expiry() {
        let mut response = TokenResponse {
            access_token: "AT".to_string(),
            refresh_token: None,
            expires_in: Some(i64::MAX),
            token_type: None,
            scope: None,
        };
        assert_eq!(response.expiry(), None);

        response.expires_in = Some(i64::MIN);
        assert_eq!(response.expiry(), None);

        // Large but representable lifetimes are kept
        response.expires_in = Some(100 * 365 * 24 * 3600);
        assert!(response.expiry().is_some());
    }

    #[test]
    fn test_exchange_outcome_messages() {
        assert!(ExchangeOutcome::Authenticated.is_success());
        assert_eq!(
            ExchangeOutcome::InvalidState.to_string(),
            "Error: Invalid state parameter. Authentication rejected."
        );
        assert!(ExchangeOutcome::NetworkFailure.to_string().starts_with("Error:"));
    }
}
