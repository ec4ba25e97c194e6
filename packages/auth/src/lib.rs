// ABOUTME: Courier authentication library providing the OAuth2 authorization code flow
// ABOUTME: Acquires Google credentials through a loopback redirect and keeps them encrypted at rest

pub mod error;
pub mod oauth;

// Re-export main types
pub use error::{AuthError, AuthResult};
pub use oauth::{
    AuthStatus, AuthorizationRequest, CallbackRegistry, CallbackServer, CredentialRecord,
    CredentialStore, ExchangeOutcome, FlowFinish, FlowOutcome, LogoutOutcome, OAuthManager,
    StatusKind, SystemBrowser, TokenEndpoint, UrlOpener,
};
