// ABOUTME: OAuth module providing the authorization code flow for the local user
// ABOUTME: Includes the encrypted credential store, callback listener, token endpoint client, and manager

pub mod browser;
pub mod endpoint;
pub mod manager;
pub mod registry;
pub mod server;
pub mod store;
pub mod types;

pub use browser::{SystemBrowser, UrlOpener};
pub use endpoint::TokenEndpoint;
pub use manager::OAuthManager;
pub use registry::{CallbackFn, CallbackRegistry, CallbackResult};
pub use server::{CallbackServer, ServerState, DEFAULT_PORT_ATTEMPTS};
pub use store::CredentialStore;
pub use types::{
    AuthStatus, AuthorizationRequest, CredentialRecord, ExchangeOutcome, FlowFinish, FlowOutcome,
    LogoutOutcome, StatusKind, TokenResponse,
};
