// ABOUTME: OAuth manager orchestrating the browser-based authorization code flow
// ABOUTME: Handles login, code exchange, transparent refresh, status, and logout

use std::sync::Arc;
use std::time::Duration;

use courier_config::AuthConfig;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    error::{AuthError, AuthResult},
    oauth::{
        browser::{SystemBrowser, UrlOpener},
        endpoint::TokenEndpoint,
        registry::{CallbackFn, CallbackRegistry, CallbackResult},
        server::CallbackServer,
        store::CredentialStore,
        types::{
            AuthStatus, AuthorizationRequest, CredentialRecord, ExchangeOutcome, FlowFinish,
            FlowOutcome, LogoutOutcome, StatusKind, TokenResponse,
        },
    },
};

/// Interval at which a running flow checks for completion
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// OAuth manager for the single local user.
///
/// Cloning is cheap and clones share the same credential store and state slot,
/// so construct one per process and hand out clones.
#[derive(Clone)]
pub struct OAuthManager {
    config: Arc<AuthConfig>,
    store: Arc<CredentialStore>,
    endpoint: TokenEndpoint,
    opener: Arc<dyn UrlOpener>,
}

impl OAuthManager {
    /// Create a manager from configuration.
    ///
    /// Fails immediately when the encryption secret is missing.
    pub fn new(config: AuthConfig) -> AuthResult<Self> {
        let store = CredentialStore::from_config(&config)?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: AuthConfig, store: CredentialStore) -> Self {
        Self {
            config: Arc::new(config),
            store: Arc::new(store),
            endpoint: TokenEndpoint::new(),
            opener: Arc::new(SystemBrowser),
        }
    }

    /// Replace how the authorization URL is shown to the user
    pub fn with_opener(mut self, opener: impl UrlOpener + 'static) -> Self {
        self.opener = Arc::new(opener);
        self
    }

    pub fn with_endpoint(mut self, endpoint: TokenEndpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Build an authorization URL with a fresh state for `scopes`.
    ///
    /// The state is returned for the caller to persist; nothing is stored here.
    pub fn build_authorization_url(&self, scopes: &[String]) -> AuthResult<AuthorizationRequest> {
        let (client_id, _) = self.config.client_credentials()?;

        let mut url = Url::parse(&self.config.auth_url)
            .map_err(|e| AuthError::Configuration(format!("Invalid auth URL: {}", e)))?;

        let state = nanoid::nanoid!(32);

        url.query_pairs_mut()
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &scopes.join(" "))
            .append_pair("state", &state)
            .append_pair("access_type", "offline")
            .append_pair("include_granted_scopes", "true")
            .append_pair("prompt", "consent");

        debug!("Built authorization URL for {} scopes", scopes.len());
        Ok(AuthorizationRequest {
            url: url.to_string(),
            state,
        })
    }

    /// Build an authorization URL for the configured scopes and remember its state.
    ///
    /// For callers that deliver the redirect themselves through
    /// [`OAuthManager::process_authorization_code`].
    pub fn authorization_url(&self) -> AuthResult<AuthorizationRequest> {
        let request = self.build_authorization_url(&self.config.scopes)?;
        self.store.store_state(&request.state);
        Ok(request)
    }

    /// Run the browser flow with the configured timeout
    pub async fn login(&self) -> AuthResult<FlowOutcome> {
        self.run_flow(self.config.flow_timeout).await
    }

    /// Authenticate through the system browser and a local callback listener.
    ///
    /// This will:
    /// 1. Build the authorization URL and remember its state
    /// 2. Register the code exchange for that state and start the listener
    /// 3. Open the browser
    /// 4. Wait until the callback completes, the listener dies, or `timeout` passes
    /// 5. Stop the listener
    pub async fn run_flow(&self, timeout: Duration) -> AuthResult<FlowOutcome> {
        info!("Starting OAuth authentication flow");

        let request = self.build_authorization_url(&self.config.scopes)?;
        let state = request.state.clone();

        let registry = CallbackRegistry::new();
        self.store.store_state(&state);
        registry.register(state.clone(), self.exchange_callback());

        let preferred_port = self.config.redirect_port();
        let mut server = CallbackServer::new(
            preferred_port,
            self.config.callback_path(),
            registry.clone(),
        )
        .with_stateless_fallback(self.config.allow_stateless_callback);

        let port = match server.start().await {
            Ok(port) => port,
            Err(e) => {
                registry.unregister(&state);
                self.store.clear_state();
                return Err(e);
            }
        };

        let redirect_uri_mismatch = port != preferred_port;
        if redirect_uri_mismatch {
            warn!("==============================================================");
            warn!("Port {} is already in use.", preferred_port);
            warn!("The callback listener is running on port {} instead.", port);
            warn!(
                "The configured redirect URI {} no longer matches and the provider",
                self.config.redirect_uri
            );
            warn!("will most likely redirect to a port nobody is listening on.");
            warn!("Free port {} or update the redirect URI and try again.", preferred_port);
            warn!("==============================================================");
        }

        if let Err(e) = self.opener.open(&request.url) {
            warn!("{}", e);
            warn!("Please open this URL in your browser: {}", request.url);
        }

        let deadline = Instant::now() + timeout;
        let finish = loop {
            if server.is_complete() {
                break FlowFinish::Completed;
            }
            if !server.is_running() {
                break FlowFinish::ListenerExited;
            }
            if Instant::now() >= deadline {
                break FlowFinish::TimedOut;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        server.stop().await;
        registry.unregister(&state);

        match finish {
            FlowFinish::Completed => debug!("OAuth callback completed"),
            FlowFinish::ListenerExited => {
                error!("Callback listener exited before receiving a callback");
                self.store.clear_state();
            }
            FlowFinish::TimedOut => {
                warn!("Timed out after {}s waiting for the OAuth callback", timeout.as_secs());
                self.store.clear_state();
            }
        }

        let authenticated = self.store.exists();
        if authenticated {
            info!("✅ Authentication completed successfully");
        } else {
            error!("Authentication failed: no credentials were stored");
        }

        Ok(FlowOutcome {
            authenticated,
            port,
            redirect_uri_mismatch,
            finish,
        })
    }

    fn exchange_callback(&self) -> CallbackFn {
        let manager = self.clone();
        Box::new(move |code, state| {
            async move {
                let outcome = manager.exchange(&code, &state).await;
                CallbackResult {
                    success: outcome.is_success(),
                    message: outcome.to_string(),
                }
            }
            .boxed()
        })
    }

    /// Exchange an authorization code after verifying its state.
    ///
    /// An unverified state is rejected before any network call.
    pub async fn exchange(&self, code: &str, state: &str) -> ExchangeOutcome {
        if !self.store.verify_state(state) {
            error!("Invalid OAuth state parameter - possible CSRF attack");
            return ExchangeOutcome::InvalidState;
        }
        info!("✅ State validated successfully");

        let (client_id, client_secret) = match self.config.client_credentials() {
            Ok(credentials) => credentials,
            Err(e) => {
                error!("Missing OAuth client credentials");
                return ExchangeOutcome::MissingConfiguration(e.to_string());
            }
        };

        let response = match self
            .endpoint
            .exchange_code(
                &self.config.token_url,
                code,
                client_id,
                client_secret,
                &self.config.redirect_uri,
            )
            .await
        {
            Ok(response) => response,
            Err(AuthError::Provider { status, .. }) => {
                return ExchangeOutcome::ProviderRejected { status };
            }
            Err(e) => {
                error!("Failed to exchange authorization code: {}", e);
                return ExchangeOutcome::NetworkFailure;
            }
        };

        let record = CredentialRecord {
            scopes: response
                .granted_scopes()
                .unwrap_or_else(|| self.config.scopes.clone()),
            expiry: response.expiry(),
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            token_uri: self.config.token_url.clone(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        };

        if let Err(e) = self.store.store(&record) {
            error!("Failed to store credentials: {}", e);
            return ExchangeOutcome::StorageFailed;
        }

        info!("Successfully processed authorization code and saved credentials");
        ExchangeOutcome::Authenticated
    }

    /// Exchange a code delivered outside the local listener, returning a status message
    pub async fn process_authorization_code(&self, code: &str, state: &str) -> String {
        self.exchange(code, state).await.to_string()
    }

    /// Get the stored credentials, refreshing them once if expired.
    ///
    /// A failed refresh yields `None` and leaves the stored record untouched.
    pub async fn get_credentials(&self) -> AuthResult<Option<CredentialRecord>> {
        let Some(record) = self.store.load()? else {
            debug!("No stored credentials");
            return Ok(None);
        };

        if !record.is_expired() {
            return Ok(Some(record));
        }

        info!("Access token is expired, refreshing");
        match self.refresh(&record).await {
            Ok(refreshed) => Ok(Some(refreshed)),
            Err(e) => {
                error!("Failed to refresh token: {}", e);
                Ok(None)
            }
        }
    }

    /// Refresh `record` and persist the result. Network errors are retried once.
    async fn refresh(&self, record: &CredentialRecord) -> AuthResult<CredentialRecord> {
        let refresh_token = record
            .refresh_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| AuthError::RefreshFailed("No refresh token available".to_string()))?;

        let response = match self.request_refresh(record, refresh_token).await {
            Err(e) if e.is_network() => {
                warn!("Token refresh hit a network error, retrying once: {}", e);
                self.request_refresh(record, refresh_token).await?
            }
            other => other?,
        };

        let refreshed = CredentialRecord {
            scopes: response
                .granted_scopes()
                .unwrap_or_else(|| record.scopes.clone()),
            expiry: response.expiry(),
            access_token: response.access_token,
            refresh_token: response
                .refresh_token
                .or_else(|| record.refresh_token.clone()),
            token_uri: record.token_uri.clone(),
            client_id: record.client_id.clone(),
            client_secret: record.client_secret.clone(),
        };

        self.store.store(&refreshed)?;
        info!("✅ Token refreshed successfully");
        Ok(refreshed)
    }

    async fn request_refresh(
        &self,
        record: &CredentialRecord,
        refresh_token: &str,
    ) -> AuthResult<TokenResponse> {
        self.endpoint
            .refresh(
                &record.token_uri,
                refresh_token,
                &record.client_id,
                &record.client_secret,
            )
            .await
    }

    /// Report whether usable credentials exist, refreshing an expired token
    pub async fn check_auth_status(&self) -> AuthResult<AuthStatus> {
        let record = match self.store.load() {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Ok(AuthStatus {
                    authenticated: false,
                    status: StatusKind::NotAuthenticated,
                    message: "Not authenticated.".to_string(),
                    next_steps: vec!["Run `courier auth login` to authenticate".to_string()],
                    expiry: None,
                });
            }
            Err(AuthError::CorruptToken(path)) => {
                return Ok(AuthStatus {
                    authenticated: false,
                    status: StatusKind::Unreadable,
                    message: format!(
                        "Stored credentials at {} could not be decrypted.",
                        path
                    ),
                    next_steps: vec![
                        "Check that TOKEN_ENCRYPTION_KEY matches the key used at login".to_string(),
                        "Or run `courier auth logout` and then `courier auth login`".to_string(),
                    ],
                    expiry: None,
                });
            }
            Err(e) => return Err(e),
        };

        if !record.is_expired() {
            return Ok(AuthStatus {
                authenticated: true,
                status: StatusKind::Valid,
                message: "Authentication is valid.".to_string(),
                next_steps: Vec::new(),
                expiry: record.expiry,
            });
        }

        match self.refresh(&record).await {
            Ok(refreshed) => Ok(AuthStatus {
                authenticated: true,
                status: StatusKind::Refreshed,
                message: "Authentication is valid. Token was refreshed.".to_string(),
                next_steps: Vec::new(),
                expiry: refreshed.expiry,
            }),
            Err(e) => {
                error!("Failed to refresh token: {}", e);
                Ok(AuthStatus {
                    authenticated: false,
                    status: StatusKind::Expired,
                    message: format!("Authentication expired and could not be refreshed: {}", e),
                    next_steps: vec![
                        "Run `courier auth login` to start a new authentication".to_string()
                    ],
                    expiry: record.expiry,
                })
            }
        }
    }

    /// Revoke the stored access token (best effort) and delete the token file
    pub async fn logout(&self) -> AuthResult<LogoutOutcome> {
        let record = match self.store.load() {
            Ok(record) => record,
            Err(AuthError::CorruptToken(path)) => {
                warn!("Removing unreadable credentials at {} without revoking", path);
                self.store.clear()?;
                return Ok(LogoutOutcome::LoggedOut { revoked: false });
            }
            Err(e) => return Err(e),
        };

        let Some(record) = record else {
            info!("No active session to log out from");
            return Ok(LogoutOutcome::NoSession);
        };

        let revoked = match self
            .endpoint
            .revoke(&self.config.revoke_url, &record.access_token)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to revoke token: {}", e);
                false
            }
        };

        self.store.clear()?;
        info!("✅ Successfully logged out");
        Ok(LogoutOutcome::LoggedOut { revoked })
    }

    /// Delete stored credentials without contacting the provider
    pub fn clear_token(&self) -> AuthResult<()> {
        self.store.clear()
    }
}

impl std::fmt::Debug for OAuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthManager")
            .field("config", &self.config)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
