// ABOUTME: HTTP client for the provider's token and revocation endpoints
// ABOUTME: Exchanges authorization codes, refreshes access tokens, and revokes tokens on logout

use std::time::Duration;

use reqwest::{Client, Response};
use serde::Deserialize;
use tracing::{debug, error};

use crate::{
    error::{AuthError, AuthResult},
    oauth::types::TokenResponse,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error payload shape used by OAuth2 token endpoints
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// Client for the remote token endpoint
#[derive(Debug, Clone)]
pub struct TokenEndpoint {
    client: Client,
}

impl Default for TokenEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenEndpoint {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Exchange an authorization code for tokens
    pub async fn exchange_code(
        &self,
        token_url: &str,
        code: &str,
        client_id: &str,
        client_secret: &str,
        redirect_uri: &str,
    ) -> AuthResult<TokenResponse> {
        debug!("Exchanging authorization code at {}", token_url);
        let response = self
            .client
            .post(token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await?;

        Self::token_response(response, "Token exchange").await
    }

    /// Obtain a new access token with a refresh token
    pub async fn refresh(
        &self,
        token_url: &str,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
    ) -> AuthResult<TokenResponse> {
        debug!("Refreshing access token at {}", token_url);
        let response = self
            .client
            .post(token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ])
            .send()
            .await?;

        Self::token_response(response, "Token refresh").await
    }

    /// Revoke a token. Succeeds only when the provider confirms.
    pub async fn revoke(&self, revoke_url: &str, token: &str) -> AuthResult<()> {
        let response = self
            .client
            .post(revoke_url)
            .form(&[("token", token)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::provider_error(response, "Token revocation").await);
        }
        Ok(())
    }

    async fn token_response(response: Response, operation: &str) -> AuthResult<TokenResponse> {
        if !response.status().is_success() {
            return Err(Self::provider_error(response, operation).await);
        }

        response.json::<TokenResponse>().await.map_err(|e| {
            AuthError::Network(format!(
                "Failed to parse {} response: {}",
                operation.to_lowercase(),
                e.without_url()
            ))
        })
    }

    async fn provider_error(response: Response, operation: &str) -> AuthError {
        let status = response.status();
        // Don't leak full response body - only the OAuth error code is kept
        let error_code = response
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|body| body.error);

        error!(
            "{} failed with status {} ({})",
            operation,
            status,
            error_code.as_deref().unwrap_or("no error code")
        );
        AuthError::Provider {
            status: status.as_u16(),
            error_code,
        }
    }
}
