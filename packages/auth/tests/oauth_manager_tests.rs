// ABOUTME: Integration tests for the OAuth manager
// ABOUTME: Tests URL building, CSRF rejection, code exchange, refresh-on-read, browser flow, status, and logout

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use courier_auth::{
    oauth::types::CredentialRecord, AuthError, AuthResult, ExchangeOutcome, FlowFinish,
    LogoutOutcome, OAuthManager, StatusKind, TokenEndpoint, UrlOpener,
};
use courier_config::AuthConfig;

/// Find a port that is free right now
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Helper to build a configuration pointing at the mock provider
fn test_config(temp_dir: &TempDir, provider_uri: &str, port: u16) -> AuthConfig {
    AuthConfig {
        client_id: Some("client-id".to_string()),
        client_secret: Some("client-secret".to_string()),
        redirect_uri: format!("http://localhost:{}/auth/callback", port),
        scopes: vec!["openid".to_string(), "email".to_string()],
        encryption_key: Some("s3cret".to_string()),
        token_storage_path: temp_dir.path().join("tokens.json"),
        auth_url: format!("{}/o/oauth2/auth", provider_uri),
        token_url: format!("{}/token", provider_uri),
        revoke_url: format!("{}/revoke", provider_uri),
        flow_timeout: Duration::from_secs(10),
        allow_stateless_callback: false,
    }
}

fn record(token_uri: &str, access_token: &str, expires_in_minutes: i64) -> CredentialRecord {
    CredentialRecord {
        access_token: access_token.to_string(),
        refresh_token: Some("RT1".to_string()),
        token_uri: token_uri.to_string(),
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
        scopes: vec!["openid".to_string()],
        expiry: Some(Utc::now() + chrono::Duration::minutes(expires_in_minutes)),
    }
}

fn query_value(url: &str, key: &str) -> Option<String> {
    Url::parse(url).ok().and_then(|url| {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    })
}

/// Plays the user's browser: follows the authorization URL straight back to
/// the redirect URI with a code and the state it was given
#[derive(Clone, Default)]
struct BrowserSimulator {
    opened: Arc<Mutex<Vec<String>>>,
}

impl UrlOpener for BrowserSimulator {
    fn open(&self, url: &str) -> AuthResult<()> {
        self.opened.lock().unwrap().push(url.to_string());

        let redirect_uri = query_value(url, "redirect_uri").unwrap();
        let state = query_value(url, "state").unwrap();
        let callback = format!(
            "{}?code=test-code&state={}",
            redirect_uri.replace("localhost", "127.0.0.1"),
            state
        );

        tokio::spawn(async move {
            let _ = reqwest::get(callback).await;
        });
        Ok(())
    }
}

/// A browser that never comes back
struct ClosedBrowser;

impl UrlOpener for ClosedBrowser {
    fn open(&self, _url: &str) -> AuthResult<()> {
        Err(AuthError::BrowserOpen("no display".to_string()))
    }
}

async fn mount_token_exchange(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=test-code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "AT1",
            "refresh_token": "RT1",
            "expires_in": 3600,
            "token_type": "Bearer",
            "scope": "openid email"
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_authorization_urls_have_distinct_states() {
    let temp_dir = TempDir::new().unwrap();
    let manager = OAuthManager::new(test_config(&temp_dir, "https://provider.test", 8000)).unwrap();
    let scopes = vec!["openid".to_string(), "email".to_string()];

    let first = manager.build_authorization_url(&scopes).unwrap();
    let second = manager.build_authorization_url(&scopes).unwrap();

    assert_ne!(first.state, second.state);
    assert_eq!(query_value(&first.url, "state"), Some(first.state.clone()));
    assert_eq!(query_value(&first.url, "client_id").as_deref(), Some("client-id"));
    assert_eq!(query_value(&first.url, "response_type").as_deref(), Some("code"));
    assert_eq!(query_value(&first.url, "scope").as_deref(), Some("openid email"));
    assert_eq!(query_value(&first.url, "access_type").as_deref(), Some("offline"));
    assert_eq!(query_value(&first.url, "prompt").as_deref(), Some("consent"));
    assert_eq!(
        query_value(&first.url, "redirect_uri").as_deref(),
        Some("http://localhost:8000/auth/callback")
    );
}

#[tokio::test]
async fn test_missing_client_credentials_is_configuration_error() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(&temp_dir, "https://provider.test", 8000);
    config.client_secret = None;
    let manager = OAuthManager::new(config).unwrap();

    let result = manager.build_authorization_url(&["openid".to_string()]);
    assert!(matches!(result, Err(AuthError::Configuration(_))));
}

#[tokio::test]
async fn test_missing_encryption_key_fails_at_construction() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(&temp_dir, "https://provider.test", 8000);
    config.encryption_key = None;

    assert!(matches!(
        OAuthManager::new(config),
        Err(AuthError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_exchange_with_unknown_state_is_rejected_before_network() {
    let provider = MockServer::start().await;
    mount_token_exchange(&provider, 0).await;

    let temp_dir = TempDir::new().unwrap();
    let manager = OAuthManager::new(test_config(&temp_dir, &provider.uri(), 8000)).unwrap();

    // Never stored
    let outcome = manager.exchange("test-code", "forged").await;
    assert_eq!(outcome, ExchangeOutcome::InvalidState);

    // Stored but different
    manager.authorization_url().unwrap();
    let outcome = manager.exchange("test-code", "forged").await;
    assert_eq!(outcome, ExchangeOutcome::InvalidState);

    assert!(!manager.store().exists());
}

#[tokio::test]
async fn test_process_authorization_code_stores_credentials_once() {
    let provider = MockServer::start().await;
    mount_token_exchange(&provider, 1).await;

    let temp_dir = TempDir::new().unwrap();
    let manager = OAuthManager::new(test_config(&temp_dir, &provider.uri(), 8000)).unwrap();

    let request = manager.authorization_url().unwrap();
    let message = manager
        .process_authorization_code("test-code", &request.state)
        .await;
    assert!(!message.starts_with("Error"));

    let stored = manager.store().load().unwrap().unwrap();
    assert_eq!(stored.access_token, "AT1");
    assert_eq!(stored.refresh_token.as_deref(), Some("RT1"));
    assert_eq!(stored.client_id, "client-id");
    assert_eq!(stored.token_uri, format!("{}/token", provider.uri()));
    assert_eq!(stored.scopes, vec!["openid".to_string(), "email".to_string()]);
    assert!(stored.expiry.unwrap() > Utc::now());

    // Replaying the same state is rejected without another exchange
    let replay = manager
        .process_authorization_code("test-code", &request.state)
        .await;
    assert_eq!(
        replay,
        "Error: Invalid state parameter. Authentication rejected."
    );
}

#[tokio::test]
async fn test_provider_rejection_stores_nothing() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(serde_json::json!({ "error": "invalid_grant" })),
        )
        .expect(1)
        .mount(&provider)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let manager = OAuthManager::new(test_config(&temp_dir, &provider.uri(), 8000)).unwrap();

    let request = manager.authorization_url().unwrap();
    let outcome = manager.exchange("test-code", &request.state).await;

    assert_eq!(outcome, ExchangeOutcome::ProviderRejected { status: 400 });
    assert!(outcome.to_string().starts_with("Error:"));
    assert!(!manager.store().exists());
}

#[tokio::test]
async fn test_get_credentials_refreshes_expired_record_once() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=RT1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "AT2",
            "expires_in": 3600,
            "token_type": "Bearer"
        })))
        .expect(1)
        .mount(&provider)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let manager = OAuthManager::new(test_config(&temp_dir, &provider.uri(), 8000)).unwrap();
    let expired = record(&format!("{}/token", provider.uri()), "AT1", -60);
    manager.store().store(&expired).unwrap();

    let credentials = manager.get_credentials().await.unwrap().unwrap();
    assert_eq!(credentials.access_token, "AT2");
    // The provider omitted a new refresh token, so the old one is kept
    assert_eq!(credentials.refresh_token.as_deref(), Some("RT1"));
    assert!(!credentials.is_expired());

    let persisted = manager.store().load().unwrap().unwrap();
    assert_eq!(persisted, credentials);
    assert!(persisted.expiry > expired.expiry);

    // Now valid: no further refresh
    let again = manager.get_credentials().await.unwrap().unwrap();
    assert_eq!(again.access_token, "AT2");
}

#[tokio::test]
async fn test_failed_refresh_returns_none_and_keeps_record() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(serde_json::json!({ "error": "invalid_grant" })),
        )
        .expect(1)
        .mount(&provider)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let manager = OAuthManager::new(test_config(&temp_dir, &provider.uri(), 8000)).unwrap();
    let expired = record(&format!("{}/token", provider.uri()), "AT1", -60);
    manager.store().store(&expired).unwrap();

    assert!(manager.get_credentials().await.unwrap().is_none());
    assert_eq!(manager.store().load().unwrap(), Some(expired));
}

#[tokio::test]
async fn test_refresh_network_error_is_retried_once() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "access_token": "AT2", "expires_in": 3600 }))
                .set_delay(Duration::from_millis(800)),
        )
        .expect(2)
        .mount(&provider)
        .await;

    let impatient = reqwest::Client::builder()
        .timeout(Duration::from_millis(200))
        .build()
        .unwrap();

    let temp_dir = TempDir::new().unwrap();
    let manager = OAuthManager::new(test_config(&temp_dir, &provider.uri(), 8000))
        .unwrap()
        .with_endpoint(TokenEndpoint::with_client(impatient));
    let expired = record(&format!("{}/token", provider.uri()), "AT1", -60);
    manager.store().store(&expired).unwrap();

    assert!(manager.get_credentials().await.unwrap().is_none());
    assert_eq!(manager.store().load().unwrap(), Some(expired));
}

#[tokio::test]
async fn test_refresh_server_error_is_not_retried() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&provider)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let manager = OAuthManager::new(test_config(&temp_dir, &provider.uri(), 8000)).unwrap();
    let expired = record(&format!("{}/token", provider.uri()), "AT1", -60);
    manager.store().store(&expired).unwrap();

    assert!(manager.get_credentials().await.unwrap().is_none());
    assert_eq!(manager.store().load().unwrap(), Some(expired));
}

#[tokio::test]
async fn test_refresh_with_out_of_range_lifetime_does_not_panic() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "AT2",
            "expires_in": i64::MAX
        })))
        .expect(1)
        .mount(&provider)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let manager = OAuthManager::new(test_config(&temp_dir, &provider.uri(), 8000)).unwrap();
    let expired = record(&format!("{}/token", provider.uri()), "AT1", -60);
    manager.store().store(&expired).unwrap();

    let credentials = manager.get_credentials().await.unwrap().unwrap();
    assert_eq!(credentials.access_token, "AT2");
    assert_eq!(credentials.expiry, None);
}

#[tokio::test]
async fn test_exchange_with_out_of_range_lifetime_stores_credentials() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "AT1",
            "refresh_token": "RT1",
            "expires_in": i64::MAX
        })))
        .expect(1)
        .mount(&provider)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let manager = OAuthManager::new(test_config(&temp_dir, &provider.uri(), 8000)).unwrap();
    let request = manager.authorization_url().unwrap();

    let outcome = manager.exchange("test-code", &request.state).await;
    assert_eq!(outcome, ExchangeOutcome::Authenticated);
    assert_eq!(manager.store().load().unwrap().unwrap().expiry, None);
}

#[tokio::test]
async fn test_valid_credentials_are_returned_without_refresh() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&provider)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let manager = OAuthManager::new(test_config(&temp_dir, &provider.uri(), 8000)).unwrap();
    let valid = record(&format!("{}/token", provider.uri()), "AT1", 60);
    manager.store().store(&valid).unwrap();

    assert_eq!(manager.get_credentials().await.unwrap(), Some(valid));
}

#[tokio::test]
async fn test_get_credentials_without_record() {
    let temp_dir = TempDir::new().unwrap();
    let manager = OAuthManager::new(test_config(&temp_dir, "https://provider.test", 8000)).unwrap();
    assert!(manager.get_credentials().await.unwrap().is_none());
}

#[tokio::test]
async fn test_browser_flow_end_to_end() {
    let provider = MockServer::start().await;
    mount_token_exchange(&provider, 1).await;

    let temp_dir = TempDir::new().unwrap();
    let port = free_port();
    let browser = BrowserSimulator::default();
    let manager = OAuthManager::new(test_config(&temp_dir, &provider.uri(), port))
        .unwrap()
        .with_opener(browser.clone());

    let outcome = manager.run_flow(Duration::from_secs(10)).await.unwrap();

    assert!(outcome.authenticated);
    assert_eq!(outcome.finish, FlowFinish::Completed);
    assert_eq!(outcome.port, port);
    assert!(!outcome.redirect_uri_mismatch);
    assert_eq!(browser.opened.lock().unwrap().len(), 1);

    let stored = manager.store().load().unwrap().unwrap();
    assert_eq!(stored.access_token, "AT1");

    // The listener is gone once the flow returns
    assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
}

#[tokio::test]
async fn test_occupied_redirect_port_flags_mismatch() {
    let temp_dir = TempDir::new().unwrap();
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let occupied = blocker.local_addr().unwrap().port();

    let manager = OAuthManager::new(test_config(&temp_dir, "https://provider.test", occupied))
        .unwrap()
        .with_opener(ClosedBrowser);

    let outcome = match manager.run_flow(Duration::from_secs(1)).await {
        Ok(outcome) => outcome,
        // The ports after an ephemeral one may all be taken on a busy machine
        Err(AuthError::PortInUse { .. }) => return,
        Err(e) => panic!("unexpected error: {}", e),
    };

    assert!(outcome.redirect_uri_mismatch);
    assert_ne!(outcome.port, occupied);
    assert!(!outcome.authenticated);
    assert_eq!(outcome.finish, FlowFinish::TimedOut);

    assert!(!manager.store().exists());
    drop(blocker);
}

#[tokio::test]
async fn test_timed_out_flow_rejects_late_callback() {
    let provider = MockServer::start().await;
    mount_token_exchange(&provider, 0).await;

    let temp_dir = TempDir::new().unwrap();
    let opened = BrowserRecorder::default();
    let manager = OAuthManager::new(test_config(&temp_dir, &provider.uri(), free_port()))
        .unwrap()
        .with_opener(opened.clone());

    let outcome = manager.run_flow(Duration::from_millis(300)).await.unwrap();
    assert_eq!(outcome.finish, FlowFinish::TimedOut);

    let url = opened.urls.lock().unwrap()[0].clone();
    let state = query_value(&url, "state").unwrap();
    assert_eq!(
        manager.exchange("test-code", &state).await,
        ExchangeOutcome::InvalidState
    );
}

/// Records the URL without following it
#[derive(Clone, Default)]
struct BrowserRecorder {
    urls: Arc<Mutex<Vec<String>>>,
}

impl UrlOpener for BrowserRecorder {
    fn open(&self, url: &str) -> AuthResult<()> {
        self.urls.lock().unwrap().push(url.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_logout_revokes_and_clears() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/revoke"))
        .and(body_string_contains("token=AT1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&provider)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let manager = OAuthManager::new(test_config(&temp_dir, &provider.uri(), 8000)).unwrap();
    manager
        .store()
        .store(&record(&format!("{}/token", provider.uri()), "AT1", 60))
        .unwrap();

    assert_eq!(
        manager.logout().await.unwrap(),
        LogoutOutcome::LoggedOut { revoked: true }
    );
    assert!(!manager.store().exists());

    assert_eq!(manager.logout().await.unwrap(), LogoutOutcome::NoSession);
}

#[tokio::test]
async fn test_logout_clears_even_when_revocation_fails() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/revoke"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&provider)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let manager = OAuthManager::new(test_config(&temp_dir, &provider.uri(), 8000)).unwrap();
    manager
        .store()
        .store(&record(&format!("{}/token", provider.uri()), "AT1", 60))
        .unwrap();

    assert_eq!(
        manager.logout().await.unwrap(),
        LogoutOutcome::LoggedOut { revoked: false }
    );
    assert!(!manager.store().exists());
}

#[tokio::test]
async fn test_auth_status_reports() {
    let provider = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    let manager = OAuthManager::new(test_config(&temp_dir, &provider.uri(), 8000)).unwrap();

    let status = manager.check_auth_status().await.unwrap();
    assert!(!status.authenticated);
    assert_eq!(status.status, StatusKind::NotAuthenticated);
    assert!(!status.next_steps.is_empty());

    manager
        .store()
        .store(&record(&format!("{}/token", provider.uri()), "AT1", 60))
        .unwrap();
    let status = manager.check_auth_status().await.unwrap();
    assert!(status.authenticated);
    assert_eq!(status.status, StatusKind::Valid);

    std::fs::write(manager.store().token_path(), "garbage").unwrap();
    let status = manager.check_auth_status().await.unwrap();
    assert!(!status.authenticated);
    assert_eq!(status.status, StatusKind::Unreadable);
    assert!(manager.store().exists());
}

#[tokio::test]
async fn test_auth_status_for_unrefreshable_record() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&provider)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let manager = OAuthManager::new(test_config(&temp_dir, &provider.uri(), 8000)).unwrap();
    manager
        .store()
        .store(&record(&format!("{}/token", provider.uri()), "AT1", -60))
        .unwrap();

    let status = manager.check_auth_status().await.unwrap();
    assert!(!status.authenticated);
    assert_eq!(status.status, StatusKind::Expired);
}
