// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Courier

// OAuth Client Configuration
pub const GOOGLE_CLIENT_ID: &str = "GOOGLE_CLIENT_ID";
pub const GOOGLE_CLIENT_SECRET: &str = "GOOGLE_CLIENT_SECRET";
pub const GOOGLE_REDIRECT_URI: &str = "GOOGLE_REDIRECT_URI";
pub const COURIER_AUTH_SCOPES: &str = "COURIER_AUTH_SCOPES";

// Provider Endpoints
pub const COURIER_AUTH_URL: &str = "COURIER_AUTH_URL";
pub const COURIER_TOKEN_URL: &str = "COURIER_TOKEN_URL";
pub const COURIER_REVOKE_URL: &str = "COURIER_REVOKE_URL";

// Token Storage
pub const TOKEN_ENCRYPTION_KEY: &str = "TOKEN_ENCRYPTION_KEY";
pub const TOKEN_STORAGE_PATH: &str = "TOKEN_STORAGE_PATH";

// Flow Behaviour
pub const COURIER_AUTH_TIMEOUT_SECS: &str = "COURIER_AUTH_TIMEOUT_SECS";
pub const COURIER_ALLOW_STATELESS_CALLBACK: &str = "COURIER_ALLOW_STATELESS_CALLBACK";
