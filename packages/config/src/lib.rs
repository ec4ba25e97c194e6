// ABOUTME: Configuration loading for Courier authentication
// ABOUTME: Exposes environment variable names and the AuthConfig loader

pub mod constants;

mod auth;

pub use auth::{expand_home, AuthConfig, ConfigError, DEFAULT_CALLBACK_PORT};
