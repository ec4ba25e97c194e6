// ABOUTME: CLI commands for signing in to Google through the OAuth browser flow
// ABOUTME: Supports login, status, and logout against the encrypted local credential store

use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use colored::*;
use courier_auth::{FlowFinish, FlowOutcome, LogoutOutcome, OAuthManager, StatusKind};
use courier_config::AuthConfig;

#[derive(Subcommand)]
pub enum AuthCommands {
    /// Sign in through the browser and store encrypted credentials
    Login {
        /// Seconds to wait for the browser redirect (defaults to COURIER_AUTH_TIMEOUT_SECS)
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        timeout: Option<u64>,
    },

    /// Show whether stored credentials are usable, refreshing them if expired
    Status,

    /// Revoke the access token and delete stored credentials
    Logout,
}

impl AuthCommands {
    pub async fn execute(&self) -> anyhow::Result<()> {
        match self {
            AuthCommands::Login { timeout } => login_command(*timeout).await,
            AuthCommands::Status => status_command().await,
            AuthCommands::Logout => logout_command().await,
        }
    }
}

fn load_manager() -> anyhow::Result<OAuthManager> {
    let config = AuthConfig::from_env().context("Failed to load configuration")?;
    tracing::debug!("Loaded configuration: {:?}", config);
    OAuthManager::new(config).context("Failed to initialize OAuth manager")
}

async fn login_command(timeout: Option<u64>) -> anyhow::Result<()> {
    let manager = load_manager()?;
    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or(manager.config().flow_timeout);

    println!("{}", "🔐 Opening your browser to sign in...".bold().cyan());
    println!(
        "   Waiting up to {}s for the redirect to {}",
        timeout.as_secs(),
        manager.config().redirect_uri
    );
    println!();

    let outcome = manager.run_flow(timeout).await?;

    if outcome.redirect_uri_mismatch {
        eprintln!(
            "{} Listened on port {} because the configured port was busy; the redirect URI no longer matches",
            "⚠".yellow().bold(),
            outcome.port
        );
    }

    login_result(&outcome, timeout)?;
    println!("{} Successfully authenticated", "✓".green().bold());
    println!(
        "   Credentials stored at {}",
        manager.store().token_path().display()
    );
    Ok(())
}

/// Success only when this flow's callback completed and credentials now exist
fn login_result(outcome: &FlowOutcome, timeout: Duration) -> anyhow::Result<()> {
    match outcome.finish {
        FlowFinish::Completed if outcome.authenticated => Ok(()),
        FlowFinish::Completed => {
            bail!("Authentication failed; see the browser window or run with --verbose")
        }
        FlowFinish::TimedOut => bail!(
            "Timed out after {}s waiting for the browser redirect",
            timeout.as_secs()
        ),
        FlowFinish::ListenerExited => bail!("The callback listener stopped unexpectedly"),
    }
}

async fn status_command() -> anyhow::Result<()> {
    let manager = load_manager()?;

    println!("{}", "🔐 Authentication Status".bold().cyan());
    println!();

    let status = manager
        .check_auth_status()
        .await
        .context("Failed to get status")?;

    let status_icon = if status.authenticated {
        "✓".green().bold()
    } else {
        "✗".red().bold()
    };
    println!("  {} {}", status_icon, status.message);

    if let Some(expiry) = status.expiry {
        let expires = format_expiry(expiry);
        if status.status == StatusKind::Expired {
            println!("        Expires: {} {}", expires.red(), "(expired)".red());
        } else {
            println!("        Expires: {}", expires.green());
        }
    }
    println!(
        "        Token file: {}",
        manager.store().token_path().display()
    );

    if !status.next_steps.is_empty() {
        println!();
        for step in &status.next_steps {
            println!("  {} {}", "→".yellow(), step);
        }
    }

    Ok(())
}

async fn logout_command() -> anyhow::Result<()> {
    let manager = load_manager()?;

    println!("{}", "🔓 Logging out...".bold().cyan());

    match manager.logout().await.context("Logout failed")? {
        LogoutOutcome::NoSession => {
            println!("{} No active session to log out from", "•".dimmed());
        }
        LogoutOutcome::LoggedOut { revoked: true } => {
            println!("{} Token revoked and credentials removed", "✓".green().bold());
        }
        LogoutOutcome::LoggedOut { revoked: false } => {
            println!("{} Credentials removed", "✓".green().bold());
            println!(
                "  {} The provider did not confirm revocation; the token stays valid until it expires",
                "⚠".yellow()
            );
        }
    }

    Ok(())
}

fn format_expiry(expiry: DateTime<Utc>) -> String {
    expiry.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
