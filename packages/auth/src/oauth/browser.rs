// ABOUTME: Seam for opening the user's browser at the authorization URL
// ABOUTME: The default implementation launches the system browser through the open crate

use crate::error::{AuthError, AuthResult};

/// Something that can show a URL to the user
pub trait UrlOpener: Send + Sync {
    fn open(&self, url: &str) -> AuthResult<()>;
}

/// Opens URLs in the system default browser
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser;

impl UrlOpener for SystemBrowser {
    fn open(&self, url: &str) -> AuthResult<()> {
        open::that(url).map_err(|e| AuthError::BrowserOpen(e.to_string()))
    }
}
