//! Consent Presentation
//!
//! Shows the consent page URL to the user.

use async_trait::async_trait;
use std::sync::Mutex;
use url::Url;

use crate::error::CredentialResult;

/// Presents the consent page (for dependency injection).
#[async_trait]
pub trait ConsentPresenter: Send + Sync {
    /// Direct the user to `url`. Must not wait for the user to finish.
    async fn present(&self, url: &Url) -> CredentialResult<()>;
}

/// Opens the system browser, printing the URL when that fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrowserPresenter;

#[async_trait]
impl ConsentPresenter for BrowserPresenter {
    async fn present(&self, url: &Url) -> CredentialResult<()> {
        eprintln!("Opening browser for broker sign-in...");
        if let Err(e) = open::that(url.as_str()) {
            tracing::warn!(error = %e, "Could not open browser");
            eprintln!("Could not open browser. Please visit:\n{}", url);
        }
        Ok(())
    }
}

/// Prints the URL for the user to open manually.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrintPresenter;

#[async_trait]
impl ConsentPresenter for PrintPresenter {
    async fn present(&self, url: &Url) -> CredentialResult<()> {
        eprintln!("Open this URL in a browser to sign in to the broker:\n{}", url);
        Ok(())
    }
}

type PresentHook = Box<dyn Fn(Url) + Send + Sync>;

/// Mock presenter for testing.
///
/// An optional hook stands in for the user; it receives the consent URL and
/// typically spawns a task that hits the redirect URI.
#[derive(Default)]
pub struct MockConsentPresenter {
    presented: Mutex<Vec<Url>>,
    hook: Mutex<Option<PresentHook>>,
}

impl MockConsentPresenter {
    /// Create new mock presenter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` every time a consent URL is presented.
    pub fn on_present(&self, hook: impl Fn(Url) + Send + Sync + 'static) -> &Self {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
        self
    }

    /// Get presented URLs.
    pub fn get_presented(&self) -> Vec<Url> {
        self.presented.lock().unwrap().clone()
    }

    /// Number of consent pages shown.
    pub fn present_count(&self) -> usize {
        self.presented.lock().unwrap().len()
    }
}

#[async_trait]
impl ConsentPresenter for MockConsentPresenter {
    async fn present(&self, url: &Url) -> CredentialResult<()> {
        self.presented.lock().unwrap().push(url.clone());
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(url.clone());
        }
        Ok(())
    }
}
