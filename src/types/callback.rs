//! Redirect Types
//!
//! Parameters carried by the consent redirect and the per-attempt state
//! they are checked against.

use std::time::Duration;
use tokio::time::Instant;
use url::Url;

/// Query parameters of the redirect back from the consent page.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallbackParams {
    /// Authorization code (if success).
    pub code: Option<String>,
    /// State parameter.
    pub state: Option<String>,
    /// Error code (if consent failed).
    pub error: Option<String>,
    /// Error description.
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Parse parameters from a full redirect URL.
    pub fn from_url(url: &Url) -> Self {
        Self::from_pairs(url.query_pairs())
    }

    /// Parse parameters from a raw query string (without the leading `?`).
    pub fn from_query(query: &str) -> Self {
        Self::from_pairs(url::form_urlencoded::parse(query.as_bytes()))
    }

    /// Parse parameters from a URL string, as pasted by a user.
    pub fn from_url_str(url_str: &str) -> Result<Self, url::ParseError> {
        let url = Url::parse(url_str.trim())?;
        Ok(Self::from_url(&url))
    }

    fn from_pairs<'a>(
        pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
    ) -> Self {
        let mut params = Self::default();

        // First occurrence wins
        for (key, value) in pairs {
            let slot = match key.as_ref() {
                "code" => &mut params.code,
                "state" => &mut params.state,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }

        params
    }

    /// Check if redirect carries an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Check if redirect carries a code and no error.
    pub fn is_success(&self) -> bool {
        self.code.as_deref().is_some_and(|c| !c.is_empty()) && self.error.is_none()
    }
}

/// Per-attempt record of one interactive authorization.
///
/// Lives only in memory for the duration of the attempt and is never reused.
#[derive(Clone, Debug)]
pub struct AuthorizationState {
    /// Unpredictable value echoed back in the redirect's `state` parameter.
    pub csrf_nonce: String,
    /// Redirect URI sent on the consent page and again in the code exchange.
    pub expected_redirect_uri: Url,
    /// Point after which no redirect is accepted.
    pub deadline: Instant,
}

impl AuthorizationState {
    /// Start an attempt that expires `timeout` from now.
    pub fn new(csrf_nonce: String, expected_redirect_uri: Url, timeout: Duration) -> Self {
        Self {
            csrf_nonce,
            expected_redirect_uri,
            deadline: Instant::now() + timeout,
        }
    }

    /// Time left until the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}
