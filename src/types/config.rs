//! Configuration Types
//!
//! Application credentials and provider settings.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::error::{ConfigurationError, CredentialError, CredentialResult};
use crate::resilience::RetryConfig;

/// Default buffer before `expires_at` at which a token counts as expired.
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(60);
/// Default deadline for the user to complete consent.
pub const DEFAULT_FLOW_TIMEOUT: Duration = Duration::from_secs(300);
/// Default timeout for token endpoint calls.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Default tolerated clock skew between this host and the token issuer.
pub const DEFAULT_CLOCK_SKEW_TOLERANCE: Duration = Duration::from_secs(300);
/// Lifetime assumed when the provider omits `expires_in`.
pub const DEFAULT_ACCESS_TOKEN_LIFETIME: Duration = Duration::from_secs(1800);
/// Default token file name.
pub const DEFAULT_TOKEN_FILE: &str = "broker-token.json";

/// Static application credentials registered with the broker.
///
/// Immutable for the process lifetime; build with
/// [`app_credentials()`](crate::app_credentials) or [`AppCredentials::from_env`].
#[derive(Clone)]
pub struct AppCredentials {
    pub(crate) client_id: String,
    pub(crate) client_secret: SecretString,
    pub(crate) redirect_uri: Url,
    pub(crate) authorize_endpoint: Url,
    pub(crate) token_endpoint: Url,
}

impl AppCredentials {
    /// Creates credentials from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `BROKER_CLIENT_ID` (required)
    /// - `BROKER_CLIENT_SECRET` (required)
    /// - `BROKER_REDIRECT_URI` (required)
    /// - `BROKER_AUTHORIZE_ENDPOINT` (required)
    /// - `BROKER_TOKEN_ENDPOINT` (required)
    pub fn from_env() -> CredentialResult<Self> {
        let mut builder = crate::builders::app_credentials();

        if let Ok(value) = std::env::var("BROKER_CLIENT_ID") {
            builder = builder.client_id(value);
        }
        if let Ok(value) = std::env::var("BROKER_CLIENT_SECRET") {
            builder = builder.client_secret(value);
        }
        if let Ok(value) = std::env::var("BROKER_REDIRECT_URI") {
            builder = builder.redirect_uri(value);
        }
        if let Ok(value) = std::env::var("BROKER_AUTHORIZE_ENDPOINT") {
            builder = builder.authorize_endpoint(value);
        }
        if let Ok(value) = std::env::var("BROKER_TOKEN_ENDPOINT") {
            builder = builder.token_endpoint(value);
        }

        builder.build()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub(crate) fn client_secret(&self) -> &str {
        self.client_secret.expose_secret()
    }

    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    pub fn authorize_endpoint(&self) -> &Url {
        &self.authorize_endpoint
    }

    pub fn token_endpoint(&self) -> &Url {
        &self.token_endpoint
    }
}

impl std::fmt::Debug for AppCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri.as_str())
            .field("authorize_endpoint", &self.authorize_endpoint.as_str())
            .field("token_endpoint", &self.token_endpoint.as_str())
            .finish()
    }
}

/// Client authentication method at the token endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// `client_id` and `client_secret` in the request body.
    ClientSecretPost,
    /// HTTP Basic Authentication header.
    #[default]
    ClientSecretBasic,
}

impl std::str::FromStr for ClientAuthMethod {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client_secret_post" | "post" => Ok(Self::ClientSecretPost),
            "client_secret_basic" | "basic" => Ok(Self::ClientSecretBasic),
            other => Err(ConfigurationError::InvalidConfig {
                message: format!("unknown client auth method: {}", other),
            }
            .into()),
        }
    }
}

/// Grant type sent to the token endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::RefreshToken => "refresh_token",
        }
    }
}

/// How the redirect carrying the authorization code reaches this process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectMode {
    /// One-shot HTTP listener on the redirect URI's host and port.
    #[default]
    LocalListener,
    /// The user pastes the redirected URL into the terminal.
    ManualPaste,
}

impl std::str::FromStr for RedirectMode {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_listener" | "listener" => Ok(Self::LocalListener),
            "manual_paste" | "manual" | "terminal" => Ok(Self::ManualPaste),
            other => Err(ConfigurationError::InvalidConfig {
                message: format!("unknown redirect mode: {}", other),
            }
            .into()),
        }
    }
}

impl RedirectMode {
    /// Check that `redirect_uri` can be received in this mode. The local
    /// listener serves plain http only.
    pub fn check_redirect_uri(&self, redirect_uri: &Url) -> CredentialResult<()> {
        match self {
            Self::LocalListener if redirect_uri.scheme() != "http" => {
                Err(ConfigurationError::InvalidConfig {
                    message: format!(
                        "the local listener serves plain http; use manual paste for {}",
                        redirect_uri
                    ),
                }
                .into())
            }
            _ => Ok(()),
        }
    }
}

/// Tunables of the credential provider.
#[derive(Clone, Debug)]
pub struct ProviderSettings {
    /// Token file location.
    pub token_path: PathBuf,
    /// A record is used only while `now < expires_at - refresh_buffer`.
    pub refresh_buffer: Duration,
    /// Deadline for the interactive consent step.
    pub flow_timeout: Duration,
    /// Timeout for token endpoint requests.
    pub http_timeout: Duration,
    /// Tolerated clock skew when trusting a persisted record.
    pub clock_skew_tolerance: Duration,
    /// Lifetime assumed when `expires_in` is missing.
    pub default_access_token_lifetime: Duration,
    /// Skip refresh and re-authorize once the refresh token is older than this.
    /// `None` waits for the provider to reject it.
    pub refresh_token_max_age: Option<Duration>,
    /// Backoff for transient token endpoint failures.
    pub retry: RetryConfig,
    /// Client authentication at the token endpoint.
    pub auth_method: ClientAuthMethod,
    /// How the redirect is received.
    pub redirect_mode: RedirectMode,
    /// Scopes requested on the consent page; empty sends none.
    pub scopes: Vec<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            token_path: PathBuf::from(DEFAULT_TOKEN_FILE),
            refresh_buffer: DEFAULT_REFRESH_BUFFER,
            flow_timeout: DEFAULT_FLOW_TIMEOUT,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            clock_skew_tolerance: DEFAULT_CLOCK_SKEW_TOLERANCE,
            default_access_token_lifetime: DEFAULT_ACCESS_TOKEN_LIFETIME,
            refresh_token_max_age: None,
            retry: RetryConfig::default(),
            auth_method: ClientAuthMethod::default(),
            redirect_mode: RedirectMode::default(),
            scopes: Vec::new(),
        }
    }
}

impl ProviderSettings {
    /// Creates settings for the given token file with defaults elsewhere.
    pub fn new(token_path: impl Into<PathBuf>) -> Self {
        Self {
            token_path: token_path.into(),
            ..Default::default()
        }
    }

    /// Overlays environment variables on the defaults.
    ///
    /// # Environment Variables
    ///
    /// - `BROKER_TOKEN_PATH`: token file location
    /// - `BROKER_REFRESH_BUFFER_SECS`
    /// - `BROKER_FLOW_TIMEOUT_SECS`
    /// - `BROKER_HTTP_TIMEOUT_SECS`
    /// - `BROKER_REFRESH_TOKEN_MAX_AGE_SECS`
    /// - `BROKER_AUTH_METHOD`: `basic` or `post`
    /// - `BROKER_REDIRECT_MODE`: `listener` or `manual`
    /// - `BROKER_SCOPES`: space separated
    pub fn from_env() -> CredentialResult<Self> {
        let mut settings = Self::default();

        if let Ok(path) = std::env::var("BROKER_TOKEN_PATH") {
            settings.token_path = PathBuf::from(path);
        }
        if let Some(secs) = env_secs("BROKER_REFRESH_BUFFER_SECS")? {
            settings.refresh_buffer = secs;
        }
        if let Some(secs) = env_secs("BROKER_FLOW_TIMEOUT_SECS")? {
            settings.flow_timeout = secs;
        }
        if let Some(secs) = env_secs("BROKER_HTTP_TIMEOUT_SECS")? {
            settings.http_timeout = secs;
        }
        if let Some(secs) = env_secs("BROKER_REFRESH_TOKEN_MAX_AGE_SECS")? {
            settings.refresh_token_max_age = Some(secs);
        }
        if let Ok(method) = std::env::var("BROKER_AUTH_METHOD") {
            settings.auth_method = method.parse()?;
        }
        if let Ok(mode) = std::env::var("BROKER_REDIRECT_MODE") {
            settings.redirect_mode = mode.parse()?;
        }
        if let Ok(scopes) = std::env::var("BROKER_SCOPES") {
            settings.scopes = scopes.split_whitespace().map(String::from).collect();
        }

        Ok(settings)
    }

    /// Sets the refresh buffer.
    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    /// Sets the consent deadline.
    pub fn with_flow_timeout(mut self, timeout: Duration) -> Self {
        self.flow_timeout = timeout;
        self
    }

    /// Sets the refresh token max age policy.
    pub fn with_refresh_token_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.refresh_token_max_age = max_age;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the client authentication method.
    pub fn with_auth_method(mut self, method: ClientAuthMethod) -> Self {
        self.auth_method = method;
        self
    }

    /// Sets the redirect mode.
    pub fn with_redirect_mode(mut self, mode: RedirectMode) -> Self {
        self.redirect_mode = mode;
        self
    }
}

fn env_secs(name: &str) -> CredentialResult<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| {
                ConfigurationError::InvalidConfig {
                    message: format!("{} must be a number of seconds, got {:?}", name, raw),
                }
                .into()
            }),
        Err(_) => Ok(None),
    }
}
