//! Broker Auth
//!
//! Client-side credential manager for a broker's OAuth2-protected API.
//!
//! # Features
//!
//! - Interactive authorization-code consent with a one-shot local redirect
//!   listener (or a pasted redirect URL)
//! - CSRF `state` validation bound to each consent attempt
//! - Token persistence in a versioned envelope, written atomically with
//!   owner-only permissions
//! - Silent refresh with bounded exponential backoff
//! - Single-flight renewal: concurrent callers never race on refresh or open
//!   a second consent page
//!
//! # Example
//!
//! ```rust,ignore
//! use broker_auth::{app_credentials, CredentialProvider, ProviderSettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let credentials = app_credentials()
//!         .client_id("my-app-key")
//!         .client_secret("my-app-secret")
//!         .redirect_uri("http://127.0.0.1:8182/callback")
//!         .base_url("https://api.broker.example/v1/oauth")
//!         .build()?;
//!
//!     let provider = CredentialProvider::from_config(
//!         credentials,
//!         ProviderSettings::new("broker-token.json"),
//!     )?;
//!
//!     let token = provider.get_access_token().await?;
//!     println!("Authorization: {}", token.authorization_header());
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - `types`: credentials, settings, token record and redirect types
//! - `error`: error hierarchy, classification into [`ErrorKind`] and user messages
//! - `core`: HTTP transport, CSRF state, consent presentation
//! - `flows`: interactive authorization-code flow and redirect receivers
//! - `token`: token store, token endpoint client, refresher
//! - `resilience`: retry with backoff
//! - `builders`: fluent credentials builder
//! - `provider`: [`CredentialProvider`], the single entry point

pub mod builders;
pub mod core;
pub mod error;
pub mod flows;
pub mod provider;
pub mod resilience;
pub mod token;
pub mod types;

// Re-export main provider
pub use provider::CredentialProvider;

// Re-export builders
pub use builders::{app_credentials, AppCredentialsBuilder};

// Re-export errors
pub use error::{
    create_error_from_response, get_user_message, map_token_error, parse_error_response,
    AuthorizationError, ConfigurationError, CredentialError, CredentialResult, ErrorKind,
    NetworkError, OAuth2ErrorResponse, ProtocolError, ProviderError, StorageError, TokenError,
};

// Re-export types
pub use types::{
    // Config
    AppCredentials, ClientAuthMethod, GrantType, ProviderSettings, RedirectMode,
    DEFAULT_ACCESS_TOKEN_LIFETIME, DEFAULT_CLOCK_SKEW_TOLERANCE, DEFAULT_FLOW_TIMEOUT,
    DEFAULT_HTTP_TIMEOUT, DEFAULT_REFRESH_BUFFER, DEFAULT_TOKEN_FILE,
    // Token
    AccessToken, TokenInfo, TokenRecord, TokenResponse,
    // Callback
    AuthorizationState, CallbackParams,
};

// Re-export core components
pub use core::{
    // Transport
    HttpRequest, HttpResponse, HttpTransport, MockHttpTransport, ReqwestHttpTransport,
    // State
    generate_state, validate_state,
    // Presenter
    BrowserPresenter, ConsentPresenter, MockConsentPresenter, PrintPresenter,
};

// Re-export flows
pub use flows::{
    AuthorizationFlow, FlowOptions, FlowState, InteractiveAuthorizationFlow, LocalRedirectListener,
    ManualRedirectReceiver, MockAuthorizationFlow, RedirectReceiver,
};

// Re-export token management
pub use token::{
    FileTokenStore, HttpTokenRefresher, InMemoryTokenStore, MockTokenRefresher, MockTokenStore,
    PersistedRecordEnvelope, TokenEndpointClient, TokenRefresher, TokenStore,
};

// Re-export resilience
pub use resilience::{RetryConfig, RetryExecutor, RetryStats};
