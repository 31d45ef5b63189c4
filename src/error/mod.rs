//! Credential Error Types
//!
//! Error hierarchy for the credential subsystem. Every failure produced below
//! the [`CredentialProvider`](crate::CredentialProvider) is one of these
//! variants, and every variant classifies into exactly one [`ErrorKind`].

use std::time::Duration;
use thiserror::Error;

/// Root error type for the credential subsystem.
///
/// Errors are `Clone` so that a single renewal outcome can be handed to every
/// caller that waited on it.
#[derive(Error, Debug, Clone)]
pub enum CredentialError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Authorization error: {0}")]
    Authorization(#[from] AuthorizationError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// Classification every failure is translated into before it reaches a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No persisted credential exists.
    NotFound,
    /// A persisted credential exists but cannot be used.
    CorruptStore,
    /// The refresh token was rejected, expired or is unavailable.
    InvalidGrant,
    /// Network failure, timeout or provider 5xx/429.
    Transient,
    /// The user (or the provider on their behalf) refused consent.
    UserDenied,
    /// The redirect carried a `state` that does not belong to this attempt.
    CsrfMismatch,
    /// The redirect or pasted URL could not be read as a consent response.
    InvalidRedirect,
    /// The redirect listener could not bind or accept on its port.
    ListenerUnavailable,
    /// Nobody completed consent before the deadline.
    Timeout,
    /// The caller cancelled the interactive flow.
    Cancelled,
    /// Credentials or settings are malformed.
    Configuration,
    /// Another interactive flow is already awaiting consent.
    FlowInProgress,
    /// The provider rejected the code exchange with a non-retriable error.
    ExchangeFailed,
    /// The token file could not be written or removed.
    StorageFailure,
    /// The token endpoint answered with something that is not a token.
    ProtocolViolation,
}

impl ErrorKind {
    /// Whether invoking the operation again, unchanged, can succeed.
    pub fn retry_may_help(&self) -> bool {
        matches!(
            self,
            Self::Transient
                | Self::Timeout
                | Self::Cancelled
                | Self::CsrfMismatch
                | Self::InvalidRedirect
                | Self::ListenerUnavailable
                | Self::FlowInProgress
                | Self::UserDenied
                | Self::NotFound
                | Self::CorruptStore
                | Self::InvalidGrant
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotFound => "not_found",
            Self::CorruptStore => "corrupt_store",
            Self::InvalidGrant => "invalid_grant",
            Self::Transient => "transient",
            Self::UserDenied => "user_denied",
            Self::CsrfMismatch => "csrf_mismatch",
            Self::InvalidRedirect => "invalid_redirect",
            Self::ListenerUnavailable => "listener_unavailable",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Configuration => "configuration",
            Self::FlowInProgress => "flow_in_progress",
            Self::ExchangeFailed => "exchange_failed",
            Self::StorageFailure => "storage_failure",
            Self::ProtocolViolation => "protocol_violation",
        };
        f.write_str(name)
    }
}

impl CredentialError {
    /// Stable error code for logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "BROKER_AUTH_CONFIG",
            Self::Storage(_) => "BROKER_AUTH_STORAGE",
            Self::Authorization(_) => "BROKER_AUTH_AUTHORIZATION",
            Self::Token(_) => "BROKER_AUTH_TOKEN",
            Self::Network(_) => "BROKER_AUTH_NETWORK",
            Self::Protocol(_) => "BROKER_AUTH_PROTOCOL",
            Self::Provider(_) => "BROKER_AUTH_PROVIDER",
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Storage(e) => match e {
                StorageError::NotFound { .. } => ErrorKind::NotFound,
                StorageError::CorruptStore { .. } | StorageError::ReadFailed { .. } => {
                    ErrorKind::CorruptStore
                }
                StorageError::WriteFailed { .. } | StorageError::DeleteFailed { .. } => {
                    ErrorKind::StorageFailure
                }
            },
            Self::Authorization(e) => match e {
                AuthorizationError::AccessDenied { .. } => ErrorKind::UserDenied,
                AuthorizationError::InvalidCallback { .. } => ErrorKind::InvalidRedirect,
                AuthorizationError::StateMismatch { .. } => ErrorKind::CsrfMismatch,
                AuthorizationError::Timeout { .. } => ErrorKind::Timeout,
                AuthorizationError::Cancelled => ErrorKind::Cancelled,
                AuthorizationError::FlowInProgress => ErrorKind::FlowInProgress,
                AuthorizationError::ListenerFailed { .. } => ErrorKind::ListenerUnavailable,
            },
            Self::Token(e) => match e {
                TokenError::NoRefreshToken | TokenError::RefreshTokenTooOld { .. } => {
                    ErrorKind::InvalidGrant
                }
                TokenError::InvalidToken { .. } => ErrorKind::ProtocolViolation,
            },
            Self::Network(_) => ErrorKind::Transient,
            Self::Protocol(_) => ErrorKind::ProtocolViolation,
            Self::Provider(e) => match e {
                ProviderError::InvalidGrant { .. } => ErrorKind::InvalidGrant,
                ProviderError::ServerError { .. }
                | ProviderError::TemporarilyUnavailable { .. } => ErrorKind::Transient,
                _ => ErrorKind::ExchangeFailed,
            },
        }
    }

    /// Check if error is retryable with backoff.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Get retry-after duration if applicable.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Provider(ProviderError::TemporarilyUnavailable { retry_after }) => *retry_after,
            _ => None,
        }
    }

    /// The token endpoint rejected the application itself. Neither a refresh
    /// nor a new consent can succeed until the credentials are fixed.
    pub fn is_client_rejection(&self) -> bool {
        matches!(
            self,
            Self::Provider(
                ProviderError::InvalidClient { .. } | ProviderError::UnauthorizedClient { .. }
            )
        )
    }

    /// Check if error requires a new interactive authorization.
    pub fn needs_reauth(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NotFound | ErrorKind::CorruptStore | ErrorKind::InvalidGrant
        )
    }
}

/// Configuration error.
#[derive(Error, Debug, Clone)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Missing required field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid endpoint URL {url}: {message}")]
    InvalidEndpoint { url: String, message: String },
}

/// Token store error.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("No stored token at {path}")]
    NotFound { path: String },

    #[error("Token file {path} is unusable: {message}")]
    CorruptStore { path: String, message: String },

    #[error("Read failed: {message}")]
    ReadFailed { message: String },

    #[error("Write failed: {message}")]
    WriteFailed { message: String },

    #[error("Delete failed: {message}")]
    DeleteFailed { message: String },
}

/// Interactive authorization flow error.
#[derive(Error, Debug, Clone)]
pub enum AuthorizationError {
    #[error("Access denied: {error}")]
    AccessDenied {
        error: String,
        error_description: Option<String>,
    },

    #[error("State parameter mismatch (possible CSRF attack)")]
    StateMismatch { received: Option<String> },

    #[error("No redirect received within {waited:?}")]
    Timeout { waited: Duration },

    #[error("Authorization flow cancelled")]
    Cancelled,

    #[error("An authorization flow is already awaiting consent")]
    FlowInProgress,

    #[error("Invalid redirect: {message}")]
    InvalidCallback { message: String },

    #[error("Cannot listen on {address}: {message}")]
    ListenerFailed { address: String, message: String },
}

/// Token record error.
#[derive(Error, Debug, Clone)]
pub enum TokenError {
    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Refresh token is {age:?} old, past the configured maximum")]
    RefreshTokenTooOld { age: Duration },

    #[error("Invalid token: {message}")]
    InvalidToken { message: String },
}

/// Network/transport error.
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Request timeout after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Request failed: {message}")]
    RequestFailed { message: String },
}

/// Protocol/response parsing error.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Unexpected redirect to: {location}")]
    UnexpectedRedirect { location: String },

    #[error("Response too large: {size} bytes")]
    ResponseTooLarge { size: usize },

    #[error("Invalid JSON: {message}")]
    InvalidJson { message: String },
}

/// Token endpoint (authorization server) error.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Invalid client credentials")]
    InvalidClient { error_description: Option<String> },

    #[error("Invalid grant: {message}")]
    InvalidGrant { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Invalid scope: {scope}")]
    InvalidScope { scope: String },

    #[error("Unauthorized client for this grant type")]
    UnauthorizedClient { error_description: Option<String> },

    #[error("Unsupported grant type: {grant_type}")]
    UnsupportedGrantType { grant_type: String },

    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Server temporarily unavailable")]
    TemporarilyUnavailable { retry_after: Option<Duration> },
}

/// Result type for credential operations.
pub type CredentialResult<T> = Result<T, CredentialError>;

/// OAuth2 error response from the token endpoint.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct OAuth2ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub error_uri: Option<String>,
}

/// Map a token endpoint error body to an error type.
pub fn map_token_error(status: u16, response: &OAuth2ErrorResponse) -> ProviderError {
    let description = || {
        response
            .error_description
            .clone()
            .unwrap_or_else(|| response.error.clone())
    };

    match response.error.as_str() {
        "invalid_client" => ProviderError::InvalidClient {
            error_description: response.error_description.clone(),
        },
        "invalid_grant" => ProviderError::InvalidGrant {
            message: description(),
        },
        "invalid_scope" => ProviderError::InvalidScope {
            scope: response.error_description.clone().unwrap_or_default(),
        },
        "unauthorized_client" => ProviderError::UnauthorizedClient {
            error_description: response.error_description.clone(),
        },
        "unsupported_grant_type" => ProviderError::UnsupportedGrantType {
            grant_type: response.error_description.clone().unwrap_or_default(),
        },
        "server_error" => ProviderError::ServerError {
            status,
            message: description(),
        },
        "temporarily_unavailable" => ProviderError::TemporarilyUnavailable { retry_after: None },
        _ if status >= 500 => ProviderError::ServerError {
            status,
            message: description(),
        },
        _ => ProviderError::InvalidRequest {
            message: description(),
        },
    }
}

/// Parse error response from HTTP body.
pub fn parse_error_response(body: &str) -> Option<OAuth2ErrorResponse> {
    serde_json::from_str(body).ok()
}

/// Create error from a non-success token endpoint response.
pub fn create_error_from_response(status: u16, body: &str) -> CredentialError {
    if status == 429 {
        return CredentialError::Provider(ProviderError::TemporarilyUnavailable {
            retry_after: None,
        });
    }

    if let Some(response) = parse_error_response(body) {
        return CredentialError::Provider(map_token_error(status, &response));
    }

    let error = match status {
        400 => ProviderError::InvalidRequest {
            message: "Bad request".to_string(),
        },
        401 => ProviderError::InvalidClient {
            error_description: Some("Unauthorized".to_string()),
        },
        403 => ProviderError::UnauthorizedClient {
            error_description: Some("Forbidden".to_string()),
        },
        500..=599 => ProviderError::ServerError {
            status,
            message: format!("HTTP {}", status),
        },
        _ => ProviderError::InvalidRequest {
            message: format!("HTTP {}", status),
        },
    };

    CredentialError::Provider(error)
}

/// Get an actionable, user-facing message: what failed and whether retrying helps.
pub fn get_user_message(error: &CredentialError) -> String {
    match error.kind() {
        ErrorKind::NotFound => {
            "No saved broker session was found. Sign in through the browser to continue."
                .to_string()
        }
        ErrorKind::CorruptStore => {
            "The saved broker session file is unreadable and will be replaced. Sign in again."
                .to_string()
        }
        ErrorKind::InvalidGrant => {
            "Your broker session can no longer be renewed. Sign in again to continue.".to_string()
        }
        ErrorKind::Transient => {
            "The broker's authentication service could not be reached. Retrying later should help."
                .to_string()
        }
        ErrorKind::UserDenied => {
            "Access was not granted on the broker's consent page. Retry and approve the request."
                .to_string()
        }
        ErrorKind::CsrfMismatch => {
            "The sign-in response did not belong to this attempt and was rejected. Start a new sign-in."
                .to_string()
        }
        ErrorKind::InvalidRedirect => format!(
            "The sign-in response could not be read ({}). Retry and paste the complete address of the page you were redirected to.",
            error
        ),
        ErrorKind::ListenerUnavailable => format!(
            "The local sign-in listener is unavailable ({}). Another sign-in may be running; retry shortly or use manual paste.",
            error
        ),
        ErrorKind::Timeout => {
            "Sign-in was not completed in time. Retry and finish the consent page before the deadline."
                .to_string()
        }
        ErrorKind::Cancelled => "Sign-in was cancelled. Retry when ready.".to_string(),
        ErrorKind::Configuration => format!(
            "The broker application settings are invalid ({}). Fix the configuration; retrying will not help.",
            error
        ),
        ErrorKind::FlowInProgress => {
            "A sign-in is already waiting for consent. Finish it in the open browser window."
                .to_string()
        }
        ErrorKind::ExchangeFailed => format!(
            "The broker rejected the sign-in ({}). Check the application credentials; retrying will not help.",
            error
        ),
        ErrorKind::StorageFailure => format!(
            "The broker session could not be saved ({}). Check the token file location and permissions.",
            error
        ),
        ErrorKind::ProtocolViolation => {
            "The broker's authentication service returned an unexpected response. Retrying later may help."
                .to_string()
        }
    }
}
