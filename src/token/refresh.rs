//! Token Refresh
//!
//! Exchanges a refresh token for a new record without user interaction.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{CredentialError, CredentialResult, ProviderError, TokenError};
use crate::token::TokenEndpointClient;
use crate::types::TokenRecord;

/// Token refresher interface.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// One refresh attempt. `InvalidGrant` means the refresh token is dead;
    /// `Transient` failures may be retried by the caller.
    async fn refresh(&self, record: &TokenRecord) -> CredentialResult<TokenRecord>;
}

/// Refresher backed by the token endpoint.
pub struct HttpTokenRefresher {
    endpoint: Arc<TokenEndpointClient>,
    default_lifetime: Duration,
}

impl HttpTokenRefresher {
    /// Create new refresher.
    pub fn new(endpoint: Arc<TokenEndpointClient>, default_lifetime: Duration) -> Self {
        Self {
            endpoint,
            default_lifetime,
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, record: &TokenRecord) -> CredentialResult<TokenRecord> {
        let refresh_token = record
            .refresh_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or(CredentialError::Token(TokenError::NoRefreshToken))?;

        let response = self
            .endpoint
            .refresh(refresh_token)
            .await
            .map_err(classify_rejection)?;
        let refreshed =
            TokenRecord::from_refresh_response(record, &response, Utc::now(), self.default_lifetime);

        tracing::debug!(
            expires_at = %refreshed.expires_at,
            rotated = response.refresh_token.is_some(),
            "Access token refreshed"
        );

        Ok(refreshed)
    }
}

/// A refresh grant the endpoint refused, other than for a bad client, means
/// the refresh token cannot be used again.
fn classify_rejection(error: CredentialError) -> CredentialError {
    let message = match &error {
        CredentialError::Provider(ProviderError::InvalidRequest { message }) => message.clone(),
        CredentialError::Provider(ProviderError::InvalidScope { scope }) => {
            format!("scope rejected: {}", scope)
        }
        CredentialError::Provider(ProviderError::UnsupportedGrantType { grant_type }) => {
            format!("refresh grant not accepted: {}", grant_type)
        }
        _ => return error,
    };
    CredentialError::Provider(ProviderError::InvalidGrant { message })
}

/// Mock refresher for testing.
///
/// Queued outcomes are returned in order. With an empty queue, a record with
/// a fresh hour-long access token is derived from the input.
#[derive(Default)]
pub struct MockTokenRefresher {
    outcomes: Mutex<VecDeque<CredentialResult<TokenRecord>>>,
    refresh_history: Mutex<Vec<TokenRecord>>,
    delay: Mutex<Option<Duration>>,
}

impl MockTokenRefresher {
    /// Create new mock refresher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful refresh.
    pub fn queue_record(&self, record: TokenRecord) -> &Self {
        self.outcomes.lock().unwrap().push_back(Ok(record));
        self
    }

    /// Queue a failure.
    pub fn queue_error(&self, error: CredentialError) -> &Self {
        self.outcomes.lock().unwrap().push_back(Err(error));
        self
    }

    /// Queue an `invalid_grant` rejection.
    pub fn queue_invalid_grant(&self) -> &Self {
        self.queue_error(CredentialError::Provider(ProviderError::InvalidGrant {
            message: "refresh token expired".to_string(),
        }))
    }

    /// Delay every refresh.
    pub fn set_delay(&self, delay: Duration) -> &Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    /// Records passed to `refresh`.
    pub fn get_refresh_history(&self) -> Vec<TokenRecord> {
        self.refresh_history.lock().unwrap().clone()
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_history.lock().unwrap().len()
    }
}

#[async_trait]
impl TokenRefresher for MockTokenRefresher {
    async fn refresh(&self, record: &TokenRecord) -> CredentialResult<TokenRecord> {
        self.refresh_history.lock().unwrap().push(record.clone());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self.outcomes.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| {
            let now = Utc::now();
            Ok(TokenRecord {
                access_token: format!("refreshed-{}", self.refresh_count()),
                issued_at: now,
                expires_at: now + chrono::Duration::hours(1),
                ..record.clone()
            })
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::app_credentials;
    use crate::core::{HttpResponse, MockHttpTransport};
    use crate::error::ErrorKind;
    use crate::types::ClientAuthMethod;

    fn stale_record(refresh_token: Option<&str>) -> TokenRecord {
        let issued = Utc::now() - chrono::Duration::hours(2);
        TokenRecord {
            access_token: "old".to_string(),
            refresh_token: refresh_token.map(String::from),
            token_type: "Bearer".to_string(),
            expires_at: issued + chrono::Duration::minutes(30),
            scope: Some("api".to_string()),
            id_token: None,
            issued_at: issued,
            refresh_token_issued_at: Some(issued),
        }
    }

    fn refresher(transport: Arc<MockHttpTransport>) -> HttpTokenRefresher {
        let credentials = app_credentials()
            .client_id("app-key")
            .client_secret("app-secret")
            .redirect_uri("https://127.0.0.1:8182/callback")
            .base_url("https://api.broker.example/v1/oauth")
            .build()
            .unwrap();
        let endpoint = TokenEndpointClient::new(
            credentials,
            transport,
            ClientAuthMethod::ClientSecretBasic,
            Duration::from_secs(5),
        );
        HttpTokenRefresher::new(Arc::new(endpoint), Duration::from_secs(1800))
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token_when_not_rotated() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_json_response(
            200,
            serde_json::json!({"access_token": "new", "expires_in": 1800, "token_type": "Bearer"}),
        );

        let old = stale_record(Some("keep-me"));
        let before = Utc::now();
        let refreshed = refresher(transport).refresh(&old).await.unwrap();

        assert_eq!(refreshed.access_token, "new");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("keep-me"));
        assert_eq!(refreshed.refresh_token_issued_at, old.refresh_token_issued_at);
        assert!(refreshed.expires_at >= before + chrono::Duration::seconds(1800));
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token() {
        let transport = Arc::new(MockHttpTransport::new());
        let err = refresher(transport.clone())
            .refresh(&stale_record(None))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidGrant);
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_failures_are_classified() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .queue_json_response(
                400,
                serde_json::json!({"error": "invalid_grant", "error_description": "revoked"}),
            )
            .queue_json_response(500, serde_json::json!({"error": "server_error"}));
        let refresher = refresher(transport);
        let old = stale_record(Some("rt"));

        assert_eq!(refresher.refresh(&old).await.unwrap_err().kind(), ErrorKind::InvalidGrant);
        assert_eq!(refresher.refresh(&old).await.unwrap_err().kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_refused_refresh_is_invalid_grant_unless_client_rejected() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .queue_response(HttpResponse {
                status: 400,
                headers: Default::default(),
                body: "Bad Request".to_string(),
            })
            .queue_json_response(400, serde_json::json!({"error": "invalid_request"}))
            .queue_json_response(401, serde_json::json!({"error": "invalid_client"}));
        let refresher = refresher(transport);
        let old = stale_record(Some("rt"));

        assert_eq!(refresher.refresh(&old).await.unwrap_err().kind(), ErrorKind::InvalidGrant);
        assert_eq!(refresher.refresh(&old).await.unwrap_err().kind(), ErrorKind::InvalidGrant);

        let err = refresher.refresh(&old).await.unwrap_err();
        assert!(err.is_client_rejection());
        assert_eq!(err.kind(), ErrorKind::ExchangeFailed);
    }

    #[tokio::test]
    async fn test_mock_refresher() {
        let refresher = MockTokenRefresher::new();
        refresher.queue_invalid_grant();

        let old = stale_record(Some("rt"));
        assert!(refresher.refresh(&old).await.is_err());
        let fresh = refresher.refresh(&old).await.unwrap();
        assert_eq!(fresh.refresh_token.as_deref(), Some("rt"));
        assert_eq!(refresher.refresh_count(), 2);
    }
}
