//! Token Endpoint Client
//!
//! Form-encoded POSTs to the broker's token endpoint, shared by the code
//! exchange and the refresh grant.

use base64::Engine;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::core::{HttpRequest, HttpTransport};
use crate::error::{create_error_from_response, CredentialError, CredentialResult, ProviderError};
use crate::types::{AppCredentials, ClientAuthMethod, GrantType, TokenResponse};

/// Client for the token endpoint.
pub struct TokenEndpointClient {
    credentials: AppCredentials,
    transport: Arc<dyn HttpTransport>,
    auth_method: ClientAuthMethod,
    timeout: Duration,
}

impl TokenEndpointClient {
    /// Create new token endpoint client.
    pub fn new(
        credentials: AppCredentials,
        transport: Arc<dyn HttpTransport>,
        auth_method: ClientAuthMethod,
        timeout: Duration,
    ) -> Self {
        Self {
            credentials,
            transport,
            auth_method,
            timeout,
        }
    }

    pub fn credentials(&self) -> &AppCredentials {
        &self.credentials
    }

    /// Exchange an authorization code (single attempt).
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &Url,
    ) -> CredentialResult<TokenResponse> {
        let params = vec![
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
            ("client_id", self.credentials.client_id().to_string()),
        ];
        self.request(GrantType::AuthorizationCode, params).await
    }

    /// Redeem a refresh token (single attempt).
    pub async fn refresh(&self, refresh_token: &str) -> CredentialResult<TokenResponse> {
        let mut params = vec![("refresh_token", refresh_token.to_string())];
        if self.auth_method == ClientAuthMethod::ClientSecretPost {
            params.push(("client_id", self.credentials.client_id().to_string()));
        }
        self.request(GrantType::RefreshToken, params).await
    }

    async fn request(
        &self,
        grant_type: GrantType,
        params: Vec<(&str, String)>,
    ) -> CredentialResult<TokenResponse> {
        let request = HttpRequest {
            url: self.credentials.token_endpoint().clone(),
            headers: self.build_headers(),
            body: self.build_body(grant_type, params),
            timeout: Some(self.timeout),
        };

        tracing::debug!(
            grant_type = grant_type.as_str(),
            endpoint = %self.credentials.token_endpoint(),
            "Calling token endpoint"
        );

        let response = self.transport.post_form(request).await?;

        if !response.is_success() {
            tracing::debug!(
                grant_type = grant_type.as_str(),
                status = response.status,
                "Token endpoint rejected request"
            );
            let error = create_error_from_response(response.status, &response.body);
            return Err(match error {
                CredentialError::Provider(ProviderError::TemporarilyUnavailable { .. }) => {
                    CredentialError::Provider(ProviderError::TemporarilyUnavailable {
                        retry_after: response.retry_after(),
                    })
                }
                other => other,
            });
        }

        TokenResponse::parse(&response.body)
    }

    fn build_body(&self, grant_type: GrantType, params: Vec<(&str, String)>) -> String {
        let mut body = url::form_urlencoded::Serializer::new(String::new());
        body.append_pair("grant_type", grant_type.as_str());

        for (key, value) in &params {
            body.append_pair(key, value);
        }

        if self.auth_method == ClientAuthMethod::ClientSecretPost {
            if !params.iter().any(|(key, _)| *key == "client_id") {
                body.append_pair("client_id", self.credentials.client_id());
            }
            body.append_pair("client_secret", self.credentials.client_secret());
        }

        body.finish()
    }

    fn build_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();

        if self.auth_method == ClientAuthMethod::ClientSecretBasic {
            let credentials = format!(
                "{}:{}",
                self.credentials.client_id(),
                self.credentials.client_secret()
            );
            let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
            headers.insert("authorization".to_string(), format!("Basic {}", encoded));
        }

        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::app_credentials;
    use crate::core::MockHttpTransport;
    use crate::error::ErrorKind;

    fn client(transport: Arc<MockHttpTransport>, method: ClientAuthMethod) -> TokenEndpointClient {
        let credentials = app_credentials()
            .client_id("app-key")
            .client_secret("app-secret")
            .redirect_uri("https://127.0.0.1:8182/callback")
            .base_url("https://api.broker.example/v1/oauth")
            .build()
            .unwrap();
        TokenEndpointClient::new(credentials, transport, method, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_code_exchange_uses_basic_auth() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_json_response(
            200,
            serde_json::json!({"access_token": "at", "refresh_token": "rt", "expires_in": 1800}),
        );
        let redirect = Url::parse("https://127.0.0.1:8182/callback").unwrap();

        let response = client(transport.clone(), ClientAuthMethod::ClientSecretBasic)
            .exchange_code("C0.code@", &redirect)
            .await
            .unwrap();
        assert_eq!(response.access_token, "at");

        let request = transport.get_last_request().unwrap();
        assert_eq!(request.url.as_str(), "https://api.broker.example/v1/oauth/token");
        assert_eq!(request.form_value("grant_type").as_deref(), Some("authorization_code"));
        assert_eq!(request.form_value("code").as_deref(), Some("C0.code@"));
        assert_eq!(request.form_value("client_id").as_deref(), Some("app-key"));
        assert_eq!(
            request.form_value("redirect_uri").as_deref(),
            Some("https://127.0.0.1:8182/callback")
        );
        assert!(request.form_value("client_secret").is_none());
        assert_eq!(
            request.headers.get("authorization").map(String::as_str),
            Some("Basic YXBwLWtleTphcHAtc2VjcmV0")
        );
    }

    #[tokio::test]
    async fn test_refresh_with_post_auth() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_json_response(200, serde_json::json!({"access_token": "at2"}));

        client(transport.clone(), ClientAuthMethod::ClientSecretPost)
            .refresh("rt")
            .await
            .unwrap();

        let request = transport.get_last_request().unwrap();
        assert_eq!(request.form_value("grant_type").as_deref(), Some("refresh_token"));
        assert_eq!(request.form_value("refresh_token").as_deref(), Some("rt"));
        assert_eq!(request.form_value("client_id").as_deref(), Some("app-key"));
        assert_eq!(request.form_value("client_secret").as_deref(), Some("app-secret"));
        assert!(!request.headers.contains_key("authorization"));
    }

    #[tokio::test]
    async fn test_error_classification() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .queue_json_response(400, serde_json::json!({"error": "invalid_grant"}))
            .queue_json_response(502, serde_json::json!({"error": "bad_gateway"}))
            .queue_json_response(200, serde_json::json!({"token_type": "Bearer"}));
        let client = client(transport, ClientAuthMethod::ClientSecretBasic);

        assert_eq!(client.refresh("rt").await.unwrap_err().kind(), ErrorKind::InvalidGrant);
        assert_eq!(client.refresh("rt").await.unwrap_err().kind(), ErrorKind::Transient);
        assert_eq!(
            client.refresh("rt").await.unwrap_err().kind(),
            ErrorKind::ProtocolViolation
        );
    }

    #[tokio::test]
    async fn test_retry_after_is_carried() {
        let transport = Arc::new(MockHttpTransport::new());
        let mut response = crate::core::HttpResponse::json(429, &serde_json::json!({}));
        response
            .headers
            .insert("retry-after".to_string(), "3".to_string());
        transport.queue_response(response);

        let err = client(transport, ClientAuthMethod::ClientSecretBasic)
            .refresh("rt")
            .await
            .unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    }
}
