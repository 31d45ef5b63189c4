//! Credentials Builder
//!
//! Fluent builder for the broker application credentials.

use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::{ConfigurationError, CredentialError, CredentialResult};
use crate::types::AppCredentials;

/// Application credentials builder.
#[derive(Default)]
pub struct AppCredentialsBuilder {
    client_id: Option<String>,
    client_secret: Option<SecretString>,
    redirect_uri: Option<String>,
    authorize_endpoint: Option<String>,
    token_endpoint: Option<String>,
}

impl AppCredentialsBuilder {
    /// Create new credentials builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set client ID (the app key).
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set client secret (the app secret).
    pub fn client_secret(mut self, client_secret: impl Into<String>) -> Self {
        self.client_secret = Some(SecretString::new(client_secret.into()));
        self
    }

    /// Set the callback URL registered with the broker.
    pub fn redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(redirect_uri.into());
        self
    }

    /// Set authorization (consent page) endpoint.
    pub fn authorize_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.authorize_endpoint = Some(endpoint.into());
        self
    }

    /// Set token endpoint.
    pub fn token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = Some(endpoint.into());
        self
    }

    /// Derive both endpoints from the broker's OAuth base URL as
    /// `{base}/authorize` and `{base}/token`.
    pub fn base_url(self, base: impl AsRef<str>) -> Self {
        let base = base.as_ref().trim_end_matches('/');
        let authorize = format!("{}/authorize", base);
        let token = format!("{}/token", base);
        self.authorize_endpoint(authorize).token_endpoint(token)
    }

    /// Build the credentials.
    pub fn build(self) -> CredentialResult<AppCredentials> {
        let client_id = required("client_id", self.client_id)?;

        let client_secret = self
            .client_secret
            .filter(|secret| !secret.expose_secret().trim().is_empty())
            .ok_or_else(|| missing("client_secret"))?;

        let redirect_uri = parse_endpoint(&required("redirect_uri", self.redirect_uri)?)?;
        let authorize_endpoint =
            parse_endpoint(&required("authorize_endpoint", self.authorize_endpoint)?)?;
        let token_endpoint = parse_endpoint(&required("token_endpoint", self.token_endpoint)?)?;

        if redirect_uri.port_or_known_default().is_none() {
            return Err(ConfigurationError::InvalidEndpoint {
                url: redirect_uri.to_string(),
                message: "redirect URI needs a port".to_string(),
            }
            .into());
        }

        Ok(AppCredentials {
            client_id,
            client_secret,
            redirect_uri,
            authorize_endpoint,
            token_endpoint,
        })
    }
}

/// Create a new credentials builder.
pub fn app_credentials() -> AppCredentialsBuilder {
    AppCredentialsBuilder::new()
}

fn missing(field: &str) -> CredentialError {
    CredentialError::Configuration(ConfigurationError::MissingRequired {
        field: field.to_string(),
    })
}

fn required(field: &str, value: Option<String>) -> CredentialResult<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| missing(field))
}

fn parse_endpoint(raw: &str) -> CredentialResult<Url> {
    let url = Url::parse(raw).map_err(|e| ConfigurationError::InvalidEndpoint {
        url: raw.to_string(),
        message: e.to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ConfigurationError::InvalidEndpoint {
            url: raw.to_string(),
            message: "expected an absolute http(s) URL".to_string(),
        }
        .into());
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn complete() -> AppCredentialsBuilder {
        app_credentials()
            .client_id("app-key")
            .client_secret("app-secret")
            .redirect_uri("https://127.0.0.1:8182/callback")
            .base_url("https://api.broker.example/v1/oauth/")
    }

    #[test]
    fn test_builder_success() {
        let credentials = complete().build().unwrap();

        assert_eq!(credentials.client_id(), "app-key");
        assert_eq!(credentials.client_secret(), "app-secret");
        assert_eq!(
            credentials.authorize_endpoint().as_str(),
            "https://api.broker.example/v1/oauth/authorize"
        );
        assert_eq!(
            credentials.token_endpoint().as_str(),
            "https://api.broker.example/v1/oauth/token"
        );
        assert!(!format!("{:?}", credentials).contains("app-secret"));
    }

    #[test]
    fn test_builder_missing_client_id() {
        let err = complete().client_id("  ").build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("client_id"));
    }

    #[test]
    fn test_builder_missing_secret() {
        let err = app_credentials()
            .client_id("app-key")
            .redirect_uri("https://127.0.0.1:8182/callback")
            .base_url("https://api.broker.example/v1/oauth")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("client_secret"));
    }

    #[test]
    fn test_builder_rejects_non_http_endpoints() {
        let err = complete()
            .token_endpoint("ftp://api.broker.example/token")
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = complete().redirect_uri("not a url").build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
