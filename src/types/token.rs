//! Token Types
//!
//! Token endpoint responses, the persisted token record and the access token
//! handed to callers.

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{CredentialError, ProtocolError};

/// Largest `expires_in` accepted from the token endpoint (one year).
pub const MAX_EXPIRES_IN_SECS: u64 = 365 * 24 * 60 * 60;

/// Token response from the token endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct TokenResponse {
    /// Access token.
    pub access_token: String,
    /// Token type (usually "Bearer").
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Expires in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Refresh token; may be omitted on refresh.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scopes.
    #[serde(default)]
    pub scope: Option<String>,
    /// ID token.
    #[serde(default)]
    pub id_token: Option<String>,
    /// Additional fields.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenResponse {
    /// Parse and validate a token endpoint body.
    pub fn parse(body: &str) -> Result<Self, CredentialError> {
        let response: TokenResponse = serde_json::from_str(body).map_err(|e| {
            CredentialError::Protocol(ProtocolError::InvalidJson {
                message: e.to_string(),
            })
        })?;

        if response.access_token.trim().is_empty() {
            return Err(CredentialError::Protocol(ProtocolError::MissingField {
                field: "access_token".to_string(),
            }));
        }

        if let Some(expires_in) = response.expires_in.filter(|&secs| secs > MAX_EXPIRES_IN_SECS) {
            return Err(CredentialError::Protocol(ProtocolError::InvalidResponse {
                message: format!("expires_in of {} seconds is out of range", expires_in),
            }));
        }

        Ok(response)
    }

    fn rotated_refresh_token(&self) -> Option<String> {
        self.refresh_token
            .as_ref()
            .filter(|token| !token.trim().is_empty())
            .cloned()
    }
}

/// A complete token set as obtained from one exchange or refresh.
///
/// `expires_at` is always computed locally as `issued_at + expires_in`. A new
/// record replaces the previous one as a whole.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// When this host received the access token.
    pub issued_at: DateTime<Utc>,
    /// When this host received the current refresh token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token_issued_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    /// Build a record from an authorization code exchange.
    pub fn from_response(
        response: &TokenResponse,
        issued_at: DateTime<Utc>,
        default_lifetime: std::time::Duration,
    ) -> Self {
        let refresh_token = response.rotated_refresh_token();
        let refresh_token_issued_at = refresh_token.as_ref().map(|_| issued_at);

        Self {
            access_token: response.access_token.clone(),
            refresh_token,
            token_type: response.token_type.clone(),
            expires_at: issued_at
                .checked_add_signed(lifetime_of(response, default_lifetime))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            scope: response.scope.clone(),
            id_token: response.id_token.clone(),
            issued_at,
            refresh_token_issued_at,
        }
    }

    /// Build the record that replaces `previous` after a refresh.
    ///
    /// When the provider does not rotate the refresh token the previous one
    /// (and its issue time) carries over.
    pub fn from_refresh_response(
        previous: &TokenRecord,
        response: &TokenResponse,
        issued_at: DateTime<Utc>,
        default_lifetime: std::time::Duration,
    ) -> Self {
        let mut record = Self::from_response(response, issued_at, default_lifetime);

        if record.refresh_token.is_none() {
            record.refresh_token = previous.refresh_token.clone();
            record.refresh_token_issued_at = previous.refresh_token_issued_at;
        }
        if record.scope.is_none() {
            record.scope = previous.scope.clone();
        }
        if record.id_token.is_none() {
            record.id_token = previous.id_token.clone();
        }

        record
    }

    /// Whether the access token can be handed out at `now`.
    ///
    /// False once `now >= expires_at - buffer`, and also when the record's
    /// timestamps are inconsistent with the local clock by more than
    /// `skew_tolerance`.
    pub fn is_fresh(
        &self,
        now: DateTime<Utc>,
        buffer: std::time::Duration,
        skew_tolerance: std::time::Duration,
    ) -> bool {
        let skew = to_chrono(skew_tolerance);

        if self.issued_at > now + skew {
            return false;
        }

        let issued_lifetime = self.expires_at - self.issued_at;
        if self.expires_at - now > issued_lifetime + skew {
            return false;
        }

        now < self.expires_at - to_chrono(buffer)
    }

    /// Check if has refresh token.
    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token
            .as_deref()
            .is_some_and(|token| !token.is_empty())
    }

    /// Age of the refresh token, if its issue time is known.
    pub fn refresh_token_age(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.refresh_token_issued_at
            .and_then(|issued| (now - issued).to_std().ok())
    }

    /// Remaining access token lifetime; zero once expired.
    pub fn remaining_lifetime(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }
}

impl std::fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRecord")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("issued_at", &self.issued_at)
            .field("refresh_token_issued_at", &self.refresh_token_issued_at)
            .finish()
    }
}

fn lifetime_of(response: &TokenResponse, default_lifetime: std::time::Duration) -> Duration {
    match response.expires_in {
        Some(secs) => Duration::try_seconds(secs.min(MAX_EXPIRES_IN_SECS) as i64)
            .unwrap_or_else(|| to_chrono(default_lifetime)),
        None => to_chrono(default_lifetime),
    }
}

pub(crate) fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::milliseconds(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX / 1_000_000))
}

/// Access token wrapper for safe handling.
#[derive(Clone)]
pub struct AccessToken {
    value: SecretString,
    /// Token type.
    pub token_type: String,
    /// Expiration time.
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Create new access token.
    pub fn new(value: String, token_type: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: SecretString::new(value),
            token_type,
            expires_at,
        }
    }

    /// Get token value (for Authorization header).
    pub fn secret(&self) -> &str {
        self.value.expose_secret()
    }

    /// Format as Authorization header value.
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.value.expose_secret())
    }
}

impl From<&TokenRecord> for AccessToken {
    fn from(record: &TokenRecord) -> Self {
        Self::new(
            record.access_token.clone(),
            record.token_type.clone(),
            record.expires_at,
        )
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Information about the current record for display.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub expires_in_secs: u64,
    pub is_expired: bool,
    pub has_refresh_token: bool,
    pub refresh_token_age_secs: Option<u64>,
    pub scope: Option<String>,
}

impl TokenInfo {
    pub(crate) fn from_record(
        record: &TokenRecord,
        now: DateTime<Utc>,
        buffer: std::time::Duration,
        skew_tolerance: std::time::Duration,
    ) -> Self {
        Self {
            issued_at: record.issued_at,
            expires_at: record.expires_at,
            expires_in_secs: record.remaining_lifetime(now).as_secs(),
            is_expired: !record.is_fresh(now, buffer, skew_tolerance),
            has_refresh_token: record.has_refresh_token(),
            refresh_token_age_secs: record.refresh_token_age(now).map(|age| age.as_secs()),
            scope: record.scope.clone(),
        }
    }

    pub fn expires_in_display(&self) -> String {
        if self.is_expired {
            "Expired (will refresh on next use)".to_string()
        } else {
            let hours = self.expires_in_secs / 3600;
            let minutes = (self.expires_in_secs % 3600) / 60;
            format!("{}h {}m", hours, minutes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUFFER: std::time::Duration = std::time::Duration::from_secs(60);
    const SKEW: std::time::Duration = std::time::Duration::from_secs(300);
    const DEFAULT_LIFETIME: std::time::Duration = std::time::Duration::from_secs(1800);

    fn response(refresh_token: Option<&str>, expires_in: Option<u64>) -> TokenResponse {
        TokenResponse {
            access_token: "access-1".to_string(),
            token_type: "Bearer".to_string(),
            expires_in,
            refresh_token: refresh_token.map(String::from),
            scope: Some("api".to_string()),
            id_token: None,
            extra: HashMap::new(),
        }
    }

    #[test]
    fn test_token_response_parsing() {
        let json = r#"{
            "access_token": "test-token",
            "token_type": "Bearer",
            "expires_in": 1800,
            "refresh_token": "test-refresh",
            "scope": "api",
            "id_token": "jwt"
        }"#;

        let response = TokenResponse::parse(json).unwrap();
        assert_eq!(response.access_token, "test-token");
        assert_eq!(response.expires_in, Some(1800));
        assert_eq!(response.refresh_token, Some("test-refresh".to_string()));
        assert_eq!(response.id_token, Some("jwt".to_string()));
    }

    #[test]
    fn test_token_response_rejects_empty_access_token() {
        let err = TokenResponse::parse(r#"{"access_token": ""}"#).unwrap_err();
        assert!(matches!(
            err,
            CredentialError::Protocol(ProtocolError::MissingField { .. })
        ));
        assert!(TokenResponse::parse("{truncated").is_err());
    }

    #[test]
    fn test_expires_at_derived_from_issue_time() {
        let now = Utc::now();
        let record = TokenRecord::from_response(&response(Some("r"), Some(1800)), now, DEFAULT_LIFETIME);
        assert_eq!(record.expires_at, now + Duration::seconds(1800));
        assert_eq!(record.refresh_token_issued_at, Some(now));

        let record = TokenRecord::from_response(&response(None, None), now, DEFAULT_LIFETIME);
        assert_eq!(record.expires_at, now + Duration::seconds(1800));
        assert!(record.refresh_token_issued_at.is_none());
    }

    #[test]
    fn test_out_of_range_expires_in() {
        let err = TokenResponse::parse(r#"{"access_token":"a","expires_in":18446744073709551615}"#)
            .unwrap_err();
        assert!(matches!(
            err,
            CredentialError::Protocol(ProtocolError::InvalidResponse { .. })
        ));
        assert_eq!(err.kind(), crate::error::ErrorKind::ProtocolViolation);

        // Records built directly from a response never overflow
        let now = Utc::now();
        let record = TokenRecord::from_response(&response(None, Some(u64::MAX)), now, DEFAULT_LIFETIME);
        assert_eq!(record.expires_at, now + Duration::seconds(MAX_EXPIRES_IN_SECS as i64));
        assert!(record.is_fresh(now, BUFFER, SKEW));
    }

    #[test]
    fn test_refresh_preserves_refresh_token_when_omitted() {
        let first_issue = Utc::now() - Duration::hours(2);
        let previous =
            TokenRecord::from_response(&response(Some("refresh-1"), Some(1800)), first_issue, DEFAULT_LIFETIME);

        let now = Utc::now();
        let refreshed =
            TokenRecord::from_refresh_response(&previous, &response(None, Some(1800)), now, DEFAULT_LIFETIME);
        assert_eq!(refreshed.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(refreshed.refresh_token_issued_at, Some(first_issue));
        assert_eq!(refreshed.issued_at, now);

        let rotated = TokenRecord::from_refresh_response(
            &previous,
            &response(Some("refresh-2"), Some(1800)),
            now,
            DEFAULT_LIFETIME,
        );
        assert_eq!(rotated.refresh_token.as_deref(), Some("refresh-2"));
        assert_eq!(rotated.refresh_token_issued_at, Some(now));
    }

    #[test]
    fn test_is_fresh_honours_buffer() {
        let now = Utc::now();
        let mut record = TokenRecord::from_response(&response(Some("r"), Some(1800)), now, DEFAULT_LIFETIME);
        assert!(record.is_fresh(now, BUFFER, SKEW));

        // Expires in 30 seconds, buffer 60 - must be treated as expired
        record.issued_at = now - Duration::seconds(1770);
        record.expires_at = now + Duration::seconds(30);
        assert!(!record.is_fresh(now, BUFFER, SKEW));

        record.expires_at = now - Duration::seconds(10);
        assert!(!record.is_fresh(now, BUFFER, SKEW));
    }

    #[test]
    fn test_is_fresh_rejects_skewed_records() {
        let now = Utc::now();

        let mut from_the_future =
            TokenRecord::from_response(&response(None, Some(1800)), now + Duration::hours(1), DEFAULT_LIFETIME);
        assert!(!from_the_future.is_fresh(now, BUFFER, SKEW));

        // Within tolerance is fine
        from_the_future.issued_at = now + Duration::seconds(60);
        from_the_future.expires_at = from_the_future.issued_at + Duration::seconds(1800);
        assert!(from_the_future.is_fresh(now, BUFFER, SKEW));
    }

    #[test]
    fn test_record_serde_and_debug_redaction() {
        let record = TokenRecord::from_response(&response(Some("secret-refresh"), Some(60)), Utc::now(), DEFAULT_LIFETIME);
        let json = serde_json::to_string(&record).unwrap();
        let back: TokenRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);

        let debug = format!("{:?}", record);
        assert!(!debug.contains("secret-refresh"));
        assert!(!debug.contains("access-1"));
    }

    #[test]
    fn test_access_token_authorization_header() {
        let token = AccessToken::new("test-token".to_string(), "Bearer".to_string(), Utc::now());
        assert_eq!(token.authorization_header(), "Bearer test-token");
        assert!(!format!("{:?}", token).contains("test-token"));
    }

    #[test]
    fn test_token_info_display() {
        let now = Utc::now();
        let record = TokenRecord::from_response(&response(Some("r"), Some(7200)), now, DEFAULT_LIFETIME);
        let info = TokenInfo::from_record(&record, now, BUFFER, SKEW);
        assert_eq!(info.expires_in_display(), "2h 0m");
        assert!(info.has_refresh_token);

        let info = TokenInfo::from_record(&record, now + Duration::hours(3), BUFFER, SKEW);
        assert!(info.expires_in_display().contains("Expired"));
    }
}
