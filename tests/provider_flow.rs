//! Integration tests for CredentialProvider against a mock broker.

use broker_auth::{
    app_credentials, CredentialProvider, ErrorKind, FileTokenStore, MockConsentPresenter,
    PersistedRecordEnvelope, ProviderSettings, ReqwestHttpTransport, RetryConfig, TokenRecord,
    TokenStore,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use wiremock::matchers::{body_string_contains, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    provider: Arc<CredentialProvider>,
    presenter: Arc<MockConsentPresenter>,
    token_path: PathBuf,
    _dir: tempfile::TempDir,
}

fn free_redirect_uri() -> Url {
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = reserved.local_addr().unwrap().port();
    drop(reserved);
    Url::parse(&format!("http://127.0.0.1:{}/callback", port)).unwrap()
}

/// Stand in for the user: approve on the consent page, which redirects the
/// browser to `redirect_uri` with `state` (or a forged one).
fn simulate_user(presenter: &MockConsentPresenter, code: &'static str, forged_state: Option<&'static str>) {
    presenter.on_present(move |consent: Url| {
        let state = match forged_state {
            Some(forged) => forged.to_string(),
            None => consent
                .query_pairs()
                .find(|(k, _)| k == "state")
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default(),
        };
        let mut redirect = consent
            .query_pairs()
            .find(|(k, _)| k == "redirect_uri")
            .map(|(_, v)| Url::parse(&v).unwrap())
            .unwrap();
        redirect
            .query_pairs_mut()
            .append_pair("code", code)
            .append_pair("state", &state);

        tokio::spawn(async move {
            let _ = reqwest::get(redirect).await;
        });
    });
}

async fn harness(server: &MockServer) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let token_path = dir.path().join("broker-token.json");

    let credentials = app_credentials()
        .client_id("app-key")
        .client_secret("app-secret")
        .redirect_uri(free_redirect_uri().as_str())
        .base_url(format!("{}/v1/oauth", server.uri()))
        .build()
        .unwrap();

    let settings = ProviderSettings::new(&token_path)
        .with_flow_timeout(Duration::from_secs(5))
        .with_retry(RetryConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            ..RetryConfig::default()
        });

    let presenter = Arc::new(MockConsentPresenter::new());
    let transport = Arc::new(ReqwestHttpTransport::new(Duration::from_secs(5)).unwrap());
    let provider =
        CredentialProvider::from_config_with(credentials, settings, transport, presenter.clone())
            .unwrap();

    Harness {
        provider: Arc::new(provider),
        presenter,
        token_path,
        _dir: dir,
    }
}

fn stale_record(refresh_token: &str) -> TokenRecord {
    let issued_at = Utc::now() - ChronoDuration::hours(2);
    TokenRecord {
        access_token: "stale-access".to_string(),
        refresh_token: Some(refresh_token.to_string()),
        token_type: "Bearer".to_string(),
        expires_at: issued_at + ChronoDuration::minutes(30),
        scope: None,
        id_token: None,
        issued_at,
        refresh_token_issued_at: Some(issued_at),
    }
}

#[tokio::test]
async fn test_first_run_consent_persists_record() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .and(header_exists("authorization"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=C0.consent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-1",
            "refresh_token": "refresh-1",
            "token_type": "Bearer",
            "expires_in": 1800,
            "scope": "api"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server).await;
    simulate_user(&h.presenter, "C0.consent", None);

    let token = h.provider.get_access_token().await.unwrap();
    assert_eq!(token.secret(), "access-1");
    assert_eq!(token.authorization_header(), "Bearer access-1");
    assert_eq!(h.presenter.present_count(), 1);

    let stored = FileTokenStore::new(&h.token_path).load().await.unwrap();
    assert_eq!(stored.access_token, "access-1");
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-1"));
    let expected_expiry = Utc::now() + ChronoDuration::seconds(1800);
    assert!((stored.expires_at - expected_expiry).num_seconds().abs() < 10);

    // Served from memory: no second exchange, no second consent page
    let again = h.provider.get_access_token().await.unwrap();
    assert_eq!(again.secret(), "access-1");
    assert_eq!(h.presenter.present_count(), 1);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-old"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(200))
                .set_body_json(json!({
                    "access_token": "access-refreshed",
                    "token_type": "Bearer",
                    "expires_in": 1800
                })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server).await;
    FileTokenStore::new(&h.token_path)
        .save(&stale_record("refresh-old"))
        .await
        .unwrap();

    let mut callers = Vec::new();
    for _ in 0..10 {
        let provider = h.provider.clone();
        callers.push(tokio::spawn(async move { provider.get_access_token().await }));
    }

    for caller in callers {
        let token = caller.await.unwrap().unwrap();
        assert_eq!(token.secret(), "access-refreshed");
    }
    assert_eq!(h.presenter.present_count(), 0);

    // Refresh token carries over when the broker does not rotate it
    let stored = FileTokenStore::new(&h.token_path).load().await.unwrap();
    assert_eq!(stored.access_token, "access-refreshed");
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-old"));
}

#[tokio::test]
async fn test_rejected_refresh_falls_back_to_consent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "refresh token expired"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-new",
            "refresh_token": "refresh-new",
            "expires_in": 1800
        })))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server).await;
    FileTokenStore::new(&h.token_path)
        .save(&stale_record("refresh-dead"))
        .await
        .unwrap();
    simulate_user(&h.presenter, "C0.again", None);

    let token = h.provider.get_access_token().await.unwrap();
    assert_eq!(token.secret(), "access-new");
    assert_eq!(h.presenter.present_count(), 1);

    let stored = FileTokenStore::new(&h.token_path).load().await.unwrap();
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-new"));
}

#[tokio::test]
async fn test_bare_bad_request_on_refresh_falls_back_to_consent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(400).set_body_string("Bad Request"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-after-400",
            "refresh_token": "refresh-after-400",
            "expires_in": 1800
        })))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server).await;
    FileTokenStore::new(&h.token_path)
        .save(&stale_record("refresh-refused"))
        .await
        .unwrap();
    simulate_user(&h.presenter, "C0.after400", None);

    let token = h.provider.get_access_token().await.unwrap();
    assert_eq!(token.secret(), "access-after-400");
    assert_eq!(h.presenter.present_count(), 1);

    let stored = FileTokenStore::new(&h.token_path).load().await.unwrap();
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-after-400"));
}

#[tokio::test]
async fn test_corrupt_token_file_leads_to_consent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-fresh",
            "refresh_token": "refresh-fresh",
            "expires_in": 1800
        })))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server).await;
    std::fs::write(&h.token_path, b"{ truncated").unwrap();
    simulate_user(&h.presenter, "C0.fresh", None);

    let token = h.provider.get_access_token().await.unwrap();
    assert_eq!(token.secret(), "access-fresh");

    // The corrupt file was replaced by a valid envelope
    let bytes = std::fs::read(&h.token_path).unwrap();
    let record = PersistedRecordEnvelope::decode(&bytes).unwrap();
    assert_eq!(record.access_token, "access-fresh");
}

#[tokio::test]
async fn test_forged_state_is_never_exchanged() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "must-not-issue",
            "expires_in": 1800
        })))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(&server).await;
    simulate_user(&h.presenter, "C0.stolen", Some("forged-state"));

    let err = h.provider.get_access_token().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CsrfMismatch);
    assert!(!h.token_path.exists());
}

#[tokio::test]
async fn test_sign_out_removes_token_file() {
    let server = MockServer::start().await;
    let h = harness(&server).await;

    let mut record = stale_record("refresh-1");
    record.expires_at = Utc::now() + ChronoDuration::hours(1);
    FileTokenStore::new(&h.token_path).save(&record).await.unwrap();

    let token = h.provider.get_access_token().await.unwrap();
    assert_eq!(token.secret(), "stale-access");

    h.provider.sign_out().await.unwrap();
    assert!(!h.token_path.exists());

    let err = h.provider.token_info().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
