//! Authorization Code Flow
//!
//! Interactive consent: build the consent URL, present it, receive exactly
//! one redirect, validate it and exchange the code for a token record.
//!
//! ```text
//! Init -> AwaitingConsent -> CodeReceived -> Complete
//!              |                  |
//!              +---> Failed <-----+
//! ```

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::{generate_state, validate_state, ConsentPresenter};
use crate::error::{AuthorizationError, CredentialError, CredentialResult, ErrorKind};
use crate::flows::RedirectReceiver;
use crate::resilience::RetryExecutor;
use crate::token::TokenEndpointClient;
use crate::types::{AuthorizationState, CallbackParams, RedirectMode, TokenRecord, TokenResponse};

/// States of one flow attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    Init,
    AwaitingConsent,
    CodeReceived,
    Complete,
    Failed(ErrorKind),
}

/// Authorization flow interface.
#[async_trait]
pub trait AuthorizationFlow: Send + Sync {
    /// Run one attempt to completion. Cancelling `cancel` (or dropping the
    /// future) tears down the redirect receiver.
    async fn authorize(&self, cancel: &CancellationToken) -> CredentialResult<TokenRecord>;
}

/// Settings for [`InteractiveAuthorizationFlow`].
#[derive(Debug, Clone)]
pub struct FlowOptions {
    pub redirect_mode: RedirectMode,
    pub flow_timeout: Duration,
    pub scopes: Vec<String>,
    pub default_access_token_lifetime: Duration,
}

/// Interactive authorization-code flow.
pub struct InteractiveAuthorizationFlow {
    endpoint: Arc<TokenEndpointClient>,
    presenter: Arc<dyn ConsentPresenter>,
    retry: Arc<RetryExecutor>,
    options: FlowOptions,
    in_progress: AtomicBool,
}

impl InteractiveAuthorizationFlow {
    /// Create new interactive flow.
    pub fn new(
        endpoint: Arc<TokenEndpointClient>,
        presenter: Arc<dyn ConsentPresenter>,
        retry: Arc<RetryExecutor>,
        options: FlowOptions,
    ) -> Self {
        Self {
            endpoint,
            presenter,
            retry,
            options,
            in_progress: AtomicBool::new(false),
        }
    }

    /// Build the consent page URL for `state`.
    pub fn build_authorization_url(&self, state: &AuthorizationState) -> Url {
        let credentials = self.endpoint.credentials();
        let mut url = credentials.authorize_endpoint().clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", credentials.client_id())
                .append_pair("redirect_uri", state.expected_redirect_uri.as_str())
                .append_pair("state", &state.csrf_nonce);
            if !self.options.scopes.is_empty() {
                query.append_pair("scope", &self.options.scopes.join(" "));
            }
        }
        url
    }

    async fn run(&self, cancel: &CancellationToken) -> CredentialResult<TokenRecord> {
        // Init
        let attempt = AuthorizationState::new(
            generate_state(),
            self.endpoint.credentials().redirect_uri().clone(),
            self.options.flow_timeout,
        );
        let consent_url = self.build_authorization_url(&attempt);

        // AwaitingConsent: the receiver is ready before the user can be redirected
        let receiver =
            RedirectReceiver::bind(self.options.redirect_mode, &attempt.expected_redirect_uri)
                .await?;
        transition(FlowState::Init, FlowState::AwaitingConsent);

        self.presenter.present(&consent_url).await?;
        tracing::info!(
            endpoint = %self.endpoint.credentials().authorize_endpoint(),
            timeout_secs = attempt.remaining().as_secs(),
            "Waiting for broker consent"
        );

        let received: CredentialResult<CallbackParams> = tokio::select! {
            _ = cancel.cancelled() => Err(AuthorizationError::Cancelled.into()),
            received = tokio::time::timeout_at(attempt.deadline, receiver.receive(&attempt.csrf_nonce)) => {
                received.unwrap_or_else(|_| Err(AuthorizationError::Timeout {
                    waited: self.options.flow_timeout,
                }.into()))
            }
        };
        let callback = received?;
        transition(FlowState::AwaitingConsent, FlowState::CodeReceived);

        // CodeReceived
        let code = check_callback(&attempt, &callback)?;

        let exchange = self.retry.execute("code_exchange", || {
            self.endpoint
                .exchange_code(code, &attempt.expected_redirect_uri)
        });
        let exchanged: CredentialResult<TokenResponse> = tokio::select! {
            _ = cancel.cancelled() => Err(AuthorizationError::Cancelled.into()),
            response = exchange => response,
        };
        let response = exchanged?;

        Ok(TokenRecord::from_response(
            &response,
            Utc::now(),
            self.options.default_access_token_lifetime,
        ))
    }
}

#[async_trait]
impl AuthorizationFlow for InteractiveAuthorizationFlow {
    async fn authorize(&self, cancel: &CancellationToken) -> CredentialResult<TokenRecord> {
        let _guard = InProgressGuard::acquire(&self.in_progress)?;

        match self.run(cancel).await {
            Ok(record) => {
                transition(FlowState::CodeReceived, FlowState::Complete);
                Ok(record)
            }
            Err(error) => {
                tracing::warn!(state = ?FlowState::Failed(error.kind()), error = %error, "Authorization flow failed");
                Err(error)
            }
        }
    }
}

/// Validate the redirect: state first, then the error parameter, then the code.
fn check_callback<'a>(
    attempt: &AuthorizationState,
    callback: &'a CallbackParams,
) -> CredentialResult<&'a str> {
    validate_state(&attempt.csrf_nonce, callback.state.as_deref())?;

    if let Some(error) = &callback.error {
        return Err(AuthorizationError::AccessDenied {
            error: error.clone(),
            error_description: callback.error_description.clone(),
        }
        .into());
    }

    callback
        .code
        .as_deref()
        .filter(|code| !code.is_empty())
        .ok_or_else(|| {
            AuthorizationError::InvalidCallback {
                message: "redirect carried neither a code nor an error".to_string(),
            }
            .into()
        })
}

fn transition(from: FlowState, to: FlowState) {
    tracing::debug!(from = ?from, to = ?to, "Authorization flow transition");
}

struct InProgressGuard<'a>(&'a AtomicBool);

impl<'a> InProgressGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, CredentialError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self(flag))
            .map_err(|_| AuthorizationError::FlowInProgress.into())
    }
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Mock authorization flow for testing.
///
/// Queued outcomes are returned in order; with an empty queue a fresh record
/// is produced.
#[derive(Default)]
pub struct MockAuthorizationFlow {
    outcomes: Mutex<VecDeque<CredentialResult<TokenRecord>>>,
    call_count: Mutex<usize>,
    delay: Mutex<Option<Duration>>,
}

impl MockAuthorizationFlow {
    /// Create new mock flow.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a completed flow.
    pub fn queue_record(&self, record: TokenRecord) -> &Self {
        self.outcomes.lock().unwrap().push_back(Ok(record));
        self
    }

    /// Queue a failed flow.
    pub fn queue_error(&self, error: CredentialError) -> &Self {
        self.outcomes.lock().unwrap().push_back(Err(error));
        self
    }

    /// Simulate the user taking `delay` to consent.
    pub fn set_delay(&self, delay: Duration) -> &Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }
}

#[async_trait]
impl AuthorizationFlow for MockAuthorizationFlow {
    async fn authorize(&self, cancel: &CancellationToken) -> CredentialResult<TokenRecord> {
        let call = {
            let mut count = self.call_count.lock().unwrap();
            *count += 1;
            *count
        };

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AuthorizationError::Cancelled.into()),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let queued = self.outcomes.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| {
            let now = Utc::now();
            Ok(TokenRecord {
                access_token: format!("authorized-{}", call),
                refresh_token: Some(format!("refresh-{}", call)),
                token_type: "Bearer".to_string(),
                expires_at: now + chrono::Duration::minutes(30),
                scope: None,
                id_token: None,
                issued_at: now,
                refresh_token_issued_at: Some(now),
            })
        })
    }
}
