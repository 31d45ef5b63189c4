//! Credential Provider
//!
//! The entry point for callers that need a bearer token. Composes the token
//! store, the refresher and the interactive flow into one pipeline:
//!
//! 1. cached record (or the store) still fresh: return it, no I/O
//! 2. refresh token present: refresh with backoff, persist, return
//! 3. otherwise, or when refresh is rejected: interactive consent
//!
//! Renewal is single-flight. Callers that arrive while a renewal runs wait for
//! it and receive its outcome, success or failure.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::core::{BrowserPresenter, ConsentPresenter, HttpTransport, ReqwestHttpTransport};
use crate::error::{AuthorizationError, CredentialResult, ErrorKind, TokenError};
use crate::flows::{AuthorizationFlow, FlowOptions, InteractiveAuthorizationFlow};
use crate::resilience::RetryExecutor;
use crate::token::{FileTokenStore, HttpTokenRefresher, TokenEndpointClient, TokenRefresher, TokenStore};
use crate::types::{AccessToken, AppCredentials, ProviderSettings, TokenInfo, TokenRecord};

/// Last published renewal outcome, guarded by the renewal lock.
#[derive(Default)]
struct RenewalSlot {
    last_outcome: Option<CredentialResult<TokenRecord>>,
}

/// Obtains and keeps valid a bearer credential for the broker API.
pub struct CredentialProvider {
    store: Arc<dyn TokenStore>,
    refresher: Arc<dyn TokenRefresher>,
    flow: Arc<dyn AuthorizationFlow>,
    settings: ProviderSettings,
    retry: RetryExecutor,
    cache: RwLock<Option<TokenRecord>>,
    renewal: Mutex<RenewalSlot>,
    episode: AtomicU64,
    invalidated: AtomicBool,
}

impl CredentialProvider {
    /// Assemble a provider from its collaborators.
    pub fn new(
        store: Arc<dyn TokenStore>,
        refresher: Arc<dyn TokenRefresher>,
        flow: Arc<dyn AuthorizationFlow>,
        settings: ProviderSettings,
    ) -> Self {
        let retry = RetryExecutor::new(settings.retry.clone());
        Self {
            store,
            refresher,
            flow,
            settings,
            retry,
            cache: RwLock::new(None),
            renewal: Mutex::new(RenewalSlot::default()),
            episode: AtomicU64::new(0),
            invalidated: AtomicBool::new(false),
        }
    }

    /// Production wiring: file store, reqwest transport, browser consent.
    pub fn from_config(
        credentials: AppCredentials,
        settings: ProviderSettings,
    ) -> CredentialResult<Self> {
        settings
            .redirect_mode
            .check_redirect_uri(credentials.redirect_uri())?;
        let transport = Arc::new(ReqwestHttpTransport::new(settings.http_timeout)?);
        Self::from_config_with(credentials, settings, transport, Arc::new(BrowserPresenter))
    }

    /// Production wiring with a custom transport and consent presenter.
    ///
    /// Fails fast when the redirect URI cannot be received in the configured
    /// redirect mode.
    pub fn from_config_with(
        credentials: AppCredentials,
        settings: ProviderSettings,
        transport: Arc<dyn HttpTransport>,
        presenter: Arc<dyn ConsentPresenter>,
    ) -> CredentialResult<Self> {
        settings
            .redirect_mode
            .check_redirect_uri(credentials.redirect_uri())?;

        let endpoint = Arc::new(TokenEndpointClient::new(
            credentials,
            transport,
            settings.auth_method,
            settings.http_timeout,
        ));
        let refresher = HttpTokenRefresher::new(
            endpoint.clone(),
            settings.default_access_token_lifetime,
        );
        let flow = InteractiveAuthorizationFlow::new(
            endpoint,
            presenter,
            Arc::new(RetryExecutor::new(settings.retry.clone())),
            FlowOptions {
                redirect_mode: settings.redirect_mode,
                flow_timeout: settings.flow_timeout,
                scopes: settings.scopes.clone(),
                default_access_token_lifetime: settings.default_access_token_lifetime,
            },
        );
        let store = FileTokenStore::new(settings.token_path.clone());

        Ok(Self::new(
            Arc::new(store),
            Arc::new(refresher),
            Arc::new(flow),
            settings,
        ))
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    /// Return a currently valid access token, renewing it if needed.
    pub async fn get_access_token(&self) -> CredentialResult<AccessToken> {
        self.get_access_token_with_cancel(&CancellationToken::new())
            .await
    }

    /// Like [`get_access_token`](Self::get_access_token), abandoning the wait
    /// (and any interactive flow this call leads) once `cancel` fires.
    pub async fn get_access_token_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> CredentialResult<AccessToken> {
        if let Some(token) = self.cached_fresh_token().await {
            return Ok(token);
        }

        let observed = self.episode.load(Ordering::Acquire);
        let mut slot = tokio::select! {
            _ = cancel.cancelled() => return Err(AuthorizationError::Cancelled.into()),
            slot = self.renewal.lock() => slot,
        };

        // A renewal finished while we waited: share its outcome.
        if self.episode.load(Ordering::Acquire) != observed {
            if let Some(outcome) = &slot.last_outcome {
                tracing::debug!("Joining completed renewal");
                return outcome.as_ref().map(AccessToken::from).map_err(Clone::clone);
            }
        }

        if let Some(token) = self.cached_fresh_token().await {
            return Ok(token);
        }

        let outcome = self.renew(cancel).await;
        self.publish(&mut slot, &outcome);
        outcome.map(|record| AccessToken::from(&record))
    }

    /// Force a new interactive authorization, replacing the current record.
    pub async fn reauthorize(&self) -> CredentialResult<AccessToken> {
        self.reauthorize_with_cancel(&CancellationToken::new()).await
    }

    /// Cancellable [`reauthorize`](Self::reauthorize).
    pub async fn reauthorize_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> CredentialResult<AccessToken> {
        let mut slot = tokio::select! {
            _ = cancel.cancelled() => return Err(AuthorizationError::Cancelled.into()),
            slot = self.renewal.lock() => slot,
        };

        let outcome = self.authorize_interactively(cancel).await;
        self.publish(&mut slot, &outcome);
        outcome.map(|record| AccessToken::from(&record))
    }

    /// Drop the in-memory record, e.g. after the API rejected its token. The
    /// next call renews instead of trusting the stored copy.
    pub async fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
        *self.cache.write().await = None;
        tracing::debug!("Cached credential invalidated");
    }

    /// Expiry and scope of the current record, without secrets.
    pub async fn token_info(&self) -> CredentialResult<TokenInfo> {
        let cached = self.cache.read().await.clone();
        let record = match cached {
            Some(record) => record,
            None => self.store.load().await?,
        };

        Ok(TokenInfo::from_record(
            &record,
            Utc::now(),
            self.settings.refresh_buffer,
            self.settings.clock_skew_tolerance,
        ))
    }

    /// Forget the credential in memory and on disk.
    pub async fn sign_out(&self) -> CredentialResult<()> {
        let mut slot = self.renewal.lock().await;
        *self.cache.write().await = None;
        slot.last_outcome = None;

        let removed = self.store.delete().await?;
        tracing::info!(removed, "Signed out of broker session");
        Ok(())
    }

    async fn cached_fresh_token(&self) -> Option<AccessToken> {
        let cache = self.cache.read().await;
        cache
            .as_ref()
            .filter(|record| self.is_fresh(record))
            .map(AccessToken::from)
    }

    fn is_fresh(&self, record: &TokenRecord) -> bool {
        record.is_fresh(
            Utc::now(),
            self.settings.refresh_buffer,
            self.settings.clock_skew_tolerance,
        )
    }

    /// Store the outcome for waiters. Cancellation belongs to the caller that
    /// cancelled, so it is not shared.
    fn publish(&self, slot: &mut RenewalSlot, outcome: &CredentialResult<TokenRecord>) {
        if matches!(outcome, Err(e) if e.kind() == ErrorKind::Cancelled) {
            return;
        }
        slot.last_outcome = Some(outcome.clone());
        self.episode.fetch_add(1, Ordering::AcqRel);
    }

    /// Runs under the renewal lock.
    async fn renew(&self, cancel: &CancellationToken) -> CredentialResult<TokenRecord> {
        let force = self.invalidated.swap(false, Ordering::AcqRel);

        let cached = self.cache.read().await.clone();
        let current = match cached {
            Some(record) => Some(record),
            None => self.load_stored().await,
        };

        if let Some(record) = &current {
            if !force && self.is_fresh(record) {
                *self.cache.write().await = Some(record.clone());
                return Ok(record.clone());
            }
        }

        if let Some(record) = current.as_ref().filter(|r| r.has_refresh_token()) {
            match self.refresh(record, cancel).await {
                Ok(refreshed) => {
                    self.commit(&refreshed).await;
                    return Ok(refreshed);
                }
                Err(e)
                    if matches!(e.kind(), ErrorKind::Cancelled | ErrorKind::Configuration)
                        || e.is_client_rejection() =>
                {
                    return Err(e);
                }
                Err(e) => {
                    let kind = e.kind();
                    tracing::info!(kind = %kind, error = %e, "Refresh failed, falling back to interactive authorization");
                    if matches!(kind, ErrorKind::InvalidGrant | ErrorKind::ExchangeFailed) {
                        self.forget_refresh_token(record).await;
                    }
                }
            }
        }

        self.authorize_interactively(cancel).await
    }

    /// Keep a rejected refresh token out of later renewals in this process.
    async fn forget_refresh_token(&self, record: &TokenRecord) {
        let mut stripped = record.clone();
        stripped.refresh_token = None;
        stripped.refresh_token_issued_at = None;
        *self.cache.write().await = Some(stripped);
    }

    async fn load_stored(&self) -> Option<TokenRecord> {
        match self.store.load().await {
            Ok(record) => Some(record),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!("No stored broker credential");
                None
            }
            Err(e) => {
                tracing::warn!(kind = %e.kind(), error = %e, "Stored broker credential is unusable");
                None
            }
        }
    }

    async fn refresh(
        &self,
        record: &TokenRecord,
        cancel: &CancellationToken,
    ) -> CredentialResult<TokenRecord> {
        if let (Some(max_age), Some(age)) = (
            self.settings.refresh_token_max_age,
            record.refresh_token_age(Utc::now()),
        ) {
            if age >= max_age {
                tracing::info!(age_secs = age.as_secs(), "Refresh token past its maximum age");
                return Err(TokenError::RefreshTokenTooOld { age }.into());
            }
        }

        tracing::debug!(expires_at = %record.expires_at, "Refreshing access token");
        let refreshed = self
            .retry
            .execute("refresh", || self.refresher.refresh(record));

        tokio::select! {
            _ = cancel.cancelled() => Err(AuthorizationError::Cancelled.into()),
            result = refreshed => result,
        }
    }

    async fn authorize_interactively(
        &self,
        cancel: &CancellationToken,
    ) -> CredentialResult<TokenRecord> {
        tracing::info!("Starting interactive broker authorization");
        let record = self.flow.authorize(cancel).await?;
        self.commit(&record).await;
        Ok(record)
    }

    /// Persist and cache a new record. A failed write keeps the record in
    /// memory so this process can continue.
    async fn commit(&self, record: &TokenRecord) {
        if let Err(e) = self.store.save(record).await {
            tracing::error!(error = %e, "Failed to persist broker credential");
        }
        *self.cache.write().await = Some(record.clone());
    }
}

impl std::fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialProvider")
            .field("settings", &self.settings)
            .field("episode", &self.episode.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
