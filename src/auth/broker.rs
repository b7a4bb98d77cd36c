//! Credential broker: the single owner of the signed-in session.
//!
//! Hands out valid access tokens, refreshes them at most once at a time,
//! persists them through a [`TokenStore`], and runs interactive sign-in
//! flows whose outcome is shared by everyone waiting on them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::callback_server;
use super::oauth::{self, PkceChallenge};
use super::provider::{
    AuthorizeRequest, DeviceCodeGrant, DevicePoll, IdentityProvider, TokenResponse,
};
use super::token::{merge_scopes, AccessToken, CredentialRecord};
use crate::error::{AuthError, ProviderError};
use crate::retry::{sleep_unless_cancelled, Backoff};
use crate::store::TokenStore;

/// Identifies one interactive sign-in flow.
pub type FlowHandle = Uuid;

/// Session state as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Unauthenticated,
    AwaitingUserAction,
    Authenticated,
    Refreshing,
}

impl fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unauthenticated => "signed out",
            Self::AwaitingUserAction => "waiting for sign-in",
            Self::Authenticated => "signed in",
            Self::Refreshing => "refreshing",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    DeviceCode,
    AuthorizationCode,
}

impl std::str::FromStr for FlowKind {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "device_code" | "device" => Ok(Self::DeviceCode),
            "authorization_code" | "browser" => Ok(Self::AuthorizationCode),
            other => Err(AuthError::FlowFailed(format!("unknown sign-in flow '{}'", other))),
        }
    }
}

/// What the user has to do to finish signing in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingFlow {
    pub handle: FlowHandle,
    pub kind: FlowKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorize_url: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Out-of-band channel for showing sign-in instructions to a person.
pub trait UserPrompt: Send + Sync {
    fn present(&self, flow: &PendingFlow);
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub account: String,
    pub default_scopes: Vec<String>,
    pub refresh_margin: Duration,
    pub refresh_retry: Backoff,
    pub flow_timeout: StdDuration,
    pub callback_port: u16,
    pub open_browser: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            account: "default".to_string(),
            default_scopes: vec!["User.Read".to_string()],
            refresh_margin: Duration::minutes(5),
            refresh_retry: Backoff::default(),
            flow_timeout: StdDuration::from_secs(900),
            callback_port: callback_server::DEFAULT_CALLBACK_PORT,
            open_browser: true,
        }
    }
}

/// Point-in-time view of the session. Never contains secrets.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: AuthStatus,
    pub account: String,
    pub username: Option<String>,
    pub tenant_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub has_refresh_token: bool,
    pub pending_flow: Option<PendingFlow>,
}

enum FlowSession {
    DeviceCode {
        grant: DeviceCodeGrant,
        scopes: Vec<String>,
    },
    AuthorizationCode {
        listener: TcpListener,
        pkce: PkceChallenge,
        state: String,
        redirect_uri: String,
        scopes: Vec<String>,
    },
}

impl FlowSession {
    fn scopes(&self) -> &[String] {
        match self {
            Self::DeviceCode { scopes, .. } | Self::AuthorizationCode { scopes, .. } => scopes,
        }
    }
}

type FlowOutcome = Option<Result<CredentialRecord, AuthError>>;

struct FlowSlot {
    pending: PendingFlow,
    /// Taken by the first completer; later completers wait on `outcome`.
    session: Option<FlowSession>,
    cancel: CancellationToken,
    outcome: watch::Sender<FlowOutcome>,
}

struct BrokerState {
    status: AuthStatus,
    record: Option<CredentialRecord>,
    loaded: bool,
    /// Bumped by sign-out; results started under an older generation are dropped.
    generation: u64,
    active_flow: Option<(FlowHandle, DateTime<Utc>)>,
}

enum RefreshFailure {
    Terminal(ProviderError),
    Transient(ProviderError),
    Cancelled,
}

pub struct CredentialBroker {
    config: BrokerConfig,
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn TokenStore>,
    prompt: Option<Arc<dyn UserPrompt>>,
    state: RwLock<BrokerState>,
    refresh_gate: Mutex<()>,
    /// Serializes flow starts without holding `flows` across the provider call.
    start_gate: Mutex<()>,
    flows: Mutex<HashMap<FlowHandle, FlowSlot>>,
}

impl CredentialBroker {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn TokenStore>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            config,
            provider,
            store,
            prompt: None,
            state: RwLock::new(BrokerState {
                status: AuthStatus::Unauthenticated,
                record: None,
                loaded: false,
                generation: 0,
                active_flow: None,
            }),
            refresh_gate: Mutex::new(()),
            start_gate: Mutex::new(()),
            flows: Mutex::new(HashMap::new()),
        }
    }

    /// Let `get_valid_token` fall back to a device code flow shown through `prompt`.
    pub fn with_prompt(mut self, prompt: Arc<dyn UserPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Return a token valid for at least the refresh margin and covering `scopes`.
    ///
    /// Empty `scopes` means the configured defaults.
    pub async fn get_valid_token(
        &self,
        scopes: &[String],
        cancel: &CancellationToken,
    ) -> Result<AccessToken, AuthError> {
        let scopes = if scopes.is_empty() {
            self.config.default_scopes.clone()
        } else {
            scopes.to_vec()
        };

        if let Some(token) = self.cached_token(&scopes).await {
            return Ok(token);
        }

        let _gate = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuthError::Cancelled),
            gate = self.refresh_gate.lock() => gate,
        };

        // Another caller may have refreshed while we waited for the gate.
        if let Some(token) = self.cached_token(&scopes).await {
            debug!("Using credentials renewed by a concurrent caller");
            return Ok(token);
        }

        self.renew(&scopes, cancel).await
    }

    pub async fn status(&self) -> AuthStatus {
        self.ensure_loaded().await;
        let mut state = self.state.write().await;
        expire_stale_flow(&mut state, Utc::now());
        state.status
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let status = self.status().await;
        let (record, active) = {
            let state = self.state.read().await;
            (state.record.clone(), state.active_flow)
        };
        let pending_flow = match active {
            Some((handle, _)) => self
                .flows
                .lock()
                .await
                .get(&handle)
                .map(|slot| slot.pending.clone()),
            None => None,
        };

        SessionSnapshot {
            status,
            account: self.config.account.clone(),
            username: record.as_ref().and_then(|r| r.username.clone()),
            tenant_id: record.as_ref().and_then(|r| r.tenant_id.clone()),
            expires_at: record.as_ref().map(|r| r.expires_at),
            scopes: record.as_ref().map(|r| r.scopes.clone()).unwrap_or_default(),
            has_refresh_token: record.as_ref().map(|r| r.has_refresh_token()).unwrap_or(false),
            pending_flow,
        }
    }

    /// Mark `token` as rejected so the next request renews it.
    pub async fn invalidate(&self, token: &AccessToken) {
        let mut state = self.state.write().await;
        if let Some(record) = state.record.as_mut() {
            if record.access_token.as_str() == token.secret() {
                record.expires_at = Utc::now() - Duration::seconds(1);
                debug!("Invalidated access token rejected by Graph");
            }
        }
    }

    /// Forget the session everywhere. Safe to call repeatedly.
    pub async fn sign_out(&self) {
        let abandoned: Vec<FlowSlot> = {
            let mut flows = self.flows.lock().await;
            flows.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &abandoned {
            slot.cancel.cancel();
        }
        drop(abandoned);

        {
            let mut state = self.state.write().await;
            state.generation += 1;
            state.record = None;
            state.status = AuthStatus::Unauthenticated;
            state.active_flow = None;
            state.loaded = true;
        }

        if let Err(e) = self.store.delete(&self.config.account) {
            warn!("Failed to remove cached credentials: {}", e);
        }
        info!("Signed out account '{}'", self.config.account);
    }

    /// Begin an interactive sign-in with the default scopes.
    ///
    /// A flow that is already pending is returned instead of starting another.
    pub async fn start_interactive_flow(
        &self,
        kind: FlowKind,
        cancel: &CancellationToken,
    ) -> Result<PendingFlow, AuthError> {
        let scopes = self.config.default_scopes.clone();
        self.start_flow(kind, &scopes, cancel).await
    }

    /// Drive a pending flow to completion. Concurrent callers share one outcome.
    pub async fn complete_interactive_flow(
        &self,
        handle: FlowHandle,
        cancel: &CancellationToken,
    ) -> Result<CredentialRecord, AuthError> {
        let (session, flow_cancel, outcome, expires_at) = {
            let mut flows = self.flows.lock().await;
            let slot = flows
                .get_mut(&handle)
                .ok_or_else(|| AuthError::UnknownFlow(handle.to_string()))?;
            (
                slot.session.take(),
                slot.cancel.clone(),
                slot.outcome.subscribe(),
                slot.pending.expires_at,
            )
        };

        let Some(session) = session else {
            debug!("Joining sign-in flow {} already in progress", handle);
            return await_outcome(outcome, cancel).await;
        };

        let generation = self.state.read().await.generation;
        let scopes = session.scopes().to_vec();
        let remaining = (expires_at - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
        let deadline = Instant::now() + remaining;

        let grant = tokio::select! {
            biased;
            _ = flow_cancel.cancelled() => Err(AuthError::Cancelled),
            result = self.drive_flow(session, deadline, cancel) => result,
        };

        let result = match grant {
            Ok(grant) => {
                let record = CredentialRecord::from_grant(
                    &self.config.account,
                    &grant,
                    &scopes,
                    None,
                    Utc::now(),
                );
                self.install(record.clone(), generation).await.map(|_| record)
            }
            Err(e) => {
                warn!("Sign-in flow {} failed: {}", handle, e);
                self.abandon_flow(handle, generation).await;
                Err(e)
            }
        };

        if let Some(slot) = self.flows.lock().await.remove(&handle) {
            slot.outcome.send_replace(Some(result.clone()));
        }
        result
    }

    async fn ensure_loaded(&self) {
        if self.state.read().await.loaded {
            return;
        }
        let mut state = self.state.write().await;
        if state.loaded {
            return;
        }
        state.loaded = true;
        if let Some(record) = self.store.load(&self.config.account) {
            info!(
                "Restored cached credentials for account '{}'",
                self.config.account
            );
            state.record = Some(record);
            if state.status == AuthStatus::Unauthenticated {
                state.status = AuthStatus::Authenticated;
            }
        }
    }

    async fn cached_token(&self, scopes: &[String]) -> Option<AccessToken> {
        self.ensure_loaded().await;
        let state = self.state.read().await;
        let record = state.record.as_ref()?;
        if record.is_fresh(self.config.refresh_margin, Utc::now()) && record.covers(scopes) {
            Some(record.access_token())
        } else {
            None
        }
    }

    /// Refresh, or fall back to interactive sign-in. Called with the gate held.
    async fn renew(
        &self,
        scopes: &[String],
        cancel: &CancellationToken,
    ) -> Result<AccessToken, AuthError> {
        let (record, generation) = {
            let state = self.state.read().await;
            (state.record.clone(), state.generation)
        };

        if let Some(record) = record {
            match record.refresh_token.clone().filter(|t| !t.is_empty()) {
                Some(refresh_token) => {
                    let wanted = merge_scopes(&record.scopes, scopes);
                    self.set_refreshing(generation).await;
                    match self
                        .refresh_with_retry(refresh_token.as_str(), &wanted, cancel)
                        .await
                    {
                        Ok(grant) => {
                            let renewed = CredentialRecord::from_grant(
                                &self.config.account,
                                &grant,
                                &wanted,
                                Some(&record),
                                Utc::now(),
                            );
                            return self.install(renewed, generation).await;
                        }
                        Err(RefreshFailure::Terminal(e)) => {
                            warn!("Refresh token rejected, discarding credentials: {}", e);
                            self.discard(generation).await;
                        }
                        Err(RefreshFailure::Transient(e)) => {
                            self.settle_refresh(generation).await;
                            return Err(AuthError::ProviderUnavailable(e.to_string()));
                        }
                        Err(RefreshFailure::Cancelled) => {
                            self.settle_refresh(generation).await;
                            return Err(AuthError::Cancelled);
                        }
                    }
                }
                None => {
                    debug!("Cached credentials expired and carry no refresh token");
                    self.discard(generation).await;
                }
            }
        }

        self.interactive_fallback(scopes, cancel).await
    }

    async fn refresh_with_retry(
        &self,
        refresh_token: &str,
        scopes: &[String],
        cancel: &CancellationToken,
    ) -> Result<TokenResponse, RefreshFailure> {
        let policy = &self.config.refresh_retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RefreshFailure::Cancelled),
                result = self.provider.refresh(refresh_token, scopes) => result,
            };

            match result {
                Ok(grant) => {
                    info!("Access token refreshed (expires in {}s)", grant.expires_in);
                    return Ok(grant);
                }
                Err(e) if e.is_terminal() => return Err(RefreshFailure::Terminal(e)),
                Err(e) if attempt >= policy.max_attempts => {
                    error!("Token refresh failed after {} attempts: {}", attempt, e);
                    return Err(RefreshFailure::Transient(e));
                }
                Err(e) => {
                    let delay = policy.delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Token refresh failed, retrying: {}",
                        e
                    );
                    if !sleep_unless_cancelled(delay, cancel).await {
                        return Err(RefreshFailure::Cancelled);
                    }
                }
            }
        }
    }

    async fn interactive_fallback(
        &self,
        scopes: &[String],
        cancel: &CancellationToken,
    ) -> Result<AccessToken, AuthError> {
        let Some(prompt) = self.prompt.clone() else {
            let message = if self.status().await == AuthStatus::AwaitingUserAction {
                "Sign-in is pending. Finish the login prompt, then retry."
            } else {
                "No valid session. Use the login tool to sign in."
            };
            return Err(AuthError::AuthRequired(message.to_string()));
        };

        let pending = self.start_flow(FlowKind::DeviceCode, scopes, cancel).await?;
        prompt.present(&pending);
        let record = self
            .complete_interactive_flow(pending.handle, cancel)
            .await?;
        Ok(record.access_token())
    }

    async fn start_flow(
        &self,
        kind: FlowKind,
        scopes: &[String],
        cancel: &CancellationToken,
    ) -> Result<PendingFlow, AuthError> {
        self.ensure_loaded().await;
        // Concurrent starts queue here and then find the flow the first one created.
        let _start = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuthError::Cancelled),
            gate = self.start_gate.lock() => gate,
        };

        let generation = {
            let mut flows = self.flows.lock().await;
            let mut state = self.state.write().await;
            let now = Utc::now();
            expire_stale_flow(&mut state, now);
            flows.retain(|_, slot| slot.pending.expires_at > now);

            if let Some((handle, _)) = state.active_flow {
                if let Some(slot) = flows.get(&handle) {
                    debug!("Reusing pending sign-in flow {}", handle);
                    return Ok(slot.pending.clone());
                }
            }
            if state.status != AuthStatus::Unauthenticated {
                return Err(AuthError::AlreadySignedIn);
            }
            state.generation
        };

        let scopes = merge_scopes(&self.config.default_scopes, scopes);
        let handle = Uuid::new_v4();
        let begin = async {
            match kind {
                FlowKind::DeviceCode => self.begin_device_code(handle, scopes).await,
                FlowKind::AuthorizationCode => self.begin_authorization_code(handle, scopes).await,
            }
        };
        let (pending, session) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuthError::Cancelled),
            begun = begin => begun?,
        };

        {
            let mut flows = self.flows.lock().await;
            let mut state = self.state.write().await;
            if state.generation != generation {
                warn!("Dropping sign-in flow {} started before sign-out", handle);
                return Err(AuthError::AuthRequired(
                    "Signed out while the sign-in flow was starting".into(),
                ));
            }

            let (outcome, _) = watch::channel(None);
            flows.insert(
                handle,
                FlowSlot {
                    pending: pending.clone(),
                    session: Some(session),
                    cancel: CancellationToken::new(),
                    outcome,
                },
            );
            state.status = AuthStatus::AwaitingUserAction;
            state.active_flow = Some((handle, pending.expires_at));
        }

        info!("Started {:?} sign-in flow {}", kind, handle);
        Ok(pending)
    }

    async fn begin_device_code(
        &self,
        handle: FlowHandle,
        scopes: Vec<String>,
    ) -> Result<(PendingFlow, FlowSession), AuthError> {
        let grant = self
            .provider
            .start_device_code(&scopes)
            .await
            .map_err(provider_failure)?;

        let lifetime = StdDuration::from_secs(grant.expires_in).min(self.config.flow_timeout);
        let message = grant.message.clone().unwrap_or_else(|| {
            format!(
                "To sign in, open {} and enter the code {}",
                grant.verification_uri, grant.user_code
            )
        });

        let pending = PendingFlow {
            handle,
            kind: FlowKind::DeviceCode,
            message,
            verification_uri: Some(grant.verification_uri.clone()),
            user_code: Some(grant.user_code.clone()),
            authorize_url: None,
            expires_at: Utc::now() + to_chrono(lifetime),
        };
        Ok((pending, FlowSession::DeviceCode { grant, scopes }))
    }

    async fn begin_authorization_code(
        &self,
        handle: FlowHandle,
        scopes: Vec<String>,
    ) -> Result<(PendingFlow, FlowSession), AuthError> {
        let listener = callback_server::bind(self.config.callback_port).await?;
        let port = listener
            .local_addr()
            .map_err(|e| AuthError::FlowFailed(e.to_string()))?
            .port();
        let redirect_uri = callback_server::redirect_uri(port);
        let pkce = PkceChallenge::new();
        let state = oauth::random_token(16);

        let url = self
            .provider
            .authorize_url(&AuthorizeRequest {
                code_challenge: &pkce.challenge,
                state: &state,
                redirect_uri: &redirect_uri,
                scopes: &scopes,
            })
            .map_err(provider_failure)?;

        if self.config.open_browser {
            if let Err(e) = open::that(url.as_str()) {
                warn!("Failed to open browser: {}", e);
            }
        }

        let pending = PendingFlow {
            handle,
            kind: FlowKind::AuthorizationCode,
            message: format!("Open {} in a browser to sign in", url),
            verification_uri: None,
            user_code: None,
            authorize_url: Some(url.to_string()),
            expires_at: Utc::now() + to_chrono(self.config.flow_timeout),
        };
        let session = FlowSession::AuthorizationCode {
            listener,
            pkce,
            state,
            redirect_uri,
            scopes,
        };
        Ok((pending, session))
    }

    async fn drive_flow(
        &self,
        session: FlowSession,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<TokenResponse, AuthError> {
        match session {
            FlowSession::DeviceCode { grant, .. } => {
                self.poll_device_code(&grant, deadline, cancel).await
            }
            FlowSession::AuthorizationCode {
                listener,
                pkce,
                state,
                redirect_uri,
                scopes,
            } => {
                let url = callback_server::wait_for_callback(&listener, deadline, cancel).await?;
                drop(listener);

                let params = oauth::parse_callback_url(&url)?;
                if params.state != state {
                    return Err(AuthError::AuthDenied("state validation failed".into()));
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(AuthError::Cancelled),
                    result = self.provider.exchange_code(&params.code, &pkce.verifier, &redirect_uri, &scopes) => {
                        result.map_err(provider_failure)
                    }
                }
            }
        }
    }

    async fn poll_device_code(
        &self,
        grant: &DeviceCodeGrant,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<TokenResponse, AuthError> {
        let mut interval = StdDuration::from_secs(grant.interval.max(1));
        loop {
            if Instant::now() >= deadline {
                return Err(AuthError::AuthTimeout);
            }
            let wake = (Instant::now() + interval).min(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AuthError::Cancelled),
                _ = tokio::time::sleep_until(wake) => {}
            }

            let poll = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AuthError::Cancelled),
                poll = self.provider.poll_device_code(grant) => poll,
            };

            match poll {
                Ok(DevicePoll::Pending) => debug!("Waiting for the user to enter the device code"),
                Ok(DevicePoll::SlowDown) => {
                    interval += StdDuration::from_secs(5);
                    debug!("Provider asked to slow down, polling every {:?}", interval);
                }
                Ok(DevicePoll::Authorized(token)) => return Ok(token),
                Ok(DevicePoll::Denied(reason)) => return Err(AuthError::AuthDenied(reason)),
                Ok(DevicePoll::Expired) => return Err(AuthError::AuthTimeout),
                Err(e @ ProviderError::Rejected { .. }) => return Err(provider_failure(e)),
                Err(e) => warn!("Device code poll failed, will retry: {}", e),
            }
        }
    }

    /// Persist and publish a new record unless a sign-out happened meanwhile.
    ///
    /// The store write runs without holding the state lock.
    async fn install(
        &self,
        record: CredentialRecord,
        generation: u64,
    ) -> Result<AccessToken, AuthError> {
        if self.state.read().await.generation != generation {
            return Err(signed_out_meanwhile());
        }

        let store = Arc::clone(&self.store);
        let account = self.config.account.clone();
        let saving = record.clone();
        match tokio::task::spawn_blocking(move || store.save(&account, &saving)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Token cache unavailable, keeping session in memory: {}", e),
            Err(e) => warn!("Token cache write aborted, keeping session in memory: {}", e),
        }

        let mut state = self.state.write().await;
        if state.generation != generation {
            // A newer sign-in owns the cache entry; otherwise undo our write.
            let superseded = state.record.is_some();
            drop(state);
            if !superseded {
                if let Err(e) = self.store.delete(&self.config.account) {
                    warn!("Failed to remove cached credentials: {}", e);
                }
            }
            return Err(signed_out_meanwhile());
        }

        info!(
            "Credentials ready for account '{}' (expires {})",
            self.config.account,
            record.expires_at.format("%H:%M:%S")
        );
        let token = record.access_token();
        state.record = Some(record);
        state.status = AuthStatus::Authenticated;
        state.active_flow = None;
        Ok(token)
    }

    async fn discard(&self, generation: u64) {
        {
            let mut state = self.state.write().await;
            if state.generation != generation {
                return;
            }
            state.record = None;
            state.status = AuthStatus::Unauthenticated;
        }
        if let Err(e) = self.store.delete(&self.config.account) {
            warn!("Failed to remove cached credentials: {}", e);
        }
    }

    async fn set_refreshing(&self, generation: u64) {
        let mut state = self.state.write().await;
        if state.generation == generation {
            state.status = AuthStatus::Refreshing;
        }
    }

    /// A failed refresh leaves the record in place for the next attempt.
    async fn settle_refresh(&self, generation: u64) {
        let mut state = self.state.write().await;
        if state.generation == generation && state.status == AuthStatus::Refreshing {
            state.status = AuthStatus::Authenticated;
        }
    }

    async fn abandon_flow(&self, handle: FlowHandle, generation: u64) {
        let mut state = self.state.write().await;
        if state.generation != generation {
            return;
        }
        if matches!(state.active_flow, Some((active, _)) if active == handle) {
            state.active_flow = None;
            if state.status == AuthStatus::AwaitingUserAction {
                state.status = AuthStatus::Unauthenticated;
            }
        }
    }
}

fn expire_stale_flow(state: &mut BrokerState, now: DateTime<Utc>) {
    if let Some((handle, expires_at)) = state.active_flow {
        if expires_at <= now {
            debug!("Sign-in flow {} expired", handle);
            state.active_flow = None;
            if state.status == AuthStatus::AwaitingUserAction {
                state.status = AuthStatus::Unauthenticated;
            }
        }
    }
}

async fn await_outcome(
    mut outcome: watch::Receiver<FlowOutcome>,
    cancel: &CancellationToken,
) -> Result<CredentialRecord, AuthError> {
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AuthError::Cancelled),
        changed = outcome.wait_for(Option::is_some) => changed.map(|value| (*value).clone()),
    };
    match result {
        Ok(Some(result)) => result,
        _ => Err(AuthError::AuthRequired(
            "Sign-in flow ended without a result".into(),
        )),
    }
}

fn signed_out_meanwhile() -> AuthError {
    warn!("Discarding credentials obtained after sign-out");
    AuthError::AuthRequired("Signed out while credentials were being obtained".into())
}

fn provider_failure(error: ProviderError) -> AuthError {
    match error {
        ProviderError::Rejected { code, description } => {
            AuthError::AuthDenied(format!("{}: {}", code, description))
        }
        other => AuthError::ProviderUnavailable(other.to_string()),
    }
}

fn to_chrono(duration: StdDuration) -> Duration {
    Duration::from_std(duration).unwrap_or_else(|_| Duration::days(1))
}
