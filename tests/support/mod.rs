#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use url::Url;

use m365_mcp::auth::provider::AuthorizeRequest;
use m365_mcp::auth::{
    BrokerConfig, CredentialBroker, CredentialRecord, DeviceCodeGrant, DevicePoll,
    IdentityProvider, PendingFlow, TokenResponse, UserPrompt,
};
use m365_mcp::error::{ProviderError, StoreError};
use m365_mcp::retry::Backoff;
use m365_mcp::store::{MemoryTokenStore, SecureString, TokenStore};

pub const ACCOUNT: &str = "default";

/// Scripted identity provider that counts every call.
#[derive(Default)]
pub struct FakeProvider {
    pub refresh_calls: AtomicUsize,
    pub device_starts: AtomicUsize,
    pub polls: AtomicUsize,
    pub refresh_delay: Duration,
    pub start_delay: Duration,
    pub device_expires_in: u64,
    refresh_failure: Mutex<Option<ProviderError>>,
    poll_script: Mutex<VecDeque<DevicePoll>>,
    last_refresh_scopes: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            device_expires_in: 600,
            ..Self::default()
        }
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn with_device_expiry(mut self, seconds: u64) -> Self {
        self.device_expires_in = seconds;
        self
    }

    /// Every refresh fails with `error`.
    pub fn failing_refresh(self, error: ProviderError) -> Self {
        *self.refresh_failure.lock().unwrap() = Some(error);
        self
    }

    /// Poll outcomes in order; once exhausted every poll is `Pending`.
    pub fn with_polls(self, polls: Vec<DevicePoll>) -> Self {
        *self.poll_script.lock().unwrap() = polls.into();
        self
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn last_refresh_scopes(&self) -> Vec<String> {
        self.last_refresh_scopes.lock().unwrap().clone()
    }
}

pub fn token_response(access_token: &str, scopes: &[String]) -> TokenResponse {
    TokenResponse {
        access_token: access_token.to_string(),
        token_type: "Bearer".to_string(),
        expires_in: 3600,
        refresh_token: Some(format!("refresh-for-{}", access_token)),
        scope: scopes.join(" "),
        id_token: None,
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    async fn start_device_code(&self, _scopes: &[String]) -> Result<DeviceCodeGrant, ProviderError> {
        self.device_starts.fetch_add(1, Ordering::SeqCst);
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        Ok(DeviceCodeGrant {
            device_code: "device-code-1".to_string(),
            user_code: "ABCD-EFGH".to_string(),
            verification_uri: "https://microsoft.com/devicelogin".to_string(),
            expires_in: self.device_expires_in,
            interval: 1,
            message: None,
        })
    }

    async fn poll_device_code(&self, _grant: &DeviceCodeGrant) -> Result<DevicePoll, ProviderError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .poll_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(DevicePoll::Pending))
    }

    fn authorize_url(&self, request: &AuthorizeRequest<'_>) -> Result<Url, ProviderError> {
        let mut url = Url::parse("https://login.example.com/authorize").unwrap();
        url.query_pairs_mut().append_pair("state", request.state);
        Ok(url)
    }

    async fn exchange_code(
        &self,
        _code: &str,
        _code_verifier: &str,
        _redirect_uri: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, ProviderError> {
        Ok(token_response("browser-token", scopes))
    }

    async fn refresh(
        &self,
        _refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, ProviderError> {
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_refresh_scopes.lock().unwrap() = scopes.to_vec();
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        if let Some(error) = self.refresh_failure.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(token_response(&format!("token-{}", call + 1), scopes))
    }
}

/// Records every prompt it is asked to show.
#[derive(Default)]
pub struct RecordingPrompt {
    pub shown: Mutex<Vec<PendingFlow>>,
}

impl UserPrompt for RecordingPrompt {
    fn present(&self, flow: &PendingFlow) {
        self.shown.lock().unwrap().push(flow.clone());
    }
}

/// Loads a fixed record; every write fails.
pub struct FailingStore {
    record: Option<CredentialRecord>,
    pub save_attempts: AtomicUsize,
    pub delete_attempts: AtomicUsize,
}

impl FailingStore {
    pub fn new(record: Option<CredentialRecord>) -> Self {
        Self {
            record,
            save_attempts: AtomicUsize::new(0),
            delete_attempts: AtomicUsize::new(0),
        }
    }
}

impl TokenStore for FailingStore {
    fn load(&self, _key: &str) -> Option<CredentialRecord> {
        self.record.clone()
    }

    fn save(&self, _key: &str, _record: &CredentialRecord) -> Result<(), StoreError> {
        self.save_attempts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::WriteFailed("read-only file system".into()))
    }

    fn delete(&self, _key: &str) -> Result<(), StoreError> {
        self.delete_attempts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::DeleteFailed("permission denied".into()))
    }
}

/// In-memory store whose writes take `delay`.
pub struct SlowStore {
    pub inner: MemoryTokenStore,
    delay: Duration,
}

impl SlowStore {
    pub fn new(record: CredentialRecord, delay: Duration) -> Self {
        Self {
            inner: MemoryTokenStore::with_record(ACCOUNT, record),
            delay,
        }
    }
}

impl TokenStore for SlowStore {
    fn load(&self, key: &str) -> Option<CredentialRecord> {
        self.inner.load(key)
    }

    fn save(&self, key: &str, record: &CredentialRecord) -> Result<(), StoreError> {
        std::thread::sleep(self.delay);
        self.inner.save(key, record)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key)
    }
}

pub fn record(access_token: &str, expires_in: chrono::Duration) -> CredentialRecord {
    let now = Utc::now();
    CredentialRecord {
        account: ACCOUNT.to_string(),
        tenant_id: Some("tenant-1".to_string()),
        username: Some("adele@contoso.com".to_string()),
        access_token: SecureString::from(access_token),
        refresh_token: Some(SecureString::from("refresh-1")),
        expires_at: now + expires_in,
        scopes: vec!["user.read".to_string()],
        obtained_at: now,
    }
}

/// Valid for an hour.
pub fn fresh_record() -> CredentialRecord {
    record("token-1", chrono::Duration::hours(1))
}

/// Expired a minute ago, refreshable.
pub fn stale_record() -> CredentialRecord {
    record("token-1", chrono::Duration::minutes(-1))
}

pub fn broker_config() -> BrokerConfig {
    BrokerConfig {
        account: ACCOUNT.to_string(),
        default_scopes: vec!["User.Read".to_string()],
        refresh_margin: chrono::Duration::minutes(5),
        refresh_retry: Backoff::immediate(3),
        flow_timeout: Duration::from_secs(600),
        callback_port: 0,
        open_browser: false,
    }
}

pub fn seeded_store(record: CredentialRecord) -> Arc<MemoryTokenStore> {
    Arc::new(MemoryTokenStore::with_record(ACCOUNT, record))
}

pub fn broker(provider: Arc<FakeProvider>, store: Arc<MemoryTokenStore>) -> Arc<CredentialBroker> {
    let store: Arc<dyn TokenStore> = store;
    Arc::new(CredentialBroker::new(provider, store, broker_config()))
}
