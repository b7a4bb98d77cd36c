//! Identity provider contract.
//!
//! The broker only talks to Azure AD through [`IdentityProvider`], which keeps
//! the token endpoints swappable in tests.

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::error::ProviderError;

/// Token response from Azure AD.
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: u64,
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub id_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scope", &self.scope)
            .finish()
    }
}

/// Device authorization response.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeGrant {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_poll_interval() -> u64 {
    5
}

/// Outcome of one device code poll.
#[derive(Debug, Clone)]
pub enum DevicePoll {
    Pending,
    SlowDown,
    Authorized(TokenResponse),
    Denied(String),
    Expired,
}

/// Parameters of a browser authorization request.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizeRequest<'a> {
    pub code_challenge: &'a str,
    pub state: &'a str,
    pub redirect_uri: &'a str,
    pub scopes: &'a [String],
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn start_device_code(&self, scopes: &[String]) -> Result<DeviceCodeGrant, ProviderError>;

    async fn poll_device_code(&self, grant: &DeviceCodeGrant) -> Result<DevicePoll, ProviderError>;

    fn authorize_url(&self, request: &AuthorizeRequest<'_>) -> Result<Url, ProviderError>;

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, ProviderError>;

    async fn refresh(
        &self,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, ProviderError>;
}
