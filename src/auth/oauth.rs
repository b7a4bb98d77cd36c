//! Azure AD v2 endpoints: device code, authorization code with PKCE, refresh.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error};
use url::Url;

use super::provider::{
    AuthorizeRequest, DeviceCodeGrant, DevicePoll, IdentityProvider, TokenResponse,
};
use crate::config::Config;
use crate::error::{AuthError, ProviderError};

/// HTTP request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// HTTP connection timeout.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// PKCE code verifier and challenge pair.
#[derive(Debug)]
pub struct PkceChallenge {
    /// The code verifier (kept locally, sent in token exchange).
    pub verifier: String,
    /// The code challenge (SHA256 hash of verifier, sent in auth request).
    pub challenge: String,
}

impl PkceChallenge {
    /// Generate a new PKCE challenge pair.
    pub fn new() -> Self {
        let verifier = random_token(32);

        // challenge = BASE64URL(SHA256(verifier))
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

        Self {
            verifier,
            challenge,
        }
    }
}

impl Default for PkceChallenge {
    fn default() -> Self {
        Self::new()
    }
}

/// Random URL-safe token of `len` bytes of entropy.
pub fn random_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Identity provider backed by the Azure AD v2 endpoints.
pub struct AzureAdProvider {
    client_id: String,
    authority: String,
    tenant: String,
    http_client: reqwest::Client,
}

impl AzureAdProvider {
    pub fn new(
        client_id: impl Into<String>,
        authority: impl Into<String>,
        tenant: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProviderError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client_id: client_id.into(),
            authority: authority.into().trim_end_matches('/').to_string(),
            tenant: tenant.into(),
            http_client,
        })
    }

    /// Create a provider from configuration.
    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        Self::new(
            config.oauth.client_id.clone(),
            config.oauth.authority.clone(),
            config.oauth.tenant.clone(),
        )
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}/oauth2/v2.0/{}", self.authority, self.tenant, name)
    }

    /// POST a form to an endpoint, mapping OAuth error bodies to `Rejected`.
    async fn post_form<T>(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<T, ProviderError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = self
            .http_client
            .post(endpoint)
            .form(params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(match serde_json::from_str::<OAuthErrorBody>(&body) {
                Ok(err) => {
                    debug!("Token endpoint returned {} ({})", err.error, status);
                    let description = err.error_description.unwrap_or_else(|| err.error.clone());
                    ProviderError::rejected(err.error, first_line(&description))
                }
                Err(_) => {
                    // Log error details for debugging (doesn't expose to user)
                    error!("Token endpoint failed: HTTP {} - {}", status, body);
                    if status.is_server_error() {
                        ProviderError::Network(format!("HTTP {}", status.as_u16()))
                    } else {
                        ProviderError::InvalidResponse(format!("HTTP {}", status.as_u16()))
                    }
                }
            });
        }

        serde_json::from_str(&body).map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}

/// Scope parameter for a request. `offline_access` is always included so a
/// refresh token comes back.
fn scope_param(scopes: &[String]) -> String {
    let mut scopes: Vec<&str> = scopes.iter().map(String::as_str).collect();
    if !scopes.iter().any(|s| s.eq_ignore_ascii_case("offline_access")) {
        scopes.push("offline_access");
    }
    scopes.join(" ")
}

/// Azure AD descriptions carry trace and correlation ids on later lines.
fn first_line(description: &str) -> String {
    description.lines().next().unwrap_or_default().trim().to_string()
}

#[async_trait]
impl IdentityProvider for AzureAdProvider {
    async fn start_device_code(&self, scopes: &[String]) -> Result<DeviceCodeGrant, ProviderError> {
        let scope = scope_param(scopes);
        let params = [("client_id", self.client_id.as_str()), ("scope", scope.as_str())];
        self.post_form(&self.endpoint("devicecode"), &params).await
    }

    async fn poll_device_code(&self, grant: &DeviceCodeGrant) -> Result<DevicePoll, ProviderError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("grant_type", DEVICE_CODE_GRANT),
            ("device_code", grant.device_code.as_str()),
        ];

        match self
            .post_form::<TokenResponse>(&self.endpoint("token"), &params)
            .await
        {
            Ok(token) => Ok(DevicePoll::Authorized(token)),
            Err(ProviderError::Rejected { code, description }) => match code.as_str() {
                "authorization_pending" => Ok(DevicePoll::Pending),
                "slow_down" => Ok(DevicePoll::SlowDown),
                "authorization_declined" | "access_denied" => Ok(DevicePoll::Denied(description)),
                "expired_token" | "code_expired" => Ok(DevicePoll::Expired),
                _ => Err(ProviderError::Rejected { code, description }),
            },
            Err(e) => Err(e),
        }
    }

    fn authorize_url(&self, request: &AuthorizeRequest<'_>) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&self.endpoint("authorize"))
            .map_err(|e| ProviderError::InvalidResponse(format!("Invalid authority: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", request.redirect_uri)
            .append_pair("response_mode", "query")
            .append_pair("scope", &scope_param(request.scopes))
            .append_pair("state", request.state)
            .append_pair("code_challenge", request.code_challenge)
            .append_pair("code_challenge_method", "S256");

        Ok(url)
    }

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, ProviderError> {
        let scope = scope_param(scopes);
        let params = [
            ("client_id", self.client_id.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", code_verifier),
            ("scope", scope.as_str()),
        ];
        self.post_form(&self.endpoint("token"), &params).await
    }

    async fn refresh(
        &self,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, ProviderError> {
        let scope = scope_param(scopes);
        let params = [
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", scope.as_str()),
        ];
        self.post_form(&self.endpoint("token"), &params).await
    }
}

/// Code and state from a successful authorization redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

/// Parse OAuth callback URL to extract code and state.
pub fn parse_callback_url(url_string: &str) -> Result<CallbackParams, AuthError> {
    let url = Url::parse(url_string)
        .map_err(|_| AuthError::FlowFailed("malformed callback URL".into()))?;

    let params: HashMap<_, _> = url.query_pairs().collect();

    if let Some(error) = params.get("error") {
        let description = params
            .get("error_description")
            .map(|s| first_line(s))
            .unwrap_or_else(|| error.to_string());
        return Err(AuthError::AuthDenied(description));
    }

    let code = params
        .get("code")
        .ok_or_else(|| AuthError::FlowFailed("callback is missing the authorization code".into()))?
        .to_string();

    let state = params
        .get("state")
        .ok_or_else(|| AuthError::AuthDenied("callback is missing the state parameter".into()))?
        .to_string();

    Ok(CallbackParams { code, state })
}
