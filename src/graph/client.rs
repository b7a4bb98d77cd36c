//! Graph request executor.
//!
//! Attaches a broker-issued token to every request and applies the retry
//! rules: one re-authentication on 401, `Retry-After` on throttling,
//! exponential backoff on 5xx and transport failures. Write methods are
//! refused up front in read-only mode.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::page::{GraphPage, PageStream};
use super::request::GraphRequest;
use super::throttle::{parse_retry_after, ThrottlePolicy};
use crate::auth::CredentialBroker;
use crate::error::GraphError;
use crate::retry::{sleep_unless_cancelled, Backoff};

/// HTTP connection timeout.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub base_url: String,
    pub read_only: bool,
    pub timeout: Duration,
    pub throttle: ThrottlePolicy,
    pub server_retry: Backoff,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.microsoft.com/v1.0".to_string(),
            read_only: false,
            timeout: Duration::from_secs(30),
            throttle: ThrottlePolicy::default(),
            server_retry: Backoff::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    error: GraphErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GraphErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

struct ClientInner {
    http: reqwest::Client,
    broker: Arc<CredentialBroker>,
    base_url: Url,
    config: GraphConfig,
}

/// Microsoft Graph API client. Cheap to clone.
#[derive(Clone)]
pub struct GraphClient {
    inner: Arc<ClientInner>,
}

impl GraphClient {
    pub fn new(broker: Arc<CredentialBroker>, config: GraphConfig) -> Result<Self, GraphError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| GraphError::InvalidResponse(format!("invalid Graph base URL: {}", e)))?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GraphError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                broker,
                base_url,
                config,
            }),
        })
    }

    pub fn broker(&self) -> &Arc<CredentialBroker> {
        &self.inner.broker
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.config.read_only
    }

    /// Validate `request` and return its lazy page sequence.
    ///
    /// Nothing is sent until the first page is requested. Mutations are
    /// rejected here in read-only mode.
    pub fn execute(
        &self,
        request: GraphRequest,
        cancel: &CancellationToken,
    ) -> Result<PageStream, GraphError> {
        if self.inner.config.read_only && request.is_mutation() {
            warn!(
                "Blocked {} {} in read-only mode",
                request.method, request.path
            );
            return Err(GraphError::WriteDisabled {
                method: request.method.to_string(),
                path: request.path,
            });
        }
        Ok(PageStream::new(self.clone(), request, cancel.clone()))
    }

    /// First page only.
    pub async fn send(
        &self,
        request: GraphRequest,
        cancel: &CancellationToken,
    ) -> Result<GraphPage, GraphError> {
        let mut pages = self.execute(request, cancel)?;
        pages
            .next_page()
            .await
            .unwrap_or_else(|| Ok(GraphPage::default()))
    }

    /// All items across pages, up to `limit`.
    pub async fn collect(
        &self,
        request: GraphRequest,
        cancel: &CancellationToken,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, GraphError> {
        self.execute(request, cancel)?.collect_items(limit).await
    }

    /// Fetch one page: the first if `next_link` is `None`.
    pub(crate) async fn fetch_page(
        &self,
        request: &GraphRequest,
        next_link: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<GraphPage, GraphError> {
        let (method, url) = match next_link {
            None => (request.method.clone(), request.url(&self.inner.base_url)?),
            Some(link) => (Method::GET, self.checked_next_link(link)?),
        };
        let config = &self.inner.config;

        let mut reauthenticated = false;
        let mut throttled: u32 = 0;
        let mut failures: u32 = 0;

        loop {
            let token = self
                .inner
                .broker
                .get_valid_token(&request.scopes, cancel)
                .await?;

            let mut builder = self
                .inner
                .http
                .request(method.clone(), url.clone())
                .bearer_auth(token.secret());
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if next_link.is_none() {
                if let Some(body) = &request.body {
                    builder = builder.json(body);
                }
            }

            debug!("Graph {} {}", method, url.path());
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GraphError::Cancelled),
                sent = builder.send() => sent,
            };

            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    failures += 1;
                    if failures >= config.server_retry.max_attempts {
                        warn!("Graph unreachable after {} attempts: {}", failures, e);
                        return Err(GraphError::Network(e.to_string()));
                    }
                    let delay = config.server_retry.delay(failures);
                    warn!(attempt = failures, "Graph request failed, retrying: {}", e);
                    self.pause(delay, cancel).await?;
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return read_page(response, cancel).await;
            }

            let hint = retry_after(&response);
            match status {
                StatusCode::UNAUTHORIZED => {
                    if reauthenticated {
                        warn!("Graph rejected a freshly issued token");
                        return Err(GraphError::Unauthorized);
                    }
                    reauthenticated = true;
                    info!("Graph returned 401, renewing credentials and retrying once");
                    self.inner.broker.invalidate(&token).await;
                }
                StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
                    if status == StatusCode::TOO_MANY_REQUESTS || hint.is_some() =>
                {
                    throttled += 1;
                    if throttled >= config.throttle.max_attempts {
                        warn!("Still throttled after {} attempts, giving up", throttled);
                        return Err(GraphError::ThrottledPermanently {
                            attempts: throttled,
                            retry_after: hint,
                        });
                    }
                    let wait = config.throttle.wait(hint, throttled);
                    warn!(
                        status = status.as_u16(),
                        attempt = throttled,
                        wait_ms = wait.as_millis() as u64,
                        "Graph throttled request"
                    );
                    self.pause(wait, cancel).await?;
                }
                status if status.is_client_error() => {
                    let (code, message) = error_detail(response, cancel).await?;
                    warn!("Graph request failed: HTTP {} {}", status.as_u16(), message);
                    return Err(GraphError::ClientRequestError {
                        status: status.as_u16(),
                        code,
                        message,
                    });
                }
                status => {
                    failures += 1;
                    let (_, message) = error_detail(response, cancel).await?;
                    if failures >= config.server_retry.max_attempts {
                        warn!(
                            "Graph server error HTTP {} after {} attempts",
                            status.as_u16(),
                            failures
                        );
                        return Err(GraphError::ServerError {
                            status: status.as_u16(),
                            attempts: failures,
                            message,
                        });
                    }
                    let delay = config.server_retry.delay(failures);
                    warn!(
                        attempt = failures,
                        "Graph server error HTTP {}, retrying",
                        status.as_u16()
                    );
                    self.pause(delay, cancel).await?;
                }
            }
        }
    }

    async fn pause(&self, wait: Duration, cancel: &CancellationToken) -> Result<(), GraphError> {
        if sleep_unless_cancelled(wait, cancel).await {
            Ok(())
        } else {
            Err(GraphError::Cancelled)
        }
    }

    /// Next links must stay on the Graph origin the token was issued for.
    fn checked_next_link(&self, link: &str) -> Result<Url, GraphError> {
        let url = Url::parse(link)
            .map_err(|e| GraphError::InvalidResponse(format!("malformed next link: {}", e)))?;
        if url.origin() != self.inner.base_url.origin() {
            warn!("Refusing to follow next link to {}", url.origin().ascii_serialization());
            return Err(GraphError::InvalidResponse(
                "next link points outside the Graph base URL".into(),
            ));
        }
        Ok(url)
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_retry_after(value, Utc::now()))
}

async fn read_page(
    response: Response,
    cancel: &CancellationToken,
) -> Result<GraphPage, GraphError> {
    if response.status() == StatusCode::NO_CONTENT {
        return Ok(GraphPage::default());
    }
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("json"))
        .unwrap_or(false);

    let text = body_text(response, cancel).await?;
    if text.trim().is_empty() {
        return Ok(GraphPage::default());
    }
    if !is_json {
        return Ok(GraphPage::from_body(Value::String(text)));
    }

    let body: Value =
        serde_json::from_str(&text).map_err(|e| GraphError::InvalidResponse(e.to_string()))?;
    Ok(GraphPage::from_body(body))
}

/// Body as text; a stalled body yields to `cancel`.
async fn body_text(response: Response, cancel: &CancellationToken) -> Result<String, GraphError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GraphError::Cancelled),
        text = response.text() => text.map_err(|e| GraphError::Network(e.to_string())),
    }
}

/// Graph error code and message, falling back to the HTTP reason.
async fn error_detail(
    response: Response,
    cancel: &CancellationToken,
) -> Result<(Option<String>, String), GraphError> {
    let status = response.status();
    let text = match body_text(response, cancel).await {
        Err(GraphError::Cancelled) => return Err(GraphError::Cancelled),
        other => other.unwrap_or_default(),
    };
    let detail = match serde_json::from_str::<GraphErrorBody>(&text) {
        Ok(body) => {
            let message = body
                .error
                .message
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
            (body.error.code, message)
        }
        Err(_) => (
            None,
            status.canonical_reason().unwrap_or("error").to_string(),
        ),
    };
    Ok(detail)
}
