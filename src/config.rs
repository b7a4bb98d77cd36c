//! Configuration loading and management.
//!
//! Loads configuration from embedded config.toml with environment variable overrides.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::auth::BrokerConfig;
use crate::graph::{GraphConfig, ThrottlePolicy};
use crate::retry::Backoff;

/// Embedded configuration file content.
const CONFIG_TOML: &str = include_str!("../config.toml");

const PLACEHOLDER_CLIENT_ID: &str = "YOUR_AZURE_AD_CLIENT_ID";

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub oauth: OAuthConfig,
    pub api: ApiConfig,
    pub token: TokenConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    pub tenant: String,
    pub authority: String,
    pub callback_port: u16,
    pub open_browser: bool,
    pub flow_timeout_seconds: u64,
    pub scopes: ScopesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScopesConfig {
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub graph_base_url: String,
    pub request_timeout_seconds: u64,
    pub read_only: bool,
    pub max_retry_after_seconds: u64,
    pub max_throttle_attempts: u32,
    pub max_server_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub account: String,
    pub refresh_before_expiry_seconds: u64,
    pub refresh_attempts: u32,
    #[serde(default)]
    pub cache_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub log_file: String,
}

impl Config {
    /// Load configuration from embedded config.toml with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::embedded()?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// The embedded defaults, without overrides or validation.
    pub fn embedded() -> Result<Self> {
        toml::from_str(CONFIG_TOML).context("Failed to parse embedded config.toml")
    }

    /// Apply `MS365_MCP_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(client_id) = lookup("MS365_MCP_CLIENT_ID") {
            self.oauth.client_id = client_id;
        }
        if let Some(tenant) = lookup("MS365_MCP_TENANT_ID") {
            self.oauth.tenant = tenant;
        }
        if let Some(authority) = lookup("MS365_MCP_AUTHORITY") {
            self.oauth.authority = authority;
        }
        if let Some(port) = lookup("MS365_MCP_CALLBACK_PORT").and_then(|p| p.parse().ok()) {
            self.oauth.callback_port = port;
        }
        if let Some(url) = lookup("MS365_MCP_GRAPH_URL") {
            self.api.graph_base_url = url;
        }
        if let Some(flag) = lookup("MS365_MCP_READ_ONLY") {
            self.api.read_only = parse_flag(&flag);
        }
        if let Some(dir) = lookup("MS365_MCP_TOKEN_CACHE_DIR") {
            self.token.cache_dir = dir;
        }
        if let Some(account) = lookup("MS365_MCP_ACCOUNT") {
            self.token.account = account;
        }
        if let Some(level) = lookup("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Validate that required configuration is present.
    pub fn validate(&self) -> Result<()> {
        if self.oauth.client_id.is_empty() || self.oauth.client_id == PLACEHOLDER_CLIENT_ID {
            anyhow::bail!(
                "Azure AD client_id not configured. Set MS365_MCP_CLIENT_ID environment variable \
                 or update config.toml"
            );
        }

        if self.oauth.tenant.is_empty() {
            anyhow::bail!("Azure AD tenant not configured. Set MS365_MCP_TENANT_ID");
        }

        url::Url::parse(&self.api.graph_base_url)
            .with_context(|| format!("Invalid Graph base URL '{}'", self.api.graph_base_url))?;
        url::Url::parse(&self.oauth.authority)
            .with_context(|| format!("Invalid authority URL '{}'", self.oauth.authority))?;

        if self.token.account.trim().is_empty() {
            anyhow::bail!("Token account label must not be empty");
        }

        Ok(())
    }

    /// Directory holding the on-disk token cache.
    pub fn token_cache_dir(&self) -> PathBuf {
        if self.token.cache_dir.trim().is_empty() {
            crate::settings::token_cache_directory()
        } else {
            PathBuf::from(&self.token.cache_dir)
        }
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            account: self.token.account.clone(),
            default_scopes: self.oauth.scopes.scopes.clone(),
            refresh_margin: chrono::Duration::seconds(
                self.token.refresh_before_expiry_seconds as i64,
            ),
            refresh_retry: Backoff {
                max_attempts: self.token.refresh_attempts.max(1),
                ..Backoff::default()
            },
            flow_timeout: Duration::from_secs(self.oauth.flow_timeout_seconds),
            callback_port: self.oauth.callback_port,
            open_browser: self.oauth.open_browser,
        }
    }

    pub fn graph_config(&self) -> GraphConfig {
        let max_wait = Duration::from_secs(self.api.max_retry_after_seconds);
        GraphConfig {
            base_url: self.api.graph_base_url.clone(),
            read_only: self.api.read_only,
            timeout: Duration::from_secs(self.api.request_timeout_seconds),
            throttle: ThrottlePolicy {
                max_attempts: self.api.max_throttle_attempts.max(1),
                max_wait,
                fallback: Backoff {
                    max: max_wait,
                    ..Backoff::default()
                },
            },
            server_retry: Backoff {
                max_attempts: self.api.max_server_attempts.max(1),
                ..Backoff::default()
            },
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
