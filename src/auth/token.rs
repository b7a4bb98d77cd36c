//! Credential records and scope bookkeeping.

use std::collections::BTreeSet;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::provider::TokenResponse;
use crate::store::SecureString;

/// Scopes every sign-in carries implicitly. They never gate token reuse.
const OIDC_SCOPES: &[&str] = &["openid", "profile", "email", "offline_access"];

const GRAPH_RESOURCE: &str = "https://graph.microsoft.com/";

/// Everything needed to call Graph as one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub account: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    pub access_token: SecureString,
    #[serde(default)]
    pub refresh_token: Option<SecureString>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub obtained_at: DateTime<Utc>,
}

impl CredentialRecord {
    /// Build a record from a successful grant.
    ///
    /// Azure AD fails the grant outright when a requested scope is not
    /// consented, so a successful response covers everything requested
    /// in addition to what it lists.
    pub fn from_grant(
        account: &str,
        grant: &TokenResponse,
        requested: &[String],
        previous: Option<&CredentialRecord>,
        now: DateTime<Utc>,
    ) -> Self {
        let claims = grant.id_token.as_deref().and_then(decode_id_token);
        let (tenant_id, username) = match claims {
            Some(claims) => (claims.tid, claims.preferred_username.or(claims.upn)),
            None => (
                previous.and_then(|p| p.tenant_id.clone()),
                previous.and_then(|p| p.username.clone()),
            ),
        };

        let refresh_token = grant
            .refresh_token
            .clone()
            .map(SecureString::from)
            .or_else(|| previous.and_then(|p| p.refresh_token.clone()));

        Self {
            account: account.to_string(),
            tenant_id,
            username,
            access_token: SecureString::from(grant.access_token.clone()),
            refresh_token,
            expires_at: now + Duration::seconds(grant.expires_in as i64),
            scopes: merge_scopes(&parse_scope_list(&grant.scope), requested),
            obtained_at: now,
        }
    }

    /// True if the access token outlives `now + margin`.
    pub fn is_fresh(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at - margin > now
    }

    /// True if the granted scopes are a superset of `required`.
    pub fn covers(&self, required: &[String]) -> bool {
        let granted = normalized_set(&self.scopes);
        normalized_set(required)
            .iter()
            .filter(|scope| scope.as_str() != ".default")
            .all(|scope| granted.contains(scope))
    }

    pub fn access_token(&self) -> AccessToken {
        AccessToken {
            value: self.access_token.clone(),
            expires_at: self.expires_at,
        }
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token
            .as_ref()
            .map(|t| !t.is_empty())
            .unwrap_or(false)
    }
}

/// A bearer token handed to Graph callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    value: SecureString,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn secret(&self) -> &str {
        self.value.as_str()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Canonical form of one scope: lowercase, Graph resource prefix stripped.
/// OIDC scopes normalize to `None`.
pub fn normalize_scope(scope: &str) -> Option<String> {
    let scope = scope.trim();
    if scope.is_empty() {
        return None;
    }
    let lower = scope.to_ascii_lowercase();
    let short = lower.strip_prefix(GRAPH_RESOURCE).unwrap_or(&lower);
    if OIDC_SCOPES.contains(&short) {
        None
    } else {
        Some(short.to_string())
    }
}

/// Split a space-delimited scope string.
pub fn parse_scope_list(scopes: &str) -> Vec<String> {
    scopes.split_whitespace().map(str::to_string).collect()
}

/// Normalized, de-duplicated union of two scope lists.
pub fn merge_scopes(a: &[String], b: &[String]) -> Vec<String> {
    let mut merged = normalized_set(a);
    merged.extend(normalized_set(b));
    merged.into_iter().collect()
}

fn normalized_set(scopes: &[String]) -> BTreeSet<String> {
    scopes.iter().filter_map(|s| normalize_scope(s)).collect()
}

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    tid: Option<String>,
    preferred_username: Option<String>,
    upn: Option<String>,
}

/// Read identity claims from an ID token payload. The signature is not
/// checked; the token came straight from the token endpoint over TLS.
fn decode_id_token(token: &str) -> Option<IdTokenClaims> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(scope: &str) -> TokenResponse {
        TokenResponse {
            access_token: "access".into(),
            token_type: "Bearer".into(),
            expires_in: 3600,
            refresh_token: Some("refresh".into()),
            scope: scope.into(),
            id_token: None,
        }
    }

    fn id_token(claims: serde_json::Value) -> String {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
        format!("eyJhbGciOiJub25lIn0.{}.sig", payload)
    }

    #[test]
    fn test_normalize_scope() {
        assert_eq!(normalize_scope("Mail.Read").as_deref(), Some("mail.read"));
        assert_eq!(
            normalize_scope("https://graph.microsoft.com/User.Read").as_deref(),
            Some("user.read")
        );
        assert_eq!(normalize_scope("offline_access"), None);
        assert_eq!(normalize_scope("  "), None);
    }

    #[test]
    fn test_covers_requires_superset() {
        let now = Utc::now();
        let record = CredentialRecord::from_grant(
            "default",
            &grant("User.Read Mail.Read openid profile"),
            &[],
            None,
            now,
        );
        assert!(record.covers(&["user.read".into()]));
        assert!(record.covers(&["Mail.Read".into(), "offline_access".into()]));
        assert!(!record.covers(&["Mail.Send".into()]));
        assert!(record.covers(&[]));
    }

    #[test]
    fn test_requested_scopes_are_recorded() {
        let record = CredentialRecord::from_grant(
            "default",
            &grant(""),
            &["Calendars.Read".into()],
            None,
            Utc::now(),
        );
        assert!(record.covers(&["Calendars.Read".into()]));
    }

    #[test]
    fn test_freshness_honours_margin() {
        let now = Utc::now();
        let mut record = CredentialRecord::from_grant("default", &grant(""), &[], None, now);
        record.expires_at = now + Duration::minutes(4);

        assert!(record.is_fresh(Duration::zero(), now));
        assert!(!record.is_fresh(Duration::minutes(5), now));
    }

    #[test]
    fn test_refresh_token_carried_over() {
        let now = Utc::now();
        let first = CredentialRecord::from_grant("default", &grant(""), &[], None, now);

        let mut renewed = grant("");
        renewed.refresh_token = None;
        let second = CredentialRecord::from_grant("default", &renewed, &[], Some(&first), now);
        assert_eq!(
            second.refresh_token.as_ref().map(|t| t.as_str()),
            Some("refresh")
        );
    }

    #[test]
    fn test_id_token_claims() {
        let mut response = grant("User.Read");
        response.id_token = Some(id_token(serde_json::json!({
            "tid": "tenant-42",
            "preferred_username": "adele@contoso.com",
        })));

        let record = CredentialRecord::from_grant("default", &response, &[], None, Utc::now());
        assert_eq!(record.tenant_id.as_deref(), Some("tenant-42"));
        assert_eq!(record.username.as_deref(), Some("adele@contoso.com"));
    }

    #[test]
    fn test_malformed_id_token_is_ignored() {
        assert!(decode_id_token("not-a-jwt").is_none());
        assert!(decode_id_token("a.!!!.c").is_none());
    }
}
