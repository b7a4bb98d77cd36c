//! Graph request description.

use reqwest::Method;
use serde_json::Value;
use url::Url;

use crate::error::GraphError;

/// One logical Graph call. Paging is handled by the executor.
#[derive(Debug, Clone)]
pub struct GraphRequest {
    pub method: Method,
    /// Path relative to the Graph base URL, e.g. `/me/messages`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Scopes the token must carry. Empty means the broker defaults.
    pub scopes: Vec<String>,
}

impl GraphRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            scopes: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// POST, PUT, PATCH and DELETE change tenant data.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self.method,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        )
    }

    /// Absolute URL of the first page.
    ///
    /// Query values are percent-encoded with `%20` for spaces, which OData
    /// filters require.
    pub fn url(&self, base: &Url) -> Result<Url, GraphError> {
        let mut url = format!(
            "{}/{}",
            base.as_str().trim_end_matches('/'),
            self.path.trim_start_matches('/')
        );

        let query: Vec<String> = self
            .query
            .iter()
            .map(|(key, value)| format!("{}={}", key, urlencoding::encode(value)))
            .collect();
        if !query.is_empty() {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&query.join("&"));
        }

        Url::parse(&url).map_err(|e| GraphError::InvalidResponse(format!("bad request URL: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_mutation() {
        assert!(!GraphRequest::get("/me").is_mutation());
        assert!(GraphRequest::post("/me/sendMail").is_mutation());
        assert!(GraphRequest::new(Method::PUT, "/me/photo/$value").is_mutation());
        assert!(GraphRequest::delete("/me/messages/1").is_mutation());
    }

    #[test]
    fn test_url_joins_base_and_encodes_query() {
        let base = Url::parse("https://graph.microsoft.com/v1.0/").unwrap();
        let url = GraphRequest::get("/me/messages")
            .query("$top", "10")
            .query("$filter", "isRead eq false")
            .url(&base)
            .unwrap();

        assert_eq!(
            url.as_str(),
            "https://graph.microsoft.com/v1.0/me/messages?$top=10&$filter=isRead%20eq%20false"
        );
    }

    #[test]
    fn test_url_without_query() {
        let base = Url::parse("https://graph.microsoft.com/v1.0").unwrap();
        let url = GraphRequest::get("me").url(&base).unwrap();
        assert_eq!(url.as_str(), "https://graph.microsoft.com/v1.0/me");
    }
}
