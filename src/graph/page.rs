//! Graph pages and the lazy page sequence.

use futures::stream::{self, Stream};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::client::GraphClient;
use super::request::GraphRequest;
use crate::error::GraphError;

/// One page of a Graph response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphPage {
    pub items: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

impl GraphPage {
    /// Interpret a JSON body. Collections contribute their `value` array;
    /// anything else is a single item.
    pub fn from_body(body: Value) -> Self {
        match body {
            Value::Null => Self::default(),
            Value::Object(mut map) if matches!(map.get("value"), Some(Value::Array(_))) => {
                let items = match map.remove("value") {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                let link = |map: &serde_json::Map<String, Value>, key: &str| {
                    map.get(key).and_then(Value::as_str).map(str::to_string)
                };
                Self {
                    next_link: link(&map, "@odata.nextLink"),
                    delta_link: link(&map, "@odata.deltaLink"),
                    count: map.get("@odata.count").and_then(Value::as_u64),
                    items,
                }
            }
            other => Self {
                items: vec![other],
                ..Self::default()
            },
        }
    }
}

enum Cursor {
    First,
    Next(String),
    Done,
}

/// Lazy sequence of pages. Each page is fetched only when asked for.
pub struct PageStream {
    client: GraphClient,
    request: GraphRequest,
    cancel: CancellationToken,
    cursor: Cursor,
    pages_fetched: usize,
}

impl PageStream {
    pub(crate) fn new(client: GraphClient, request: GraphRequest, cancel: CancellationToken) -> Self {
        Self {
            client,
            request,
            cancel,
            cursor: Cursor::First,
            pages_fetched: 0,
        }
    }

    /// Fetch the next page, or `None` once the last page has been returned
    /// or an error ended the sequence.
    pub async fn next_page(&mut self) -> Option<Result<GraphPage, GraphError>> {
        let current = match std::mem::replace(&mut self.cursor, Cursor::Done) {
            Cursor::Done => return None,
            Cursor::First => None,
            Cursor::Next(link) => Some(link),
        };

        let result = self
            .client
            .fetch_page(&self.request, current.as_deref(), &self.cancel)
            .await;

        if let Ok(page) = &result {
            self.pages_fetched += 1;
            if let Some(next) = &page.next_link {
                if current.as_deref() == Some(next.as_str()) {
                    warn!("Graph returned the same next link twice, stopping pagination");
                } else {
                    self.cursor = Cursor::Next(next.clone());
                }
            }
        }
        Some(result)
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<GraphPage, GraphError>> {
        stream::unfold(self, |mut pages| async move {
            pages.next_page().await.map(|page| (page, pages))
        })
    }

    /// Concatenate items across pages, stopping early once `limit` is reached.
    pub async fn collect_items(mut self, limit: Option<usize>) -> Result<Vec<Value>, GraphError> {
        let mut items = Vec::new();
        while let Some(page) = self.next_page().await {
            items.extend(page?.items);
            if let Some(limit) = limit {
                if items.len() >= limit {
                    items.truncate(limit);
                    break;
                }
            }
        }
        Ok(items)
    }
}
