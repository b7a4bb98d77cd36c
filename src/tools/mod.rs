//! Tool registry: named operations with JSON arguments and JSON results.
//!
//! Protocol-agnostic. A host lists [`ToolRegistry::definitions`] and routes
//! calls through [`ToolRegistry::call`]; errors come back as structured
//! payloads rather than Rust errors.

pub mod auth_tools;
pub mod catalog;
pub mod graph_tools;

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::CredentialBroker;
use crate::error::AppError;
use crate::graph::GraphClient;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub text: String,
    pub is_error: bool,
}

impl ToolResponse {
    pub fn success(value: &Value) -> Self {
        Self {
            text: render(value),
            is_error: false,
        }
    }

    pub fn failure(error: &AppError) -> Self {
        Self {
            text: render(&error.payload()),
            is_error: true,
        }
    }

    /// Parse the text back into JSON.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.text).ok()
    }
}

fn render(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

pub struct ToolRegistry {
    graph: GraphClient,
}

impl ToolRegistry {
    pub fn new(graph: GraphClient) -> Self {
        Self { graph }
    }

    pub fn broker(&self) -> &Arc<CredentialBroker> {
        self.graph.broker()
    }

    pub fn graph(&self) -> &GraphClient {
        &self.graph
    }

    /// Advertised tools. Write tools are hidden in read-only mode.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let read_only = self.graph.is_read_only();
        let mut definitions = auth_tools::definitions();
        definitions.extend(
            catalog::ENDPOINTS
                .iter()
                .filter(|endpoint| !(read_only && endpoint.is_write()))
                .map(graph_tools::definition),
        );
        definitions
    }

    pub async fn call(&self, name: &str, arguments: Value, cancel: &CancellationToken) -> ToolResponse {
        info!(tool = name, "Tool invoked");
        match self.dispatch(name, arguments, cancel).await {
            Ok(value) => ToolResponse::success(&value),
            Err(e) => {
                warn!(tool = name, category = %e.category(), "Tool failed: {}", e);
                ToolResponse::failure(&e)
            }
        }
    }

    async fn dispatch(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, AppError> {
        let args = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => {
                return Err(AppError::InvalidInput(
                    "tool arguments must be a JSON object".into(),
                ))
            }
        };

        if let Some(tool) = auth_tools::AuthTool::from_name(name) {
            return auth_tools::invoke(self, tool, &args, cancel).await;
        }

        match catalog::find(name) {
            Some(endpoint) => graph_tools::invoke(&self.graph, endpoint, &args, cancel).await,
            None => Err(AppError::InvalidInput(format!("unknown tool '{}'", name))),
        }
    }
}
