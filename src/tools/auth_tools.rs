//! Session tools: login, verify-login, logout, auth-status.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ToolDefinition, ToolRegistry};
use crate::auth::{AuthStatus, CredentialBroker, FlowKind};
use crate::error::{AppError, GraphError};
use crate::graph::{GraphRequest, UserProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthTool {
    Login,
    VerifyLogin,
    Logout,
    AuthStatus,
}

impl AuthTool {
    pub const ALL: [AuthTool; 4] = [Self::Login, Self::VerifyLogin, Self::Logout, Self::AuthStatus];

    pub fn name(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::VerifyLogin => "verify-login",
            Self::Logout => "logout",
            Self::AuthStatus => "auth-status",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }
}

pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: AuthTool::Login.name().into(),
            description: "Sign in to Microsoft 365. Returns the code and URL the user needs; \
                          sign-in finishes in the background."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "force": { "type": "boolean", "description": "Sign out first, even if a session exists" },
                    "flow": {
                        "type": "string",
                        "enum": ["device_code", "authorization_code"],
                        "description": "Sign-in flow (default: device_code)"
                    }
                },
                "additionalProperties": false,
            }),
            read_only: true,
        },
        ToolDefinition {
            name: AuthTool::VerifyLogin.name().into(),
            description: "Check the session by reading the signed-in user's profile".into(),
            input_schema: empty_schema(),
            read_only: true,
        },
        ToolDefinition {
            name: AuthTool::Logout.name().into(),
            description: "Sign out and delete cached credentials".into(),
            input_schema: empty_schema(),
            read_only: true,
        },
        ToolDefinition {
            name: AuthTool::AuthStatus.name().into(),
            description: "Report the session state without contacting Microsoft".into(),
            input_schema: empty_schema(),
            read_only: true,
        },
    ]
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {}, "additionalProperties": false })
}

pub async fn invoke(
    registry: &ToolRegistry,
    tool: AuthTool,
    args: &Map<String, Value>,
    cancel: &CancellationToken,
) -> Result<Value, AppError> {
    let broker = registry.broker();
    match tool {
        AuthTool::Login => login(broker, args, cancel).await,
        AuthTool::VerifyLogin => verify_login(registry, cancel).await,
        AuthTool::Logout => {
            broker.sign_out().await;
            Ok(json!({ "message": "Logged out successfully" }))
        }
        AuthTool::AuthStatus => {
            let snapshot = broker.snapshot().await;
            serde_json::to_value(snapshot).map_err(|e| AppError::Internal(e.to_string()))
        }
    }
}

async fn login(
    broker: &Arc<CredentialBroker>,
    args: &Map<String, Value>,
    cancel: &CancellationToken,
) -> Result<Value, AppError> {
    let force = args.get("force").and_then(Value::as_bool).unwrap_or(false);
    let kind = match args.get("flow").and_then(Value::as_str) {
        Some(flow) => flow
            .parse::<FlowKind>()
            .map_err(|e| AppError::InvalidInput(e.to_string()))?,
        None => FlowKind::DeviceCode,
    };

    if force {
        broker.sign_out().await;
    } else if matches!(
        broker.status().await,
        AuthStatus::Authenticated | AuthStatus::Refreshing
    ) {
        let snapshot = broker.snapshot().await;
        return Ok(json!({
            "status": "already_signed_in",
            "username": snapshot.username,
            "message": "Already signed in. Pass force=true to sign in again.",
        }));
    }

    let pending = broker.start_interactive_flow(kind, cancel).await?;

    // The tool returns right away; the user finishes signing in out of band.
    let background = Arc::clone(broker);
    let handle = pending.handle;
    tokio::spawn(async move {
        let cancel = CancellationToken::new();
        match background.complete_interactive_flow(handle, &cancel).await {
            Ok(record) => info!(
                "Sign-in completed for {}",
                record.username.as_deref().unwrap_or("unknown user")
            ),
            Err(e) => warn!("Sign-in flow {} ended: {}", handle, e),
        }
    });

    let mut body = serde_json::to_value(&pending).map_err(|e| AppError::Internal(e.to_string()))?;
    body["status"] = json!("pending");
    Ok(body)
}

async fn verify_login(registry: &ToolRegistry, cancel: &CancellationToken) -> Result<Value, AppError> {
    let request = GraphRequest::get("/me")
        .query("$select", "id,displayName,mail,userPrincipalName,jobTitle")
        .scopes(["User.Read"]);
    let page = registry.graph().send(request, cancel).await?;
    let item = page
        .items
        .into_iter()
        .next()
        .ok_or_else(|| GraphError::InvalidResponse("Graph returned no profile for /me".into()))?;
    let profile = UserProfile::from_item(item)?;
    let status = registry.broker().status().await;

    Ok(json!({
        "success": true,
        "status": status,
        "message": format!("Signed in as {}", profile.display_name_or_upn()),
        "userData": {
            "displayName": profile.display_name,
            "userPrincipalName": profile.user_principal_name,
            "mail": profile.email(),
        },
    }))
}
