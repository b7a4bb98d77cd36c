mod support;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use m365_mcp::graph::{GraphClient, GraphConfig, ThrottlePolicy};
use m365_mcp::retry::Backoff;
use m365_mcp::store::MemoryTokenStore;
use m365_mcp::tools::ToolRegistry;

use support::{broker, fresh_record, seeded_store, FakeProvider};

fn registry_with(server: &MockServer, read_only: bool, store: Arc<MemoryTokenStore>) -> ToolRegistry {
    let provider = Arc::new(FakeProvider::new());
    let config = GraphConfig {
        base_url: format!("{}/v1.0", server.uri()),
        read_only,
        timeout: Duration::from_secs(5),
        throttle: ThrottlePolicy {
            max_attempts: 3,
            max_wait: Duration::from_secs(1),
            fallback: Backoff::immediate(3),
        },
        server_retry: Backoff::immediate(3),
    };
    let graph = GraphClient::new(broker(provider, store), config).unwrap();
    ToolRegistry::new(graph)
}

fn registry(server: &MockServer, read_only: bool) -> ToolRegistry {
    registry_with(server, read_only, seeded_store(fresh_record()))
}

async fn call(registry: &ToolRegistry, name: &str, args: Value) -> (Value, bool) {
    let response = registry.call(name, args, &CancellationToken::new()).await;
    let body = response.json().unwrap_or(Value::Null);
    (body, response.is_error)
}

#[tokio::test]
async fn read_only_mode_hides_write_tools() {
    let server = MockServer::start().await;

    let writable: Vec<_> = registry(&server, false)
        .definitions()
        .into_iter()
        .map(|d| d.name)
        .collect();
    let read_only: Vec<_> = registry(&server, true)
        .definitions()
        .into_iter()
        .map(|d| d.name)
        .collect();

    assert!(writable.contains(&"send-mail".to_string()));
    assert!(!read_only.contains(&"send-mail".to_string()));
    assert!(!read_only.contains(&"delete-calendar-event".to_string()));
    assert!(read_only.contains(&"list-mail-messages".to_string()));
    assert!(read_only.contains(&"login".to_string()));
}

#[tokio::test]
async fn list_tool_passes_odata_options() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me/messages"))
        .and(query_param("$top", "5"))
        .and(query_param("$search", "\"budget\""))
        .and(header("ConsistencyLevel", "eventual"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{ "id": "m1", "subject": "Budget" }],
            "@odata.nextLink": format!("{}/v1.0/me/messages?$skiptoken=2", server.uri()),
        })))
        .expect(1)
        .mount(&server)
        .await;

    let registry = registry(&server, false);
    let (body, is_error) = call(
        &registry,
        "list-mail-messages",
        json!({ "top": 5, "search": "\"budget\"" }),
    )
    .await;

    assert!(!is_error, "{}", body);
    assert_eq!(body["value"][0]["subject"], "Budget");
    assert!(body["@odata.nextLink"].as_str().unwrap().contains("skiptoken"));
}

#[tokio::test]
async fn fetch_all_pages_concatenates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me/todo/lists"))
        .and(query_param("$skiptoken", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{ "id": "l3" }],
        })))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me/todo/lists"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{ "id": "l1" }, { "id": "l2" }],
            "@odata.nextLink": format!("{}/v1.0/me/todo/lists?$skiptoken=2", server.uri()),
        })))
        .mount(&server)
        .await;

    let registry = registry(&server, false);
    let (body, is_error) = call(
        &registry,
        "list-todo-task-lists",
        json!({ "fetchAllPages": true }),
    )
    .await;

    assert!(!is_error, "{}", body);
    assert_eq!(body["count"], 3);
    assert_eq!(body["value"][2]["id"], "l3");
}

#[tokio::test]
async fn write_in_read_only_mode_is_rejected_locally() {
    let server = MockServer::start().await;

    let registry = registry(&server, true);
    let (body, is_error) = call(
        &registry,
        "send-mail",
        json!({ "body": { "message": { "subject": "hi" } } }),
    )
    .await;

    assert!(is_error);
    assert_eq!(body["error"]["category"], "write_disabled");
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_tool_reports_success() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1.0/me/messages/m1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let registry = registry(&server, false);
    let (body, is_error) = call(&registry, "delete-mail-message", json!({ "messageId": "m1" })).await;

    assert!(!is_error, "{}", body);
    assert_eq!(body, json!({ "success": true }));
}

#[tokio::test]
async fn graph_errors_become_structured_payloads() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me/events/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "code": "ErrorItemNotFound", "message": "The specified object was not found in the store." }
        })))
        .mount(&server)
        .await;

    let registry = registry(&server, false);
    let (body, is_error) = call(&registry, "get-calendar-event", json!({ "eventId": "missing" })).await;

    assert!(is_error);
    assert_eq!(body["error"]["category"], "client_request_error");
    assert_eq!(body["error"]["status"], 404);
}

#[tokio::test]
async fn bad_arguments_are_invalid_input() {
    let server = MockServer::start().await;
    let registry = registry(&server, false);

    let (body, is_error) = call(&registry, "no-such-tool", json!({})).await;
    assert!(is_error);
    assert_eq!(body["error"]["category"], "invalid_input");

    let (body, is_error) = call(&registry, "get-mail-message", json!({})).await;
    assert!(is_error);
    assert_eq!(body["error"]["category"], "invalid_input");

    let (body, _) = call(&registry, "auth-status", json!([1, 2])).await;
    assert_eq!(body["error"]["category"], "invalid_input");

    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn calls_without_session_require_login() {
    let server = MockServer::start().await;
    let registry = registry_with(&server, false, Arc::new(MemoryTokenStore::new()));

    let (body, is_error) = call(&registry, "get-current-user", json!({})).await;

    assert!(is_error);
    assert_eq!(body["error"]["category"], "auth_required");
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn auth_status_and_logout() {
    let server = MockServer::start().await;
    let registry = registry(&server, false);

    let (status, _) = call(&registry, "auth-status", json!({})).await;
    assert_eq!(status["status"], "authenticated");
    assert_eq!(status["username"], "adele@contoso.com");

    let (logout, is_error) = call(&registry, "logout", json!({})).await;
    assert!(!is_error);
    assert_eq!(logout["message"], "Logged out successfully");

    let (status, _) = call(&registry, "auth-status", json!({})).await;
    assert_eq!(status["status"], "unauthenticated");
}

#[tokio::test]
async fn login_when_signed_in_is_a_no_op() {
    let server = MockServer::start().await;
    let registry = registry(&server, false);

    let (body, is_error) = call(&registry, "login", json!({})).await;

    assert!(!is_error);
    assert_eq!(body["status"], "already_signed_in");
    assert_eq!(body["username"], "adele@contoso.com");
}

#[tokio::test]
async fn forced_login_returns_device_code() {
    let server = MockServer::start().await;
    let registry = registry(&server, false);

    let (body, is_error) = call(&registry, "login", json!({ "force": true })).await;

    assert!(!is_error, "{}", body);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["userCode"], "ABCD-EFGH");
    assert_eq!(body["kind"], "device_code");

    let (status, _) = call(&registry, "auth-status", json!({})).await;
    assert_eq!(status["status"], "awaiting_user_action");
    assert_eq!(status["pendingFlow"]["userCode"], "ABCD-EFGH");

    // A second login joins the pending flow.
    let (again, _) = call(&registry, "login", json!({})).await;
    assert_eq!(again["handle"], body["handle"]);
}

#[tokio::test]
async fn unknown_login_flow_is_rejected() {
    let server = MockServer::start().await;
    let registry = registry_with(&server, false, Arc::new(MemoryTokenStore::new()));

    let (body, is_error) = call(&registry, "login", json!({ "flow": "carrier-pigeon" })).await;

    assert!(is_error);
    assert_eq!(body["error"]["category"], "invalid_input");
}

#[tokio::test]
async fn verify_login_reads_profile() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "u1",
            "displayName": "Adele Vance",
            "mail": null,
            "userPrincipalName": "AdeleV@contoso.onmicrosoft.com",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let registry = registry(&server, false);
    let (body, is_error) = call(&registry, "verify-login", json!({})).await;

    assert!(!is_error, "{}", body);
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "authenticated");
    assert_eq!(body["message"], "Signed in as Adele Vance");
    assert_eq!(body["userData"]["mail"], "AdeleV@contoso.onmicrosoft.com");
}
