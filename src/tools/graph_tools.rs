//! Turning catalog entries into tool schemas and Graph calls.

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use super::catalog::GraphEndpoint;
use super::ToolDefinition;
use crate::error::AppError;
use crate::graph::{GraphClient, GraphRequest};

const FETCH_ALL_PAGES: &str = "fetchAllPages";

pub fn definition(endpoint: &GraphEndpoint) -> ToolDefinition {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for param in endpoint.path_params() {
        properties.insert(
            param.to_string(),
            json!({ "type": "string", "description": format!("Graph id for {{{}}}", param) }),
        );
        required.push(param);
    }
    for param in endpoint.query {
        properties.insert(
            param.arg.to_string(),
            json!({ "type": "string", "description": param.description }),
        );
        if param.required {
            required.push(param.arg);
        }
    }
    if let Some(body) = endpoint.body {
        properties.insert(
            "body".to_string(),
            json!({ "type": "object", "description": body }),
        );
        required.push("body");
    }
    if endpoint.collection {
        properties.insert(
            FETCH_ALL_PAGES.to_string(),
            json!({
                "type": "boolean",
                "description": "Follow @odata.nextLink and return every item (default: first page only)"
            }),
        );
    }

    ToolDefinition {
        name: endpoint.name.to_string(),
        description: format!(
            "{} ({} {})",
            endpoint.description,
            endpoint.verb.method(),
            endpoint.path
        ),
        input_schema: json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        }),
        read_only: !endpoint.is_write(),
    }
}

/// Build the Graph request for `endpoint` from tool arguments.
pub fn build_request(
    endpoint: &GraphEndpoint,
    args: &Map<String, Value>,
) -> Result<GraphRequest, AppError> {
    let mut path = endpoint.path.to_string();
    for param in endpoint.path_params() {
        let value = string_arg(args, param)?
            .ok_or_else(|| AppError::InvalidInput(format!("missing required argument '{}'", param)))?;
        if value.is_empty() {
            return Err(AppError::InvalidInput(format!("argument '{}' is empty", param)));
        }
        path = path.replace(&format!("{{{}}}", param), &urlencoding::encode(&value));
    }

    let mut request = GraphRequest::new(endpoint.verb.method(), path)
        .scopes(endpoint.scopes.iter().copied());

    for param in endpoint.query {
        match string_arg(args, param.arg)? {
            Some(value) => {
                if param.key == "$search" {
                    request = request.header("ConsistencyLevel", "eventual");
                }
                request = request.query(param.key, value);
            }
            None if param.required => {
                return Err(AppError::InvalidInput(format!(
                    "missing required argument '{}'",
                    param.arg
                )))
            }
            None => {}
        }
    }

    if endpoint.body.is_some() {
        match args.get("body") {
            Some(body @ Value::Object(_)) => request = request.body(body.clone()),
            Some(_) => return Err(AppError::InvalidInput("'body' must be a JSON object".into())),
            None => return Err(AppError::InvalidInput("missing required argument 'body'".into())),
        }
    }

    Ok(request)
}

pub async fn invoke(
    client: &GraphClient,
    endpoint: &GraphEndpoint,
    args: &Map<String, Value>,
    cancel: &CancellationToken,
) -> Result<Value, AppError> {
    let request = build_request(endpoint, args)?;
    let fetch_all = endpoint.collection
        && args.get(FETCH_ALL_PAGES).and_then(Value::as_bool).unwrap_or(false);

    if fetch_all {
        let items = client.collect(request, cancel, None).await?;
        let count = items.len();
        return Ok(json!({ "value": items, "count": count }));
    }

    let page = client.send(request, cancel).await?;
    if endpoint.collection {
        let mut body = json!({ "value": page.items });
        if let Some(next) = page.next_link {
            body["@odata.nextLink"] = json!(next);
        }
        if let Some(count) = page.count {
            body["@odata.count"] = json!(count);
        }
        return Ok(body);
    }

    Ok(match page.items.into_iter().next() {
        Some(item) => item,
        None => json!({ "success": true }),
    })
}

/// Scalars are accepted and stringified; objects and arrays are not.
fn string_arg(args: &Map<String, Value>, name: &str) -> Result<Option<String>, AppError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(_) => Err(AppError::InvalidInput(format!(
            "argument '{}' must be a string",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::catalog::find;
    use reqwest::Method;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_schema_lists_path_and_query_params() {
        let def = definition(find("list-mail-folder-messages").unwrap());
        let schema = &def.input_schema;
        assert!(schema["properties"]["mailFolderId"].is_object());
        assert!(schema["properties"]["filter"].is_object());
        assert!(schema["properties"]["fetchAllPages"].is_object());
        assert_eq!(schema["required"], json!(["mailFolderId"]));
        assert!(def.read_only);
    }

    #[test]
    fn test_write_schema_requires_body() {
        let def = definition(find("send-mail").unwrap());
        assert_eq!(def.input_schema["required"], json!(["body"]));
        assert!(!def.read_only);
    }

    #[test]
    fn test_build_request_substitutes_and_encodes_path() {
        let request = build_request(
            find("get-mail-message").unwrap(),
            &args(json!({ "messageId": "AAMk/x=", "select": "subject" })),
        )
        .unwrap();
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.path, "/me/messages/AAMk%2Fx%3D");
        assert_eq!(request.query, vec![("$select".to_string(), "subject".to_string())]);
        assert_eq!(request.scopes, vec!["Mail.Read".to_string()]);
    }

    #[test]
    fn test_search_adds_consistency_header() {
        let request = build_request(
            find("list-mail-messages").unwrap(),
            &args(json!({ "search": "\"quarterly\"", "top": 5 })),
        )
        .unwrap();
        assert!(request
            .headers
            .contains(&("ConsistencyLevel".to_string(), "eventual".to_string())));
        assert!(request.query.contains(&("$top".to_string(), "5".to_string())));
    }

    #[test]
    fn test_missing_arguments_are_rejected() {
        let err = build_request(find("get-mail-message").unwrap(), &Map::new()).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));

        let err = build_request(
            find("get-calendar-view").unwrap(),
            &args(json!({ "startDateTime": "2024-01-01T00:00:00Z" })),
        )
        .unwrap_err();
        assert!(err.to_string().contains("endDateTime"));

        let err = build_request(find("send-mail").unwrap(), &args(json!({ "body": "hi" })))
            .unwrap_err();
        assert!(err.to_string().contains("JSON object"));
    }
}
