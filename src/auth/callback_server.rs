//! Loopback HTTP listener for the authorization code redirect.
//!
//! Binds before the browser is opened, answers the first `GET /callback`
//! with a small result page, and hands the full callback URL back to the
//! broker.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::AuthError;

/// The port registered as the app's redirect URI.
pub const DEFAULT_CALLBACK_PORT: u16 = 28491;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// The full redirect URI for a listener on `port`.
pub fn redirect_uri(port: u16) -> String {
    format!("http://localhost:{}/callback", port)
}

/// Bind the callback listener on 127.0.0.1. Port 0 picks a free port.
pub async fn bind(port: u16) -> Result<TcpListener, AuthError> {
    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        error!("Failed to bind callback server to {}: {}", addr, e);
        AuthError::FlowFailed(format!("cannot listen on {}: {}", addr, e))
    })?;
    info!("OAuth callback server listening on {}", addr);
    Ok(listener)
}

/// Wait for a single OAuth callback, returning its URL.
pub async fn wait_for_callback(
    listener: &TcpListener,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<String, AuthError> {
    let port = listener
        .local_addr()
        .map_err(|e| AuthError::FlowFailed(e.to_string()))?
        .port();

    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Callback server cancelled");
                return Err(AuthError::Cancelled);
            }
            _ = tokio::time::sleep_until(deadline) => return Err(AuthError::AuthTimeout),
            accepted = listener.accept() => accepted.map_err(|e| {
                error!("Error accepting connection: {}", e);
                AuthError::FlowFailed(format!("connection error: {}", e))
            })?,
        };

        debug!("Connection from {}", peer);
        if let Some(url) = handle_connection(stream, port).await {
            info!("OAuth callback received");
            return Ok(url);
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Callback(String),
    BadRequest,
    MethodNotAllowed,
    NotFound,
}

fn route(request_line: &str) -> Route {
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
        return Route::BadRequest;
    };
    if method != "GET" {
        return Route::MethodNotAllowed;
    }
    if path == "/callback" || path.starts_with("/callback?") {
        Route::Callback(path.to_string())
    } else {
        Route::NotFound
    }
}

/// Returns the callback URL if this connection carried one.
async fn handle_connection(mut stream: TcpStream, port: u16) -> Option<String> {
    let mut buffer = [0u8; 4096];
    let bytes_read = match tokio::time::timeout(READ_TIMEOUT, stream.read(&mut buffer)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            debug!("Failed to read request: {}", e);
            return None;
        }
        Err(_) => {
            debug!("Timed out reading request");
            return None;
        }
    };

    let request = String::from_utf8_lossy(&buffer[..bytes_read]);
    let request_line = request.lines().next().unwrap_or_default();
    debug!("Received request: {}", request_line);

    match route(request_line) {
        Route::Callback(path) => {
            let url = format!("http://localhost:{}{}", port, path);
            let query = query_params(&url);
            let page = match query.get("error") {
                Some(error) => {
                    let description = query.get("error_description").unwrap_or(error);
                    result_page("Sign-in failed", description, false)
                }
                None if query.contains_key("code") => result_page(
                    "Signed in",
                    "Microsoft 365 access is ready. You can close this tab.",
                    true,
                ),
                None => {
                    send_response(&mut stream, 400, "text/plain", "Missing authorization code")
                        .await;
                    return None;
                }
            };
            send_response(&mut stream, 200, "text/html; charset=utf-8", &page).await;
            Some(url)
        }
        Route::BadRequest => {
            send_response(&mut stream, 400, "text/plain", "Bad Request").await;
            None
        }
        Route::MethodNotAllowed => {
            send_response(&mut stream, 405, "text/plain", "Method Not Allowed").await;
            None
        }
        Route::NotFound => {
            send_response(&mut stream, 404, "text/plain", "Not Found").await;
            None
        }
    }
}

fn query_params(url: &str) -> HashMap<String, String> {
    url::Url::parse(url)
        .map(|u| u.query_pairs().into_owned().collect())
        .unwrap_or_default()
}

fn result_page(title: &str, message: &str, success: bool) -> String {
    let accent = if success { "#10B981" } else { "#EF4444" };
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>{title} - m365-mcp</title>
    <style>
        body {{ font-family: -apple-system, "Segoe UI", sans-serif; background: #F9FAFB;
               display: flex; align-items: center; justify-content: center; height: 100vh; margin: 0; }}
        .container {{ text-align: center; padding: 48px; background: white; border-radius: 12px;
                     box-shadow: 0 4px 6px rgba(0, 0, 0, 0.1); max-width: 420px; }}
        h1 {{ color: {accent}; font-size: 24px; margin-bottom: 12px; }}
        p {{ color: #4B5563; line-height: 1.5; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>{title}</h1>
        <p>{message}</p>
    </div>
</body>
</html>"#,
        title = escape_html(title),
        message = escape_html(message),
        accent = accent,
    )
}

fn escape_html(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '<' => "&lt;".to_string(),
            '>' => "&gt;".to_string(),
            '&' => "&amp;".to_string(),
            '"' => "&quot;".to_string(),
            '\'' => "&#39;".to_string(),
            _ => c.to_string(),
        })
        .collect()
}

async fn send_response(stream: &mut TcpStream, status: u16, content_type: &str, body: &str) {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        content_type,
        body.len(),
        body
    );

    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_uri() {
        assert_eq!(redirect_uri(28491), "http://localhost:28491/callback");
    }

    #[test]
    fn test_route() {
        assert_eq!(
            route("GET /callback?code=1&state=2 HTTP/1.1"),
            Route::Callback("/callback?code=1&state=2".into())
        );
        assert_eq!(route("POST /callback HTTP/1.1"), Route::MethodNotAllowed);
        assert_eq!(route("GET /favicon.ico HTTP/1.1"), Route::NotFound);
        assert_eq!(route("GET /callbackx HTTP/1.1"), Route::NotFound);
        assert_eq!(route(""), Route::BadRequest);
    }

    #[test]
    fn test_result_page_escapes_message() {
        let page = result_page("Sign-in failed", "<script>alert(1)</script>", false);
        assert!(!page.contains("<script>"));
        assert!(page.contains("&lt;script&gt;"));
    }

    #[tokio::test]
    async fn test_receives_callback() {
        let listener = bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            stream
                .write_all(b"GET /favicon.ico HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .await
                .unwrap();
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            stream
                .write_all(b"GET /callback?code=abc&state=xyz HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .await
                .unwrap();
            let mut body = String::new();
            stream.read_to_string(&mut body).await.unwrap();
            body
        });

        let deadline = Instant::now() + Duration::from_secs(10);
        let url = wait_for_callback(&listener, deadline, &cancel).await.unwrap();
        assert_eq!(
            url,
            format!("http://localhost:{}/callback?code=abc&state=xyz", port)
        );

        let body = client.await.unwrap();
        assert!(body.starts_with("HTTP/1.1 200 OK"));
        assert!(body.contains("Signed in"));
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting() {
        let listener = bind(0).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let deadline = Instant::now() + Duration::from_secs(10);
        let result = wait_for_callback(&listener, deadline, &cancel).await;
        assert_eq!(result, Err(AuthError::Cancelled));
    }
}
