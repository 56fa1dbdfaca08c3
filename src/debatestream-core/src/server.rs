//! Session page server for streaming-avatar mode.
//!
//! Serves the player pages from the web root and exposes the sessions file
//! written by [`crate::heygen_stream::StreamSessions`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::error::StreamError;
use crate::participant::Speaker;

#[derive(Debug, Clone)]
struct ServerState {
    web_root: PathBuf,
    sessions_file: PathBuf,
}

fn with_common_headers(status: StatusCode, content_type: &'static str, body: Vec<u8>) -> Response {
    (
        status,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-store"),
        ],
        body,
    )
        .into_response()
}

fn json_response(status: StatusCode, value: &Value) -> Response {
    with_common_headers(status, "application/json", value.to_string().into_bytes())
}

fn not_found() -> Response {
    with_common_headers(StatusCode::NOT_FOUND, "text/plain; charset=utf-8", b"not found".to_vec())
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(str::to_lowercase).as_deref() {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "application/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        _ => "application/octet-stream",
    }
}

async fn serve_file(path: PathBuf) -> Response {
    match tokio::fs::read(&path).await {
        Ok(content) => with_common_headers(StatusCode::OK, content_type_for(&path), content),
        Err(_) => not_found(),
    }
}

/// The sessions file, or an empty object when it is missing or unreadable.
async fn read_sessions(path: &Path) -> Value {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|_| json!({})),
        Err(_) => json!({}),
    }
}

async fn index(State(state): State<Arc<ServerState>>) -> Response {
    serve_file(state.web_root.join("index.html")).await
}

async fn agent_page(State(state): State<Arc<ServerState>>) -> Response {
    serve_file(state.web_root.join("agent.html")).await
}

async fn agent_redirect(UrlPath(agent): UrlPath<String>) -> Response {
    match Speaker::parse(&agent) {
        Some(speaker) => Redirect::to(&format!("/agent.html?agent={}", speaker)).into_response(),
        None => not_found(),
    }
}

async fn session(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let agent = params
        .get("agent")
        .map(|a| a.trim().to_uppercase())
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| "A".to_string());
    let payload = read_sessions(&state.sessions_file).await;
    match payload.get("sessions").and_then(|s| s.get(&agent)) {
        Some(data) if !data.is_null() => json_response(StatusCode::OK, data),
        _ => json_response(StatusCode::NOT_FOUND, &json!({ "error": "session not found" })),
    }
}

async fn sessions(State(state): State<Arc<ServerState>>) -> Response {
    json_response(StatusCode::OK, &read_sessions(&state.sessions_file).await)
}

pub fn create_router(web_root: impl Into<PathBuf>, sessions_file: impl Into<PathBuf>) -> Router {
    let state = Arc::new(ServerState {
        web_root: web_root.into(),
        sessions_file: sessions_file.into(),
    });
    Router::new()
        .route("/", get(index))
        .route("/index.html", get(index))
        .route("/agent", get(agent_page))
        .route("/agent.html", get(agent_page))
        .route("/agent/{agent}", get(agent_redirect))
        .route("/api/session", get(session))
        .route("/api/sessions", get(sessions))
        .fallback(|| async { not_found() })
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Bind and serve in the background. Returns the bound address.
pub async fn spawn_server(
    config: &ServerConfig,
    sessions_file: &Path,
) -> Result<(SocketAddr, JoinHandle<()>), StreamError> {
    tokio::fs::create_dir_all(&config.web_root).await?;
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    let app = create_router(config.web_root.clone(), sessions_file.to_path_buf());

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(target: "server", error = %e, "session server stopped");
        }
    });
    info!(target: "server", %addr, "serving session pages");
    Ok((addr, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start(dir: &Path) -> String {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            web_root: dir.join("web"),
        };
        std::fs::create_dir_all(&config.web_root).unwrap();
        std::fs::write(config.web_root.join("agent.html"), "<html>agent</html>").unwrap();
        std::fs::write(
            dir.join("sessions.json"),
            r#"{"updated_at":1.0,"sessions":{"A":{"session_id":"s-a","url":"wss://x"}}}"#,
        )
        .unwrap();
        let (addr, _handle) = spawn_server(&config, &dir.join("sessions.json")).await.unwrap();
        format!("http://{}", addr)
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_session_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let base = start(dir.path()).await;

        let resp = client()
            .get(format!("{base}/api/session?agent=a"))
            .header("origin", "https://player.example")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers().get("access-control-allow-origin").unwrap(), "*");
        assert_eq!(resp.headers().get("cache-control").unwrap(), "no-store");
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["session_id"], "s-a");

        let resp = client().get(format!("{base}/api/session?agent=B")).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        let all: Value = client()
            .get(format!("{base}/api/sessions"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(all["sessions"]["A"]["url"], "wss://x");
    }

    #[tokio::test]
    async fn test_pages_and_redirects() {
        let dir = tempfile::tempdir().unwrap();
        let base = start(dir.path()).await;

        let resp = client().get(format!("{base}/agent")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "<html>agent</html>");

        let resp = client().get(format!("{base}/agent/B")).send().await.unwrap();
        assert!(resp.status().is_redirection());
        assert_eq!(resp.headers().get("location").unwrap(), "/agent.html?agent=B");

        // No index.html in the web root.
        let resp = client().get(format!("{base}/")).send().await.unwrap();
        assert_eq!(resp.status(), 404);
        let resp = client().get(format!("{base}/agent/C")).send().await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_cors_preflight_is_answered() {
        let dir = tempfile::tempdir().unwrap();
        let base = start(dir.path()).await;

        let resp = client()
            .request(reqwest::Method::OPTIONS, format!("{base}/api/session?agent=A"))
            .header("origin", "https://player.example")
            .header("access-control-request-method", "GET")
            .header("access-control-request-headers", "content-type")
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        assert_eq!(resp.headers().get("access-control-allow-origin").unwrap(), "*");
        assert!(resp.headers().contains_key("access-control-allow-methods"));
    }

    #[tokio::test]
    async fn test_missing_sessions_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_sessions(&dir.path().join("none.json")).await, json!({}));
    }
}
