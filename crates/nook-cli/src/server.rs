//! HTTP surface
//!
//! Everything under `/api` and `/ws` sits behind the token check.
//! `/health` and static assets do not.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use nook_core::auth::{TOKEN_HEADER, TOKEN_QUERY_PARAM};
use nook_core::{AuthToken, BroadcastRelay, ExecutionGateway, NookConfig};
use nook_sandbox::{SandboxError, WorkspaceStore};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::api::{self, ApiError};
use crate::events;

/// Immutable per-process state handed to every handler
#[derive(Debug)]
pub struct AppState {
    pub store: WorkspaceStore,
    pub gateway: ExecutionGateway,
    pub relay: BroadcastRelay,
    pub token: AuthToken,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Takes the token out of the config; the rest is cloned
    pub fn from_config(config: NookConfig) -> Result<Self, SandboxError> {
        Ok(Self {
            store: config.store()?,
            gateway: config.gateway(),
            relay: BroadcastRelay::default(),
            token: config.token,
        })
    }
}

pub fn router(state: SharedState, public_dir: Option<&Path>, max_upload_bytes: usize) -> Router {
    let protected = Router::new()
        .route("/api/files", get(api::list_files).delete(api::delete_path))
        .route("/api/files/upload", post(api::upload_file))
        .route("/api/files/download", get(api::download_file))
        .route("/api/files/mkdir", post(api::make_directory))
        .route("/api/execute", post(api::execute))
        .route("/ws", get(events::upgrade))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token))
        .layer(DefaultBodyLimit::max(max_upload_bytes));

    let mut app = Router::new().route("/health", get(health)).merge(protected);
    if let Some(dir) = public_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Runs before any extractor, so an unauthenticated request never reaches
/// path resolution, the body, or a process spawn.
async fn require_token(State(state): State<SharedState>, req: Request, next: Next) -> Response {
    let query = Query::<HashMap<String, String>>::try_from_uri(req.uri())
        .map(|Query(params)| params)
        .unwrap_or_default();

    let presented = req
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            req.headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .or_else(|| query.get(TOKEN_QUERY_PARAM).map(String::as_str));

    if !state.token.verify(presented) {
        warn!(
            method = %req.method(),
            path = %req.uri().path(),
            token_present = presented.is_some(),
            "rejected unauthenticated request"
        );
        return ApiError::unauthorized().into_response();
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{self, Method, StatusCode};
    use nook_core::config::prepare_workspace;
    use nook_core::ExecPolicy;
    use nook_sandbox::EscapePolicy;
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const TOKEN: &str = "test-token";
    const BOUNDARY: &str = "nook-test-boundary";

    fn config_for(tmp: &TempDir) -> NookConfig {
        NookConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            token: AuthToken::new(TOKEN).unwrap(),
            workspace_root: prepare_workspace(tmp.path()).unwrap(),
            public_dir: None,
            exec: ExecPolicy {
                timeout: Duration::from_secs(5),
                ..ExecPolicy::default()
            },
            escape_policy: EscapePolicy::Clamp,
            confine_symlinks: false,
            max_upload_bytes: 1024 * 1024,
        }
    }

    fn app_with(config: NookConfig) -> Router {
        let max = config.max_upload_bytes;
        let state = Arc::new(AppState::from_config(config).unwrap());
        router(state, None, max)
    }

    fn app(tmp: &TempDir) -> Router {
        app_with(config_for(tmp))
    }

    fn request(method: Method, uri: &str, token: Option<&str>, body: Body) -> Request {
        let mut builder = http::Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        builder.body(body).unwrap()
    }

    fn upload_request(dir: &str, file_name: &str, content: &str, token: Option<&str>) -> Request {
        let body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n\
             {content}\r\n\
             --{BOUNDARY}--\r\n"
        );
        let mut builder = http::Request::builder()
            .method(Method::POST)
            .uri(format!("/api/files/upload?path={dir}"))
            .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"));
        if let Some(token) = token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn execute_request(body: Value, token: Option<&str>) -> Request {
        let mut builder = http::Request::builder()
            .method(Method::POST)
            .uri("/api/execute")
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn send(app: &Router, req: Request) -> (StatusCode, Vec<u8>) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn send_json(app: &Router, req: Request) -> (StatusCode, Value) {
        let (status, body) = send(app, req).await;
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health_is_open() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp);
        let (status, body) = send_json(&app, request(Method::GET, "/health", None, Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_unauthorized_requests_have_no_side_effects() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("keep.txt"), "keep").unwrap();
        let app = app(&tmp);

        for token in [None, Some("wrong-token"), Some("")] {
            let requests = vec![
                request(Method::GET, "/api/files?path=", token, Body::empty()),
                request(Method::GET, "/api/files/download?path=keep.txt", token, Body::empty()),
                request(Method::DELETE, "/api/files?path=keep.txt", token, Body::empty()),
                request(Method::POST, "/api/files/mkdir?path=made", token, Body::empty()),
                upload_request("", "uploaded.txt", "data", token),
                execute_request(
                    serde_json::json!({ "language": "bash", "code": "touch ran.txt" }),
                    token,
                ),
                request(Method::GET, "/ws", token, Body::empty()),
            ];
            for req in requests {
                let uri = req.uri().clone();
                let (status, body) = send_json(&app, req).await;
                assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
                assert_eq!(body, serde_json::json!({ "error": "Unauthorized" }), "{uri}");
            }
        }

        assert!(tmp.path().join("keep.txt").exists());
        assert!(!tmp.path().join("made").exists());
        assert!(!tmp.path().join("uploaded.txt").exists());
        assert!(!tmp.path().join("ran.txt").exists());
    }

    #[tokio::test]
    async fn test_token_sources() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp);

        let by_query = request(Method::GET, "/api/files?token=test-token", None, Body::empty());
        assert_eq!(send(&app, by_query).await.0, StatusCode::OK);

        let by_bearer = http::Request::builder()
            .uri("/api/files")
            .header(AUTHORIZATION, "Bearer test-token")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, by_bearer).await.0, StatusCode::OK);

        let wrong_query = request(Method::GET, "/api/files?token=nope", None, Body::empty());
        assert_eq!(send(&app, wrong_query).await.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_list_directory() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("src")).unwrap();
        std::fs::create_dir(tmp.path().join("public")).unwrap();
        std::fs::write(tmp.path().join("index.js"), "x").unwrap();
        std::fs::write(tmp.path().join("src/app.py"), "x").unwrap();
        let app = app(&tmp);

        let (status, body) =
            send_json(&app, request(Method::GET, "/api/files?path=", Some(TOKEN), Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        let mut entries: Vec<(String, bool)> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|e| (e["name"].as_str().unwrap().to_string(), e["isDir"].as_bool().unwrap()))
            .collect();
        entries.sort();
        assert_eq!(
            entries,
            vec![
                ("index.js".to_string(), false),
                ("public".to_string(), true),
                ("src".to_string(), true),
            ]
        );

        // No path parameter means the root
        let (status, body) =
            send_json(&app, request(Method::GET, "/api/files", Some(TOKEN), Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_errors() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp);

        let (status, body) = send_json(
            &app,
            request(Method::GET, "/api/files?path=missing", Some(TOKEN), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("missing"));

        let (status, _) = send_json(
            &app,
            request(Method::GET, "/api/files?path=a%00b", Some(TOKEN), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_escape_clamped_by_default_rejected_when_strict() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("etc")).unwrap();

        let lax = app(&tmp);
        let (status, _) = send_json(
            &lax,
            request(Method::GET, "/api/files?path=../../etc", Some(TOKEN), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let mut config = config_for(&tmp);
        config.escape_policy = EscapePolicy::Reject;
        let strict = app_with(config);
        let (status, body) = send_json(
            &strict,
            request(Method::GET, "/api/files?path=../../etc", Some(TOKEN), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid path"));
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("docs")).unwrap();
        let app = app(&tmp);

        let (status, body) =
            send_json(&app, upload_request("docs", "notes.txt", "hello nook", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({ "success": true }));
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("docs/notes.txt")).unwrap(),
            "hello nook"
        );

        let resp = app
            .clone()
            .oneshot(request(
                Method::GET,
                "/api/files/download?path=docs/notes.txt",
                Some(TOKEN),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()["content-disposition"],
            "attachment; filename=\"notes.txt\""
        );
        assert_eq!(resp.headers()["content-length"], "10");
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello nook");
    }

    #[tokio::test]
    async fn test_upload_rejects_traversal_and_missing_dir() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp);

        let (status, _) =
            send_json(&app, upload_request("", "../../evil.sh", "x", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!tmp.path().parent().unwrap().join("evil.sh").exists());

        let (status, _) =
            send_json(&app, upload_request("no/such/dir", "a.txt", "x", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_upload_without_file_field() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp);

        let body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"other\"\r\n\r\nvalue\r\n--{BOUNDARY}--\r\n"
        );
        let req = http::Request::builder()
            .method(Method::POST)
            .uri("/api/files/upload")
            .header(TOKEN_HEADER, TOKEN)
            .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap();
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "file field required");
    }

    #[tokio::test]
    async fn test_download_errors() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp);

        let (status, body) =
            send_json(&app, request(Method::GET, "/api/files/download", Some(TOKEN), Body::empty())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "path required");

        let (status, _) = send_json(
            &app,
            request(Method::GET, "/api/files/download?path=ghost.txt", Some(TOKEN), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_mkdir_and_delete() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp);

        let (status, body) = send_json(
            &app,
            request(Method::POST, "/api/files/mkdir?path=a/b/c", Some(TOKEN), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert!(tmp.path().join("a/b/c").is_dir());

        for _ in 0..2 {
            let (status, _) = send_json(
                &app,
                request(Method::DELETE, "/api/files?path=a", Some(TOKEN), Body::empty()),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
        assert!(!tmp.path().join("a").exists());

        let (status, _) =
            send_json(&app, request(Method::DELETE, "/api/files", Some(TOKEN), Body::empty())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send_json(
            &app,
            request(Method::DELETE, "/api/files?path=..", Some(TOKEN), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(tmp.path().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp);

        let (status, body) = send_json(
            &app,
            execute_request(
                serde_json::json!({ "language": "bash", "code": "echo $((2 + 2)) > four.txt; cat four.txt" }),
                Some(TOKEN),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stdout"], "4\n");
        assert_eq!(body["stderr"], "");
        assert!(tmp.path().join("four.txt").exists());

        let (status, body) = send_json(
            &app,
            execute_request(
                serde_json::json!({ "language": "bash", "code": "echo bad >&2; exit 1" }),
                Some(TOKEN),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stderr"], "Process exited with code 1\nbad\n");
    }

    #[tokio::test]
    async fn test_execute_bad_requests() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp);

        let cases = [
            serde_json::json!({ "language": "cobol", "code": "DISPLAY 1" }),
            serde_json::json!({ "language": "python" }),
            serde_json::json!({ "code": "print(1)" }),
        ];
        for case in cases {
            let (status, body) = send_json(&app, execute_request(case.clone(), Some(TOKEN))).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{case}");
            assert!(body["error"].is_string());
        }

        let malformed = http::Request::builder()
            .method(Method::POST)
            .uri("/api/execute")
            .header(TOKEN_HEADER, TOKEN)
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        assert_eq!(send(&app, malformed).await.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_static_assets() {
        let tmp = TempDir::new().unwrap();
        let public = TempDir::new().unwrap();
        std::fs::write(public.path().join("index.html"), "<h1>nook</h1>").unwrap();

        let state = Arc::new(AppState::from_config(config_for(&tmp)).unwrap());
        let app = router(state, Some(public.path()), 1024);

        let (status, body) = send(&app, request(Method::GET, "/index.html", None, Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"<h1>nook</h1>");
    }

    mod event_channel {
        use super::*;
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::{Error as WsError, Message};

        async fn spawn_server(tmp: &TempDir) -> std::net::SocketAddr {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let app = app(tmp);
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            addr
        }

        #[tokio::test]
        async fn test_events_reach_others_but_not_sender() {
            let tmp = TempDir::new().unwrap();
            let addr = spawn_server(&tmp).await;
            let url = format!("ws://{addr}/ws?token={TOKEN}");

            let (mut alice, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
            let (mut bob, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
            // Let both sessions join the relay server-side
            tokio::time::sleep(Duration::from_millis(200)).await;

            let frame = r#"{"event":"preview-update","data":"<p>hi</p>"}"#;
            alice.send(Message::Text(frame.to_string())).await.unwrap();

            let received = tokio::time::timeout(Duration::from_secs(2), bob.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let value: Value = serde_json::from_str(received.to_text().unwrap()).unwrap();
            assert_eq!(value, serde_json::json!({ "event": "preview-update", "data": "<p>hi</p>" }));

            let echoed = tokio::time::timeout(Duration::from_millis(200), alice.next()).await;
            assert!(echoed.is_err(), "sender got its own event back");
        }

        #[tokio::test]
        async fn test_malformed_frames_are_dropped() {
            let tmp = TempDir::new().unwrap();
            let addr = spawn_server(&tmp).await;
            let url = format!("ws://{addr}/ws?token={TOKEN}");

            let (mut alice, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
            let (mut bob, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;

            alice.send(Message::Text("not json".into())).await.unwrap();
            alice
                .send(Message::Text(r#"{"event":"shutdown","data":""}"#.into()))
                .await
                .unwrap();
            alice
                .send(Message::Text(r#"{"event":"log","data":"still here"}"#.into()))
                .await
                .unwrap();

            let received = tokio::time::timeout(Duration::from_secs(2), bob.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let value: Value = serde_json::from_str(received.to_text().unwrap()).unwrap();
            assert_eq!(value["data"], "still here");
        }

        #[tokio::test]
        async fn test_handshake_requires_token() {
            let tmp = TempDir::new().unwrap();
            let addr = spawn_server(&tmp).await;

            for url in [format!("ws://{addr}/ws"), format!("ws://{addr}/ws?token=wrong")] {
                match tokio_tungstenite::connect_async(&url).await {
                    Err(WsError::Http(resp)) => assert_eq!(resp.status().as_u16(), 401),
                    Err(e) => panic!("expected 401, got {e}"),
                    Ok(_) => panic!("connected without a valid token"),
                }
            }
        }
    }
}
