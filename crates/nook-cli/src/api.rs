//! File and execute endpoints
//!
//! Thin adapters: pull parameters out of the request, call the store or the
//! gateway, map the result onto JSON. Auth has already happened by the time
//! any of these run.

use std::io;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::TryStreamExt;
use nook_core::ExecError;
use nook_sandbox::{DirEntry, SandboxError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::server::SharedState;

/// Error body: `{"error": "..."}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Io(e) => {
                // Raw OS text stays in the log
                error!(error = %e, "workspace I/O failed");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("I/O error: {}", e.kind()),
                )
            }
            e if e.is_client_error() => Self::bad_request(e.to_string()),
            e => Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

impl From<ExecError> for ApiError {
    fn from(err: ExecError) -> Self {
        Self::bad_request(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    path: Option<String>,
}

impl PathQuery {
    fn or_root(self) -> String {
        self.path.unwrap_or_default()
    }

    fn required(self) -> Result<String, ApiError> {
        match self.path {
            Some(path) if !path.is_empty() => Ok(path),
            _ => Err(ApiError::bad_request("path required")),
        }
    }
}

fn success() -> Json<Value> {
    Json(json!({ "success": true }))
}

/// GET /api/files?path=
pub async fn list_files(
    State(state): State<SharedState>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Vec<DirEntry>>, ApiError> {
    let dir = query.or_root();
    Ok(Json(state.store.list(&dir).await?))
}

/// POST /api/files/upload?path=  (multipart, field "file")
pub async fn upload_file(
    State(state): State<SharedState>,
    Query(query): Query<PathQuery>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let dir = query.or_root();
    // Fail on a bad directory before reading any of the body
    state.store.resolver().resolve(&dir)?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_owned)
            .ok_or_else(|| ApiError::bad_request("file name required"))?;

        let chunks = Box::pin(field.map_err(|e| io::Error::new(io::ErrorKind::Other, e)));
        let bytes = state.store.write(&dir, &file_name, chunks).await?;
        info!(dir = %dir, file = %file_name, bytes, "uploaded");
        return Ok(success());
    }

    Err(ApiError::bad_request("file field required"))
}

/// GET /api/files/download?path=
pub async fn download_file(
    State(state): State<SharedState>,
    Query(query): Query<PathQuery>,
) -> Result<Response, ApiError> {
    let path = query.required()?;
    let handle = state.store.read(&path).await?;

    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        header_safe(&handle.name)
    ))
    .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let headers = [
        (CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
        (CONTENT_LENGTH, HeaderValue::from(handle.len)),
        (CONTENT_DISPOSITION, disposition),
    ];
    let body = Body::from_stream(ReaderStream::new(handle.file));
    Ok((headers, body).into_response())
}

/// DELETE /api/files?path=
pub async fn delete_path(
    State(state): State<SharedState>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Value>, ApiError> {
    let path = query.required()?;
    state.store.remove(&path).await?;
    info!(path = %path, "deleted");
    Ok(success())
}

/// POST /api/files/mkdir?path=
pub async fn make_directory(
    State(state): State<SharedState>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Value>, ApiError> {
    let path = query.required()?;
    state.store.make_directory(&path).await?;
    Ok(success())
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    #[serde(default)]
    language: String,
    #[serde(default)]
    code: String,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    stdout: String,
    stderr: String,
}

/// POST /api/execute {language, code}
///
/// Always 200 once the request is well-formed; failures ride in `stderr`.
pub async fn execute(
    State(state): State<SharedState>,
    body: Result<Json<ExecuteBody>, JsonRejection>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let result = state.gateway.execute(&body.language, &body.code).await?;
    Ok(Json(ExecuteResponse {
        stdout: result.stdout_lossy(),
        stderr: result.stderr_lossy(),
    }))
}

fn header_safe(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect()
}
