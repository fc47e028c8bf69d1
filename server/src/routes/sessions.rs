//! Session CRUD plus the workspace file surface (listing, read/write,
//! tarball download) and best-effort stop.

use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use atelier_protocol::SessionRecord;
use atelier_protocol::SessionStatus;

use atelier_core::sandbox::SandboxRuntime;
use atelier_core::sandbox::UserSandbox;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Lockfiles and infrastructure files hidden from the workspace listing.
const LISTING_EXCLUDES: &[&str] = &[
    "bun.lock",
    "package-lock.json",
    "LICENSE",
    ".gitignore",
    "e2b.toml",
];

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route(
            "/sessions/{session_id}",
            get(get_session).patch(update_session).delete(delete_session),
        )
        .route("/sessions/{session_id}/files", get(list_files))
        .route(
            "/sessions/{session_id}/files/{*file_path}",
            get(get_file).put(put_file),
        )
        .route("/sessions/{session_id}/download", get(download))
        .route("/sessions/{session_id}/stop", post(stop))
}

async fn create_session(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<SessionRecord>, ApiError> {
    let session = state.store.create_session(&user.id).await?;
    Ok(Json(session))
}

async fn list_sessions(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<SessionRecord>>, ApiError> {
    Ok(Json(state.store.sessions_for_user(&user.id).await?))
}

async fn owned_session(
    state: &AppState,
    session_id: &str,
    user_id: &str,
) -> Result<SessionRecord, ApiError> {
    state
        .store
        .session_for_user(session_id, user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Session not found"))
}

async fn get_session(
    State(state): State<AppState>,
    user: AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<SessionRecord>, ApiError> {
    Ok(Json(owned_session(&state, &session_id, &user.id).await?))
}

#[derive(Debug, Deserialize)]
struct SessionUpdate {
    title: Option<String>,
}

async fn update_session(
    State(state): State<AppState>,
    user: AuthUser,
    Path(session_id): Path<String>,
    Json(update): Json<SessionUpdate>,
) -> Result<Json<SessionRecord>, ApiError> {
    owned_session(&state, &session_id, &user.id).await?;
    if let Some(title) = update.title {
        state.store.set_title(&session_id, &title).await?;
    }
    Ok(Json(owned_session(&state, &session_id, &user.id).await?))
}

async fn delete_session(
    State(state): State<AppState>,
    user: AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    owned_session(&state, &session_id, &user.id).await?;

    // Best effort: the sandbox may already be gone.
    state.sandboxes.destroy(&user.id).await;
    state.store.terminate_session(&session_id).await?;
    state.drop_session_cache(&session_id);

    Ok(Json(json!({ "status": "terminated" })))
}

async fn sandbox_for(state: &AppState, user_id: &str) -> Option<std::sync::Arc<UserSandbox>> {
    state.sandboxes.get(user_id).await
}

async fn list_files(
    State(state): State<AppState>,
    user: AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    owned_session(&state, &session_id, &user.id).await?;

    let Some(sandbox) = sandbox_for(&state, &user.id).await else {
        return Ok(Json(json!({ "files": [] })));
    };
    let backend = sandbox
        .file_backend()
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let workspace = &sandbox.workspace_path;
    let cmd = format!(
        "find {workspace} -type f 2>/dev/null | \
         grep -v node_modules | grep -v '.git/' | grep -v '/dist/' | \
         sed 's|{workspace}/||' | sort"
    );
    match backend.exec(&cmd, Duration::from_secs(15), None).await {
        Ok(result) => {
            let files: Vec<String> = result
                .stdout
                .lines()
                .map(str::trim)
                .filter(|f| !f.is_empty() && !f.starts_with('.'))
                .filter(|f| {
                    let basename = f.rsplit('/').next().unwrap_or(f);
                    !LISTING_EXCLUDES.contains(&basename) && !f.ends_with(".Dockerfile")
                })
                .map(str::to_string)
                .collect();
            Ok(Json(json!({ "files": files })))
        }
        Err(e) => {
            error!(%session_id, "failed to list files: {e}");
            Ok(Json(json!({ "files": [] })))
        }
    }
}

async fn get_file(
    State(state): State<AppState>,
    user: AuthUser,
    Path((session_id, file_path)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    owned_session(&state, &session_id, &user.id).await?;

    let sandbox = sandbox_for(&state, &user.id)
        .await
        .ok_or_else(|| ApiError::not_found("No active sandbox for this session"))?;
    let backend = sandbox
        .file_backend()
        .map_err(|e| ApiError::internal(e.to_string()))?;

    match backend.read_file(&file_path).await {
        Ok(content) => Ok(Json(json!({ "path": file_path, "content": content }))),
        Err(_) => Err(ApiError::not_found(format!("File not found: {file_path}"))),
    }
}

#[derive(Debug, Deserialize)]
struct FileUpdate {
    content: String,
}

async fn put_file(
    State(state): State<AppState>,
    user: AuthUser,
    Path((session_id, file_path)): Path<(String, String)>,
    Json(body): Json<FileUpdate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    owned_session(&state, &session_id, &user.id).await?;

    let sandbox = sandbox_for(&state, &user.id)
        .await
        .ok_or_else(|| ApiError::not_found("No active sandbox for this session"))?;
    let backend = sandbox
        .file_backend()
        .map_err(|e| ApiError::internal(e.to_string()))?;

    backend
        .write_file(&file_path, &body.content)
        .await
        .map_err(|e| ApiError::internal(format!("Failed to write file: {e}")))?;
    // The session file cache may now be stale for this path.
    state
        .session_cache(&session_id)
        .invalidate(&atelier_core::backend::cache::normalize_path(&file_path));

    Ok(Json(json!({ "status": "ok", "path": file_path })))
}

async fn download(
    State(state): State<AppState>,
    user: AuthUser,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    owned_session(&state, &session_id, &user.id).await?;

    let sandbox = sandbox_for(&state, &user.id).await.ok_or_else(|| {
        ApiError::gone("Project session expired. Sandbox is no longer active.")
    })?;
    let backend = sandbox
        .file_backend()
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let archive = "/tmp/project.tar.gz";
    backend
        .exec(&format!("rm -f {archive}"), Duration::from_secs(10), None)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let tar = backend
        .exec(
            &format!(
                "tar -czf {archive} --exclude node_modules --exclude dist --exclude .git ."
            ),
            Duration::from_secs(60),
            None,
        )
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    if tar.exit_code != 0 {
        error!(%session_id, stderr = %tar.stderr, "tar failed");
        return Err(ApiError::internal("Failed to compress project files"));
    }

    let bytes = match &sandbox.runtime {
        SandboxRuntime::Remote(provider) => provider
            .read_file_bytes(&sandbox.sandbox_id, archive)
            .await
            .map_err(|_| ApiError::internal("Failed to read generated archive"))?,
        SandboxRuntime::Local(_) => tokio::fs::read(archive)
            .await
            .map_err(|_| ApiError::internal("Failed to read generated archive"))?,
    };

    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=project-{session_id}.tar.gz"),
            ),
        ],
        bytes,
    )
        .into_response())
}

/// Best-effort cancel: drop an unconsumed pending slot and unlock the
/// session. An in-flight subscription is cancelled by the client closing
/// the stream.
async fn stop(
    State(state): State<AppState>,
    user: AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = owned_session(&state, &session_id, &user.id).await?;

    let dropped_slot = state.take_pending(&session_id).is_some();
    if dropped_slot && session.status == SessionStatus::Busy {
        state.store.set_ready(&session_id).await?;
    }

    Ok(Json(json!({ "status": "ok" })))
}
