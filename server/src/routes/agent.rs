//! The session orchestrator: binds an accepted user message to a single
//! in-flight agent turn, provisions the sandbox on first message, streams
//! normalized events to the subscriber, and persists the turn.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::convert::Infallible;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::response::sse::Event;
use axum::response::sse::KeepAlive;
use axum::response::sse::Sse;
use axum::routing::get;
use axum::routing::post;
use futures::Stream;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tracing::error;
use tracing::info;

use atelier_core::agent::TurnRequest;
use atelier_core::agent::pipeline::MAX_HISTORY;
use atelier_core::agent::run_turn;
use atelier_protocol::MessageRecord;
use atelier_protocol::Step;
use atelier_protocol::StepStatus;
use atelier_protocol::StreamEvent;
use atelier_protocol::TurnEvent;
use atelier_protocol::is_visible_tool;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;
use crate::state::PendingTurn;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions/{session_id}/message", post(send_message))
        .route("/sessions/{session_id}/sse", get(stream_events))
        .route("/sessions/{session_id}/messages", get(list_messages))
}

#[derive(Debug, Deserialize)]
struct MessageCreate {
    content: String,
}

async fn send_message(
    State(state): State<AppState>,
    user: AuthUser,
    Path(session_id): Path<String>,
    Json(body): Json<MessageCreate>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .store
        .session_for_user(&session_id, &user.id)
        .await?
        .ok_or_else(|| ApiError::not_found("Session not found"))?;

    if session.status == atelier_protocol::SessionStatus::Busy {
        return Err(ApiError::conflict("Session is busy"));
    }
    if !session.status.accepts_messages() {
        return Err(ApiError::bad_request(format!(
            "Session not ready: {}",
            session.status.as_str()
        )));
    }

    if !state.store.begin_turn(&session_id, &body.content).await? {
        return Err(ApiError::conflict("Session is busy"));
    }
    state.set_pending(
        &session_id,
        PendingTurn {
            user_id: user.id,
            content: body.content,
            needs_sandbox: session.sandbox_id.is_none(),
        },
    );

    Ok(Json(json!({
        "status": "processing",
        "stream_url": format!("/sessions/{session_id}/sse"),
    })))
}

/// Unlocks the session if the subscription is dropped before the turn
/// finished. Persisted state is reconciled through the store; events
/// already delivered are not rolled back.
struct TurnGuard {
    state: AppState,
    session_id: String,
    completed: bool,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        info!(session_id = %self.session_id, "turn aborted before completion");
        let state = self.state.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            if let Err(e) = state.store.set_ready(&session_id).await {
                error!(%session_id, "failed to unlock session: {e}");
            }
        });
    }
}

async fn stream_events(
    State(state): State<AppState>,
    user: AuthUser,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = state
        .store
        .session_for_user(&session_id, &user.id)
        .await?
        .ok_or_else(|| ApiError::not_found("Session not found"))?;

    // Consume the pending slot recorded by send_message.
    let pending = state
        .take_pending(&session_id)
        .ok_or_else(|| ApiError::bad_request("No pending message"))?;

    let stream = async_stream::stream! {
        let mut guard = TurnGuard {
            state: state.clone(),
            session_id: session_id.clone(),
            completed: false,
        };
        let mut preview_url = session.preview_url.clone();

        // Step 1: provision the sandbox on first message.
        if pending.needs_sandbox {
            match state.sandboxes.provision_for_session(&pending.user_id).await {
                Ok((sandbox, url)) => {
                    preview_url = url;
                    if let Err(e) = state
                        .store
                        .attach_sandbox(&session_id, &sandbox.sandbox_id, preview_url.as_deref())
                        .await
                    {
                        error!(%session_id, "failed to record sandbox: {e}");
                    }
                }
                Err(e) => {
                    for ev in [
                        StreamEvent::Error {
                            message: format!("Failed to create sandbox: {e}"),
                        },
                        StreamEvent::Done { preview_url: None },
                    ] {
                        if let Ok(event) = Event::default().json_data(&ev) {
                            yield Ok::<Event, Infallible>(event);
                        }
                    }
                    let _ = state.store.set_ready(&session_id).await;
                    guard.completed = true;
                    return;
                }
            }
        }

        // Step 2: the preview URL goes out once, before any tool activity.
        if let Some(url) = &preview_url {
            if let Ok(event) = Event::default().json_data(&StreamEvent::PreviewUrl {
                url: url.clone(),
            }) {
                yield Ok(event);
            }
        }

        // Step 3: drive the agent turn.
        let history = match state.store.messages_for_session(&session_id).await {
            Ok(messages) => {
                let start = messages.len().saturating_sub(MAX_HISTORY);
                messages[start..]
                    .iter()
                    .map(|m| (m.role, m.content.clone()))
                    .collect()
            }
            Err(e) => {
                error!(%session_id, "failed to load history: {e}");
                Vec::new()
            }
        };

        let Some(sandbox) = state.sandboxes.get(&pending.user_id).await else {
            for ev in [
                StreamEvent::Error {
                    message: format!("No sandbox for user {}", pending.user_id),
                },
                StreamEvent::Done { preview_url: preview_url.clone() },
            ] {
                if let Ok(event) = Event::default().json_data(&ev) {
                    yield Ok(event);
                }
            }
            let _ = state.store.set_ready(&session_id).await;
            guard.completed = true;
            return;
        };

        let cache = state.session_cache(&session_id);
        let rx = run_turn(
            state.model.clone(),
            sandbox,
            cache,
            TurnRequest {
                history,
                user_message: pending.content.clone(),
            },
        );

        let mut assistant_content = String::new();
        let mut collected_steps: Vec<Step> = Vec::new();
        let mut tool_step_map: HashMap<String, String> = HashMap::new();
        let mut step_counter = 0usize;

        while let Ok(turn_event) = rx.recv().await {
            let projected = match turn_event {
                TurnEvent::Token { content } => Some(StreamEvent::Token { content }),
                TurnEvent::UserMessage { content } => {
                    assistant_content.push_str(&content);
                    Some(StreamEvent::UserMessage { content })
                }
                TurnEvent::ToolStart { tool, args } => {
                    if is_visible_tool(&tool) {
                        step_counter += 1;
                        let step_id = format!("step-{step_counter}");
                        let step = Step::tool(&step_id, step_title(&tool, &args));
                        collected_steps.push(step.clone());
                        tool_step_map.insert(tool.clone(), step_id);
                        Some(StreamEvent::ToolStart { tool, step })
                    } else {
                        None
                    }
                }
                TurnEvent::ToolEnd { tool, .. } => {
                    if is_visible_tool(&tool) {
                        let step_id = tool_step_map.get(&tool).cloned();
                        if let Some(id) = &step_id {
                            for step in &mut collected_steps {
                                if &step.id == id {
                                    step.status = StepStatus::Done;
                                    break;
                                }
                            }
                        }
                        Some(StreamEvent::ToolEnd { tool, step_id })
                    } else {
                        None
                    }
                }
                TurnEvent::PreviewReady { url } => {
                    step_counter += 1;
                    let step = Step::preview(format!("step-{step_counter}"), &url);
                    collected_steps.push(step.clone());
                    preview_url = Some(url.clone());
                    Some(StreamEvent::PreviewReady { url, step })
                }
                TurnEvent::Error { message } => Some(StreamEvent::Error { message }),
                TurnEvent::Done => {
                    // Step 4: persist the turn before the stream's done.
                    if let Err(e) = state
                        .store
                        .finish_turn(
                            &session_id,
                            &assistant_content,
                            &collected_steps,
                            preview_url.as_deref(),
                        )
                        .await
                    {
                        error!(%session_id, "failed to persist turn: {e}");
                    }
                    guard.completed = true;
                    if let Ok(event) = Event::default().json_data(&StreamEvent::Done {
                        preview_url: preview_url.clone(),
                    }) {
                        yield Ok(event);
                    }
                    break;
                }
            };
            if let Some(ev) = projected {
                if let Ok(event) = Event::default().json_data(&ev) {
                    yield Ok(event);
                }
            }
        }

        // The pipeline guarantees a terminal Done; if the channel closed
        // without one, unlock the session and close the stream cleanly.
        if !guard.completed {
            for ev in [
                StreamEvent::Error {
                    message: "agent stream ended unexpectedly".to_string(),
                },
                StreamEvent::Done { preview_url: preview_url.clone() },
            ] {
                if let Ok(event) = Event::default().json_data(&ev) {
                    yield Ok(event);
                }
            }
            let _ = state.store.set_ready(&session_id).await;
            guard.completed = true;
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn list_messages(
    State(state): State<AppState>,
    user: AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<MessageRecord>>, ApiError> {
    state
        .store
        .session_for_user(&session_id, &user.id)
        .await?
        .ok_or_else(|| ApiError::not_found("Session not found"))?;

    Ok(Json(state.store.messages_for_session(&session_id).await?))
}

/// Human-facing titles for activity-feed steps.
fn step_title(tool: &str, args: &Value) -> String {
    let arg = |key: &str| args.get(key).and_then(Value::as_str).unwrap_or_default();
    let path = arg("path");
    let filename = path.rsplit('/').next().unwrap_or_default();

    match tool {
        "write_file" => {
            if filename.is_empty() {
                "Edited file".to_string()
            } else {
                format!("Edited {filename}")
            }
        }
        "read_file" => {
            if filename.is_empty() {
                "Read file".to_string()
            } else {
                format!("Read {filename}")
            }
        }
        "list_files" => {
            if path.is_empty() {
                "Checked folder".to_string()
            } else {
                format!("Checked {path}")
            }
        }
        "grep_search" => {
            let pattern = arg("pattern");
            let ellipsis = if pattern.chars().count() > 20 { "..." } else { "" };
            let short: String = pattern.chars().take(20).collect();
            format!("Searched '{short}{ellipsis}'")
        }
        "fuzzy_find" => format!("Finding '{}'", arg("query")),
        "run_command" => {
            let cmd = arg("command");
            let ellipsis = if cmd.chars().count() > 25 { "..." } else { "" };
            let short: String = cmd.chars().take(25).collect();
            format!("Running {short}{ellipsis}")
        }
        other => {
            let mut title = String::new();
            for (i, part) in other.split('_').enumerate() {
                if i > 0 {
                    title.push(' ');
                }
                let mut chars = part.chars();
                if let Some(first) = chars.next() {
                    title.extend(first.to_uppercase());
                    title.push_str(chars.as_str());
                }
            }
            title
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn titles_follow_the_formatting_rules() {
        assert_eq!(
            step_title("write_file", &json!({"path": "src/App.tsx"})),
            "Edited App.tsx"
        );
        assert_eq!(step_title("write_file", &json!({})), "Edited file");
        assert_eq!(
            step_title("read_file", &json!({"path": "index.html"})),
            "Read index.html"
        );
        assert_eq!(
            step_title("list_files", &json!({"path": "src"})),
            "Checked src"
        );
        assert_eq!(step_title("list_files", &json!({})), "Checked folder");
        assert_eq!(
            step_title("grep_search", &json!({"pattern": "useState"})),
            "Searched 'useState'"
        );
        assert_eq!(
            step_title(
                "grep_search",
                &json!({"pattern": "a-very-long-pattern-over-twenty-chars"})
            ),
            "Searched 'a-very-long-pattern-...'"
        );
        assert_eq!(
            step_title("fuzzy_find", &json!({"query": "Button"})),
            "Finding 'Button'"
        );
        assert_eq!(
            step_title("run_command", &json!({"command": "bun run build"})),
            "Running bun run build"
        );
        assert_eq!(
            step_title(
                "run_command",
                &json!({"command": "bun run build && bun run preview"})
            ),
            "Running bun run build && bun run...",
        );
        assert_eq!(step_title("some_other_tool", &json!({})), "Some Other Tool");
    }
}
