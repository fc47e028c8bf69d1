//! Agent pipeline tests against a mock model endpoint.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

use atelier_core::agent::ModelClient;
use atelier_core::agent::TurnRequest;
use atelier_core::agent::run_turn;
use atelier_core::backend::FileCache;
use atelier_core::sandbox::SandboxManager;
use atelier_protocol::TurnEvent;

/// One SSE response body in the chat-completions streaming format.
fn sse_body(chunks: &[serde_json::Value]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn tool_call_response(name: &str, arguments: &str) -> ResponseTemplate {
    let body = sse_body(&[
        serde_json::json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": name, "arguments": arguments}
                    }]
                },
                "finish_reason": null
            }]
        }),
        serde_json::json!({
            "choices": [{"delta": {}, "finish_reason": "tool_calls"}]
        }),
    ]);
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

fn text_response(content: &str) -> ResponseTemplate {
    let body = sse_body(&[
        serde_json::json!({
            "choices": [{"delta": {"content": content}, "finish_reason": null}]
        }),
        serde_json::json!({
            "choices": [{"delta": {}, "finish_reason": "stop"}]
        }),
    ]);
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

async fn collect_turn(
    server: &MockServer,
    manager: &SandboxManager,
    user_message: &str,
) -> Vec<TurnEvent> {
    let sandbox = manager.get_or_create("user-1").await.unwrap();
    let client = ModelClient::new(server.uri(), None, "test-model");
    let rx = run_turn(
        client,
        sandbox,
        Arc::new(FileCache::default()),
        TurnRequest {
            history: Vec::new(),
            user_message: user_message.to_string(),
        },
    );

    let mut events = Vec::new();
    while let Ok(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn turn_projects_tool_calls_user_message_and_done() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(tool_call_response(
            "write_file",
            r#"{"path":"src/App.tsx","content":"export default 1;"}"#,
        ))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(tool_call_response(
            "show_user_message",
            r#"{"message":"All done!"}"#,
        ))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(text_response("ok"))
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let manager = SandboxManager::local(root.path());
    let events = collect_turn(&server, &manager, "build me a counter").await;

    // tool_start → tool_end for the visible tool, in order.
    let start_idx = events
        .iter()
        .position(|e| matches!(e, TurnEvent::ToolStart { tool, .. } if tool == "write_file"))
        .expect("tool_start for write_file");
    let end_idx = events
        .iter()
        .position(|e| matches!(e, TurnEvent::ToolEnd { tool, .. } if tool == "write_file"))
        .expect("tool_end for write_file");
    assert!(start_idx < end_idx);

    match &events[end_idx] {
        TurnEvent::ToolEnd { result, .. } => {
            assert!(result.contains("Written to src/App.tsx"), "got {result:?}");
        }
        _ => unreachable!(),
    }

    // show_user_message collapses into a user_message event with no
    // tool_start/tool_end of its own.
    assert!(events.iter().any(
        |e| matches!(e, TurnEvent::UserMessage { content } if content == "All done!")
    ));
    assert!(!events.iter().any(
        |e| matches!(e, TurnEvent::ToolStart { tool, .. } if tool == "show_user_message")
    ));

    // Token passthrough from the final text turn.
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::Token { content } if content == "ok")));

    // Exactly one terminal done, and it is last.
    let done_count = events
        .iter()
        .filter(|e| matches!(e, TurnEvent::Done))
        .count();
    assert_eq!(done_count, 1);
    assert!(matches!(events.last(), Some(TurnEvent::Done)));

    // The write really happened in the workspace.
    let sandbox = manager.get("user-1").await.unwrap();
    let written =
        std::fs::read_to_string(std::path::Path::new(&sandbox.workspace_path).join("src/App.tsx"))
            .unwrap();
    assert_eq!(written, "export default 1;");
}

#[tokio::test]
async fn command_output_preview_marker_emits_preview_ready() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(tool_call_response(
            "run_command",
            r#"{"command":"echo 'Preview URL: http://localhost:5173'"}"#,
        ))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(text_response("done"))
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let manager = SandboxManager::local(root.path());
    let events = collect_turn(&server, &manager, "start it").await;

    let end_idx = events
        .iter()
        .position(|e| matches!(e, TurnEvent::ToolEnd { tool, .. } if tool == "run_command"))
        .expect("tool_end for run_command");
    let preview_idx = events
        .iter()
        .position(
            |e| matches!(e, TurnEvent::PreviewReady { url } if url == "http://localhost:5173"),
        )
        .expect("preview_ready event");
    assert!(end_idx < preview_idx);
}

#[tokio::test]
async fn blocked_tool_command_stays_inside_the_turn() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(tool_call_response("run_command", r#"{"command":"rm -rf /"}"#))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(text_response("understood"))
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let manager = SandboxManager::local(root.path());
    let events = collect_turn(&server, &manager, "clean up").await;

    // The security refusal is a tool result, not a turn failure.
    assert!(events.iter().any(|e| matches!(
        e,
        TurnEvent::ToolEnd { tool, result } if tool == "run_command" && result.contains("BLOCKED")
    )));
    assert!(!events.iter().any(|e| matches!(e, TurnEvent::Error { .. })));
    assert!(matches!(events.last(), Some(TurnEvent::Done)));
}

#[tokio::test]
async fn model_failure_yields_error_then_done() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let manager = SandboxManager::local(root.path());
    let events = collect_turn(&server, &manager, "hello").await;

    assert!(matches!(events.first(), Some(TurnEvent::Error { .. })));
    assert!(matches!(events.last(), Some(TurnEvent::Done)));
    assert_eq!(events.len(), 2);
}
