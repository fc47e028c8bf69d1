use serde::Deserialize;
use serde::Serialize;

use crate::step::Step;

/// Raw events produced while driving one agent turn. This is the fixed
/// alphabet coming off the model/tool loop; the orchestrator owns the
/// projection into [`StreamEvent`]s (step ids, titles, preview bookkeeping).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// Incremental assistant text from the model.
    Token { content: String },

    /// User-visible assistant text, lifted out of the `show_user_message`
    /// pseudo-tool's input so the final reply is a first-class event rather
    /// than something parsed back out of the token stream.
    UserMessage { content: String },

    /// A tool invocation is starting. `args` is the parsed call payload.
    ToolStart {
        tool: String,
        args: serde_json::Value,
    },

    /// A tool invocation finished. `result` is truncated to 500 chars.
    ToolEnd { tool: String, result: String },

    /// A command tool reported a `Preview URL:` in its output.
    PreviewReady { url: String },

    Error { message: String },

    /// Terminates the turn. Exactly one per turn.
    Done,
}

/// Wire-level events delivered to the subscribing client, in generation
/// order. `PreviewUrl` is emitted at most once, before any `ToolStart`;
/// `Done` is always last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    PreviewUrl {
        url: String,
    },
    Token {
        content: String,
    },
    UserMessage {
        content: String,
    },
    ToolStart {
        tool: String,
        step: Step,
    },
    ToolEnd {
        tool: String,
        step_id: Option<String>,
    },
    PreviewReady {
        url: String,
        step: Step,
    },
    Error {
        message: String,
    },
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        preview_url: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn turn_events_use_snake_case_type_tags() {
        let event = TurnEvent::ToolStart {
            tool: "write_file".to_string(),
            args: serde_json::json!({"path": "src/App.tsx"}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool_start");
        assert_eq!(json["args"]["path"], "src/App.tsx");
    }

    #[test]
    fn done_omits_absent_preview_url() {
        let done = StreamEvent::Done { preview_url: None };
        assert_eq!(
            serde_json::to_string(&done).unwrap(),
            r#"{"type":"done"}"#
        );

        let done = StreamEvent::Done {
            preview_url: Some("https://p.example".to_string()),
        };
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["preview_url"], "https://p.example");
    }
}
