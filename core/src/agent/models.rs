use serde::Deserialize;
use serde::Serialize;

/// One item of model conversation state. The model's function-call
/// `arguments` arrive as a *string* containing JSON, not as a parsed
/// object; they are kept raw here and parsed at dispatch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseItem {
    Message {
        role: String,
        content: String,
    },
    FunctionCall {
        name: String,
        arguments: String,
        call_id: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}
