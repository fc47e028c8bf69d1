//! Tool definitions advertised to the model, in the chat-completions
//! function-calling wire shape.

use serde_json::Value;
use serde_json::json;

pub const READ_FILE: &str = "read_file";
pub const WRITE_FILE: &str = "write_file";
pub const LIST_FILES: &str = "list_files";
pub const GREP_SEARCH: &str = "grep_search";
pub const FUZZY_FIND: &str = "fuzzy_find";
pub const RUN_COMMAND: &str = "run_command";
pub const START_DEV_SERVER: &str = "start_dev_server";
pub const GET_PREVIEW_URL: &str = "get_preview_url";
pub const CHECK_DEV_SERVER: &str = "check_dev_server";
pub const SHOW_USER_MESSAGE: &str = "show_user_message";

fn function(name: &str, description: &str, parameters: Value) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": parameters,
        }
    })
}

/// The full tool belt bound to every agent turn.
pub fn builtin_tools() -> Vec<Value> {
    vec![
        function(
            READ_FILE,
            "Read contents of a file.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path to file (relative to workspace)"},
                },
                "required": ["path"],
                "additionalProperties": false,
            }),
        ),
        function(
            WRITE_FILE,
            "Write content to a file. Creates parent directories.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path to file (relative to workspace)"},
                    "content": {"type": "string", "description": "Content to write"},
                },
                "required": ["path", "content"],
                "additionalProperties": false,
            }),
        ),
        function(
            LIST_FILES,
            "List files in a directory.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Directory to list"},
                },
                "required": [],
                "additionalProperties": false,
            }),
        ),
        function(
            GREP_SEARCH,
            "Search for a pattern in files.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Pattern to search for"},
                    "path": {"type": "string", "description": "Path to search in"},
                },
                "required": ["pattern"],
                "additionalProperties": false,
            }),
        ),
        function(
            FUZZY_FIND,
            "Fuzzy search for files by name.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Partial filename to search for"},
                },
                "required": ["query"],
                "additionalProperties": false,
            }),
        ),
        function(
            RUN_COMMAND,
            "Run a shell command that terminates. Use for builds and installs. \
             DO NOT use for dev servers.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Command to run (e.g. 'bun run build')"},
                    "timeout": {"type": "integer", "description": "Max seconds to wait"},
                    "confirmed": {"type": "boolean", "description": "Set true to run a flagged dangerous command"},
                },
                "required": ["command"],
                "additionalProperties": false,
            }),
        ),
        function(
            START_DEV_SERVER,
            "Start the dev server in the background and report the preview URL.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Dev server command"},
                },
                "required": [],
                "additionalProperties": false,
            }),
        ),
        function(
            GET_PREVIEW_URL,
            "Get the public preview URL for the running dev server.",
            json!({
                "type": "object",
                "properties": {},
                "required": [],
                "additionalProperties": false,
            }),
        ),
        function(
            CHECK_DEV_SERVER,
            "Check whether the dev server is running and fetch recent logs.",
            json!({
                "type": "object",
                "properties": {},
                "required": [],
                "additionalProperties": false,
            }),
        ),
        function(
            SHOW_USER_MESSAGE,
            "Send a message to the user. This is the ONLY way to communicate with \
             the user; regular text responses are not shown. Always call this at \
             the end of your work.",
            json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string", "description": "Message to show to the user"},
                },
                "required": ["message"],
                "additionalProperties": false,
            }),
        ),
    ]
}
