//! Drives one agent turn and projects it onto the public event alphabet.
//!
//! The caller receives a channel of [`TurnEvent`]s ending in exactly one
//! `Done`. Tool failures stay inside the loop (the model sees them as
//! results); stream-level failures become one `Error` event before `Done`.
//! If the receiver is dropped mid-turn the next send fails and the turn
//! unwinds without further work.

use std::sync::Arc;
use std::time::Duration;

use async_channel::Receiver;
use async_channel::Sender;
use futures::StreamExt;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::info;

use atelier_protocol::Role;
use atelier_protocol::TurnEvent;

use crate::backend::FileCache;
use crate::backend::WorkspaceTools;
use crate::error::CoreErr;
use crate::error::Result;
use crate::exec::safety;
use crate::flags::DEV_SERVER_PORT;
use crate::sandbox::SandboxRuntime;
use crate::sandbox::UserSandbox;
use crate::util::truncate_chars;

use super::client::ModelClient;
use super::client::Prompt;
use super::client::ResponseEvent;
use super::models::ResponseItem;
use super::tool_defs;

/// Hard cap on model/tool round-trips per turn.
pub const MAX_ITERATIONS: usize = 100;

/// How many stored messages of history are replayed into a new turn.
pub const MAX_HISTORY: usize = 6;

const TOOL_RESULT_LIMIT: usize = 500;
const PREVIEW_MARKER: &str = "Preview URL:";
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

/// Tools whose output is scanned for a freshly reported preview URL.
const COMMAND_TOOLS: &[&str] = &[
    tool_defs::RUN_COMMAND,
    tool_defs::START_DEV_SERVER,
    tool_defs::CHECK_DEV_SERVER,
    tool_defs::GET_PREVIEW_URL,
];

const BASE_INSTRUCTIONS: &str = include_str!("prompt.md");

/// Input to one agent turn. History is the last [`MAX_HISTORY`] stored
/// messages, oldest first.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub history: Vec<(Role, String)>,
    pub user_message: String,
}

/// Spawn a turn against the given sandbox and return its event stream.
pub fn run_turn(
    client: ModelClient,
    sandbox: Arc<UserSandbox>,
    cache: Arc<FileCache>,
    request: TurnRequest,
) -> Receiver<TurnEvent> {
    let (tx, rx) = async_channel::bounded(64);
    tokio::spawn(async move {
        match drive_turn(&client, sandbox, cache, request, &tx).await {
            Ok(()) => {}
            Err(CoreErr::SubscriberGone) => {
                debug!("turn subscriber disconnected; unwinding");
                return;
            }
            Err(e) => {
                info!("turn error: {e}");
                let _ = tx
                    .send(TurnEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        }
        let _ = tx.send(TurnEvent::Done).await;
    });
    rx
}

async fn emit(tx: &Sender<TurnEvent>, event: TurnEvent) -> Result<()> {
    tx.send(event).await.map_err(|_| CoreErr::SubscriberGone)
}

async fn drive_turn(
    client: &ModelClient,
    sandbox: Arc<UserSandbox>,
    cache: Arc<FileCache>,
    request: TurnRequest,
    tx: &Sender<TurnEvent>,
) -> Result<()> {
    let backend = sandbox.file_backend()?;
    let belt = ToolBelt {
        tools: WorkspaceTools::new(backend, cache),
        sandbox: Arc::clone(&sandbox),
    };

    let mut input: Vec<ResponseItem> = request
        .history
        .into_iter()
        .map(|(role, content)| ResponseItem::Message {
            role: role.as_str().to_string(),
            content,
        })
        .collect();
    input.push(ResponseItem::Message {
        role: "user".to_string(),
        content: request.user_message,
    });

    let instructions = format!(
        "{}\n\nWorkspace root: {}",
        BASE_INSTRUCTIONS.trim(),
        sandbox.workspace_path
    );
    let tools = tool_defs::builtin_tools();

    for _ in 0..MAX_ITERATIONS {
        let prompt = Prompt {
            instructions: instructions.clone(),
            input: input.clone(),
            tools: tools.clone(),
        };
        let mut stream = client.stream(&prompt).await?;

        let mut calls: Vec<(String, String, String)> = Vec::new();
        while let Some(event) = stream.next().await {
            match event? {
                ResponseEvent::OutputItemDone(ResponseItem::Message { role, content })
                    if role == "assistant" && !content.is_empty() =>
                {
                    emit(tx, TurnEvent::Token { content }).await?;
                }
                ResponseEvent::OutputItemDone(ResponseItem::FunctionCall {
                    name,
                    arguments,
                    call_id,
                }) => {
                    calls.push((name, arguments, call_id));
                }
                ResponseEvent::OutputItemDone(_) => {}
                ResponseEvent::Completed => break,
            }
        }

        if calls.is_empty() {
            // No tool requests: the model is finished.
            return Ok(());
        }

        for (name, arguments, call_id) in calls {
            let args: Value = serde_json::from_str(&arguments).unwrap_or_else(|_| json!({}));

            if name == tool_defs::SHOW_USER_MESSAGE {
                let message = args
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if !message.is_empty() {
                    emit(
                        tx,
                        TurnEvent::UserMessage {
                            content: message.clone(),
                        },
                    )
                    .await?;
                }
                input.push(ResponseItem::FunctionCall {
                    name,
                    arguments,
                    call_id: call_id.clone(),
                });
                input.push(ResponseItem::FunctionCallOutput {
                    call_id,
                    output: message,
                });
                continue;
            }

            emit(
                tx,
                TurnEvent::ToolStart {
                    tool: name.clone(),
                    args: args.clone(),
                },
            )
            .await?;

            let result = belt.invoke(&name, &args).await;

            emit(
                tx,
                TurnEvent::ToolEnd {
                    tool: name.clone(),
                    result: truncate_chars(&result, TOOL_RESULT_LIMIT),
                },
            )
            .await?;

            if COMMAND_TOOLS.contains(&name.as_str()) {
                if let Some(url) = extract_preview_url(&result) {
                    emit(tx, TurnEvent::PreviewReady { url }).await?;
                }
            }

            input.push(ResponseItem::FunctionCall {
                name,
                arguments,
                call_id: call_id.clone(),
            });
            input.push(ResponseItem::FunctionCallOutput {
                call_id,
                output: result,
            });
        }
    }

    Err(CoreErr::IterationLimit(MAX_ITERATIONS))
}

/// Pull the URL following a `Preview URL:` marker out of a tool result.
/// The URL ends at whitespace or a quote, so the marker is recognized in
/// plain text and in JSON-encoded command output alike.
pub fn extract_preview_url(result: &str) -> Option<String> {
    let idx = result.find(PREVIEW_MARKER)?;
    let rest = result[idx + PREVIEW_MARKER.len()..].trim_start();
    let url: String = rest
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != '"' && *c != '\\')
        .collect();
    (!url.is_empty()).then_some(url)
}

/// The tools the agent can invoke, bound to one sandbox and one session
/// cache. Every failure is rendered into the result string; nothing here
/// aborts the turn.
struct ToolBelt {
    tools: WorkspaceTools,
    sandbox: Arc<UserSandbox>,
}

impl ToolBelt {
    async fn invoke(&self, name: &str, args: &Value) -> String {
        match name {
            tool_defs::READ_FILE => match required_str(args, "path") {
                Ok(path) => self.tools.read_file(path).await,
                Err(e) => e,
            },
            tool_defs::WRITE_FILE => {
                match (required_str(args, "path"), required_str(args, "content")) {
                    (Ok(path), Ok(content)) => self.tools.write_file(path, content).await,
                    (Err(e), _) | (_, Err(e)) => e,
                }
            }
            tool_defs::LIST_FILES => {
                let path = optional_str(args, "path").unwrap_or(".");
                self.tools.list_dir(path).await
            }
            tool_defs::GREP_SEARCH => match required_str(args, "pattern") {
                Ok(pattern) => {
                    let path = optional_str(args, "path").unwrap_or(".");
                    self.tools.grep(pattern, path, 2).await
                }
                Err(e) => e,
            },
            tool_defs::FUZZY_FIND => match required_str(args, "query") {
                Ok(query) => self.tools.fuzzy_find(query).await,
                Err(e) => e,
            },
            tool_defs::RUN_COMMAND => match required_str(args, "command") {
                Ok(command) => {
                    let timeout = args
                        .get("timeout")
                        .and_then(Value::as_u64)
                        .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
                    let confirmed = args
                        .get("confirmed")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    self.run_command(command, Duration::from_secs(timeout), confirmed)
                        .await
                }
                Err(e) => e,
            },
            tool_defs::START_DEV_SERVER => {
                let command = optional_str(args, "command").unwrap_or("bun run dev");
                self.start_dev_server(command).await
            }
            tool_defs::GET_PREVIEW_URL => self.get_preview_url().await,
            tool_defs::CHECK_DEV_SERVER => self.check_dev_server().await,
            other => format!("Unknown tool: {other}"),
        }
    }

    /// The security gate applies here, uniformly, before any dispatch: a
    /// blocked command never reaches either runtime.
    async fn run_command(&self, command: &str, timeout: Duration, confirmed: bool) -> String {
        if safety::is_blocked(command) {
            return CoreErr::Blocked.to_string();
        }
        if safety::needs_confirmation(command) && !confirmed {
            return CoreErr::ConfirmationRequired(command.to_string()).to_string();
        }

        match &self.sandbox.runtime {
            SandboxRuntime::Local(executor) => {
                match executor
                    .run_command(command, None, Some(timeout), confirmed, false)
                    .await
                {
                    Ok(output) => serde_json::to_string(&output)
                        .unwrap_or_else(|_| output.output.clone()),
                    Err(e) => e.to_string(),
                }
            }
            SandboxRuntime::Remote(_) => {
                match self.tools.backend().exec(command, timeout, None).await {
                    Ok(result) => {
                        let success = result.success();
                        let exit_code = result.exit_code;
                        let mut out = result.stdout;
                        if !result.stderr.is_empty() {
                            out.push_str(&format!("\n[stderr]: {}", result.stderr));
                        }
                        if !success {
                            out = format!("[Exit code: {exit_code}]\n{out}");
                        }
                        out
                    }
                    Err(e) => format!("Error: {e}"),
                }
            }
        }
    }

    async fn start_dev_server(&self, command: &str) -> String {
        match &self.sandbox.runtime {
            SandboxRuntime::Remote(provider) => {
                let id = &self.sandbox.sandbox_id;
                // Stop any previous dev server before starting a new one.
                let _ = provider
                    .run(
                        id,
                        "pkill -f 'vite' 2>/dev/null; exit 0",
                        None,
                        Duration::from_secs(5),
                    )
                    .await;
                tokio::time::sleep(Duration::from_secs(1)).await;

                if let Err(e) = provider
                    .run_background(id, command, Some(&self.sandbox.workspace_path))
                    .await
                {
                    return format!("Error starting dev server: {e}");
                }
                self.sandbox.set_dev_server_running(true);

                let mut code = "000".to_string();
                for _ in 0..10 {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    if let Ok(result) = provider
                        .run(
                            id,
                            &format!(
                                "curl -s -o /dev/null -w '%{{http_code}}' http://localhost:{}/ 2>/dev/null || echo '000'",
                                *DEV_SERVER_PORT
                            ),
                            None,
                            Duration::from_secs(5),
                        )
                        .await
                    {
                        code = result.stdout.trim().to_string();
                        if code == "200" {
                            break;
                        }
                    }
                }

                let url = format!("https://{}", provider.host(id, *DEV_SERVER_PORT));
                self.sandbox.set_preview_url(&url);
                if code == "200" {
                    format!("✓ Dev server running.\nPreview URL: {url}")
                } else {
                    format!("Dev server starting...\nPreview URL: {url}")
                }
            }
            SandboxRuntime::Local(executor) => {
                match executor
                    .run_background(command, None, Some(Duration::from_secs(2)))
                    .await
                {
                    Ok(out) if out.status == "running" => {
                        self.sandbox.set_dev_server_running(true);
                        let url = out
                            .url
                            .unwrap_or_else(|| format!("http://localhost:{}", *DEV_SERVER_PORT));
                        self.sandbox.set_preview_url(&url);
                        format!("✓ Dev server running.\nPreview URL: {url}")
                    }
                    Ok(out) => format!(
                        "Dev server exited early (exit code {:?}).\n{}",
                        out.exit_code, out.initial_output
                    ),
                    Err(e) => format!("Error starting dev server: {e}"),
                }
            }
        }
    }

    async fn get_preview_url(&self) -> String {
        if let Some(url) = self.sandbox.preview_url() {
            return url;
        }
        match &self.sandbox.runtime {
            SandboxRuntime::Remote(provider) => {
                let url = format!(
                    "https://{}",
                    provider.host(&self.sandbox.sandbox_id, *DEV_SERVER_PORT)
                );
                self.sandbox.set_preview_url(&url);
                url
            }
            SandboxRuntime::Local(_) => {
                "No preview URL available. Start dev server first.".to_string()
            }
        }
    }

    async fn check_dev_server(&self) -> String {
        let url = self
            .sandbox
            .preview_url()
            .unwrap_or_else(|| "Not available".to_string());
        match &self.sandbox.runtime {
            SandboxRuntime::Remote(provider) => {
                let id = &self.sandbox.sandbox_id;
                let code = provider
                    .run(
                        id,
                        &format!(
                            "curl -s -o /dev/null -w '%{{http_code}}' http://localhost:{}/ 2>/dev/null || echo '000'",
                            *DEV_SERVER_PORT
                        ),
                        None,
                        Duration::from_secs(5),
                    )
                    .await
                    .map(|r| r.stdout.trim().to_string())
                    .unwrap_or_else(|_| "000".to_string());
                let logs = provider
                    .run(
                        id,
                        "tail -20 /tmp/dev-server.log 2>/dev/null || echo 'No logs'",
                        None,
                        Duration::from_secs(5),
                    )
                    .await
                    .map(|r| r.stdout)
                    .unwrap_or_default();
                let status = if code == "200" {
                    "✓ Running".to_string()
                } else {
                    format!("⚠ HTTP {code}")
                };
                format!("Status: {status}\nPreview URL: {url}\n\nRecent logs:\n{logs}")
            }
            SandboxRuntime::Local(executor) => {
                let status = if self.sandbox.dev_server_running() {
                    "✓ Running"
                } else {
                    "⚠ Not running"
                };
                let recent: Vec<String> = executor
                    .list_commands(3)
                    .into_iter()
                    .map(|c| format!("{} ({})", c.command, if c.is_running { "running" } else { "done" }))
                    .collect();
                format!(
                    "Status: {status}\nPreview URL: {url}\n\nRecent commands:\n{}",
                    recent.join("\n")
                )
            }
        }
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> std::result::Result<&'a str, String> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("Error: missing required argument '{key}'"))
}

fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}
