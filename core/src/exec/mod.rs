//! Asynchronous local subprocess manager.
//!
//! Commands run rooted inside a configured workspace directory in one of
//! two modalities: blocking (wait to completion under a wall-clock timeout)
//! and background (return quickly while a reader task drains output into a
//! bounded log). Logs are retained in an LRU store with a TTL and read back
//! through bounded pagination.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

pub mod command_log;
pub mod output;
pub mod safety;

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::error::CoreErr;
use crate::error::Result;
use command_log::CommandLog;
use command_log::CommandLogStore;
use command_log::LogHandle;
use output::CommandOutput;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_TAIL_LINES: usize = 40;
const MAX_PAGINATION_CALLS: u32 = 3;
const DEFAULT_WAIT_FOR_OUTPUT: Duration = Duration::from_secs(2);
const TERMINATE_GRACE: Duration = Duration::from_secs(3);
const LOG_CAPACITY: usize = 50;
const LOG_TTL: Duration = Duration::from_secs(30 * 60);

/// Result of `run_background`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackgroundOutput {
    pub cmd_id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub initial_output: String,
    pub lines_captured: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub hint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminateOutcome {
    pub cmd_id: String,
    pub status: &'static str,
    pub exit_code: Option<i32>,
    pub total_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminatedProcess {
    pub cmd_id: String,
    pub command: String,
    pub result: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupReport {
    pub terminated_count: usize,
    pub processes: Vec<TerminatedProcess>,
}

/// One page of a command log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogPage {
    pub cmd_id: String,
    pub lines: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub showing: Option<String>,
    pub total_lines: usize,
    pub is_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination_remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandSummary {
    pub cmd_id: String,
    pub command: String,
    pub exit_code: Option<i32>,
    pub is_running: bool,
    pub started_at: String,
}

pub struct AsyncProcessExecutor {
    root: PathBuf,
    timeout: Duration,
    default_tail_lines: usize,
    max_pagination_calls: u32,
    log_store: CommandLogStore,
}

impl AsyncProcessExecutor {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().canonicalize()?;
        Ok(Self {
            root,
            timeout: DEFAULT_TIMEOUT,
            default_tail_lines: DEFAULT_TAIL_LINES,
            max_pagination_calls: MAX_PAGINATION_CALLS,
            log_store: CommandLogStore::new(LOG_CAPACITY, LOG_TTL),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn validate_cwd(&self, cwd: Option<&str>) -> Result<PathBuf> {
        let Some(cwd) = cwd else {
            return Ok(self.root.clone());
        };
        let path = Path::new(cwd);
        if !path.is_absolute() {
            return Err(CoreErr::InvalidCwd(cwd.to_string()));
        }
        let resolved = path
            .canonicalize()
            .map_err(|_| CoreErr::InvalidCwd(cwd.to_string()))?;
        if !resolved.starts_with(&self.root) {
            return Err(CoreErr::InvalidCwd(cwd.to_string()));
        }
        Ok(resolved)
    }

    fn shell_command(command: &str, cwd: &Path) -> Command {
        let mut cmd = Command::new("bash");
        cmd.arg("-lc")
            .arg(command)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            // Do not create a file descriptor for stdin because otherwise
            // some commands may hang forever waiting for input.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run a command to completion (or timeout) and return its shaped
    /// output. On timeout the child is killed and the log records
    /// `exit_code = -1` with a timeout sentinel on stderr.
    pub async fn run_command(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
        confirmed: bool,
        verbose: bool,
    ) -> Result<CommandOutput> {
        let command = command.trim().to_string();
        if command.is_empty() {
            return Err(CoreErr::EmptyCommand);
        }
        if safety::is_blocked(&command) {
            return Err(CoreErr::Blocked);
        }
        if safety::needs_confirmation(&command) && !confirmed {
            return Err(CoreErr::ConfirmationRequired(command));
        }
        let effective_cwd = self.validate_cwd(cwd)?;
        let effective_timeout = timeout.unwrap_or(self.timeout);

        let cmd_id = short_id();
        let handle = LogHandle::new(CommandLog::new(&cmd_id, &command, &effective_cwd));
        self.log_store.store(handle.clone());

        debug!(%cmd_id, %command, "run_command");

        let child = match Self::shell_command(&command, &effective_cwd).spawn() {
            Ok(child) => child,
            Err(e) => {
                let mut log = handle.log.lock().unwrap();
                log.stderr_lines = vec![format!("ERROR: {e}\n")];
                log.mark_completed(Some(-1));
                return Ok(output::format_output(&log, verbose, self.default_tail_lines));
            }
        };

        match tokio::time::timeout(effective_timeout, child.wait_with_output()).await {
            Ok(Ok(out)) => {
                let mut log = handle.log.lock().unwrap();
                log.stdout_lines = split_keepends(&String::from_utf8_lossy(&out.stdout));
                log.stderr_lines = split_keepends(&String::from_utf8_lossy(&out.stderr));
                log.mark_completed(out.status.code().or(Some(-1)));
                Ok(output::format_output(&log, verbose, self.default_tail_lines))
            }
            Ok(Err(e)) => {
                let mut log = handle.log.lock().unwrap();
                log.stderr_lines = vec![format!("ERROR: {e}\n")];
                log.mark_completed(Some(-1));
                Ok(output::format_output(&log, verbose, self.default_tail_lines))
            }
            Err(_) => {
                // Dropping the wait future kills the child (kill_on_drop).
                let mut log = handle.log.lock().unwrap();
                log.stderr_lines = vec![format!(
                    "TIMEOUT: Command exceeded {}s\n",
                    effective_timeout.as_secs()
                )];
                log.mark_completed(Some(-1));
                Ok(output::format_output(&log, false, self.default_tail_lines))
            }
        }
    }

    /// Launch a command in the background, wait briefly to harvest early
    /// output, then return while the process keeps running. Any existing
    /// background process sharing the same first three command tokens is
    /// killed first.
    pub async fn run_background(
        &self,
        command: &str,
        cwd: Option<&str>,
        wait_for_output: Option<Duration>,
    ) -> Result<BackgroundOutput> {
        let command = command.trim().to_string();
        if command.is_empty() {
            return Err(CoreErr::EmptyCommand);
        }
        if safety::is_blocked(&command) {
            return Err(CoreErr::Blocked);
        }
        let effective_cwd = self.validate_cwd(cwd)?;

        self.kill_similar_background(&command).await;

        let cmd_id = short_id();
        let handle = LogHandle::new(CommandLog::new(&cmd_id, &command, &effective_cwd));
        self.log_store.store(handle.clone());

        debug!(%cmd_id, %command, "run_background");

        let mut child = match Self::shell_command(&command, &effective_cwd).spawn() {
            Ok(child) => child,
            Err(e) => {
                let mut log = handle.log.lock().unwrap();
                log.stderr_lines = vec![format!("ERROR: {e}\n")];
                log.mark_completed(Some(-1));
                return Ok(BackgroundOutput {
                    cmd_id,
                    status: "error",
                    exit_code: Some(-1),
                    initial_output: String::new(),
                    lines_captured: 0,
                    url: None,
                    hint: format!("Failed to launch: {e}"),
                });
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        {
            let mut log = handle.log.lock().unwrap();
            log.pid = child.id();
        }
        let reader = tokio::spawn(stream_output(child, stdout, stderr, handle.log.clone()));
        handle.log.lock().unwrap().reader = Some(reader);

        tokio::time::sleep(wait_for_output.unwrap_or(DEFAULT_WAIT_FOR_OUTPUT)).await;

        let (is_running, exit_code, tail, captured) = {
            let log = handle.log.lock().unwrap();
            let start = log.output_buffer.len().saturating_sub(30);
            let tail: String = log.output_buffer[start..].concat();
            (log.is_running, log.exit_code, tail, log.output_buffer.len())
        };

        if !is_running {
            return Ok(BackgroundOutput {
                cmd_id,
                status: "completed",
                exit_code,
                initial_output: tail.trim_end().to_string(),
                lines_captured: captured,
                url: None,
                hint: "Process exited before the wait window elapsed.".to_string(),
            });
        }

        let url = output::detect_url(&tail);
        let hint = match &url {
            Some(url) => format!("Dev server running at {url}"),
            None => format!("Process running. Use read_log('{cmd_id}') to check output."),
        };
        Ok(BackgroundOutput {
            cmd_id,
            status: "running",
            exit_code: None,
            initial_output: tail.trim_end().to_string(),
            lines_captured: captured,
            url,
            hint,
        })
    }

    /// Kill any running background process whose command shares the same
    /// first three whitespace-delimited tokens as `command`.
    async fn kill_similar_background(&self, command: &str) {
        let words: Vec<&str> = command.split_whitespace().take(3).collect();
        for cmd_id in self.log_store.all_ids() {
            let Some(handle) = self.log_store.get(&cmd_id) else {
                continue;
            };
            let matches = {
                let log = handle.log.lock().unwrap();
                log.is_running
                    && log.pid.is_some()
                    && log.command.split_whitespace().take(3).collect::<Vec<_>>() == words
            };
            if matches {
                if let Err(e) = self.terminate(&cmd_id).await {
                    warn!(%cmd_id, "failed to terminate peer background process: {e}");
                }
            }
        }
    }

    /// Graceful SIGTERM, then SIGKILL after a short grace period.
    pub async fn terminate(&self, cmd_id: &str) -> Result<TerminateOutcome> {
        let handle = self.log_store.get(cmd_id).ok_or_else(|| CoreErr::LogNotFound {
            cmd_id: cmd_id.to_string(),
            recent: self.log_store.list_recent(5),
        })?;

        let (pid, is_running) = {
            let log = handle.log.lock().unwrap();
            (log.pid, log.is_running)
        };
        if !is_running {
            let log = handle.log.lock().unwrap();
            return Ok(TerminateOutcome {
                cmd_id: cmd_id.to_string(),
                status: "already_stopped",
                exit_code: log.exit_code,
                total_lines: log.output_buffer.len(),
            });
        }
        let Some(pid) = pid else {
            return Err(CoreErr::LogNotFound {
                cmd_id: cmd_id.to_string(),
                recent: self.log_store.list_recent(5),
            });
        };

        signal_process(pid, libc::SIGTERM);
        if !wait_until_exit(&handle, TERMINATE_GRACE).await {
            signal_process(pid, libc::SIGKILL);
            wait_until_exit(&handle, Duration::from_secs(1)).await;
        }

        let mut log = handle.log.lock().unwrap();
        if log.is_running {
            // Reader never observed the exit; force the record closed.
            if let Some(reader) = log.reader.take() {
                reader.abort();
            }
            log.mark_completed(Some(-(libc::SIGKILL)));
        }
        Ok(TerminateOutcome {
            cmd_id: cmd_id.to_string(),
            status: "terminated",
            exit_code: log.exit_code,
            total_lines: log.output_buffer.len(),
        })
    }

    /// Terminate every still-running background process. Called on
    /// shutdown.
    pub async fn cleanup_all(&self) -> CleanupReport {
        let mut processes = Vec::new();
        for cmd_id in self.log_store.all_ids() {
            let Some(handle) = self.log_store.get(&cmd_id) else {
                continue;
            };
            let (is_running, command) = {
                let log = handle.log.lock().unwrap();
                (log.is_running && log.pid.is_some(), log.command.clone())
            };
            if !is_running {
                continue;
            }
            let result = match self.terminate(&cmd_id).await {
                Ok(outcome) => outcome.status,
                Err(_) => "error",
            };
            processes.push(TerminatedProcess {
                cmd_id,
                command: crate::util::truncate_chars(&command, 50),
                result,
            });
        }
        CleanupReport {
            terminated_count: processes.len(),
            processes,
        }
    }

    /// Paginated, bounded readback of a command's log. Each call spends one
    /// unit of the per-log pagination budget.
    pub fn read_log(
        &self,
        cmd_id: &str,
        offset: Option<usize>,
        limit: usize,
        from_end: bool,
    ) -> Result<LogPage> {
        let handle = self.log_store.get(cmd_id).ok_or_else(|| CoreErr::LogNotFound {
            cmd_id: cmd_id.to_string(),
            recent: self.log_store.list_recent(5),
        })?;
        let mut log = handle.log.lock().unwrap();

        log.pagination_count += 1;
        if log.pagination_count > self.max_pagination_calls {
            return Err(CoreErr::PaginationLimit(self.max_pagination_calls));
        }

        let all_lines: Vec<String> = if log.is_running && !log.output_buffer.is_empty() {
            log.output_buffer.clone()
        } else {
            log.stdout_lines
                .iter()
                .chain(log.stderr_lines.iter())
                .cloned()
                .collect()
        };
        let total = all_lines.len();

        if total == 0 {
            let lines = if log.is_running {
                "still starting...".to_string()
            } else {
                String::new()
            };
            return Ok(LogPage {
                cmd_id: cmd_id.to_string(),
                lines,
                showing: None,
                total_lines: 0,
                is_running: log.is_running,
                pagination_remaining: None,
                prev: None,
                next: None,
            });
        }

        let offset = match offset {
            Some(o) => o.min(total - 1),
            None if from_end => total.saturating_sub(limit),
            None => 0,
        };
        let end = (offset + limit).min(total);
        let joined: String = all_lines[offset..end].concat();

        if output::is_binary(&joined) {
            return Err(CoreErr::BinaryOutput);
        }

        Ok(LogPage {
            cmd_id: cmd_id.to_string(),
            lines: joined.trim_end().to_string(),
            showing: Some(format!("lines {}-{} of {}", offset + 1, end, total)),
            total_lines: total,
            is_running: log.is_running,
            pagination_remaining: Some(self.max_pagination_calls - log.pagination_count),
            prev: (offset > 0)
                .then(|| format!("read_log('{cmd_id}', offset={})", offset.saturating_sub(limit))),
            next: (end < total).then(|| format!("read_log('{cmd_id}', offset={end})")),
        })
    }

    /// Most-recent-first summaries of retained logs.
    pub fn list_commands(&self, limit: usize) -> Vec<CommandSummary> {
        let mut summaries = Vec::new();
        for cmd_id in self.log_store.list_recent(limit).into_iter().rev() {
            let Some(handle) = self.log_store.get(&cmd_id) else {
                continue;
            };
            let log = handle.log.lock().unwrap();
            let mut command = crate::util::truncate_chars(&log.command, 50);
            if log.command.chars().count() > 50 {
                command.push_str("...");
            }
            summaries.push(CommandSummary {
                cmd_id,
                command,
                exit_code: log.exit_code,
                is_running: log.is_running,
                started_at: log.started_at.to_rfc3339(),
            });
        }
        summaries
    }
}

/// Drain both pipes into the log, then record the exit status. This task is
/// the single writer of a background log's completion state.
async fn stream_output(
    mut child: Child,
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    log: Arc<Mutex<CommandLog>>,
) {
    let read_stdout = {
        let log = Arc::clone(&log);
        async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut log = log.lock().unwrap();
                    let line = format!("{line}\n");
                    log.output_buffer.push(line.clone());
                    log.stdout_lines.push(line);
                }
            }
        }
    };
    let read_stderr = {
        let log = Arc::clone(&log);
        async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut log = log.lock().unwrap();
                    let line = format!("{line}\n");
                    log.output_buffer.push(line.clone());
                    log.stderr_lines.push(line);
                }
            }
        }
    };
    tokio::join!(read_stdout, read_stderr);

    let exit_code = match child.wait().await {
        Ok(status) => exit_code_of(status),
        Err(_) => Some(-1),
    };
    log.lock().unwrap().mark_completed(exit_code);
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|s| -s))
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> Option<i32> {
    status.code()
}

#[cfg(unix)]
fn signal_process(pid: u32, signal: i32) {
    // Best effort; the process may already be gone.
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

#[cfg(not(unix))]
fn signal_process(_pid: u32, _signal: i32) {}

async fn wait_until_exit(handle: &LogHandle, grace: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !handle.log.lock().unwrap().is_running {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    !handle.log.lock().unwrap().is_running
}

fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// Split preserving line terminators, like the log store expects.
fn split_keepends(s: &str) -> Vec<String> {
    s.split_inclusive('\n').map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_keepends_preserves_newlines() {
        assert_eq!(split_keepends("a\nb\nc"), vec!["a\n", "b\n", "c"]);
        assert_eq!(split_keepends(""), Vec::<String>::new());
    }

    #[test]
    fn short_ids_are_eight_chars() {
        assert_eq!(short_id().len(), 8);
    }
}
