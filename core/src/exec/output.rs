//! Output shaping for completed commands: binary detection, tail-biased
//! truncation, and dev-server URL auto-detection.

use std::sync::LazyLock;

use regex_lite::Regex;
use serde::Serialize;

use super::command_log::CommandLog;
use super::safety;

/// Ordered URL patterns; the first match wins. A bare captured port is
/// expanded to `http://localhost:<port>`.
#[rustfmt::skip]
const URL_PATTERNS: &[&str] = &[
    r"(?i)Local:\s*(https?://\S+)",
    r"(?i)http://localhost:(\d+)",
    r"(?i)http://127\.0\.0\.1:(\d+)",
    r"(?i)Server running (?:at|on)\s*(https?://\S+)",
    r"(?i)listening on\s*(https?://\S+)",
];

static URL_REGEXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    URL_PATTERNS
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
});

/// Scan command output for the first dev-server URL.
pub fn detect_url(output: &str) -> Option<String> {
    for re in URL_REGEXES.iter() {
        if let Some(caps) = re.captures(output) {
            let captured = caps.get(1)?.as_str();
            if !captured.is_empty() && captured.bytes().all(|b| b.is_ascii_digit()) {
                return Some(format!("http://localhost:{captured}"));
            }
            return Some(captured.to_string());
        }
    }
    None
}

/// Output is treated as binary when at least 10% of the first 1000 chars
/// are non-printable control characters (`\n`, `\r` and `\t` excluded).
/// Binary output is never returned as text.
pub fn is_binary(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let sample: Vec<char> = text.chars().take(1000).collect();
    let non_printable = sample
        .iter()
        .filter(|c| (**c as u32) < 32 && !matches!(**c, '\n' | '\r' | '\t'))
        .count();
    non_printable * 10 > sample.len()
}

/// Result of a blocking `run_command` call (or of formatting a finished
/// log).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutput {
    pub cmd_id: String,
    pub exit_code: Option<i32>,
    pub status: &'static str,
    pub output: String,
    pub total_lines: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Summarize a completed log for the agent. Errors cluster at the tail, so
/// truncation is tail-biased: successes keep the last 10 lines, failures
/// the last `default_tail_lines`.
pub fn format_output(log: &CommandLog, verbose: bool, default_tail_lines: usize) -> CommandOutput {
    let all_lines: Vec<&String> = log.stdout_lines.iter().chain(log.stderr_lines.iter()).collect();
    let total_lines = all_lines.len();

    let sample: String = all_lines.iter().take(10).map(|s| s.as_str()).collect();
    if is_binary(&sample) {
        return CommandOutput {
            cmd_id: log.cmd_id.clone(),
            exit_code: log.exit_code,
            status: "completed",
            output: "[Binary output detected. Cannot display.]".to_string(),
            total_lines,
            hint: None,
        };
    }

    let noisy = safety::is_noisy(&log.command);
    let success = log.exit_code == Some(0);

    let (output, shown, truncated) = if verbose {
        let joined: String = all_lines.iter().map(|s| s.as_str()).collect();
        (joined, total_lines, false)
    } else if success && noisy {
        (
            format!("Completed successfully. [{total_lines} lines suppressed]"),
            0,
            true,
        )
    } else if success {
        let shown = total_lines.min(10);
        let joined: String = all_lines[total_lines - shown..]
            .iter()
            .map(|s| s.as_str())
            .collect();
        (joined, shown, total_lines > 10)
    } else {
        let shown = total_lines.min(default_tail_lines);
        let joined: String = all_lines[total_lines - shown..]
            .iter()
            .map(|s| s.as_str())
            .collect();
        (joined, shown, total_lines > default_tail_lines)
    };

    let hint = if truncated && !(success && noisy) {
        Some(format!(
            "Use read_log('{}') to see more. Showing last {} of {} lines.",
            log.cmd_id, shown, total_lines
        ))
    } else {
        None
    };

    CommandOutput {
        cmd_id: log.cmd_id.clone(),
        exit_code: log.exit_code,
        status: "completed",
        output: output.trim_end().to_string(),
        total_lines,
        hint,
    }
}
