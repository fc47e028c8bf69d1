//! Pre-launch classification of shell commands.
//!
//! Three tiers: hard-blocked commands are rejected without ever spawning a
//! subprocess; "dangerous but sometimes intended" commands require the
//! caller to pass an explicit confirmation; "noisy" commands run normally
//! but have their successful output collapsed to a one-line summary.

use std::sync::LazyLock;

use regex_lite::Regex;

#[rustfmt::skip]
const BLOCKED_PATTERNS: &[&str] = &[
    r"(?i)sudo\s+",
    r"(?i)rm\s+-[rf]*\s+[/~]",              // rm -rf / or ~
    r"(?i)rm\s+-[rf]*\s+\.\.",              // rm -rf ..
    r"(?i)>\s*/dev/",                       // write to device
    r"(?i)chmod\s+777",                     // world writable
    r"(?i)curl.*\|\s*(ba)?sh",              // pipe to shell
    r"(?i)wget.*\|\s*(ba)?sh",              // pipe to shell
    r"(?i)mkfs\.",                          // format filesystem
    r"(?i)dd\s+if=",                        // raw disk write
    r"(?i):\(\)\s*\{\s*:\|:\s*&\s*\}",      // fork bomb
    r"(?i)>\s*/etc/",                       // write to /etc
    r"(?i)git\s+push.*--force",             // force push
];

#[rustfmt::skip]
const CONFIRM_PATTERNS: &[&str] = &[
    r"(?i)git\s+push",
    r"(?i)git\s+reset\s+--hard",
    r"(?i)git\s+clean\s+-[fd]",
    r"(?i)git\s+checkout\s+\.",
    r"(?i)rm\s+-[rf]",
    r"(?i)pip\s+uninstall",
    r"(?i)npm\s+publish",
    r"(?i)docker\s+(rm|rmi|system\s+prune)",
];

#[rustfmt::skip]
const NOISY_PATTERNS: &[&str] = &[
    r"(?i)^(pip|pip3|python -m pip)\s+install",
    r"(?i)^(npm|bun)\s+(install|ci|update)",
    r"(?i)^yarn(\s+install)?",
    r"(?i)^pnpm\s+install",
    r"(?i)^git\s+(clone|pull|fetch)",
    r"(?i)^apt(-get)?\s+(install|update)",
    r"(?i)^cargo\s+build",
    r"(?i)^make\b",
];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
}

static BLOCKED: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(BLOCKED_PATTERNS));
static CONFIRM: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(CONFIRM_PATTERNS));
static NOISY: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(NOISY_PATTERNS));

/// Matches the hard blocklist: privilege escalation, root/home deletion,
/// device writes, world-writable chmod, network-pipe-to-shell, filesystem
/// format, raw disk writes, fork bombs, `/etc` writes, forced pushes.
pub fn is_blocked(command: &str) -> bool {
    BLOCKED.iter().any(|re| re.is_match(command))
}

/// Matches a pattern that is destructive but sometimes intended; the caller
/// must opt in with `confirmed=true`.
pub fn needs_confirmation(command: &str) -> bool {
    CONFIRM.iter().any(|re| re.is_match(command))
}

/// Package installs, clones and builds: voluminous and uninteresting on
/// success.
pub fn is_noisy(command: &str) -> bool {
    NOISY.iter().any(|re| re.is_match(command))
}
