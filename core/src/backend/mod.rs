//! Uniform capability surface over "the workspace", independent of whether
//! it lives on the local filesystem or inside a remote sandbox.

pub mod cache;
pub mod fuzzy;
pub mod local;
pub mod remote;
pub mod tools;

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;

pub use cache::FileCache;
pub use local::LocalBackend;
pub use remote::RemoteBackend;
pub use tools::WorkspaceTools;

/// Result of a command executed through a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined stdout + stderr.
    pub fn output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// File and command operations rooted at a workspace directory. Both
/// variants return identical shapes so the tools layer and the HTTP
/// surface never care where the workspace actually lives.
#[async_trait]
pub trait FileBackend: Send + Sync {
    /// Workspace root path.
    fn root(&self) -> &str;

    /// Read file contents. Path is relative to the root.
    async fn read_file(&self, path: &str) -> Result<String>;

    /// Write content to a file, creating parent directories as needed.
    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    async fn file_exists(&self, path: &str) -> Result<bool>;

    /// List directory entries as bare names.
    async fn list_dir(&self, path: &str) -> Result<Vec<String>>;

    /// Run a shell command with a per-call timeout.
    async fn exec(
        &self,
        command: &str,
        timeout: Duration,
        cwd: Option<&str>,
    ) -> Result<CommandResult>;

    /// Search for a pattern with surrounding context lines.
    async fn grep(&self, pattern: &str, path: &str, context_lines: u32) -> Result<String>;
}
