use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::CommandResult;
use super::FileBackend;
use crate::error::Result;
use crate::sandbox::SandboxProvider;

/// File backend that defers every operation to the sandbox provider,
/// rooted at the sandbox's workspace path. Confinement is the provider's
/// responsibility.
pub struct RemoteBackend {
    provider: Arc<dyn SandboxProvider>,
    sandbox_id: String,
    root: String,
}

impl RemoteBackend {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        sandbox_id: impl Into<String>,
        root: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            sandbox_id: sandbox_id.into(),
            root: root.into(),
        }
    }

    fn resolve(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{path}", self.root).replace("//", "/")
        }
    }
}

#[async_trait]
impl FileBackend for RemoteBackend {
    fn root(&self) -> &str {
        &self.root
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let full = self.resolve(path);
        Ok(self.provider.read_file(&self.sandbox_id, &full).await?)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(path);
        Ok(self
            .provider
            .write_file(&self.sandbox_id, &full, content)
            .await?)
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path);
        let result = self
            .provider
            .run(
                &self.sandbox_id,
                &format!("test -e \"{full}\" && echo yes || echo no"),
                None,
                Duration::from_secs(10),
            )
            .await?;
        Ok(result.stdout.trim() == "yes")
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let full = self.resolve(path);
        let result = self
            .provider
            .run(
                &self.sandbox_id,
                &format!("ls -1 \"{full}\" 2>/dev/null || echo \"\""),
                None,
                Duration::from_secs(10),
            )
            .await?;
        let trimmed = result.stdout.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        Ok(trimmed.lines().map(str::to_string).collect())
    }

    async fn exec(
        &self,
        command: &str,
        timeout: Duration,
        cwd: Option<&str>,
    ) -> Result<CommandResult> {
        let work_dir = match cwd {
            Some(cwd) => self.resolve(cwd),
            None => self.root.clone(),
        };
        let full_cmd = format!("cd \"{work_dir}\" && {command}");
        // Provider failures become a failed command rather than aborting the
        // turn; the agent sees them as results it can react to.
        match self
            .provider
            .run(&self.sandbox_id, &full_cmd, None, timeout)
            .await
        {
            Ok(result) => Ok(result),
            Err(e) => Ok(CommandResult {
                stdout: String::new(),
                stderr: e.to_string(),
                exit_code: -1,
            }),
        }
    }

    async fn grep(&self, pattern: &str, path: &str, context_lines: u32) -> Result<String> {
        let full = self.resolve(path);
        let cmd = format!(
            "grep -rn -C {context_lines} \"{pattern}\" \"{full}\" 2>/dev/null \
             || echo \"No matches found\""
        );
        let result = self.exec(&cmd, Duration::from_secs(15), Some("/")).await?;
        Ok(result.stdout)
    }
}
