use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::CommandResult;
use super::FileBackend;
use crate::error::CoreErr;
use crate::error::Result;

/// File backend over a confined local directory.
///
/// Every path is resolved with canonicalize-then-ancestor-check so neither
/// `..` traversal nor symlinks can escape the root.
pub struct LocalBackend {
    root: PathBuf,
    root_str: String,
}

impl LocalBackend {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if !root.exists() {
            std::fs::create_dir_all(root)?;
        }
        let root = root.canonicalize()?;
        let root_str = root.to_string_lossy().into_owned();
        Ok(Self { root, root_str })
    }

    fn join(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        }
    }

    /// Resolve a path that must already exist.
    fn resolve_existing(&self, path: &str) -> Result<PathBuf> {
        let full = self.join(path);
        let resolved = full
            .canonicalize()
            .map_err(|_| CoreErr::PathEscape(full.clone()))?;
        if !resolved.starts_with(&self.root) {
            return Err(CoreErr::PathEscape(resolved));
        }
        Ok(resolved)
    }

    /// Resolve a path for writing. Traversal is refused before anything
    /// touches the filesystem; parents are then created and the parent
    /// directory canonicalized so a symlinked directory cannot smuggle the
    /// write outside the root.
    fn resolve_for_write(&self, path: &str) -> Result<PathBuf> {
        let full = self.join(path);
        if full
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(CoreErr::PathEscape(full));
        }
        if !full.starts_with(&self.root) {
            return Err(CoreErr::PathEscape(full));
        }
        let Some(name) = full.file_name().map(|n| n.to_owned()) else {
            return Err(CoreErr::PathEscape(full));
        };
        let parent = full.parent().unwrap_or(&self.root).to_path_buf();
        std::fs::create_dir_all(&parent)?;
        let parent = parent
            .canonicalize()
            .map_err(|_| CoreErr::PathEscape(parent.clone()))?;
        if !parent.starts_with(&self.root) {
            return Err(CoreErr::PathEscape(parent));
        }
        Ok(parent.join(name))
    }
}

#[async_trait]
impl FileBackend for LocalBackend {
    fn root(&self) -> &str {
        &self.root_str
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let full = self.resolve_existing(path)?;
        Ok(tokio::fs::read_to_string(full).await?)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve_for_write(path)?;
        tokio::fs::write(full, content).await?;
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve_existing(path).is_ok())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let full = self.resolve_existing(path)?;
        if !full.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(full).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    async fn exec(
        &self,
        command: &str,
        timeout: Duration,
        cwd: Option<&str>,
    ) -> Result<CommandResult> {
        let work_dir = match cwd {
            Some(cwd) => self.resolve_existing(cwd)?,
            None => self.root.clone(),
        };
        let child = Command::new("bash")
            .arg("-lc")
            .arg(command)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(out) => {
                let out = out?;
                Ok(CommandResult {
                    stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
                    exit_code: out.status.code().unwrap_or(-1),
                })
            }
            Err(_) => Ok(CommandResult {
                stdout: String::new(),
                stderr: format!("Command timed out after {}s", timeout.as_secs()),
                exit_code: -1,
            }),
        }
    }

    async fn grep(&self, pattern: &str, path: &str, context_lines: u32) -> Result<String> {
        let target = self.resolve_existing(path)?;
        let target = target.to_string_lossy();
        // ripgrep when available, GNU grep as fallback.
        let cmd = format!(
            "rg --color=never -n -C {context_lines} \"{pattern}\" \"{target}\" 2>/dev/null \
             || grep -rn -C {context_lines} \"{pattern}\" \"{target}\""
        );
        let result = self.exec(&cmd, Duration::from_secs(15), None).await?;
        if result.exit_code == 1 {
            return Ok(format!("No matches found for '{pattern}'"));
        }
        Ok(result.stdout)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (_dir, backend) = backend();
        backend
            .write_file("src/App.tsx", "export default 1;")
            .await
            .unwrap();
        let content = backend.read_file("src/App.tsx").await.unwrap();
        assert_eq!(content, "export default 1;");
        assert!(backend.file_exists("src/App.tsx").await.unwrap());
        assert!(!backend.file_exists("missing.tsx").await.unwrap());
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let (_dir, backend) = backend();
        assert!(matches!(
            backend.read_file("../outside.txt").await,
            Err(CoreErr::PathEscape(_))
        ));
        assert!(matches!(
            backend.write_file("../../etc/passwd", "x").await,
            Err(CoreErr::PathEscape(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();
        let (dir, backend) = backend();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("link"))
            .unwrap();
        assert!(matches!(
            backend.read_file("link").await,
            Err(CoreErr::PathEscape(_))
        ));
    }

    #[tokio::test]
    async fn absolute_paths_inside_root_are_allowed() {
        let (dir, backend) = backend();
        backend.write_file("note.txt", "hi").await.unwrap();
        let abs = dir.path().canonicalize().unwrap().join("note.txt");
        let content = backend.read_file(&abs.to_string_lossy()).await.unwrap();
        assert_eq!(content, "hi");
    }

    #[tokio::test]
    async fn exec_reports_exit_code_and_timeout() {
        let (_dir, backend) = backend();
        let ok = backend
            .exec("echo hello", Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(ok.exit_code, 0);
        assert_eq!(ok.stdout.trim(), "hello");

        let timed_out = backend
            .exec("sleep 5", Duration::from_millis(200), None)
            .await
            .unwrap();
        assert_eq!(timed_out.exit_code, -1);
        assert!(timed_out.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn grep_reports_no_matches() {
        let (_dir, backend) = backend();
        backend.write_file("a.txt", "nothing here").await.unwrap();
        let out = backend.grep("definitely-absent", ".", 2).await.unwrap();
        assert!(out.contains("No matches found"));
    }
}
