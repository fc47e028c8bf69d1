//! Per-session workspace tools: the cached file operations and searches the
//! agent calls, with results rendered as strings the model can consume.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use super::FileBackend;
use super::cache::FileCache;
use super::cache::normalize_path;
use super::fuzzy;

const FUZZY_LIMIT: usize = 10;
const GREP_MAX_CHARS: usize = 10_000;

/// Directories and files skipped when enumerating the workspace.
static DEFAULT_IGNORE: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        ".git",
        "node_modules",
        "__pycache__",
        ".venv",
        "dist",
        "build",
        ".idea",
        ".vscode",
        ".DS_Store",
        "venv",
        "package-lock.json",
        "yarn.lock",
        "bun.lockb",
        "bun.lock",
    ])
});

/// File-system tools over a [`FileBackend`], with a write-through content
/// cache. One instance per session; the cache dies with it.
pub struct WorkspaceTools {
    backend: Arc<dyn FileBackend>,
    cache: Arc<FileCache>,
}

impl WorkspaceTools {
    pub fn new(backend: Arc<dyn FileBackend>, cache: Arc<FileCache>) -> Self {
        Self { backend, cache }
    }

    pub fn root(&self) -> &str {
        self.backend.root()
    }

    pub fn backend(&self) -> &Arc<dyn FileBackend> {
        &self.backend
    }

    pub fn cache(&self) -> &Arc<FileCache> {
        &self.cache
    }

    /// Read a file, serving from the cache when possible.
    pub async fn read_file(&self, path: &str) -> String {
        let key = normalize_path(path);
        if let Some(cached) = self.cache.get(&key) {
            return cached;
        }
        match self.backend.read_file(path).await {
            Ok(content) => {
                self.cache.set(&key, &content);
                content
            }
            Err(e) => format!("Error reading file: {e}"),
        }
    }

    /// Write a file; the cache is updated on success and invalidated on
    /// failure so it never serves content the backend rejected.
    pub async fn write_file(&self, path: &str, content: &str) -> String {
        let key = normalize_path(path);
        match self.backend.write_file(path, content).await {
            Ok(()) => {
                self.cache.set(&key, content);
                format!("✓ Written to {path}")
            }
            Err(e) => {
                self.cache.invalidate(&key);
                format!("Error writing file: {e}")
            }
        }
    }

    pub async fn list_dir(&self, path: &str) -> String {
        match self.backend.list_dir(path).await {
            Ok(items) if items.is_empty() => format!("Empty or not a directory: {path}"),
            Ok(mut items) => {
                items.sort();
                items.join("\n")
            }
            Err(e) => format!("Error listing directory: {e}"),
        }
    }

    pub async fn file_exists(&self, path: &str) -> bool {
        self.backend.file_exists(path).await.unwrap_or(false)
    }

    /// Search for a pattern; the result is annotated with the query and
    /// path and capped so a pathological match set cannot flood the model.
    pub async fn grep(&self, pattern: &str, path: &str, context_lines: u32) -> String {
        match self.backend.grep(pattern, path, context_lines).await {
            Ok(result) => {
                let mut body = result;
                if body.chars().count() > GREP_MAX_CHARS {
                    body = crate::util::truncate_chars(&body, GREP_MAX_CHARS);
                    body.push_str("\n[... truncated]");
                }
                format!("Query: {pattern}\nPath: {path}\n---\n{body}")
            }
            Err(e) => format!("Search error: {e}"),
        }
    }

    /// Fuzzy search for files by name across the whole workspace.
    pub async fn fuzzy_find(&self, query: &str) -> String {
        let all_files = self.enumerate_files().await;
        if all_files.is_empty() {
            return "No files found in workspace".to_string();
        }
        let ranked = fuzzy::rank(query, all_files, FUZZY_LIMIT);
        if ranked.is_empty() {
            return format!("No files matching '{query}'");
        }
        let mut out = vec![format!("Matches for '{query}':")];
        for (path, score) in ranked {
            out.push(format!("  {path} (score: {score})"));
        }
        out.join("\n")
    }

    /// Run a shell command in the workspace, combined output with a failure
    /// banner when the exit code is non-zero.
    pub async fn run(&self, command: &str, timeout: Duration) -> String {
        match self.backend.exec(command, timeout, None).await {
            Ok(result) => {
                let output = result.output().trim().to_string();
                if result.success() {
                    output
                } else {
                    format!("[Exit code: {}]\n{output}", result.exit_code)
                }
            }
            Err(e) => format!("Error: {e}"),
        }
    }

    /// Recursively enumerate workspace files, skipping the ignore set.
    /// Works through the backend so local and remote behave identically.
    async fn enumerate_files(&self) -> Vec<String> {
        let mut result = Vec::new();
        let mut stack = vec![".".to_string()];
        while let Some(current) = stack.pop() {
            let Ok(items) = self.backend.list_dir(&current).await else {
                continue;
            };
            for item in items {
                if DEFAULT_IGNORE.contains(item.as_str()) {
                    continue;
                }
                let full = if current == "." {
                    item.clone()
                } else {
                    format!("{current}/{item}")
                };
                match self.backend.list_dir(&full).await {
                    Ok(children) if !children.is_empty() => stack.push(full),
                    _ => result.push(full),
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::backend::LocalBackend;
    use pretty_assertions::assert_eq;

    fn tools() -> (tempfile::TempDir, WorkspaceTools) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path()).unwrap());
        let tools = WorkspaceTools::new(backend, Arc::new(FileCache::default()));
        (dir, tools)
    }

    #[tokio::test]
    async fn read_after_write_returns_written_content() {
        let (_dir, tools) = tools();
        let ack = tools.write_file("src/App.tsx", "v1").await;
        assert_eq!(ack, "✓ Written to src/App.tsx");
        assert_eq!(tools.read_file("src/App.tsx").await, "v1");
        // Same file through a normalized alias hits the cache.
        assert_eq!(tools.read_file("./src/App.tsx").await, "v1");

        tools.write_file("src/App.tsx", "v2").await;
        assert_eq!(tools.read_file("src/App.tsx").await, "v2");
    }

    #[tokio::test]
    async fn failed_write_invalidates_cache_entry() {
        let (_dir, tools) = tools();
        tools.write_file("note.txt", "cached").await;
        let err = tools.write_file("../escape.txt", "x").await;
        assert!(err.starts_with("Error writing file:"));
        // The good entry is untouched; the bad path never entered the cache.
        assert_eq!(tools.read_file("note.txt").await, "cached");
        assert!(tools.cache().get("../escape.txt").is_none());
    }

    #[tokio::test]
    async fn list_dir_sorts_and_reports_empty() {
        let (_dir, tools) = tools();
        tools.write_file("b.txt", "b").await;
        tools.write_file("a.txt", "a").await;
        assert_eq!(tools.list_dir(".").await, "a.txt\nb.txt");
        assert!(tools.list_dir("missing").await.starts_with("Error"));
    }

    #[tokio::test]
    async fn grep_is_annotated_with_query_and_path() {
        let (_dir, tools) = tools();
        tools.write_file("src/main.ts", "const needle = 1;\n").await;
        let out = tools.grep("needle", ".", 1).await;
        assert!(out.starts_with("Query: needle\nPath: .\n---\n"));
        assert!(out.contains("needle = 1"));
    }

    #[tokio::test]
    async fn fuzzy_find_skips_ignored_directories() {
        let (_dir, tools) = tools();
        tools.write_file("src/App.tsx", "x").await;
        tools.write_file("node_modules/react/App.tsx", "x").await;
        let out = tools.fuzzy_find("App").await;
        assert!(out.contains("src/App.tsx"));
        assert!(!out.contains("node_modules"));
    }

    #[tokio::test]
    async fn run_prefixes_failures_with_exit_code() {
        let (_dir, tools) = tools();
        let ok = tools.run("echo hi", Duration::from_secs(5)).await;
        assert_eq!(ok, "hi");
        let failed = tools.run("exit 3", Duration::from_secs(5)).await;
        assert!(failed.starts_with("[Exit code: 3]"));
    }
}
