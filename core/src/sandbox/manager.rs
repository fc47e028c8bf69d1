// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::backend::FileBackend;
use crate::backend::LocalBackend;
use crate::backend::RemoteBackend;
use crate::error::Result;
use crate::exec::AsyncProcessExecutor;
use crate::flags::DEV_SERVER_PORT;
use crate::flags::SANDBOX_LOCAL_ROOT;
use crate::flags::SANDBOX_MODE;
use crate::flags::SANDBOX_TEMPLATE_DIR;
use crate::flags::SANDBOX_TEMPLATE_ID;
use crate::flags::SANDBOX_TIMEOUT_SECS;
use crate::sandbox::HttpSandboxProvider;
use crate::sandbox::SandboxProvider;

const REMOTE_WORKSPACE: &str = "/home/user/workspace";
const DEV_SERVER_COMMAND: &str = "bun run dev";
const DEV_SERVER_WAIT_SECS: u64 = 15;

/// Directories never synced into a fresh sandbox from a template overlay.
const TEMPLATE_EXCLUDES: &[&str] = &["node_modules", ".git", "__pycache__", ".venv", "dist"];

#[derive(Debug, Default)]
struct SandboxState {
    preview_url: Option<String>,
    dev_server_running: bool,
}

/// A user's active sandbox. At most one exists per user; creating another
/// destroys this one first.
pub struct UserSandbox {
    pub user_id: String,
    pub sandbox_id: String,
    pub workspace_path: String,
    pub runtime: SandboxRuntime,
    state: StdMutex<SandboxState>,
}

/// Where the sandbox actually executes: a provider-hosted machine, or a
/// local workspace directory driven through the process executor.
#[derive(Clone)]
pub enum SandboxRuntime {
    Remote(Arc<dyn SandboxProvider>),
    Local(Arc<AsyncProcessExecutor>),
}

impl UserSandbox {
    pub fn preview_url(&self) -> Option<String> {
        self.state.lock().unwrap().preview_url.clone()
    }

    pub fn set_preview_url(&self, url: impl Into<String>) {
        self.state.lock().unwrap().preview_url = Some(url.into());
    }

    pub fn dev_server_running(&self) -> bool {
        self.state.lock().unwrap().dev_server_running
    }

    pub fn set_dev_server_running(&self, running: bool) {
        self.state.lock().unwrap().dev_server_running = running;
    }

    /// Build the file backend matching this sandbox's runtime.
    pub fn file_backend(&self) -> Result<Arc<dyn FileBackend>> {
        match &self.runtime {
            SandboxRuntime::Remote(provider) => Ok(Arc::new(RemoteBackend::new(
                Arc::clone(provider),
                &self.sandbox_id,
                &self.workspace_path,
            ))),
            SandboxRuntime::Local(_) => Ok(Arc::new(LocalBackend::new(&self.workspace_path)?)),
        }
    }
}

enum ManagerRuntime {
    Remote {
        provider: Arc<dyn SandboxProvider>,
        template: String,
        timeout: Duration,
        template_dir: Option<PathBuf>,
    },
    Local {
        root: PathBuf,
    },
}

/// Owns the user-id → sandbox map with strict one-per-user semantics.
pub struct SandboxManager {
    runtime: ManagerRuntime,
    sandboxes: Mutex<HashMap<String, Arc<UserSandbox>>>,
}

impl SandboxManager {
    pub fn remote(
        provider: Arc<dyn SandboxProvider>,
        template: impl Into<String>,
        timeout: Duration,
        template_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            runtime: ManagerRuntime::Remote {
                provider,
                template: template.into(),
                timeout,
                template_dir,
            },
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self {
            runtime: ManagerRuntime::Local { root: root.into() },
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_flags() -> Self {
        if *SANDBOX_MODE == "local" {
            Self::local(*SANDBOX_LOCAL_ROOT)
        } else {
            Self::remote(
                Arc::new(HttpSandboxProvider::from_flags()),
                *SANDBOX_TEMPLATE_ID,
                Duration::from_secs(*SANDBOX_TIMEOUT_SECS),
                SANDBOX_TEMPLATE_DIR.map(PathBuf::from),
            )
        }
    }

    /// Create a fresh sandbox for the user, destroying any existing one
    /// first. Provider errors during create propagate.
    pub async fn create(&self, user_id: &str) -> Result<Arc<UserSandbox>> {
        self.destroy(user_id).await;

        let sandbox = match &self.runtime {
            ManagerRuntime::Remote {
                provider,
                template,
                timeout,
                template_dir,
            } => {
                let sandbox_id = provider.create(template, *timeout).await?;
                info!(user_id, %sandbox_id, "created remote sandbox");
                provider
                    .run(
                        &sandbox_id,
                        &format!("mkdir -p {REMOTE_WORKSPACE}"),
                        None,
                        Duration::from_secs(30),
                    )
                    .await?;
                if let Some(dir) = template_dir {
                    let uploaded =
                        sync_template(provider.as_ref(), &sandbox_id, dir, REMOTE_WORKSPACE).await;
                    info!(user_id, uploaded, "synced template overlay");
                }
                UserSandbox {
                    user_id: user_id.to_string(),
                    sandbox_id,
                    workspace_path: REMOTE_WORKSPACE.to_string(),
                    runtime: SandboxRuntime::Remote(Arc::clone(provider)),
                    state: StdMutex::new(SandboxState::default()),
                }
            }
            ManagerRuntime::Local { root } => {
                let workspace = root.join(user_id);
                if workspace.exists() {
                    let _ = std::fs::remove_dir_all(&workspace);
                }
                std::fs::create_dir_all(&workspace)?;
                let executor = Arc::new(AsyncProcessExecutor::new(&workspace)?);
                let sandbox_id = format!("local-{}", &Uuid::new_v4().to_string()[..8]);
                info!(user_id, %sandbox_id, "created local sandbox");
                UserSandbox {
                    user_id: user_id.to_string(),
                    sandbox_id,
                    workspace_path: workspace.to_string_lossy().into_owned(),
                    runtime: SandboxRuntime::Local(executor),
                    state: StdMutex::new(SandboxState::default()),
                }
            }
        };

        let sandbox = Arc::new(sandbox);
        self.sandboxes
            .lock()
            .await
            .insert(user_id.to_string(), Arc::clone(&sandbox));
        Ok(sandbox)
    }

    pub async fn get_or_create(&self, user_id: &str) -> Result<Arc<UserSandbox>> {
        if let Some(existing) = self.get(user_id).await {
            return Ok(existing);
        }
        self.create(user_id).await
    }

    pub async fn get(&self, user_id: &str) -> Option<Arc<UserSandbox>> {
        self.sandboxes.lock().await.get(user_id).cloned()
    }

    /// Best-effort teardown: the mapping is removed even when the provider
    /// kill fails.
    pub async fn destroy(&self, user_id: &str) -> bool {
        let Some(sandbox) = self.sandboxes.lock().await.remove(user_id) else {
            return false;
        };
        match &sandbox.runtime {
            SandboxRuntime::Remote(provider) => {
                if let Err(e) = provider.kill(&sandbox.sandbox_id).await {
                    warn!(user_id, "failed to kill sandbox: {e}");
                }
            }
            SandboxRuntime::Local(executor) => {
                executor.cleanup_all().await;
                let _ = std::fs::remove_dir_all(&sandbox.workspace_path);
            }
        }
        info!(user_id, sandbox_id = %sandbox.sandbox_id, "destroyed sandbox");
        true
    }

    /// Terminate everything. Called on shutdown; returns how many sandboxes
    /// were destroyed.
    pub async fn destroy_all(&self) -> usize {
        let user_ids: Vec<String> = self.sandboxes.lock().await.keys().cloned().collect();
        let mut count = 0;
        for user_id in user_ids {
            if self.destroy(&user_id).await {
                count += 1;
            }
        }
        count
    }

    /// Public preview URL for the user's sandbox on `port`, or None when no
    /// sandbox exists. The derivation is deterministic, so a reused sandbox
    /// reuses its URL.
    pub async fn get_preview_url(&self, user_id: &str, port: u16) -> Option<String> {
        let sandbox = self.get(user_id).await?;
        if let Some(url) = sandbox.preview_url() {
            return Some(url);
        }
        let url = match &sandbox.runtime {
            SandboxRuntime::Remote(provider) => {
                format!("https://{}", provider.host(&sandbox.sandbox_id, port))
            }
            SandboxRuntime::Local(_) => format!("http://localhost:{port}"),
        };
        sandbox.set_preview_url(&url);
        Some(url)
    }

    pub async fn list_users(&self) -> Vec<String> {
        self.sandboxes.lock().await.keys().cloned().collect()
    }

    /// First-message provisioning: create the sandbox, auto-start the dev
    /// server, and derive the preview URL.
    pub async fn provision_for_session(
        &self,
        user_id: &str,
    ) -> Result<(Arc<UserSandbox>, Option<String>)> {
        let sandbox = self.create(user_id).await?;

        match &sandbox.runtime {
            SandboxRuntime::Remote(provider) => {
                match provider
                    .run_background(&sandbox.sandbox_id, DEV_SERVER_COMMAND, Some(REMOTE_WORKSPACE))
                    .await
                {
                    Ok(()) => {
                        sandbox.set_dev_server_running(true);
                        wait_for_dev_server(provider.as_ref(), &sandbox.sandbox_id).await;
                    }
                    Err(e) => warn!(user_id, "could not auto-start dev server: {e}"),
                }
            }
            SandboxRuntime::Local(executor) => {
                match executor
                    .run_background(DEV_SERVER_COMMAND, None, Some(Duration::from_secs(2)))
                    .await
                {
                    Ok(out) => {
                        sandbox.set_dev_server_running(out.status == "running");
                        if let Some(url) = out.url {
                            sandbox.set_preview_url(url);
                        }
                    }
                    Err(e) => warn!(user_id, "could not auto-start dev server: {e}"),
                }
            }
        }

        let preview_url = self.get_preview_url(user_id, *DEV_SERVER_PORT).await;
        Ok((sandbox, preview_url))
    }
}

async fn wait_for_dev_server(provider: &dyn SandboxProvider, sandbox_id: &str) {
    for _ in 0..DEV_SERVER_WAIT_SECS {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let probe = provider
            .run(
                sandbox_id,
                &format!(
                    "curl -s -o /dev/null -w '%{{http_code}}' http://localhost:{}/ 2>/dev/null || echo '000'",
                    *DEV_SERVER_PORT
                ),
                None,
                Duration::from_secs(3),
            )
            .await;
        if let Ok(result) = probe {
            if result.stdout.trim() == "200" {
                return;
            }
        }
    }
}

/// Upload a local template directory into the sandbox workspace, skipping
/// excluded subtrees and unreadable files. Returns the file count.
async fn sync_template(
    provider: &dyn SandboxProvider,
    sandbox_id: &str,
    local_dir: &Path,
    remote_root: &str,
) -> usize {
    let mut uploaded = 0;
    let mut stack = vec![local_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if TEMPLATE_EXCLUDES.contains(&name.as_str()) {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let Ok(rel) = path.strip_prefix(local_dir) else {
                continue;
            };
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let remote_path = format!("{remote_root}/{}", rel.to_string_lossy());
            if provider
                .write_file(sandbox_id, &remote_path, &content)
                .await
                .is_ok()
            {
                uploaded += 1;
            }
        }
    }
    uploaded
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn local_create_is_one_per_user() {
        let root = tempfile::tempdir().unwrap();
        let manager = SandboxManager::local(root.path());

        let first = manager.create("user-1").await.unwrap();
        let second = manager.create("user-1").await.unwrap();
        assert_ne!(first.sandbox_id, second.sandbox_id);

        let users = manager.list_users().await;
        assert_eq!(users, vec!["user-1".to_string()]);
    }

    #[tokio::test]
    async fn destroy_unknown_user_is_a_noop() {
        let root = tempfile::tempdir().unwrap();
        let manager = SandboxManager::local(root.path());
        assert!(!manager.destroy("nobody").await);
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let manager = SandboxManager::local(root.path());
        let first = manager.get_or_create("user-1").await.unwrap();
        let second = manager.get_or_create("user-1").await.unwrap();
        assert_eq!(first.sandbox_id, second.sandbox_id);
    }

    #[tokio::test]
    async fn destroy_all_counts_sandboxes() {
        let root = tempfile::tempdir().unwrap();
        let manager = SandboxManager::local(root.path());
        manager.create("a").await.unwrap();
        manager.create("b").await.unwrap();
        assert_eq!(manager.destroy_all().await, 2);
        assert!(manager.list_users().await.is_empty());
    }

    #[tokio::test]
    async fn local_preview_url_is_stable() {
        let root = tempfile::tempdir().unwrap();
        let manager = SandboxManager::local(root.path());
        manager.create("user-1").await.unwrap();
        let first = manager.get_preview_url("user-1", 5173).await;
        let second = manager.get_preview_url("user-1", 5173).await;
        assert_eq!(first, second);
        assert_eq!(first.as_deref(), Some("http://localhost:5173"));
        assert!(manager.get_preview_url("nobody", 5173).await.is_none());
    }
}
