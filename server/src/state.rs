// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use atelier_core::agent::ModelClient;
use atelier_core::backend::FileCache;
use atelier_core::sandbox::SandboxManager;

use crate::store::Store;

/// The in-memory handoff from `send_message` to the SSE subscription.
#[derive(Debug, Clone)]
pub struct PendingTurn {
    pub user_id: String,
    pub content: String,
    pub needs_sandbox: bool,
}

/// Process-wide shared state. Everything here is either the store (the
/// single source of truth for sessions and messages) or in-memory maps
/// that die with the process: the pending-turn slots and the per-session
/// file caches.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub sandboxes: Arc<SandboxManager>,
    pub model: ModelClient,
    pending: Arc<Mutex<HashMap<String, PendingTurn>>>,
    caches: Arc<Mutex<HashMap<String, Arc<FileCache>>>>,
}

impl AppState {
    pub fn new(store: Store, sandboxes: Arc<SandboxManager>, model: ModelClient) -> Self {
        Self {
            store,
            sandboxes,
            model,
            pending: Arc::new(Mutex::new(HashMap::new())),
            caches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record the pending slot for a session. At most one exists; the
    /// orchestrator rejects concurrent turns before this point.
    pub fn set_pending(&self, session_id: &str, turn: PendingTurn) {
        self.pending
            .lock()
            .unwrap()
            .insert(session_id.to_string(), turn);
    }

    /// Consume the pending slot, if any.
    pub fn take_pending(&self, session_id: &str) -> Option<PendingTurn> {
        self.pending.lock().unwrap().remove(session_id)
    }

    pub fn has_pending(&self, session_id: &str) -> bool {
        self.pending.lock().unwrap().contains_key(session_id)
    }

    /// The session's file cache, created on first use and discarded with
    /// the session.
    pub fn session_cache(&self, session_id: &str) -> Arc<FileCache> {
        let mut caches = self.caches.lock().unwrap();
        Arc::clone(
            caches
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(FileCache::default())),
        )
    }

    pub fn drop_session_cache(&self, session_id: &str) {
        self.caches.lock().unwrap().remove(session_id);
    }
}
