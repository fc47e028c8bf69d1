// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use tokio::task::JoinHandle;

/// Everything retained about one launched command: identity, captured
/// output, completion state and handles to the live process (background
/// mode only).
#[derive(Debug)]
pub struct CommandLog {
    pub cmd_id: String,
    pub command: String,
    pub cwd: PathBuf,
    pub exit_code: Option<i32>,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    /// Interleaved stdout+stderr in arrival order (background mode).
    pub output_buffer: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_running: bool,
    pub pagination_count: u32,
    /// OS pid of the child while it runs (background mode).
    pub pid: Option<u32>,
    pub(crate) started: Instant,
    pub(crate) reader: Option<JoinHandle<()>>,
}

impl CommandLog {
    pub fn new(cmd_id: impl Into<String>, command: impl Into<String>, cwd: impl AsRef<Path>) -> Self {
        Self {
            cmd_id: cmd_id.into(),
            command: command.into(),
            cwd: cwd.as_ref().to_path_buf(),
            exit_code: None,
            stdout_lines: Vec::new(),
            stderr_lines: Vec::new(),
            output_buffer: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            is_running: true,
            pagination_count: 0,
            pid: None,
            started: Instant::now(),
            reader: None,
        }
    }

    pub fn mark_completed(&mut self, exit_code: Option<i32>) {
        self.exit_code = exit_code;
        self.is_running = false;
        self.completed_at = Some(Utc::now());
    }
}

/// A shared, individually locked log entry.
#[derive(Clone)]
pub struct LogHandle {
    pub log: Arc<Mutex<CommandLog>>,
}

impl LogHandle {
    pub fn new(log: CommandLog) -> Self {
        Self {
            log: Arc::new(Mutex::new(log)),
        }
    }
}

/// Ordered map of command logs with LRU touch-on-access, a hard capacity
/// bound and a TTL measured from launch. Expired entries are evicted on
/// every access; the oldest entry is dropped when inserting at capacity.
pub struct CommandLogStore {
    inner: Mutex<StoreInner>,
    max_entries: usize,
    ttl: Duration,
}

struct StoreInner {
    // Insertion/access order, oldest first. Parallel to `map`.
    order: Vec<String>,
    map: HashMap<String, LogHandle>,
}

impl CommandLogStore {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                order: Vec::new(),
                map: HashMap::new(),
            }),
            max_entries,
            ttl,
        }
    }

    pub fn store(&self, handle: LogHandle) {
        let cmd_id = handle.log.lock().unwrap().cmd_id.clone();
        let mut inner = self.inner.lock().unwrap();
        Self::evict_expired(&mut inner, self.ttl);
        if inner.map.len() >= self.max_entries
            && !inner.order.is_empty()
            && !inner.map.contains_key(&cmd_id)
        {
            let oldest = inner.order.remove(0);
            inner.map.remove(&oldest);
        }
        inner.order.retain(|id| id != &cmd_id);
        inner.order.push(cmd_id.clone());
        inner.map.insert(cmd_id, handle);
    }

    pub fn get(&self, cmd_id: &str) -> Option<LogHandle> {
        let mut inner = self.inner.lock().unwrap();
        Self::evict_expired(&mut inner, self.ttl);
        let handle = inner.map.get(cmd_id).cloned()?;
        inner.order.retain(|id| id != cmd_id);
        inner.order.push(cmd_id.to_string());
        Some(handle)
    }

    /// Most recently used last, like the underlying order vector.
    pub fn list_recent(&self, limit: usize) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        Self::evict_expired(&mut inner, self.ttl);
        let start = inner.order.len().saturating_sub(limit);
        inner.order[start..].to_vec()
    }

    pub fn all_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.order.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_expired(inner: &mut StoreInner, ttl: Duration) {
        let expired: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, handle)| handle.log.lock().unwrap().started.elapsed() > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            inner.map.remove(&id);
            inner.order.retain(|o| o != &id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> LogHandle {
        LogHandle::new(CommandLog::new(id, format!("echo {id}"), "/tmp"))
    }

    #[test]
    fn capacity_evicts_oldest() {
        let store = CommandLogStore::new(3, Duration::from_secs(60));
        for id in ["a", "b", "c", "d"] {
            store.store(handle(id));
        }
        assert_eq!(store.len(), 3);
        assert!(store.get("a").is_none());
        assert!(store.get("d").is_some());
    }

    #[test]
    fn access_refreshes_lru_position() {
        let store = CommandLogStore::new(3, Duration::from_secs(60));
        for id in ["a", "b", "c"] {
            store.store(handle(id));
        }
        // Touch "a" so "b" becomes the eviction candidate.
        assert!(store.get("a").is_some());
        store.store(handle("d"));
        assert!(store.get("a").is_some());
        assert!(store.get("b").is_none());
    }

    #[test]
    fn ttl_expiry_hides_entries() {
        let store = CommandLogStore::new(10, Duration::from_millis(0));
        store.store(handle("a"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get("a").is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn list_recent_returns_newest_window() {
        let store = CommandLogStore::new(10, Duration::from_secs(60));
        for id in ["a", "b", "c", "d"] {
            store.store(handle(id));
        }
        assert_eq!(store.list_recent(2), vec!["c".to_string(), "d".to_string()]);
    }
}
