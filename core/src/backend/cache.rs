// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Mutex;

pub const DEFAULT_MAX_ENTRIES: usize = 50;

/// Write-through file-content cache with strict LRU eviction.
///
/// Reads populate the cache; writes go to the backend first and update the
/// cache afterwards, so a read immediately following a successful write of
/// the same path always returns the just-written content. Failed writes
/// invalidate the entry instead.
pub struct FileCache {
    inner: Mutex<Inner>,
    max_entries: usize,
}

struct Inner {
    map: HashMap<String, String>,
    // LRU order, oldest first.
    order: Vec<String>,
}

impl FileCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: Vec::new(),
            }),
            max_entries,
        }
    }

    pub fn get(&self, path: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        let content = inner.map.get(path).cloned()?;
        inner.order.retain(|p| p != path);
        inner.order.push(path.to_string());
        Some(content)
    }

    pub fn set(&self, path: &str, content: &str) {
        let mut inner = self.inner.lock().unwrap();
        while inner.map.len() >= self.max_entries
            && !inner.map.contains_key(path)
            && !inner.order.is_empty()
        {
            let oldest = inner.order.remove(0);
            inner.map.remove(&oldest);
        }
        inner.map.insert(path.to_string(), content.to_string());
        inner.order.retain(|p| p != path);
        inner.order.push(path.to_string());
    }

    pub fn invalidate(&self, path: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.remove(path);
        inner.order.retain(|p| p != path);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FileCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

/// Normalize a workspace-relative path for use as a cache key: strip a
/// leading `./` and any trailing `/`.
pub fn normalize_path(path: &str) -> String {
    let mut p = path;
    while let Some(stripped) = p.strip_prefix("./") {
        p = stripped;
    }
    p.trim_end_matches('/').to_string()
}
