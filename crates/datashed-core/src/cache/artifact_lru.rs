//! Byte-weighted LRU over on-disk artifacts.
//!
//! The `lru` crate tracks recency; this wrapper adds byte accounting and
//! file deletion on eviction. Accessors are independently thread-safe: the
//! file cache only needs its per-key mutexes around the download itself,
//! never around LRU bookkeeping.

use std::path::PathBuf;
use std::sync::Mutex;

use log::warn;
use lru::LruCache;

/// A cached on-disk file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    /// Absolute path of the cached file.
    pub path: PathBuf,
    /// Size in bytes; the artifact's LRU weight.
    pub size: u64,
}

struct Inner {
    entries: LruCache<String, Artifact>,
    total_bytes: u64,
}

/// Thread-safe, byte-bounded LRU of cached artifacts.
///
/// Inserting beyond the ceiling evicts least-recently-used artifacts until
/// the new total fits, deleting their files. An artifact larger than the
/// ceiling itself is still registered (the caller already holds its path)
/// after everything else is evicted.
pub struct ArtifactLru {
    inner: Mutex<Inner>,
    max_bytes: u64,
}

impl ArtifactLru {
    /// Create an LRU with the given byte ceiling.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            max_bytes,
        }
    }

    /// Fetch an artifact, marking it most recently used.
    pub fn get(&self, key: &str) -> Option<Artifact> {
        self.inner
            .lock()
            .expect("artifact lru poisoned")
            .entries
            .get(key)
            .cloned()
    }

    /// Register an artifact, evicting as needed. Replacing an existing key
    /// adjusts the byte total instead of double-counting.
    pub fn insert(&self, key: String, artifact: Artifact) {
        let mut inner = self.inner.lock().expect("artifact lru poisoned");

        if let Some(previous) = inner.entries.pop(&key) {
            inner.total_bytes -= previous.size;
        }

        inner.total_bytes += artifact.size;
        inner.entries.put(key, artifact);

        while inner.total_bytes > self.max_bytes && inner.entries.len() > 1 {
            if let Some((_, evicted)) = inner.entries.pop_lru() {
                inner.total_bytes -= evicted.size;
                if let Err(e) = std::fs::remove_file(&evicted.path) {
                    warn!(
                        "failed to delete evicted cache file {}: {e}",
                        evicted.path.display()
                    );
                }
            }
        }
    }

    /// Remove an artifact without touching the file.
    pub fn forget(&self, key: &str) {
        let mut inner = self.inner.lock().expect("artifact lru poisoned");
        if let Some(artifact) = inner.entries.pop(key) {
            inner.total_bytes -= artifact.size;
        }
    }

    /// Current byte total.
    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().expect("artifact lru poisoned").total_bytes
    }

    /// Number of resident artifacts.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("artifact lru poisoned").entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifact(dir: &TempDir, name: &str, size: u64) -> Artifact {
        let path = dir.path().join(name);
        std::fs::write(&path, vec![0u8; size as usize]).expect("write artifact");
        Artifact { path, size }
    }

    #[test]
    fn eviction_deletes_least_recently_used_files() {
        let dir = TempDir::new().expect("tempdir");
        let lru = ArtifactLru::new(6);

        let a = artifact(&dir, "a", 2);
        let b = artifact(&dir, "b", 2);
        let c = artifact(&dir, "c", 2);
        let d = artifact(&dir, "d", 2);
        lru.insert("a".to_string(), a.clone());
        lru.insert("b".to_string(), b.clone());
        lru.insert("c".to_string(), c.clone());

        // Touch `a` so `b` is the eviction victim.
        assert!(lru.get("a").is_some());
        lru.insert("d".to_string(), d.clone());

        assert_eq!(lru.len(), 3);
        assert_eq!(lru.total_bytes(), 6);
        assert!(lru.get("b").is_none());
        assert!(!b.path.exists());
        assert!(a.path.exists() && c.path.exists() && d.path.exists());
    }

    #[test]
    fn reinserting_a_key_does_not_double_count() {
        let dir = TempDir::new().expect("tempdir");
        let lru = ArtifactLru::new(10);

        lru.insert("k".to_string(), artifact(&dir, "k1", 4));
        lru.insert("k".to_string(), artifact(&dir, "k2", 6));
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.total_bytes(), 6);
    }

    #[test]
    fn oversized_artifact_still_registers_after_evicting_the_rest() {
        let dir = TempDir::new().expect("tempdir");
        let lru = ArtifactLru::new(4);

        let small = artifact(&dir, "small", 2);
        let huge = artifact(&dir, "huge", 8);
        lru.insert("small".to_string(), small.clone());
        lru.insert("huge".to_string(), huge.clone());

        assert_eq!(lru.len(), 1);
        assert!(lru.get("huge").is_some());
        assert!(!small.path.exists());
    }
}
