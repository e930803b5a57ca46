//! Bounded on-disk file cache with single-flight downloads.
//!
//! Every object read in the warehouse funnels through [`FileCache::get`]:
//! metadata descriptors and gather-side data objects alike. The cache
//! guarantees:
//!
//! 1. **Single-flight**: for any `(bucket, logical key)` at most one download
//!    is in flight; concurrent callers block on a per-key mutex and then
//!    observe the completed artifact.
//! 2. **Parallelism across keys**: different keys download concurrently,
//!    bounded only by the caller's worker budget.
//! 3. **Bounded residency**: cumulative artifact bytes never exceed the
//!    ceiling once a `get` returns; least-recently-used artifacts are evicted
//!    (and their files deleted) to make room.
//! 4. **Transparent decompression**: with `decompress`, a known compression
//!    suffix is stripped during ingest — the cached file and its logical key
//!    both lose the suffix, so `k.csv.gz` (decompressed) and `k.csv` share an
//!    artifact.
//! 5. **Persistence**: a configured cache directory is reconstructed at
//!    startup — files beyond the TTL are deleted, the rest registered in
//!    ascending mtime order so recency survives restarts. Without a
//!    directory the cache lives in a temp dir torn down with the process.
//!
//! The per-key mutex table is itself a small LRU (100 entries). Evicting a
//! mutex under extreme key churn only costs coordination — a re-entering
//! caller may download redundantly, but artifact registration stays
//! consistent. Sharing one persistent directory across processes is
//! best-effort only; nothing coordinates evictions between processes.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};

use log::{debug, warn};
use lru::LruCache;
use tokio::io::AsyncWriteExt;

use crate::codec;
use crate::config::{self, Config};
use crate::error::{ConfigSnafu, MissingDataSnafu, Result, TransportSnafu};
use crate::object_store::{ObjectStore, ObjectStoreError};

pub mod artifact_lru;

use artifact_lru::{Artifact, ArtifactLru};

/// Capacity of the per-key mutex LRU. Sized well above any realistic worker
/// fan-out; see the module docs for what eviction costs.
const KEY_MUTEX_CAPACITY: usize = 100;

/// Retries after the first failed fetch attempt.
const FETCH_RETRIES: u32 = 2;

/// Base delay of the exponential backoff between retries.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// A bounded LRU of local files mirroring remote objects.
pub struct FileCache {
    root: PathBuf,
    artifacts: ArtifactLru,
    key_mutexes: Mutex<LruCache<String, Arc<tokio::sync::Mutex<()>>>>,
    // Keeps the ephemeral directory alive for the cache's lifetime.
    _ephemeral: Option<tempfile::TempDir>,
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("root", &self.root)
            .field("entries", &self.artifacts.len())
            .field("total_bytes", &self.artifacts.total_bytes())
            .finish()
    }
}

impl FileCache {
    /// Create an ephemeral cache in a fresh temp directory.
    pub fn ephemeral(max_bytes: u64) -> Result<Self> {
        let dir = tempfile::tempdir().map_err(|e| {
            ConfigSnafu {
                message: format!("cannot create ephemeral cache directory: {e}"),
            }
            .build()
        })?;
        Ok(Self {
            root: dir.path().to_path_buf(),
            artifacts: ArtifactLru::new(max_bytes),
            key_mutexes: Mutex::new(LruCache::new(
                NonZeroUsize::new(KEY_MUTEX_CAPACITY).expect("nonzero capacity"),
            )),
            _ephemeral: Some(dir),
        })
    }

    /// Open a persistent cache over `dir`, reconstructing the LRU from the
    /// files already present: anything older than `ttl` is deleted, the rest
    /// registered in ascending mtime order.
    pub fn persistent(dir: impl Into<PathBuf>, max_bytes: u64, ttl: Duration) -> Result<Self> {
        let root: PathBuf = dir.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            ConfigSnafu {
                message: format!("cannot create cache directory {}: {e}", root.display()),
            }
            .build()
        })?;

        let cache = Self {
            root: root.clone(),
            artifacts: ArtifactLru::new(max_bytes),
            key_mutexes: Mutex::new(LruCache::new(
                NonZeroUsize::new(KEY_MUTEX_CAPACITY).expect("nonzero capacity"),
            )),
            _ephemeral: None,
        };
        cache.reconstruct(ttl)?;
        Ok(cache)
    }

    /// Build the cache the configuration describes.
    pub fn from_config(config: &Config) -> Result<Self> {
        match &config.cache_dir {
            Some(dir) => Self::persistent(
                dir,
                config.cache_max_bytes(),
                Duration::from_secs(config.cache_expire_after_days * 24 * 60 * 60),
            ),
            None => Self::ephemeral(config.cache_max_bytes()),
        }
    }

    fn reconstruct(&self, ttl: Duration) -> Result<()> {
        fn walk(dir: &Path, out: &mut Vec<(PathBuf, SystemTime, u64)>) -> std::io::Result<()> {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let meta = entry.metadata()?;
                if meta.is_dir() {
                    walk(&entry.path(), out)?;
                } else if meta.is_file() {
                    out.push((entry.path(), meta.modified()?, meta.len()));
                }
            }
            Ok(())
        }

        let mut files = Vec::new();
        walk(&self.root, &mut files).map_err(|e| {
            ConfigSnafu {
                message: format!("cannot scan cache directory {}: {e}", self.root.display()),
            }
            .build()
        })?;

        let now = SystemTime::now();
        files.retain(|(path, mtime, _)| {
            let expired = now
                .duration_since(*mtime)
                .map(|age| age > ttl)
                .unwrap_or(false);
            if expired {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("failed to prune expired cache file {}: {e}", path.display());
                }
            }
            !expired
        });

        files.sort_by_key(|(_, mtime, _)| *mtime);
        for (path, _, size) in files {
            if let Some(key) = self.logical_key_of_path(&path) {
                self.artifacts.insert(key, Artifact { path, size });
            }
        }
        Ok(())
    }

    fn logical_key_of_path(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        Some(
            rel.to_str()?
                .replace(std::path::MAIN_SEPARATOR, "/"),
        )
    }

    fn key_mutex(&self, logical_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut mutexes = self.key_mutexes.lock().expect("key mutex table poisoned");
        if let Some(m) = mutexes.get(logical_key) {
            return m.clone();
        }
        let m = Arc::new(tokio::sync::Mutex::new(()));
        mutexes.put(logical_key.to_string(), m.clone());
        m
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of resident artifacts.
    pub fn entry_count(&self) -> usize {
        self.artifacts.len()
    }

    /// Cumulative artifact bytes.
    pub fn total_bytes(&self) -> u64 {
        self.artifacts.total_bytes()
    }

    /// Fetch `bucket/key` through the cache, returning the local path.
    ///
    /// With `decompress`, a known compression suffix is stripped during
    /// ingest and the artifact is cached under the stripped key. Not-found
    /// surfaces as a missing-data error for the caller to interpret;
    /// transient transport failures are retried twice with exponential
    /// backoff before giving up.
    pub async fn get(
        &self,
        adapter: &Arc<dyn ObjectStore>,
        bucket: &str,
        key: &str,
        decompress: bool,
    ) -> Result<PathBuf> {
        let (_, compression) = codec::detect_from_filename(key)?;
        let strip = match compression {
            Some(c) if decompress => Some(c),
            _ => None,
        };
        let local_key = match strip {
            Some(c) => key
                .strip_suffix(&format!(".{}", c.extension()))
                .unwrap_or(key)
                .to_string(),
            None => key.to_string(),
        };
        let logical_key = format!("{bucket}/{local_key}");

        let mutex = self.key_mutex(&logical_key);
        let _guard = mutex.lock().await;

        if let Some(artifact) = self.artifacts.get(&logical_key) {
            debug!("cache hit for {logical_key}");
            return Ok(artifact.path);
        }

        let mut data = fetch_with_retry(adapter, bucket, key).await?;
        if let Some(c) = strip {
            data = bytes::Bytes::from(codec::compression::decompress(&data, c)?);
        }

        let path = self.root.join(&logical_key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                TransportSnafu {
                    message: format!("cannot create cache subdirectory for {logical_key}: {e}"),
                }
                .build()
            })?;
        }

        // Write-then-rename keeps partially written artifacts invisible. The
        // suffix is appended, not substituted, so keys differing only in
        // extension cannot collide on the temp name.
        let tmp = {
            let mut os = path.clone().into_os_string();
            os.push(".part");
            PathBuf::from(os)
        };
        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &path).await
        };
        write.await.map_err(|e| {
            TransportSnafu {
                message: format!("cannot write cache file {}: {e}", path.display()),
            }
            .build()
        })?;

        self.artifacts.insert(
            logical_key,
            Artifact {
                path: path.clone(),
                size: data.len() as u64,
            },
        );
        Ok(path)
    }
}

async fn fetch_with_retry(
    adapter: &Arc<dyn ObjectStore>,
    bucket: &str,
    key: &str,
) -> Result<bytes::Bytes> {
    let mut attempt = 0u32;
    loop {
        match adapter.get(bucket, key).await {
            Ok(data) => return Ok(data),
            Err(ObjectStoreError::NoSuchKey { .. }) => {
                return MissingDataSnafu {
                    message: format!("no such key: {bucket}/{key}"),
                }
                .fail();
            }
            Err(e @ ObjectStoreError::Transient { .. }) if attempt < FETCH_RETRIES => {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                debug!("transient fetch failure for {bucket}/{key}, retrying in {delay:?}: {e}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return TransportSnafu {
                    message: e.to_string(),
                }
                .fail();
            }
        }
    }
}

static DEFAULT_CACHE: OnceLock<Mutex<Option<Arc<FileCache>>>> = OnceLock::new();

fn default_slot() -> &'static Mutex<Option<Arc<FileCache>>> {
    DEFAULT_CACHE.get_or_init(|| Mutex::new(None))
}

/// The process-wide default cache, constructed lazily from the configuration
/// snapshot. Pipelines use this when no cache handle is injected.
pub fn default_handle() -> Result<Arc<FileCache>> {
    let mut slot = default_slot().lock().expect("default cache poisoned");
    if let Some(cache) = slot.as_ref() {
        return Ok(cache.clone());
    }
    let cache = Arc::new(FileCache::from_config(config::snapshot()?.as_ref())?);
    *slot = Some(cache.clone());
    Ok(cache)
}

/// Drop the default cache so the next use rebuilds it from configuration.
pub fn reset_default_handle() {
    *default_slot().lock().expect("default cache poisoned") = None;
}
