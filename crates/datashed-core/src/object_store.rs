//! Object-store adapter contract and reference implementations.
//!
//! The warehouse core never talks to a transport SDK directly. Everything it
//! needs from the storage layer is captured by the [`ObjectStore`] trait:
//! whole-object get/put, key listing under a prefix, and immediate-child
//! prefix listing. Production deployments plug in their own adapter; this
//! module ships two reference implementations:
//!
//! - [`LocalDirStore`]: buckets as directories under a local root. Useful for
//!   development and offline runs.
//! - [`MemoryStore`]: an in-process map with fetch counters and injectable
//!   transient failures, used heavily by the test suites.
//!
//! Error taxonomy matters more than the implementations: the core reacts
//! differently to [`ObjectStoreError::NoSuchKey`] (often "treat as empty"),
//! [`ObjectStoreError::Transient`] (retried by the file cache), and
//! [`ObjectStoreError::Other`] (propagated immediately).

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use snafu::prelude::*;
use tokio::{fs, io::AsyncWriteExt};

/// Result type for adapter operations.
pub type StoreResult<T> = Result<T, ObjectStoreError>;

/// Errors an object-store adapter can surface to the core.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ObjectStoreError {
    /// The requested object does not exist.
    #[snafu(display("no such key: {bucket}/{key}"))]
    NoSuchKey {
        /// Bucket that was consulted.
        bucket: String,
        /// Key that was not found.
        key: String,
    },

    /// A transient transport failure (connection reset, unexpected EOF).
    /// The file cache retries these with backoff.
    #[snafu(display("transient transport failure for {bucket}/{key}: {message}"))]
    Transient {
        /// Bucket of the failed request.
        bucket: String,
        /// Key of the failed request.
        key: String,
        /// Rendered cause.
        message: String,
    },

    /// Any other adapter failure. Not retried.
    #[snafu(display("object store failure: {message}"))]
    Other {
        /// Rendered cause.
        message: String,
    },
}

impl ObjectStoreError {
    /// True for the not-found case, which most call sites special-case.
    pub fn is_no_such_key(&self) -> bool {
        matches!(self, ObjectStoreError::NoSuchKey { .. })
    }

    /// True for failures the file cache is allowed to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, ObjectStoreError::Transient { .. })
    }
}

/// Storage operations the warehouse core consumes.
///
/// Implementations must be cheap to clone behind an `Arc` and safe to call
/// concurrently; the gather and insert pipelines fan out over worker pools.
#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Fetch the raw bytes of `bucket/key`.
    async fn get(&self, bucket: &str, key: &str) -> StoreResult<Bytes>;

    /// Write `data` to `bucket/key`, replacing any previous object.
    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> StoreResult<()>;

    /// List every key under `prefix`, in lexicographic order.
    async fn list_keys(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<String>>;

    /// List the immediate child prefixes of `parent` (delimiter `/`), each
    /// rendered with a trailing slash, in lexicographic order.
    async fn list_prefixes(&self, bucket: &str, parent: &str) -> StoreResult<Vec<String>>;
}

fn io_error_to_store(bucket: &str, key: &str, err: io::Error) -> ObjectStoreError {
    if err.kind() == io::ErrorKind::NotFound {
        ObjectStoreError::NoSuchKey {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    } else {
        ObjectStoreError::Other {
            message: format!("{bucket}/{key}: {err}"),
        }
    }
}

/// Adapter that maps buckets to directories under a local root.
///
/// Layout is `<root>/<bucket>/<key>`. Writes create parent directories on
/// demand and go through a write-then-rename so concurrent readers never see
/// a half-written object.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    /// Create a store rooted at `root`. The directory itself is created
    /// lazily on the first put.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }

    fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                Self::walk_files(&path, out)?;
            } else {
                out.push(path);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalDirStore {
    async fn get(&self, bucket: &str, key: &str) -> StoreResult<Bytes> {
        let path = self.object_path(bucket, key);
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) => Err(io_error_to_store(bucket, key, e)),
        }
    }

    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> StoreResult<()> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error_to_store(bucket, key, e))?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)
                .await
                .map_err(|e| io_error_to_store(bucket, key, e))?;
            file.write_all(&data)
                .await
                .map_err(|e| io_error_to_store(bucket, key, e))?;
            file.sync_all()
                .await
                .map_err(|e| io_error_to_store(bucket, key, e))?;
        }
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error_to_store(bucket, key, e))
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<String>> {
        let bucket_root = self.root.join(bucket);
        if !bucket_root.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        Self::walk_files(&bucket_root, &mut files).map_err(|e| ObjectStoreError::Other {
            message: format!("listing {bucket}: {e}"),
        })?;

        let mut keys: Vec<String> = files
            .into_iter()
            .filter_map(|p| {
                let rel = p.strip_prefix(&bucket_root).ok()?;
                let key = rel.to_str()?.replace(std::path::MAIN_SEPARATOR, "/");
                key.starts_with(prefix).then_some(key)
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn list_prefixes(&self, bucket: &str, parent: &str) -> StoreResult<Vec<String>> {
        let keys = self.list_keys(bucket, parent).await?;
        let mut children = BTreeSet::new();
        for key in keys {
            let rest = &key[parent.len()..];
            if let Some(slash) = rest.find('/') {
                children.insert(format!("{parent}{}/", &rest[..slash]));
            }
        }
        Ok(children.into_iter().collect())
    }
}

/// In-memory adapter used by tests.
///
/// Tracks per-key fetch counts and lets tests inject a number of transient
/// failures that will be surfaced ahead of successful gets.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<(String, String), Bytes>>,
    get_counts: Mutex<HashMap<(String, String), usize>>,
    transient_failures: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without going through the async trait.
    pub fn seed(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.objects
            .lock()
            .expect("memory store poisoned")
            .insert((bucket.to_string(), key.to_string()), data.into());
    }

    /// Number of `get` calls observed for `bucket/key`.
    pub fn get_count(&self, bucket: &str, key: &str) -> usize {
        self.get_counts
            .lock()
            .expect("memory store poisoned")
            .get(&(bucket.to_string(), key.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Total `get` calls observed across all keys.
    pub fn total_gets(&self) -> usize {
        self.get_counts
            .lock()
            .expect("memory store poisoned")
            .values()
            .sum()
    }

    /// Make the next `n` gets fail with a transient error before succeeding.
    pub fn inject_transient_failures(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Raw object bytes, if present.
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .expect("memory store poisoned")
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, bucket: &str, key: &str) -> StoreResult<Bytes> {
        {
            let mut counts = self.get_counts.lock().expect("memory store poisoned");
            *counts
                .entry((bucket.to_string(), key.to_string()))
                .or_insert(0) += 1;
        }

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .transient_failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return TransientSnafu {
                bucket,
                key,
                message: "injected failure".to_string(),
            }
            .fail();
        }

        self.objects
            .lock()
            .expect("memory store poisoned")
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| ObjectStoreError::NoSuchKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> StoreResult<()> {
        self.objects
            .lock()
            .expect("memory store poisoned")
            .insert((bucket.to_string(), key.to_string()), data);
        Ok(())
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .expect("memory store poisoned")
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn list_prefixes(&self, bucket: &str, parent: &str) -> StoreResult<Vec<String>> {
        let keys = self.list_keys(bucket, parent).await?;
        let mut children = BTreeSet::new();
        for key in keys {
            let rest = &key[parent.len()..];
            if let Some(slash) = rest.find('/') {
                children.insert(format!("{parent}{}/", &rest[..slash]));
            }
        }
        Ok(children.into_iter().collect())
    }
}
