//! The user-facing warehouse handle.
//!
//! [`Warehouse`] binds an object-store adapter to the three public dataset
//! operations — list, gather, insert — and decides which file cache the
//! reads go through: an injected handle, or the process-wide default built
//! lazily from configuration. Tests inject a handle; long-lived processes
//! usually rely on the default.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};

use crate::cache::{self, FileCache};
use crate::error::Result;
use crate::gather::{self, GatherOptions, Gathered};
use crate::insert::{self, InsertOptions};
use crate::list;
use crate::object_store::ObjectStore;

/// A client for one object-store transport.
#[derive(Clone, Debug)]
pub struct Warehouse {
    adapter: Arc<dyn ObjectStore>,
    cache: Option<Arc<FileCache>>,
}

impl Warehouse {
    /// Create a warehouse using the process-wide default cache.
    pub fn new(adapter: Arc<dyn ObjectStore>) -> Self {
        Self {
            adapter,
            cache: None,
        }
    }

    /// Create a warehouse with an injected cache handle.
    pub fn with_cache(adapter: Arc<dyn ObjectStore>, cache: Arc<FileCache>) -> Self {
        Self {
            adapter,
            cache: Some(cache),
        }
    }

    /// The cache reads go through.
    fn cache_handle(&self) -> Result<Arc<FileCache>> {
        match &self.cache {
            Some(cache) => Ok(cache.clone()),
            None => cache::default_handle(),
        }
    }

    /// The adapter this warehouse talks to.
    pub fn adapter(&self) -> &Arc<dyn ObjectStore> {
        &self.adapter
    }

    /// List collections and datasets; see [`list::list_datasets`].
    pub async fn list_datasets(
        &self,
        collection: Option<&str>,
        store_id: Option<&str>,
    ) -> Result<BTreeMap<String, Vec<String>>> {
        list::list_datasets(&self.adapter, collection, store_id).await
    }

    /// Range-query a dataset; see [`gather::gather`].
    #[allow(clippy::too_many_arguments)]
    pub async fn gather(
        &self,
        collection: &str,
        dataset: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        store_id: Option<&str>,
        opts: &GatherOptions,
    ) -> Result<Gathered> {
        let cache = self.cache_handle()?;
        gather::gather(
            &self.adapter,
            &cache,
            collection,
            dataset,
            start,
            stop,
            store_id,
            opts,
        )
        .await
    }

    /// Append-merge-store a table; see [`insert::insert`].
    pub async fn insert(
        &self,
        store_id: &str,
        collection: &str,
        dataset: &str,
        batch: &RecordBatch,
        opts: &InsertOptions,
    ) -> Result<()> {
        let cache = self.cache_handle()?;
        insert::insert(
            &self.adapter,
            &cache,
            store_id,
            collection,
            dataset,
            batch,
            opts,
        )
        .await
    }
}
