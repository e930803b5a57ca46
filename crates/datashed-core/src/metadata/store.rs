//! Reading and writing dataset descriptors.
//!
//! Descriptor reads go through the file cache like any other object read;
//! writes go straight to the adapter (the file cache is read-only territory).
//! A process-wide JSON cache sits in front so repeated descriptor lookups in
//! one process cost nothing, and so an insert observes its own descriptor
//! writes immediately. `put` updates that cache; it deliberately does not
//! touch the file cache, so other processes sharing a persistent cache
//! directory see updates only after their artifact is evicted — the
//! documented cross-process limitation.
//!
//! Read-only archives do not store their schema through this library. Their
//! descriptor is partially synthesized: index granularity, file format, and
//! compression come from the store URI variant, while whatever the archive
//! publishes (column order, timezone, details such as `type_map` and
//! `superkey`) is taken leniently from the stored JSON.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, TimeZone, Utc};
use log::debug;

use crate::cache::FileCache;
use crate::error::{Error, FormatSnafu, MissingDataSnafu, Result, TransportSnafu};
use crate::metadata::{
    DatasetDescriptor, DatasetIndex, PartitionSize, metadata_key,
};
use crate::metadata::type_tag::TypeTag;
use crate::object_store::ObjectStore;
use crate::registry::Store;

type CacheKey = (String, String, String, String);

static DESCRIPTOR_CACHE: OnceLock<Mutex<HashMap<CacheKey, DatasetDescriptor>>> = OnceLock::new();

fn descriptor_cache() -> &'static Mutex<HashMap<CacheKey, DatasetDescriptor>> {
    DESCRIPTOR_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn cache_key(store: &Store, collection: &str, dataset: &str) -> CacheKey {
    (
        store.bucket().to_string(),
        store.prefix().to_string(),
        collection.to_string(),
        dataset.to_string(),
    )
}

/// Drop every cached descriptor. Tests use this between scenarios.
pub fn reset_descriptor_cache() {
    descriptor_cache()
        .lock()
        .expect("descriptor cache poisoned")
        .clear();
}

/// Fetch the descriptor for `collection/dataset` in `store`.
///
/// A missing descriptor object is the missing-data condition; any other
/// adapter failure propagates unchanged.
pub async fn get_descriptor(
    adapter: &Arc<dyn ObjectStore>,
    cache: &FileCache,
    store: &Store,
    collection: &str,
    dataset: &str,
) -> Result<DatasetDescriptor> {
    if let Some(desc) = descriptor_cache()
        .lock()
        .expect("descriptor cache poisoned")
        .get(&cache_key(store, collection, dataset))
    {
        debug!("descriptor cache hit for {collection}/{dataset}");
        return Ok(desc.clone());
    }

    let key = metadata_key(store.prefix(), collection, dataset);
    let path = cache
        .get(adapter, store.bucket(), &key, false)
        .await
        .map_err(|e| match e {
            Error::MissingData { .. } => MissingDataSnafu {
                message: format!(
                    "no descriptor for {collection}/{dataset} in {}",
                    store.uri()
                ),
            }
            .build(),
            other => other,
        })?;

    let raw = tokio::fs::read(&path).await.map_err(|e| {
        TransportSnafu {
            message: format!("cannot read cached descriptor {}: {e}", path.display()),
        }
        .build()
    })?;

    let desc = match store {
        Store::WritableArchive { .. } => parse_writable(&raw, collection, dataset)?,
        Store::ReadOnlyArchive {
            file_format,
            compression,
            partition_size,
            ..
        } => synthesize_read_only(
            &raw,
            collection,
            dataset,
            *file_format,
            *compression,
            *partition_size,
        )?,
    };

    descriptor_cache()
        .lock()
        .expect("descriptor cache poisoned")
        .insert(cache_key(store, collection, dataset), desc.clone());
    Ok(desc)
}

/// Serialize and store a descriptor under the fixed metadata key.
///
/// Does not touch the file cache; the process-wide JSON cache is updated so
/// this process reads its own write.
pub async fn put_descriptor(
    adapter: &Arc<dyn ObjectStore>,
    store: &Store,
    desc: &DatasetDescriptor,
) -> Result<()> {
    let key = desc.metadata_key(store.prefix());
    let body = serde_json::to_vec(desc).map_err(|e| {
        FormatSnafu {
            message: format!(
                "cannot serialize descriptor for {}/{}: {e}",
                desc.collection, desc.dataset
            ),
        }
        .build()
    })?;

    adapter
        .put(store.bucket(), &key, body.into())
        .await
        .map_err(|e| {
            TransportSnafu {
                message: format!("cannot store descriptor at {key}: {e}"),
            }
            .build()
        })?;

    descriptor_cache()
        .lock()
        .expect("descriptor cache poisoned")
        .insert(
            cache_key(store, &desc.collection, &desc.dataset),
            desc.clone(),
        );
    Ok(())
}

fn parse_writable(raw: &[u8], collection: &str, dataset: &str) -> Result<DatasetDescriptor> {
    let mut desc: DatasetDescriptor = serde_json::from_slice(raw).map_err(|e| {
        FormatSnafu {
            message: format!("corrupt descriptor for {collection}/{dataset}: {e}"),
        }
        .build()
    })?;
    desc.collection = collection.to_string();
    desc.dataset = dataset.to_string();
    Ok(desc)
}

fn synthesize_read_only(
    raw: &[u8],
    collection: &str,
    dataset: &str,
    file_format: crate::codec::FileFormat,
    compression: Option<crate::codec::Compression>,
    partition_size: PartitionSize,
) -> Result<DatasetDescriptor> {
    let value: serde_json::Value = serde_json::from_slice(raw).map_err(|e| {
        FormatSnafu {
            message: format!("corrupt descriptor for {collection}/{dataset}: {e}"),
        }
        .build()
    })?;

    let column_order: Vec<String> = value
        .get("column_order")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let column_types: BTreeMap<String, TypeTag> = match value.get("column_types") {
        Some(types) => serde_json::from_value(types.clone()).map_err(|e| {
            FormatSnafu {
                message: format!("corrupt column types for {collection}/{dataset}: {e}"),
            }
            .build()
        })?,
        None => BTreeMap::new(),
    };

    let timezone = value
        .get("timezone")
        .and_then(|v| v.as_str())
        .unwrap_or("UTC")
        .to_string();

    // Archives publish their index column name; the granularity is pinned by
    // the URI regardless of what the stored JSON claims.
    let index_key = value
        .get("index")
        .and_then(|v| v.get("_attr"))
        .and_then(|v| v.get("key"))
        .and_then(|v| v.as_str())
        .unwrap_or("target_start")
        .to_string();

    let last_modified: DateTime<Utc> = value
        .get("last_modified")
        .and_then(|v| v.as_i64())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().expect("epoch"));

    let details: Option<BTreeMap<String, String>> = value
        .get("details")
        .filter(|v| !v.is_null())
        .map(|v| {
            serde_json::from_value(v.clone()).map_err(|e| {
                FormatSnafu {
                    message: format!("corrupt details for {collection}/{dataset}: {e}"),
                }
                .build()
            })
        })
        .transpose()?;

    Ok(DatasetDescriptor {
        collection: collection.to_string(),
        dataset: dataset.to_string(),
        column_order,
        column_types,
        timezone,
        index: DatasetIndex::TimeSeries {
            key: index_key,
            partition_size,
        },
        file_format,
        compression,
        last_modified,
        details,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Compression, FileFormat};
    use crate::metadata::type_tag::SimpleTag;
    use crate::object_store::MemoryStore;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn writable_store() -> Store {
        Store::WritableArchive {
            bucket: "b".to_string(),
            prefix: "p".to_string(),
        }
    }

    fn sample_descriptor() -> DatasetDescriptor {
        let mut column_types = BTreeMap::new();
        column_types.insert(
            "target_start".to_string(),
            TypeTag::simple(SimpleTag::ZonedDateTime),
        );
        DatasetDescriptor {
            collection: "c".to_string(),
            dataset: "d".to_string(),
            column_order: vec!["target_start".to_string()],
            column_types,
            timezone: "UTC".to_string(),
            index: DatasetIndex::TimeSeries {
                key: "target_start".to_string(),
                partition_size: PartitionSize::Day,
            },
            file_format: FileFormat::Csv,
            compression: Some(Compression::Gz),
            last_modified: Utc.timestamp_opt(1_600_000_000, 0).single().expect("ts"),
            details: None,
        }
    }

    #[tokio::test]
    async fn descriptor_roundtrips_through_the_store() -> TestResult {
        let adapter: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let cache = FileCache::ephemeral(1_000_000)?;
        let store = writable_store();
        let mut desc = sample_descriptor();
        desc.collection = "roundtrip".to_string();

        put_descriptor(&adapter, &store, &desc).await?;
        // Forget the cached copy so the read exercises the object path.
        descriptor_cache()
            .lock()
            .expect("descriptor cache poisoned")
            .remove(&cache_key(&store, "roundtrip", "d"));

        let back = get_descriptor(&adapter, &cache, &store, "roundtrip", "d").await?;
        assert_eq!(back, desc);
        Ok(())
    }

    #[tokio::test]
    async fn missing_descriptor_is_missing_data() -> TestResult {
        let adapter: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let cache = FileCache::ephemeral(1_000_000)?;

        let err = get_descriptor(&adapter, &cache, &writable_store(), "c", "absent")
            .await
            .expect_err("missing");
        assert!(err.is_missing_data());
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_descriptor_is_a_format_error() -> TestResult {
        let memory = Arc::new(MemoryStore::new());
        memory.seed("b", "p/corrupt/d/METADATA.json", b"{not json".as_slice());
        let adapter: Arc<dyn ObjectStore> = memory;
        let cache = FileCache::ephemeral(1_000_000)?;

        let err = get_descriptor(&adapter, &cache, &writable_store(), "corrupt", "d")
            .await
            .expect_err("corrupt");
        assert!(matches!(err, Error::Format { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn put_updates_the_process_cache_for_read_your_own_write() -> TestResult {
        let adapter: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let cache = FileCache::ephemeral(1_000_000)?;
        let store = writable_store();

        let mut desc = sample_descriptor();
        desc.collection = "ryow".to_string();
        put_descriptor(&adapter, &store, &desc).await?;
        // Warm the file cache with the first version.
        let _ = get_descriptor(&adapter, &cache, &store, "ryow", "d").await?;

        desc.last_modified = Utc.timestamp_opt(1_700_000_000, 0).single().expect("ts");
        put_descriptor(&adapter, &store, &desc).await?;

        // Even though the file cache still holds the old artifact, this
        // process observes its own write through the JSON cache.
        let back = get_descriptor(&adapter, &cache, &store, "ryow", "d").await?;
        assert_eq!(back.last_modified, desc.last_modified);
        Ok(())
    }

    #[tokio::test]
    async fn read_only_descriptors_are_synthesized_from_the_variant() -> TestResult {
        let memory = Arc::new(MemoryStore::new());
        memory.seed(
            "feeds",
            "c/d/METADATA.json",
            serde_json::to_vec(&serde_json::json!({
                "column_order": ["release_date", "target_start", "value"],
                "timezone": "America/New_York",
                "details": {
                    "superkey": "release_date,target_start,node_name,tag",
                    "type_map": "{\"value\": \"float\"}"
                }
            }))?,
        );
        let adapter: Arc<dyn ObjectStore> = memory;
        let cache = FileCache::ephemeral(1_000_000)?;

        let store = Store::ReadOnlyArchive {
            bucket: "feeds".to_string(),
            prefix: String::new(),
            file_format: FileFormat::Arrow,
            compression: Some(Compression::Zst),
            partition_size: PartitionSize::Hour,
        };

        let desc = get_descriptor(&adapter, &cache, &store, "c", "d").await?;
        assert_eq!(desc.file_format, FileFormat::Arrow);
        assert_eq!(desc.compression, Some(Compression::Zst));
        assert_eq!(desc.partition_size(), PartitionSize::Hour);
        assert_eq!(desc.index_key(), "target_start");
        assert_eq!(desc.timezone, "America/New_York");
        assert_eq!(
            desc.superkey().expect("superkey"),
            vec!["release_date", "target_start", "node_name", "tag"]
        );
        Ok(())
    }
}
