//! Insert: append-merge-store for writable archives.
//!
//! An insert validates the input table against the dataset's descriptor
//! (creating the descriptor on first insert), partitions the rows by the
//! dataset index, and runs an independent read-modify-write merge per
//! partition on a bounded worker pool:
//!
//! 1. The existing partition object is fetched **directly**, never through
//!    the file cache — an insert must read its own prior writes, and a stale
//!    cached artifact would silently resurrect deleted rows.
//! 2. Existing and new rows concatenate column-aligned on the canonical
//!    column order (input extras are dropped with a warning at validation
//!    time), zoned timestamps having been converted to their stored
//!    unix-second form.
//! 3. The merged rows sort lexicographically across the full column order
//!    and exact duplicates collapse, which is what makes a retried insert
//!    idempotent.
//!
//! A failed partition merge fails the whole insert; partitions already
//! written stay written, and the caller's retry converges by the same
//! sort+dedup argument.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::UInt32Array;
use arrow::compute::{concat_batches, take_record_batch};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, SortField};
use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use log::warn;
use snafu::prelude::*;

use crate::cache::FileCache;
use crate::codec::{self, Compression, FileFormat};
use crate::error::{Error, FormatSnafu, Result, SchemaSnafu, TransportSnafu};
use crate::gather::align_to_storage;
use crate::index;
use crate::metadata::store::{get_descriptor, put_descriptor};
use crate::metadata::type_tag::{TypeTag, storage_arrow_type};
use crate::metadata::{DatasetDescriptor, DatasetIndex, PartitionSize};
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::registry::{self, Store};

/// Default size of the merge worker pool.
pub const DEFAULT_WORKERS: usize = 8;

/// Default index column for freshly created datasets.
pub const DEFAULT_INDEX_COLUMN: &str = "target_start";

/// Rewrite the descriptor when this much time has passed since
/// `last_modified`, even if nothing else changed.
fn last_modified_refresh() -> TimeDelta {
    TimeDelta::days(1)
}

/// Options for an insert request.
#[derive(Clone, Debug, Default)]
pub struct InsertOptions {
    /// Free-form details merged element-wise into the descriptor.
    pub details: Option<BTreeMap<String, String>>,
    /// Per-column type overrides, honored only when the insert creates the
    /// dataset; an existing schema is locked.
    pub column_types: Option<BTreeMap<String, TypeTag>>,
    /// Index for a freshly created dataset. Default: time series over
    /// [`DEFAULT_INDEX_COLUMN`] at day granularity.
    pub index: Option<DatasetIndex>,
    /// File format for a freshly created dataset. Default: CSV.
    pub file_format: Option<FileFormat>,
    /// Compression for a freshly created dataset. `Some(None)` pins
    /// "uncompressed"; absent means the gzip default.
    pub compression: Option<Option<Compression>>,
    /// Merge pool size; `None` means [`DEFAULT_WORKERS`].
    pub workers: Option<usize>,
}

/// Append-merge-store `batch` into `collection/dataset` of the named store.
#[allow(clippy::too_many_arguments)]
pub async fn insert(
    adapter: &Arc<dyn ObjectStore>,
    cache: &Arc<FileCache>,
    store_id: &str,
    collection: &str,
    dataset: &str,
    batch: &RecordBatch,
    opts: &InsertOptions,
) -> Result<()> {
    let store = registry::lookup(store_id)?;
    ensure!(
        store.is_writable(),
        SchemaSnafu {
            message: format!("cannot insert into read-only archive {}", store.uri()),
        }
    );
    ensure!(
        batch.num_rows() > 0 && batch.num_columns() > 0,
        SchemaSnafu {
            message: format!("refusing to insert an empty table into {collection}/{dataset}"),
        }
    );

    let desc = ensure_descriptor(adapter, cache, &store, collection, dataset, batch, opts).await?;
    let partitions = index::partition_batch(&desc, batch)?;

    let workers = opts.workers.unwrap_or(DEFAULT_WORKERS).max(1);
    let context = Arc::new(MergeContext {
        adapter: adapter.clone(),
        store: store.clone(),
        desc,
    });

    let mut pool = futures::stream::iter(partitions.into_iter().map(|(boundary, part)| {
        let context = context.clone();
        tokio::spawn(async move { merge_partition(context, boundary, part).await })
    }))
    .buffered(workers);

    while let Some(joined) = pool.next().await {
        joined.map_err(|e| {
            TransportSnafu {
                message: format!("merge worker aborted: {e}"),
            }
            .build()
        })??;
    }
    Ok(())
}

/// Validate against the stored descriptor, or create one from the input.
async fn ensure_descriptor(
    adapter: &Arc<dyn ObjectStore>,
    cache: &Arc<FileCache>,
    store: &Store,
    collection: &str,
    dataset: &str,
    batch: &RecordBatch,
    opts: &InsertOptions,
) -> Result<DatasetDescriptor> {
    match get_descriptor(adapter, cache, store, collection, dataset).await {
        Ok(mut existing) => {
            validate_against(&existing, batch)?;
            if opts.column_types.is_some() {
                warn!(
                    "{collection}/{dataset} already declares its schema; ignoring column_types"
                );
            }
            refresh_descriptor(adapter, store, &mut existing, opts.details.as_ref()).await?;
            Ok(existing)
        }
        Err(Error::MissingData { .. }) => {
            create_descriptor(adapter, store, collection, dataset, batch, opts).await
        }
        Err(e) => Err(e),
    }
}

/// Check the input against a locked schema: every declared column present,
/// every observed type a subtype of its declaration. Extra input columns are
/// allowed; they are dropped on write.
fn validate_against(desc: &DatasetDescriptor, batch: &RecordBatch) -> Result<()> {
    let schema = batch.schema_ref();

    for name in &desc.column_order {
        ensure!(
            schema.column_with_name(name).is_some(),
            SchemaSnafu {
                message: format!(
                    "input table is missing declared column {name:?} of {}/{}",
                    desc.collection, desc.dataset
                ),
            }
        );
    }

    for field in schema.fields() {
        let name = field.name();
        let Some(declared) = desc.column_types.get(name) else {
            warn!(
                "input column {name:?} is not declared by {}/{} and will be dropped",
                desc.collection, desc.dataset
            );
            continue;
        };
        let observed = TypeTag::from_arrow(field.data_type()).with_context(|| SchemaSnafu {
            message: format!(
                "input column {name:?} has unsupported type {:?}",
                field.data_type()
            ),
        })?;
        ensure!(
            observed.is_subtype_of(declared),
            SchemaSnafu {
                message: format!(
                    "input column {name:?} is {observed:?}, which is not a {declared:?}"
                ),
            }
        );
    }
    Ok(())
}

/// Merge supplied details and refresh `last_modified` when warranted.
async fn refresh_descriptor(
    adapter: &Arc<dyn ObjectStore>,
    store: &Store,
    desc: &mut DatasetDescriptor,
    details: Option<&BTreeMap<String, String>>,
) -> Result<()> {
    let mut changed = false;
    if let Some(details) = details {
        let mut merged = desc.details.clone().unwrap_or_default();
        for (key, value) in details {
            merged.insert(key.clone(), value.clone());
        }
        if desc.details.as_ref() != Some(&merged) {
            desc.details = Some(merged);
            changed = true;
        }
    }

    let now = Utc::now();
    if changed || now - desc.last_modified > last_modified_refresh() {
        desc.last_modified = now;
        put_descriptor(adapter, store, desc).await?;
    }
    Ok(())
}

/// Build, validate, and persist a descriptor for a dataset's first insert.
async fn create_descriptor(
    adapter: &Arc<dyn ObjectStore>,
    store: &Store,
    collection: &str,
    dataset: &str,
    batch: &RecordBatch,
    opts: &InsertOptions,
) -> Result<DatasetDescriptor> {
    let schema = batch.schema_ref();
    let column_order: Vec<String> = schema.fields().iter().map(|f| f.name().clone()).collect();

    // Declared types default to the sanitized observation, so later inserts
    // are held to the abstract bound rather than one batch's concrete types.
    let mut column_types = BTreeMap::new();
    for field in schema.fields() {
        let observed = TypeTag::from_arrow(field.data_type()).with_context(|| SchemaSnafu {
            message: format!(
                "input column {:?} has unsupported type {:?}",
                field.name(),
                field.data_type()
            ),
        })?;
        column_types.insert(field.name().clone(), observed.sanitize());
    }

    if let Some(overrides) = &opts.column_types {
        for (name, tag) in overrides {
            if column_types.contains_key(name) {
                column_types.insert(name.clone(), tag.clone());
            } else {
                warn!("column_types override names absent column {name:?}; ignored");
            }
        }
    }

    let index = opts.index.clone().unwrap_or(DatasetIndex::TimeSeries {
        key: DEFAULT_INDEX_COLUMN.to_string(),
        partition_size: PartitionSize::Day,
    });

    let timezone = match schema.column_with_name(index.key()) {
        Some((_, field)) => match field.data_type() {
            DataType::Timestamp(_, Some(tz)) if tz.parse::<chrono_tz::Tz>().is_ok() => {
                tz.to_string()
            }
            DataType::Timestamp(_, Some(tz)) => {
                warn!("index timezone {tz:?} is not an IANA zone; recording UTC");
                "UTC".to_string()
            }
            _ => "UTC".to_string(),
        },
        None => "UTC".to_string(),
    };

    let desc = DatasetDescriptor {
        collection: collection.to_string(),
        dataset: dataset.to_string(),
        column_order,
        column_types,
        timezone,
        index,
        file_format: opts.file_format.unwrap_or(FileFormat::Csv),
        compression: opts.compression.unwrap_or(Some(Compression::Gz)),
        last_modified: Utc::now(),
        details: opts.details.clone(),
    };

    desc.validate()?;
    // User-supplied overrides must still accept the data at hand.
    validate_against(&desc, batch)?;

    put_descriptor(adapter, store, &desc).await?;
    Ok(desc)
}

struct MergeContext {
    adapter: Arc<dyn ObjectStore>,
    store: Store,
    desc: DatasetDescriptor,
}

/// Read-modify-write one partition.
async fn merge_partition(
    ctx: Arc<MergeContext>,
    boundary: DateTime<Utc>,
    part: RecordBatch,
) -> Result<()> {
    let desc = &ctx.desc;
    let key = index::object_key(ctx.store.prefix(), desc, boundary);

    let incoming = to_storage(&part, desc)?;

    // Read-your-own-write: straight to the adapter, never the cache.
    let existing = match ctx.adapter.get(ctx.store.bucket(), &key).await {
        Ok(raw) => {
            let decoded = codec::decode_batch(&raw, desc.file_format, desc.compression)?;
            Some(align_to_storage(&decoded, desc)?)
        }
        Err(ObjectStoreError::NoSuchKey { .. }) => None,
        Err(e) => {
            return TransportSnafu {
                message: format!("fetching existing partition {key}: {e}"),
            }
            .fail();
        }
    };

    let combined = match existing {
        Some(existing) => {
            concat_batches(&incoming.schema(), &[existing, incoming.clone()]).map_err(|e| {
                FormatSnafu {
                    message: format!("merging partition {key}: {e}"),
                }
                .build()
            })?
        }
        None => incoming,
    };

    let merged = sort_dedup(&combined)?;
    let body = codec::encode_batch(&merged, desc.file_format, desc.compression)?;
    ctx.adapter
        .put(ctx.store.bucket(), &key, body)
        .await
        .map_err(|e| {
            TransportSnafu {
                message: format!("storing partition {key}: {e}"),
            }
            .build()
        })
}

/// Project the caller's partition onto the canonical column order in stored
/// form: zoned timestamps become unix-second integers, everything else is
/// cast to its storage type, extras are dropped.
fn to_storage(batch: &RecordBatch, desc: &DatasetDescriptor) -> Result<RecordBatch> {
    let mut fields = Vec::with_capacity(desc.column_order.len());
    let mut columns = Vec::with_capacity(desc.column_order.len());

    for name in &desc.column_order {
        let column = batch.column_by_name(name).with_context(|| SchemaSnafu {
            message: format!("input table is missing declared column {name:?}"),
        })?;
        let declared = desc.column_types.get(name).with_context(|| SchemaSnafu {
            message: format!("no declared type for column {name:?}"),
        })?;

        let column = if declared.is_zoned_timestamp() {
            // Two steps: normalize the unit to seconds, then drop the
            // timestamp wrapper to plain integers.
            let seconds = arrow::compute::cast(
                column,
                &DataType::Timestamp(TimeUnit::Second, timezone_of(column.data_type())),
            )
            .and_then(|c| arrow::compute::cast(&c, &DataType::Int64))
            .map_err(|e| {
                SchemaSnafu {
                    message: format!("converting timestamp column {name:?} to unix seconds: {e}"),
                }
                .build()
            })?;
            seconds
        } else {
            match storage_arrow_type(declared) {
                Some(target) if column.data_type() != &target => {
                    arrow::compute::cast(column, &target).map_err(|e| {
                        SchemaSnafu {
                            message: format!("converting column {name:?} to stored form: {e}"),
                        }
                        .build()
                    })?
                }
                _ => column.clone(),
            }
        };

        fields.push(Field::new(name, column.data_type().clone(), true));
        columns.push(column);
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).map_err(|e| {
        SchemaSnafu {
            message: format!("projecting input onto the canonical column order: {e}"),
        }
        .build()
    })
}

fn timezone_of(data_type: &DataType) -> Option<Arc<str>> {
    match data_type {
        DataType::Timestamp(_, tz) => tz.clone(),
        _ => None,
    }
}

/// Sort rows lexicographically across the full column order and drop exact
/// duplicates, preserving a single representative each.
fn sort_dedup(batch: &RecordBatch) -> Result<RecordBatch> {
    let fields: Vec<SortField> = batch
        .schema_ref()
        .fields()
        .iter()
        .map(|f| SortField::new(f.data_type().clone()))
        .collect();

    let converter = RowConverter::new(fields).map_err(|e| {
        FormatSnafu {
            message: format!("sorting merged partition: {e}"),
        }
        .build()
    })?;
    let rows = converter
        .convert_columns(batch.columns())
        .map_err(|e| {
            FormatSnafu {
                message: format!("sorting merged partition: {e}"),
            }
            .build()
        })?;

    let mut order: Vec<u32> = (0..batch.num_rows() as u32).collect();
    order.sort_unstable_by(|a, b| rows.row(*a as usize).cmp(&rows.row(*b as usize)));
    order.dedup_by(|a, b| rows.row(*a as usize) == rows.row(*b as usize));

    take_record_batch(batch, &UInt32Array::from(order)).map_err(|e| {
        FormatSnafu {
            message: format!("sorting merged partition: {e}"),
        }
        .build()
    })
}
