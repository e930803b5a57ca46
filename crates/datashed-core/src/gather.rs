//! Gather: concurrent range queries over a dataset.
//!
//! A gather request resolves a store (or walks the registry in rank order),
//! loads the dataset descriptor, enumerates the candidate partition keys for
//! the closed range, and runs a fetch→decode→filter worker pool over them:
//!
//! 1. Candidate keys beyond the worker budget are pruned first by listing
//!    their parent directories, so partitions that were never written cost a
//!    listing instead of a failed fetch each.
//! 2. Each worker fetches through the file cache (honoring the configured
//!    decompress-on-ingest), decodes with whatever compression suffix the
//!    cached artifact still carries, applies the range filter with its
//!    source-key hint, then the caller's include/exclude predicates, then
//!    the cutoff release selection for read-only archives.
//! 3. Missing objects are swallowed with a debug trace; any other failure
//!    cancels the remaining work. Workers already in flight finish on their
//!    own and their results are discarded.
//! 4. Surviving partitions concatenate in ascending key order — worker
//!    completion order is never observable — and post-processing rebuilds
//!    the typed columns.
//!
//! A worker budget of 1 degenerates to strict sequential execution, which
//! keeps error propagation deterministic for debugging.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use arrow::array::BooleanArray;
use arrow::compute::{concat_batches, filter_record_batch, not};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::debug;
use snafu::prelude::*;

use crate::cache::FileCache;
use crate::codec;
use crate::config;
use crate::error::{
    ArgumentSnafu, Error, FormatSnafu, MissingDataSnafu, Result, SchemaSnafu, TransportSnafu,
};
use crate::index;
use crate::metadata::DatasetDescriptor;
use crate::metadata::store::get_descriptor;
use crate::metadata::type_tag::{SimpleTag, TypeTag, storage_arrow_type};
use crate::object_store::ObjectStore;
use crate::registry::{self, Store};

pub mod postprocess;
pub mod releases;

/// Default size of the gather worker pool.
pub const DEFAULT_WORKERS: usize = 8;

/// A row predicate over a decoded partition: `true` marks a row.
pub type RowPredicate = Arc<dyn Fn(&RecordBatch) -> Result<BooleanArray> + Send + Sync>;

/// Options for a gather request.
#[derive(Clone, Default)]
pub struct GatherOptions {
    /// Worker pool size; `None` means [`DEFAULT_WORKERS`]. A pool of 1 runs
    /// strictly sequentially.
    pub workers: Option<usize>,
    /// Keep only rows the predicate marks.
    pub include: Option<RowPredicate>,
    /// Drop rows the predicate marks.
    pub exclude: Option<RowPredicate>,
    /// Evaluate multi-release archives as of this instant (read-only
    /// archives only).
    pub cutoff: Option<DateTime<Utc>>,
}

impl GatherOptions {
    fn worker_count(&self) -> Result<usize> {
        let workers = self.workers.unwrap_or(DEFAULT_WORKERS);
        ensure!(
            workers >= 1,
            ArgumentSnafu {
                message: "gather requires at least one worker".to_string(),
            }
        );
        Ok(workers)
    }
}

/// A gathered table together with the descriptor it was read under.
#[derive(Clone, Debug)]
pub struct Gathered {
    /// The concatenated, post-processed result.
    pub batch: RecordBatch,
    /// The dataset descriptor consulted for the read.
    pub descriptor: DatasetDescriptor,
}

/// Range-query a dataset.
///
/// With a `store_id` the named store is consulted and a missing dataset
/// surfaces as missing data. Without one, the registry is walked in rank
/// order and the first store yielding rows wins; only when every store comes
/// up empty does missing data surface. A cutoff narrows the walk to
/// read-only archives — writable archives store no releases, so they can
/// never serve the request; naming one explicitly is still an argument
/// error.
#[allow(clippy::too_many_arguments)]
pub async fn gather(
    adapter: &Arc<dyn ObjectStore>,
    cache: &Arc<FileCache>,
    collection: &str,
    dataset: &str,
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
    store_id: Option<&str>,
    opts: &GatherOptions,
) -> Result<Gathered> {
    match store_id {
        Some(id) => {
            let store = registry::lookup(id)?;
            gather_in_store(adapter, cache, &store, collection, dataset, start, stop, opts).await
        }
        None => {
            for (id, store) in registry::registry()?.iter() {
                // Writable archives store no releases; with a cutoff they can
                // never serve the request, so the walk passes over them
                // instead of surfacing the explicit-call argument error.
                if opts.cutoff.is_some() && store.is_writable() {
                    debug!("store {id:?} is writable; skipped for a cutoff gather");
                    continue;
                }
                match gather_in_store(
                    adapter, cache, store, collection, dataset, start, stop, opts,
                )
                .await
                {
                    Ok(gathered) => return Ok(gathered),
                    Err(e) if e.is_missing_data() => {
                        debug!("store {id:?} has no rows for {collection}/{dataset}: {e}");
                    }
                    Err(e) => return Err(e),
                }
            }
            MissingDataSnafu {
                message: format!(
                    "no rows for {collection}/{dataset} in [{start}, {stop}] in any registered store"
                ),
            }
            .fail()
        }
    }
}

struct WorkerContext {
    adapter: Arc<dyn ObjectStore>,
    cache: Arc<FileCache>,
    store: Store,
    desc: DatasetDescriptor,
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
    decompress: bool,
    include: Option<RowPredicate>,
    exclude: Option<RowPredicate>,
    cutoff: Option<DateTime<Utc>>,
}

/// Range-query a dataset in one resolved store.
#[allow(clippy::too_many_arguments)]
pub async fn gather_in_store(
    adapter: &Arc<dyn ObjectStore>,
    cache: &Arc<FileCache>,
    store: &Store,
    collection: &str,
    dataset: &str,
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
    opts: &GatherOptions,
) -> Result<Gathered> {
    ensure!(
        opts.cutoff.is_none() || !store.is_writable(),
        ArgumentSnafu {
            message: format!(
                "a release cutoff cannot apply to writable archive {}: it stores no releases",
                store.uri()
            ),
        }
    );
    let workers = opts.worker_count()?;

    let desc = get_descriptor(adapter, cache, store, collection, dataset).await?;
    let mut keys = index::keys_for_range(store.prefix(), &desc, start, stop)?;

    // More candidates than workers: one listing per parent directory beats a
    // failed fetch per absent partition.
    if keys.len() > workers {
        keys = prune_missing_keys(adapter, store.bucket(), keys).await?;
    }

    let context = Arc::new(WorkerContext {
        adapter: adapter.clone(),
        cache: cache.clone(),
        store: store.clone(),
        desc: desc.clone(),
        start,
        stop,
        decompress: config::snapshot()?.cache_decompress,
        include: opts.include.clone(),
        exclude: opts.exclude.clone(),
        cutoff: opts.cutoff,
    });

    let mut pool = futures::stream::iter(keys.into_iter().map(|key| {
        let context = context.clone();
        tokio::spawn(async move { process_key(context, key).await })
    }))
    .buffered(workers);

    let mut kept: Vec<RecordBatch> = Vec::new();
    while let Some(joined) = pool.next().await {
        let outcome = joined.map_err(|e| {
            TransportSnafu {
                message: format!("gather worker aborted: {e}"),
            }
            .build()
        })?;
        if let Some(batch) = outcome? {
            kept.push(batch);
        }
    }

    ensure!(
        !kept.is_empty(),
        MissingDataSnafu {
            message: format!(
                "no rows for {collection}/{dataset} in [{start}, {stop}] at {}",
                store.uri()
            ),
        }
    );

    let schema = kept[0].schema();
    let combined = concat_batches(&schema, &kept).map_err(|e| {
        FormatSnafu {
            message: format!("concatenating gathered partitions: {e}"),
        }
        .build()
    })?;

    let batch = postprocess::postprocess(&combined, &desc, store.is_writable())?;
    Ok(Gathered {
        batch,
        descriptor: desc,
    })
}

/// Drop candidate keys whose objects do not exist, using one listing per
/// unique parent directory.
async fn prune_missing_keys(
    adapter: &Arc<dyn ObjectStore>,
    bucket: &str,
    keys: Vec<String>,
) -> Result<Vec<String>> {
    let parents: BTreeSet<String> = keys
        .iter()
        .filter_map(|k| k.rsplit_once('/').map(|(parent, _)| format!("{parent}/")))
        .collect();

    let mut existing = HashSet::new();
    for parent in parents {
        let listed = adapter.list_keys(bucket, &parent).await.map_err(|e| {
            TransportSnafu {
                message: format!("listing {bucket}/{parent}: {e}"),
            }
            .build()
        })?;
        existing.extend(listed);
    }

    let before = keys.len();
    let keys: Vec<String> = keys.into_iter().filter(|k| existing.contains(k)).collect();
    debug!("pruned {} absent partitions via listing", before - keys.len());
    Ok(keys)
}

async fn process_key(ctx: Arc<WorkerContext>, key: String) -> Result<Option<RecordBatch>> {
    let path = match ctx
        .cache
        .get(&ctx.adapter, ctx.store.bucket(), &key, ctx.decompress)
        .await
    {
        Ok(path) => path,
        Err(Error::MissingData { .. }) => {
            debug!("partition {key} does not exist; treated as empty");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let raw = tokio::fs::read(&path).await.map_err(|e| {
        TransportSnafu {
            message: format!("cannot read cached partition {}: {e}", path.display()),
        }
        .build()
    })?;

    // The cache may have decompressed on ingest; decode with whatever suffix
    // the artifact still carries.
    let remaining = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(codec::detect_from_filename)
        .transpose()?
        .and_then(|(_, compression)| compression);

    let mut batch = codec::decode_batch(&raw, ctx.desc.file_format, remaining)?;

    if ctx.store.is_writable() {
        batch = align_to_storage(&batch, &ctx.desc)?;
    }

    let Some(mut batch) = index::filter_batch(&batch, &ctx.desc, ctx.start, ctx.stop, Some(&key))?
    else {
        return Ok(None);
    };

    if let Some(include) = &ctx.include {
        let mask = include(&batch)?;
        batch = apply_mask(&batch, &mask)?;
    }
    if let Some(exclude) = &ctx.exclude {
        let mask = exclude(&batch)?;
        let mask = not(&mask).map_err(|e| {
            FormatSnafu {
                message: format!("exclude predicate on {key}: {e}"),
            }
            .build()
        })?;
        batch = apply_mask(&batch, &mask)?;
    }
    if batch.num_rows() == 0 {
        return Ok(None);
    }

    if let Some(cutoff) = ctx.cutoff {
        match crate::gather::releases::select_latest_releases(&batch, &ctx.desc, cutoff)? {
            Some(selected) => batch = selected,
            None => return Ok(None),
        }
    }

    Ok(Some(batch))
}

fn apply_mask(batch: &RecordBatch, mask: &BooleanArray) -> Result<RecordBatch> {
    filter_record_batch(batch, mask).map_err(|e| {
        FormatSnafu {
            message: format!("applying row predicate: {e}"),
        }
        .build()
    })
}

/// Project a decoded writable-archive partition onto the descriptor's column
/// order and storage types, validating observed types along the way.
///
/// Partitions written at different times can decode with cosmetically
/// different schemas (an all-null column comes back untyped); aligning here
/// keeps cross-partition concatenation well-defined. The insert engine
/// reuses this for the read side of its merges.
pub(crate) fn align_to_storage(batch: &RecordBatch, desc: &DatasetDescriptor) -> Result<RecordBatch> {
    use arrow::datatypes::{DataType, Field, Schema};

    let mut fields = Vec::with_capacity(desc.column_order.len());
    let mut columns = Vec::with_capacity(desc.column_order.len());

    for name in &desc.column_order {
        let column = batch.column_by_name(name).with_context(|| FormatSnafu {
            message: format!(
                "stored partition for {}/{} is missing column {name:?}",
                desc.collection, desc.dataset
            ),
        })?;
        let declared = desc.column_types.get(name).with_context(|| FormatSnafu {
            message: format!(
                "descriptor for {}/{} lacks a type for column {name:?}",
                desc.collection, desc.dataset
            ),
        })?;

        let target = if declared.is_zoned_timestamp() {
            Some(DataType::Int64)
        } else {
            storage_arrow_type(declared)
        };

        // An untyped all-null column widens silently; anything else must
        // already be a subtype of the declaration.
        if column.data_type() != &DataType::Null {
            let observed = TypeTag::from_arrow(column.data_type());
            let compatible = if declared.is_zoned_timestamp() {
                matches!(
                    observed,
                    Some(TypeTag::Simple(SimpleTag::Int64))
                        | Some(TypeTag::Simple(SimpleTag::ZonedDateTime))
                )
            } else {
                observed.as_ref().is_some_and(|o| o.is_subtype_of(declared))
                    || target.as_ref() == Some(column.data_type())
            };
            ensure!(
                compatible,
                SchemaSnafu {
                    message: format!(
                        "column {name:?} in {}/{} stored as {:?}, which is not a {declared:?}",
                        desc.collection,
                        desc.dataset,
                        column.data_type()
                    ),
                }
            );
        }

        let column = match &target {
            Some(target) if column.data_type() != target => {
                arrow::compute::cast(column, target).map_err(|e| {
                    FormatSnafu {
                        message: format!("normalizing column {name:?}: {e}"),
                    }
                    .build()
                })?
            }
            _ => column.clone(),
        };

        fields.push(Field::new(name, column.data_type().clone(), true));
        columns.push(column);
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).map_err(|e| {
        FormatSnafu {
            message: format!("normalizing stored partition: {e}"),
        }
        .build()
    })
}
