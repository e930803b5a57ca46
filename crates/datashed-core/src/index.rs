//! Partition index: mapping between range predicates and object keys.
//!
//! Datasets are partitioned by the UTC-floor of their index column at a
//! configured granularity. Partition ids are the unix-second count of the
//! floored boundary, and object keys are deterministic:
//!
//! ```text
//! <prefix>/<collection>/<dataset>/year=<YYYY>/<unix_seconds>.<ext>
//! ```
//!
//! Three families of operations live here:
//!
//! - Read-side enumeration: [`keys_for_range`] lists every partition key
//!   intersecting a closed range, ascending.
//! - Read-side filtering: [`filter_batch`] applies the range predicate to a
//!   fetched object, using the source key as a hint so interior partitions
//!   are kept whole and only boundary partitions pay for row-level work.
//! - Write-side grouping: [`partition_batch`] splits an input batch into the
//!   partitions its rows belong to.
//!
//! Bucket boundaries are monotonic in time. Hour/day granularities are fixed
//! width; month/year step by calendar arithmetic, so boundary enumeration
//! always walks `floor(start) ..= floor(stop)` rather than assuming a fixed
//! stride.

use std::collections::BTreeMap;

use arrow::array::{
    Array, Int64Array, TimestampMicrosecondArray, TimestampMillisecondArray,
    TimestampNanosecondArray, TimestampSecondArray, UInt32Array,
};
use arrow::compute::kernels::{boolean as boolean_kernels, cmp as cmp_kernels};
use arrow::compute::{filter_record_batch, take_record_batch};
use arrow::datatypes::{DataType, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Datelike, Months, TimeDelta, TimeZone, Timelike, Utc};
use snafu::prelude::*;

use crate::codec;
use crate::error::{ArgumentSnafu, FormatSnafu, Result, SchemaSnafu};
use crate::metadata::{DatasetDescriptor, PartitionSize, join_key};

/// Floor a UTC instant to its partition boundary.
pub fn floor_partition(ts: DateTime<Utc>, size: PartitionSize) -> DateTime<Utc> {
    let (y, m, d) = (ts.year(), ts.month(), ts.day());
    let floored = match size {
        PartitionSize::Hour => Utc.with_ymd_and_hms(y, m, d, ts.hour(), 0, 0),
        PartitionSize::Day => Utc.with_ymd_and_hms(y, m, d, 0, 0, 0),
        PartitionSize::Month => Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0),
        PartitionSize::Year => Utc.with_ymd_and_hms(y, 1, 1, 0, 0, 0),
    };
    floored.single().expect("floored UTC datetime is unambiguous")
}

/// The boundary immediately after `boundary`.
fn next_partition(boundary: DateTime<Utc>, size: PartitionSize) -> DateTime<Utc> {
    match size {
        PartitionSize::Hour => boundary + TimeDelta::hours(1),
        PartitionSize::Day => boundary + TimeDelta::days(1),
        PartitionSize::Month => boundary
            .checked_add_months(Months::new(1))
            .expect("month arithmetic in range"),
        PartitionSize::Year => boundary
            .checked_add_months(Months::new(12))
            .expect("year arithmetic in range"),
    }
}

/// Every partition boundary intersecting the closed range `[start, stop]`,
/// ascending.
pub fn partition_boundaries(
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
    size: PartitionSize,
) -> Result<Vec<DateTime<Utc>>> {
    ensure!(
        start <= stop,
        ArgumentSnafu {
            message: format!("range start {start} is after stop {stop}"),
        }
    );

    let last = floor_partition(stop, size);
    let mut boundaries = Vec::new();
    let mut boundary = floor_partition(start, size);
    while boundary <= last {
        boundaries.push(boundary);
        boundary = next_partition(boundary, size);
    }
    Ok(boundaries)
}

/// The object key of the partition at `boundary`.
pub fn object_key(
    prefix: &str,
    desc: &DatasetDescriptor,
    boundary: DateTime<Utc>,
) -> String {
    let ext = codec::extension(desc.file_format, desc.compression);
    join_key([
        prefix,
        &desc.collection,
        &desc.dataset,
        &format!("year={}", boundary.year()),
        &format!("{}.{}", boundary.timestamp(), ext),
    ])
}

/// Object keys of every partition intersecting `[start, stop]`, ascending by
/// partition id.
pub fn keys_for_range(
    prefix: &str,
    desc: &DatasetDescriptor,
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
) -> Result<Vec<String>> {
    let boundaries = partition_boundaries(start, stop, desc.partition_size())?;
    Ok(boundaries
        .into_iter()
        .map(|b| object_key(prefix, desc, b))
        .collect())
}

/// Extract the partition id (unix seconds) from an object key.
pub fn partition_of_key(key: &str) -> Option<i64> {
    let name = key.rsplit('/').next()?;
    let stem = name.split('.').next()?;
    stem.parse().ok()
}

/// Apply the closed range `[start, stop]` to a fetched partition.
///
/// `source_key` is an optimization hint: only the boundary partitions (those
/// whose floor equals the floor of `start` or `stop`) need row-level
/// filtering. Interior partitions are returned whole and out-of-range
/// partitions become `None`. Row filtering operates on the stored form of the
/// index column (unix-second integers); a partition without that column is
/// corrupt.
pub fn filter_batch(
    batch: &RecordBatch,
    desc: &DatasetDescriptor,
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
    source_key: Option<&str>,
) -> Result<Option<RecordBatch>> {
    let size = desc.partition_size();
    let first = floor_partition(start, size).timestamp();
    let last = floor_partition(stop, size).timestamp();

    if let Some(partition) = source_key.and_then(partition_of_key) {
        if partition < first || partition > last {
            return Ok(None);
        }
        if partition != first && partition != last {
            return Ok(Some(batch.clone()));
        }
    }

    let key = desc.index_key();
    let idx = batch
        .schema_ref()
        .index_of(key)
        .map_err(|_| {
            FormatSnafu {
                message: format!(
                    "partition for {}/{} is missing index column {key:?}",
                    desc.collection, desc.dataset
                ),
            }
            .build()
        })?;

    let column = batch.column(idx);
    let values = column
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| {
            FormatSnafu {
                message: format!(
                    "index column {key:?} in {}/{} stored as {:?}, expected unix-second integers",
                    desc.collection,
                    desc.dataset,
                    column.data_type()
                ),
            }
            .build()
        })?;

    let lo = Int64Array::new_scalar(start.timestamp());
    let hi = Int64Array::new_scalar(stop.timestamp());
    let ge = cmp_kernels::gt_eq(values, &lo).map_err(|e| {
        FormatSnafu {
            message: format!("range filter on {key:?}: {e}"),
        }
        .build()
    })?;
    let le = cmp_kernels::lt_eq(values, &hi).map_err(|e| {
        FormatSnafu {
            message: format!("range filter on {key:?}: {e}"),
        }
        .build()
    })?;
    let mask = boolean_kernels::and(&ge, &le).map_err(|e| {
        FormatSnafu {
            message: format!("range filter on {key:?}: {e}"),
        }
        .build()
    })?;

    let filtered = filter_record_batch(batch, &mask).map_err(|e| {
        FormatSnafu {
            message: format!("range filter on {key:?}: {e}"),
        }
        .build()
    })?;

    Ok((filtered.num_rows() > 0).then_some(filtered))
}

/// Group the rows of an input batch by partition boundary, ascending.
///
/// The index column must be a zoned timestamp; anything else is a schema
/// error against the caller's input. Row order within each partition follows
/// the input.
pub fn partition_batch(
    desc: &DatasetDescriptor,
    batch: &RecordBatch,
) -> Result<Vec<(DateTime<Utc>, RecordBatch)>> {
    let key = desc.index_key();
    let idx = batch.schema_ref().index_of(key).map_err(|_| {
        SchemaSnafu {
            message: format!("input table is missing index column {key:?}"),
        }
        .build()
    })?;

    let column = batch.column(idx);
    let seconds = index_column_seconds(key, column)?;

    let size = desc.partition_size();
    let mut groups: BTreeMap<DateTime<Utc>, Vec<u32>> = BTreeMap::new();
    for (row, secs) in seconds.into_iter().enumerate() {
        let ts = Utc
            .timestamp_opt(secs, 0)
            .single()
            .with_context(|| SchemaSnafu {
                message: format!("index column {key:?} value {secs} is out of range"),
            })?;
        groups
            .entry(floor_partition(ts, size))
            .or_default()
            .push(row as u32);
    }

    groups
        .into_iter()
        .map(|(boundary, rows)| {
            let indices = UInt32Array::from(rows);
            let part = take_record_batch(batch, &indices).map_err(|e| {
                SchemaSnafu {
                    message: format!("partitioning input table: {e}"),
                }
                .build()
            })?;
            Ok((boundary, part))
        })
        .collect()
}

/// Unix-second values of a zoned timestamp column, rejecting nulls and
/// non-zoned types.
fn index_column_seconds(key: &str, column: &dyn Array) -> Result<Vec<i64>> {
    let DataType::Timestamp(unit, Some(_)) = column.data_type() else {
        return SchemaSnafu {
            message: format!(
                "index column {key:?} must be a zoned timestamp, found {:?}",
                column.data_type()
            ),
        }
        .fail();
    };

    ensure!(
        column.null_count() == 0,
        SchemaSnafu {
            message: format!("index column {key:?} contains nulls"),
        }
    );

    let raw: Vec<i64> = match unit {
        TimeUnit::Second => {
            let arr = column
                .as_any()
                .downcast_ref::<TimestampSecondArray>()
                .expect("second timestamps");
            arr.values().iter().copied().collect()
        }
        TimeUnit::Millisecond => {
            let arr = column
                .as_any()
                .downcast_ref::<TimestampMillisecondArray>()
                .expect("millisecond timestamps");
            arr.values().iter().map(|v| v.div_euclid(1_000)).collect()
        }
        TimeUnit::Microsecond => {
            let arr = column
                .as_any()
                .downcast_ref::<TimestampMicrosecondArray>()
                .expect("microsecond timestamps");
            arr.values().iter().map(|v| v.div_euclid(1_000_000)).collect()
        }
        TimeUnit::Nanosecond => {
            let arr = column
                .as_any()
                .downcast_ref::<TimestampNanosecondArray>()
                .expect("nanosecond timestamps");
            arr.values()
                .iter()
                .map(|v| v.div_euclid(1_000_000_000))
                .collect()
        }
    };
    Ok(raw)
}
