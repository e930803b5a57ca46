//! "Latest release up to cutoff" selection.
//!
//! Read-only archives can store several releases of the same logical row,
//! distinguished by a `release_date` column. Evaluating such a dataset as of
//! an external instant (the cutoff) means keeping, per logical row, the
//! single release with the greatest `release_date` not exceeding the cutoff,
//! and dropping logical rows with no qualifying release.
//!
//! A logical row is identified by the archive's superkey minus the
//! `release_date` and `tag` columns. Selection works on the stored form of
//! the table (before post-processing), returns row indices into it, and
//! never materializes per-group intermediate tables: group keys are
//! converted once with [`RowConverter`] and the winner per group is tracked
//! in a single map pass.

use std::collections::HashMap;

use arrow::array::{Array, Int64Array, UInt32Array};
use arrow::compute::take_record_batch;
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, SortField};
use chrono::{DateTime, Utc};
use log::debug;

use crate::error::{FormatSnafu, Result};
use crate::metadata::DatasetDescriptor;

/// Column that orders releases of a logical row.
pub const RELEASE_DATE_COLUMN: &str = "release_date";

/// Superkey column excluded from grouping alongside `release_date`.
pub const TAG_COLUMN: &str = "tag";

/// Apply the cutoff selection to a stored batch.
///
/// Returns `None` when the batch is unaffected (the archive declares no
/// superkey) or when no row survives. The surviving rows keep their stored
/// order.
pub fn select_latest_releases(
    batch: &RecordBatch,
    desc: &DatasetDescriptor,
    cutoff: DateTime<Utc>,
) -> Result<Option<RecordBatch>> {
    let Some(superkey) = desc.superkey() else {
        debug!(
            "{}/{} declares no superkey; cutoff selection skipped",
            desc.collection, desc.dataset
        );
        return Ok(Some(batch.clone()));
    };

    let schema = batch.schema_ref();
    let release_idx = schema.index_of(RELEASE_DATE_COLUMN).map_err(|_| {
        FormatSnafu {
            message: format!(
                "{}/{} declares a superkey but stores no {RELEASE_DATE_COLUMN} column",
                desc.collection, desc.dataset
            ),
        }
        .build()
    })?;

    let release_dates = batch
        .column(release_idx)
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| {
            FormatSnafu {
                message: format!(
                    "{RELEASE_DATE_COLUMN} in {}/{} stored as {:?}, expected unix-second integers",
                    desc.collection,
                    desc.dataset,
                    batch.column(release_idx).data_type()
                ),
            }
            .build()
        })?;

    // Group by superkey minus {release_date, tag}.
    let group_columns: Vec<&str> = superkey
        .iter()
        .map(String::as_str)
        .filter(|c| *c != RELEASE_DATE_COLUMN && *c != TAG_COLUMN)
        .collect();

    let mut fields = Vec::with_capacity(group_columns.len());
    let mut arrays = Vec::with_capacity(group_columns.len());
    for name in &group_columns {
        let idx = schema.index_of(name).map_err(|_| {
            FormatSnafu {
                message: format!(
                    "superkey column {name:?} missing from {}/{}",
                    desc.collection, desc.dataset
                ),
            }
            .build()
        })?;
        let column = batch.column(idx);
        fields.push(SortField::new(column.data_type().clone()));
        arrays.push(column.clone());
    }

    let converter = RowConverter::new(fields).map_err(|e| {
        FormatSnafu {
            message: format!("cannot build superkey rows: {e}"),
        }
        .build()
    })?;
    let rows = converter.convert_columns(&arrays).map_err(|e| {
        FormatSnafu {
            message: format!("cannot build superkey rows: {e}"),
        }
        .build()
    })?;

    let cutoff_secs = cutoff.timestamp();
    let mut winners: HashMap<Vec<u8>, (i64, u32)> = HashMap::new();
    for row in 0..batch.num_rows() {
        if release_dates.is_null(row) {
            continue;
        }
        let released = release_dates.value(row);
        if released > cutoff_secs {
            continue;
        }
        let key = rows.row(row).as_ref().to_vec();
        match winners.get_mut(&key) {
            Some((best, index)) if released > *best => {
                *best = released;
                *index = row as u32;
            }
            Some(_) => {}
            None => {
                winners.insert(key, (released, row as u32));
            }
        }
    }

    if winners.is_empty() {
        return Ok(None);
    }

    let mut indices: Vec<u32> = winners.into_values().map(|(_, index)| index).collect();
    indices.sort_unstable();

    let selected = take_record_batch(batch, &UInt32Array::from(indices)).map_err(|e| {
        FormatSnafu {
            message: format!("cutoff selection on {}/{}: {e}", desc.collection, desc.dataset),
        }
        .build()
    })?;
    Ok(Some(selected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Compression, FileFormat};
    use crate::metadata::type_tag::{SimpleTag, TypeTag};
    use crate::metadata::{DatasetIndex, PartitionSize};
    use arrow::array::StringArray;
    use arrow::datatypes::{DataType, Field, Schema};
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn archive_descriptor() -> DatasetDescriptor {
        let mut details = BTreeMap::new();
        details.insert(
            "superkey".to_string(),
            "release_date,target_start,target_end,node_name,tag".to_string(),
        );
        DatasetDescriptor {
            collection: "c".to_string(),
            dataset: "d".to_string(),
            column_order: vec![
                "release_date".to_string(),
                "target_start".to_string(),
                "target_end".to_string(),
                "node_name".to_string(),
                "tag".to_string(),
            ],
            column_types: BTreeMap::new(),
            timezone: "UTC".to_string(),
            index: DatasetIndex::TimeSeries {
                key: "target_start".to_string(),
                partition_size: PartitionSize::Day,
            },
            file_format: FileFormat::Csv,
            compression: Some(Compression::Gz),
            last_modified: Utc.timestamp_opt(0, 0).single().expect("epoch"),
            details: Some(details),
        }
    }

    /// Three releases of one logical row (same target window and node),
    /// with differing tags, plus an unrelated logical row.
    fn release_batch(r1: i64, r2: i64, r3: i64) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("release_date", DataType::Int64, false),
            Field::new("target_start", DataType::Int64, false),
            Field::new("target_end", DataType::Int64, false),
            Field::new("node_name", DataType::Utf8, false),
            Field::new("tag", DataType::Utf8, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![r1, r2, r3, r1])),
                Arc::new(Int64Array::from(vec![100, 100, 100, 100])),
                Arc::new(Int64Array::from(vec![200, 200, 200, 200])),
                Arc::new(StringArray::from(vec!["n1", "n1", "n1", "n2"])),
                Arc::new(StringArray::from(vec!["t1", "t2", "t3", "t1"])),
            ],
        )
        .expect("valid batch")
    }

    fn released(batch: &RecordBatch, node: &str) -> Vec<i64> {
        let nodes = batch
            .column(3)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("nodes");
        let dates = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("dates");
        (0..batch.num_rows())
            .filter(|i| nodes.value(*i) == node)
            .map(|i| dates.value(i))
            .collect()
    }

    #[test]
    fn cutoff_between_releases_selects_the_earlier_one() -> TestResult {
        let desc = archive_descriptor();
        let (r1, r2, r3) = (1_000, 2_000, 3_000);
        let batch = release_batch(r1, r2, r3);

        let cutoff = Utc.timestamp_opt(1_500, 0).single().expect("ts");
        let selected = select_latest_releases(&batch, &desc, cutoff)?.expect("rows survive");
        assert_eq!(released(&selected, "n1"), vec![r1]);
        Ok(())
    }

    #[test]
    fn cutoff_at_or_after_the_last_release_selects_it() -> TestResult {
        let desc = archive_descriptor();
        let (r1, r2, r3) = (1_000, 2_000, 3_000);
        let batch = release_batch(r1, r2, r3);

        let cutoff = Utc.timestamp_opt(3_000, 0).single().expect("ts");
        let selected = select_latest_releases(&batch, &desc, cutoff)?.expect("rows survive");
        assert_eq!(released(&selected, "n1"), vec![r3]);
        Ok(())
    }

    #[test]
    fn cutoff_before_every_release_drops_the_group() -> TestResult {
        let desc = archive_descriptor();
        let batch = release_batch(1_000, 2_000, 3_000);

        let cutoff = Utc.timestamp_opt(500, 0).single().expect("ts");
        assert!(select_latest_releases(&batch, &desc, cutoff)?.is_none());
        Ok(())
    }

    #[test]
    fn groups_are_independent_and_order_is_stable() -> TestResult {
        let desc = archive_descriptor();
        let batch = release_batch(1_000, 2_000, 3_000);

        let cutoff = Utc.timestamp_opt(2_500, 0).single().expect("ts");
        let selected = select_latest_releases(&batch, &desc, cutoff)?.expect("rows survive");
        // n1 keeps its r2 release, n2 its only one; stored order preserved.
        assert_eq!(selected.num_rows(), 2);
        assert_eq!(released(&selected, "n1"), vec![2_000]);
        assert_eq!(released(&selected, "n2"), vec![1_000]);
        Ok(())
    }

    #[test]
    fn archives_without_a_superkey_pass_through() -> TestResult {
        let mut desc = archive_descriptor();
        desc.details = None;
        let batch = release_batch(1_000, 2_000, 3_000);

        let cutoff = Utc.timestamp_opt(0, 0).single().expect("ts");
        let out = select_latest_releases(&batch, &desc, cutoff)?.expect("pass-through");
        assert_eq!(out.num_rows(), batch.num_rows());
        Ok(())
    }

    #[test]
    fn missing_release_date_column_is_corrupt() {
        let desc = archive_descriptor();
        let schema = Arc::new(Schema::new(vec![Field::new(
            "target_start",
            DataType::Int64,
            false,
        )]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(vec![1_i64]))],
        )
        .expect("valid batch");

        let err = select_latest_releases(
            &batch,
            &desc,
            Utc.timestamp_opt(0, 0).single().expect("ts"),
        )
        .expect_err("missing column");
        assert!(matches!(err, crate::error::Error::Format { .. }));
    }
}
