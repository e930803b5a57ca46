//! Typed column reconstruction after gather.
//!
//! Decoders are schema-agnostic, so a concatenated gather result still
//! carries the stored column forms: unix-second integers for timestamps,
//! 0..3 integers for interval bounds, JSON strings for list cells, 0/1 for
//! archive booleans. This module rebuilds the typed columns the descriptor
//! promises:
//!
//! - **Writable archives**: zoned timestamp columns decode from unix seconds
//!   into the descriptor's timezone; every other column's observed type must
//!   be a subtype of its declared type, anything else being a schema error.
//! - **Read-only archives**: zoned timestamps decode the same way; the
//!   archive's free-form `type_map` then drives `"bounds"` translation into
//!   bracket notation, `"list"` JSON cells into typed list columns (nulls
//!   become missing, numeric sequences become numeric vectors of the
//!   narrowest type present), and `"bool"` 0/1 into booleans.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanBuilder, Float64Builder, Int64Array, Int64Builder, ListBuilder,
    StringArray, StringBuilder,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use snafu::prelude::*;

use crate::error::{FormatSnafu, Result, SchemaSnafu};
use crate::metadata::DatasetDescriptor;
use crate::metadata::type_tag::{TypeTag, storage_arrow_type};

/// Bracket notation for the four interval bound kinds, indexed by the stored
/// integer.
const BOUNDS_NOTATION: [&str; 4] = ["()", "[)", "(]", "[]"];

/// Reconstruct typed columns on a gathered batch.
pub fn postprocess(
    batch: &RecordBatch,
    desc: &DatasetDescriptor,
    writable: bool,
) -> Result<RecordBatch> {
    if writable {
        postprocess_writable(batch, desc)
    } else {
        postprocess_read_only(batch, desc)
    }
}

fn zoned_type(desc: &DatasetDescriptor) -> Result<DataType> {
    // Parsing validates the zone; the arrow metadata keeps the name.
    desc.tz()?;
    Ok(DataType::Timestamp(
        TimeUnit::Second,
        Some(Arc::from(desc.timezone.as_str())),
    ))
}

fn decode_zoned(name: &str, column: &ArrayRef, target: &DataType) -> Result<ArrayRef> {
    cast(column, target).map_err(|e| {
        FormatSnafu {
            message: format!("cannot decode timestamp column {name:?} from unix seconds: {e}"),
        }
        .build()
    })
}

fn postprocess_writable(batch: &RecordBatch, desc: &DatasetDescriptor) -> Result<RecordBatch> {
    let target_ts = zoned_type(desc)?;

    let mut fields = Vec::with_capacity(batch.num_columns());
    let mut columns = Vec::with_capacity(batch.num_columns());

    for (field, column) in batch.schema_ref().fields().iter().zip(batch.columns()) {
        let name = field.name();
        let declared = desc.column_types.get(name).with_context(|| FormatSnafu {
            message: format!(
                "stored partition carries column {name:?} that {}/{} does not declare",
                desc.collection, desc.dataset
            ),
        })?;

        let column = if declared.is_zoned_timestamp() {
            decode_zoned(name, column, &target_ts)?
        } else if column.data_type() == &DataType::Null {
            // A partition where this nullable column was entirely absent
            // decodes as untyped nulls; rebuild it in the declared storage
            // type.
            match storage_arrow_type(declared) {
                Some(storage) => cast(column, &storage).map_err(|e| {
                    FormatSnafu {
                        message: format!("cannot widen null column {name:?}: {e}"),
                    }
                    .build()
                })?,
                None => column.clone(),
            }
        } else {
            let observed = TypeTag::from_arrow(column.data_type());
            let compatible = observed
                .as_ref()
                .is_some_and(|tag| tag.is_subtype_of(declared));
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
            column.clone()
        };

        fields.push(Field::new(name, column.data_type().clone(), true));
        columns.push(column);
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).map_err(|e| {
        FormatSnafu {
            message: format!("rebuilding gathered batch: {e}"),
        }
        .build()
    })
}

fn postprocess_read_only(batch: &RecordBatch, desc: &DatasetDescriptor) -> Result<RecordBatch> {
    let target_ts = zoned_type(desc)?;
    let type_map = desc.type_map()?;

    let mut fields = Vec::with_capacity(batch.num_columns());
    let mut columns = Vec::with_capacity(batch.num_columns());

    for (field, column) in batch.schema_ref().fields().iter().zip(batch.columns()) {
        let name = field.name();
        let declared = desc.column_types.get(name);
        let free_form = type_map
            .as_ref()
            .and_then(|m| m.get(name))
            .map(String::as_str);

        let column = if declared.is_some_and(TypeTag::is_zoned_timestamp) {
            decode_zoned(name, column, &target_ts)?
        } else {
            match free_form {
                Some("bounds") => decode_bounds(name, column)?,
                Some("list") => decode_json_lists(name, column)?,
                Some("bool") => decode_archive_bools(name, column)?,
                _ => column.clone(),
            }
        };

        fields.push(Field::new(name, column.data_type().clone(), true));
        columns.push(column);
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).map_err(|e| {
        FormatSnafu {
            message: format!("rebuilding gathered batch: {e}"),
        }
        .build()
    })
}

fn decode_bounds(name: &str, column: &ArrayRef) -> Result<ArrayRef> {
    let values = column
        .as_any()
        .downcast_ref::<Int64Array>()
        .with_context(|| FormatSnafu {
            message: format!(
                "bounds column {name:?} stored as {:?}, expected integers",
                column.data_type()
            ),
        })?;

    let mut out: Vec<Option<&str>> = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        if values.is_null(i) {
            out.push(None);
            continue;
        }
        let raw = values.value(i);
        let notation = usize::try_from(raw)
            .ok()
            .and_then(|idx| BOUNDS_NOTATION.get(idx))
            .with_context(|| FormatSnafu {
                message: format!("bounds column {name:?} holds out-of-range value {raw}"),
            })?;
        out.push(Some(*notation));
    }
    Ok(Arc::new(StringArray::from(out)))
}

/// The narrowest list element type observed across all JSON cells.
#[derive(Clone, Copy, PartialEq)]
enum ListElement {
    Int,
    Float,
    Bool,
    Text,
}

fn decode_json_lists(name: &str, column: &ArrayRef) -> Result<ArrayRef> {
    let cells = column
        .as_any()
        .downcast_ref::<StringArray>()
        .with_context(|| FormatSnafu {
            message: format!(
                "list column {name:?} stored as {:?}, expected JSON strings",
                column.data_type()
            ),
        })?;

    let mut parsed: Vec<Option<Vec<serde_json::Value>>> = Vec::with_capacity(cells.len());
    let mut element = None::<ListElement>;

    for i in 0..cells.len() {
        if cells.is_null(i) {
            parsed.push(None);
            continue;
        }
        let values: Vec<serde_json::Value> =
            serde_json::from_str(cells.value(i)).map_err(|e| {
                FormatSnafu {
                    message: format!("list column {name:?} holds unparseable JSON: {e}"),
                }
                .build()
            })?;
        for value in values.iter().filter(|v| !v.is_null()) {
            let observed = match value {
                v if v.is_i64() || v.is_u64() => ListElement::Int,
                v if v.is_f64() => ListElement::Float,
                serde_json::Value::Bool(_) => ListElement::Bool,
                serde_json::Value::String(_) => ListElement::Text,
                other => {
                    return FormatSnafu {
                        message: format!(
                            "list column {name:?} holds unsupported element {other}"
                        ),
                    }
                    .fail();
                }
            };
            element = Some(match (element, observed) {
                (None, observed) => observed,
                (Some(current), observed) if current == observed => current,
                // Integers widen to floats; anything else is mixed.
                (Some(ListElement::Int), ListElement::Float)
                | (Some(ListElement::Float), ListElement::Int) => ListElement::Float,
                _ => {
                    return FormatSnafu {
                        message: format!("list column {name:?} mixes element types"),
                    }
                    .fail();
                }
            });
        }
        parsed.push(Some(values));
    }

    // All-null or all-empty cells: default to a float list, the common case
    // for numeric archives.
    let element = element.unwrap_or(ListElement::Float);

    macro_rules! build_lists {
        ($builder:expr, $extract:expr) => {{
            let mut builder = ListBuilder::new($builder);
            for cell in &parsed {
                match cell {
                    None => builder.append(false),
                    Some(values) => {
                        for value in values {
                            match $extract(value) {
                                Some(v) => builder.values().append_value(v),
                                None => builder.values().append_null(),
                            }
                        }
                        builder.append(true);
                    }
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }};
    }

    let array = match element {
        ListElement::Int => build_lists!(Int64Builder::new(), |v: &serde_json::Value| v.as_i64()),
        ListElement::Float => {
            build_lists!(Float64Builder::new(), |v: &serde_json::Value| v.as_f64())
        }
        ListElement::Bool => {
            build_lists!(BooleanBuilder::new(), |v: &serde_json::Value| v.as_bool())
        }
        ListElement::Text => build_lists!(StringBuilder::new(), |v: &serde_json::Value| v
            .as_str()
            .map(str::to_string)),
    };
    Ok(array)
}

fn decode_archive_bools(name: &str, column: &ArrayRef) -> Result<ArrayRef> {
    if column.data_type() == &DataType::Boolean {
        return Ok(column.clone());
    }
    let values = column
        .as_any()
        .downcast_ref::<Int64Array>()
        .with_context(|| FormatSnafu {
            message: format!(
                "bool column {name:?} stored as {:?}, expected 0/1 integers",
                column.data_type()
            ),
        })?;

    let mut builder = BooleanBuilder::with_capacity(values.len());
    for i in 0..values.len() {
        if values.is_null(i) {
            builder.append_null();
            continue;
        }
        match values.value(i) {
            0 => builder.append_value(false),
            1 => builder.append_value(true),
            other => {
                return FormatSnafu {
                    message: format!("bool column {name:?} holds non-boolean value {other}"),
                }
                .fail();
            }
        }
    }
    Ok(Arc::new(builder.finish()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Compression, FileFormat};
    use crate::metadata::type_tag::SimpleTag;
    use crate::metadata::{DatasetIndex, PartitionSize};
    use arrow::array::{Float64Array, ListArray, TimestampSecondArray};
    use chrono::TimeZone;
    use chrono::Utc;
    use std::collections::BTreeMap;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn descriptor(writable: bool) -> DatasetDescriptor {
        let mut column_types = BTreeMap::new();
        column_types.insert(
            "target_start".to_string(),
            TypeTag::simple(SimpleTag::ZonedDateTime),
        );
        column_types.insert(
            "price".to_string(),
            TypeTag::simple(SimpleTag::AbstractFloat),
        );
        let mut details = BTreeMap::new();
        if !writable {
            details.insert(
                "type_map".to_string(),
                r#"{"bounds": "bounds", "flags": "list", "active": "bool"}"#.to_string(),
            );
        }
        DatasetDescriptor {
            collection: "c".to_string(),
            dataset: "d".to_string(),
            column_order: vec!["target_start".to_string(), "price".to_string()],
            column_types,
            timezone: "America/New_York".to_string(),
            index: DatasetIndex::TimeSeries {
                key: "target_start".to_string(),
                partition_size: PartitionSize::Day,
            },
            file_format: FileFormat::Csv,
            compression: Some(Compression::Gz),
            last_modified: Utc.timestamp_opt(0, 0).single().expect("epoch"),
            details: (!details.is_empty()).then_some(details),
        }
    }

    #[test]
    fn writable_archives_decode_zoned_timestamps() -> TestResult {
        let desc = descriptor(true);
        let schema = Arc::new(Schema::new(vec![
            Field::new("target_start", DataType::Int64, false),
            Field::new("price", DataType::Float64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1_577_836_800_i64])),
                Arc::new(Float64Array::from(vec![9.5])),
            ],
        )?;

        let out = postprocess(&batch, &desc, true)?;
        let ts = out
            .column(0)
            .as_any()
            .downcast_ref::<TimestampSecondArray>()
            .expect("timestamps");
        assert_eq!(ts.value(0), 1_577_836_800);
        assert_eq!(
            out.schema_ref().field(0).data_type(),
            &DataType::Timestamp(TimeUnit::Second, Some("America/New_York".into()))
        );
        Ok(())
    }

    #[test]
    fn writable_archives_reject_incompatible_observed_types() {
        let desc = descriptor(true);
        let schema = Arc::new(Schema::new(vec![
            Field::new("target_start", DataType::Int64, false),
            Field::new("price", DataType::Utf8, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![0_i64])),
                Arc::new(StringArray::from(vec!["not a float"])),
            ],
        )
        .expect("valid batch");

        let err = postprocess(&batch, &desc, true).expect_err("type mismatch");
        assert!(matches!(err, crate::error::Error::Schema { .. }));
    }

    #[test]
    fn read_only_archives_translate_bounds_lists_and_bools() -> TestResult {
        let desc = descriptor(false);
        let schema = Arc::new(Schema::new(vec![
            Field::new("bounds", DataType::Int64, false),
            Field::new("flags", DataType::Utf8, true),
            Field::new("active", DataType::Int64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![0, 1, 2, 3])),
                Arc::new(StringArray::from(vec![
                    Some("[1,2]"),
                    None,
                    Some("[3,null]"),
                    Some("[]"),
                ])),
                Arc::new(Int64Array::from(vec![1, 0, 1, 0])),
            ],
        )?;

        let out = postprocess(&batch, &desc, false)?;

        let bounds = out
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("bounds");
        assert_eq!(
            (0..4).map(|i| bounds.value(i)).collect::<Vec<_>>(),
            vec!["()", "[)", "(]", "[]"]
        );

        let flags = out
            .column(1)
            .as_any()
            .downcast_ref::<ListArray>()
            .expect("flags");
        assert!(flags.is_null(1));
        let first = flags.value(0);
        let first = first.as_any().downcast_ref::<Int64Array>().expect("ints");
        assert_eq!(first.values(), &[1, 2]);
        let third = flags.value(2);
        let third = third.as_any().downcast_ref::<Int64Array>().expect("ints");
        assert!(third.is_null(1));

        let active = out
            .column(2)
            .as_any()
            .downcast_ref::<arrow::array::BooleanArray>()
            .expect("bools");
        assert!(active.value(0));
        assert!(!active.value(1));
        Ok(())
    }

    #[test]
    fn mixed_numeric_lists_widen_to_floats() -> TestResult {
        let desc = descriptor(false);
        let schema = Arc::new(Schema::new(vec![Field::new("flags", DataType::Utf8, true)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(StringArray::from(vec!["[1, 2.5]"]))],
        )?;

        let out = postprocess(&batch, &desc, false)?;
        let flags = out
            .column(0)
            .as_any()
            .downcast_ref::<ListArray>()
            .expect("flags");
        let values = flags.value(0);
        let values = values
            .as_any()
            .downcast_ref::<arrow::array::Float64Array>()
            .expect("floats");
        assert_eq!(values.values(), &[1.0, 2.5]);
        Ok(())
    }

    #[test]
    fn out_of_range_bounds_are_corrupt() {
        let desc = descriptor(false);
        let schema = Arc::new(Schema::new(vec![Field::new("bounds", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(vec![7_i64]))],
        )
        .expect("valid batch");

        let err = postprocess(&batch, &desc, false).expect_err("bad bounds");
        assert!(matches!(err, crate::error::Error::Format { .. }));
    }
}
