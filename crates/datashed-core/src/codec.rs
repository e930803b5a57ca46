//! Format and compression codec registry.
//!
//! This module owns the closed mapping between the warehouse's on-disk
//! formats ([`FileFormat`]: CSV, Arrow IPC, Parquet) and compressions
//! ([`Compression`]: bzip2, gzip, lz4, zstd) and the byte-level encode/decode
//! entry points the pipelines use:
//!
//! - [`encode_batch`] / [`decode_batch`]: whole-object conversion between a
//!   `RecordBatch` and the stored bytes, compressing/decompressing as asked.
//! - [`detect_from_filename`]: extension sniffing for object keys, used by
//!   the file cache to know what a cached artifact still carries.
//! - [`extension`]: the canonical suffix for a (format, compression) pair,
//!   used when building object keys.
//!
//! Decoders are deliberately schema-agnostic. A CSV object's unix-second
//! timestamp columns come back as plain integers and JSON-encoded list cells
//! come back as strings; reconstructing typed columns is the gather engine's
//! post-processing step, driven by the dataset descriptor.

use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::compute::concat_batches;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{FormatSnafu, Result};

pub mod compression;

/// Supported on-disk file formats for data objects.
///
/// JSON layout example: `"file_format": "CSV"`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FileFormat {
    /// Comma-separated text with a header row.
    #[default]
    #[serde(rename = "CSV")]
    Csv,
    /// Arrow IPC file format.
    #[serde(rename = "ARROW")]
    Arrow,
    /// Apache Parquet columnar format.
    #[serde(rename = "PARQUET")]
    Parquet,
}

impl FileFormat {
    /// Canonical filename extension (no leading dot).
    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Arrow => "arrow",
            FileFormat::Parquet => "parquet",
        }
    }

    /// Parse a lowercase extension or URI token.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "csv" => Some(FileFormat::Csv),
            "arrow" => Some(FileFormat::Arrow),
            "parquet" => Some(FileFormat::Parquet),
            _ => None,
        }
    }
}

/// Supported compressions for data objects.
///
/// JSON layout example: `"compression": "GZ"`; the absent case is stored as
/// the literal string `"nothing"` and modeled as `Option<Compression>` here.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Compression {
    /// bzip2.
    #[serde(rename = "BZ2")]
    Bz2,
    /// gzip.
    #[serde(rename = "GZ")]
    Gz,
    /// LZ4 frame format.
    #[serde(rename = "LZ4")]
    Lz4,
    /// Zstandard.
    #[serde(rename = "ZST")]
    Zst,
}

impl Compression {
    /// Canonical filename extension (no leading dot).
    pub fn extension(self) -> &'static str {
        match self {
            Compression::Bz2 => "bz2",
            Compression::Gz => "gz",
            Compression::Lz4 => "lz4",
            Compression::Zst => "zst",
        }
    }

    /// Parse a lowercase extension or URI token.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "bz2" => Some(Compression::Bz2),
            "gz" => Some(Compression::Gz),
            "lz4" => Some(Compression::Lz4),
            "zst" => Some(Compression::Zst),
            _ => None,
        }
    }
}

/// The canonical suffix for a (format, compression) pair, without a leading
/// dot: `extension(Csv, Some(Gz))` is `"csv.gz"`.
pub fn extension(format: FileFormat, compression: Option<Compression>) -> String {
    match compression {
        Some(c) => format!("{}.{}", format.extension(), c.extension()),
        None => format.extension().to_string(),
    }
}

/// Sniff the format and compression of a filename from its trailing
/// extensions.
///
/// At most two extensions are examined, lowercased. An innermost known
/// format wins outright; a known compression looks one extension further for
/// the format. Two stacked compression extensions are corrupt by definition
/// and fail with a format error.
pub fn detect_from_filename(name: &str) -> Result<(Option<FileFormat>, Option<Compression>)> {
    let lower = name.to_ascii_lowercase();
    let mut parts = lower.rsplit('.');

    let last = match parts.next() {
        Some(ext) if lower.contains('.') => ext,
        _ => return Ok((None, None)),
    };

    if let Some(format) = FileFormat::from_token(last) {
        return Ok((Some(format), None));
    }

    let Some(comp) = Compression::from_token(last) else {
        return Ok((None, None));
    };

    match parts.next() {
        Some(inner) if Compression::from_token(inner).is_some() => FormatSnafu {
            message: format!("stacked compression extensions in {name:?}"),
        }
        .fail(),
        Some(inner) => Ok((FileFormat::from_token(inner), Some(comp))),
        None => Ok((None, Some(comp))),
    }
}

/// Encode a batch into stored object bytes.
///
/// CSV list-typed columns are JSON-encoded cell by cell before writing; the
/// other formats carry lists natively.
pub fn encode_batch(
    batch: &RecordBatch,
    format: FileFormat,
    compression: Option<Compression>,
) -> Result<Bytes> {
    let raw = match format {
        FileFormat::Csv => encode_csv(batch)?,
        FileFormat::Arrow => encode_arrow(batch)?,
        FileFormat::Parquet => encode_parquet(batch)?,
    };

    let out = match compression {
        Some(c) => compression::compress(&raw, c)?,
        None => raw,
    };
    Ok(Bytes::from(out))
}

/// Decode stored object bytes into a single batch, decompressing first when
/// asked. Corrupt framing in either stage is a format error.
pub fn decode_batch(
    data: &[u8],
    format: FileFormat,
    compression: Option<Compression>,
) -> Result<RecordBatch> {
    let raw;
    let data = match compression {
        Some(c) => {
            raw = compression::decompress(data, c)?;
            raw.as_slice()
        }
        None => data,
    };

    match format {
        FileFormat::Csv => decode_csv(data),
        FileFormat::Arrow => decode_arrow(data),
        FileFormat::Parquet => decode_parquet(data),
    }
}

fn format_err(what: &str, err: impl std::fmt::Display) -> crate::error::Error {
    FormatSnafu {
        message: format!("{what}: {err}"),
    }
    .build()
}

fn encode_csv(batch: &RecordBatch) -> Result<Vec<u8>> {
    let batch = json_encode_list_columns(batch)?;
    let mut buf = Vec::new();
    {
        let mut writer = arrow_csv::WriterBuilder::new()
            .with_header(true)
            .build(&mut buf);
        writer
            .write(&batch)
            .map_err(|e| format_err("csv encode", e))?;
    }
    Ok(buf)
}

fn decode_csv(data: &[u8]) -> Result<RecordBatch> {
    let format = arrow_csv::reader::Format::default().with_header(true);
    let (schema, _) = format
        .infer_schema(Cursor::new(data), None)
        .map_err(|e| format_err("csv schema inference", e))?;
    let schema = Arc::new(schema);

    let reader = arrow_csv::ReaderBuilder::new(schema.clone())
        .with_format(format)
        .build(Cursor::new(data))
        .map_err(|e| format_err("csv decode", e))?;

    let batches: Vec<RecordBatch> = reader
        .collect::<Result<_, _>>()
        .map_err(|e| format_err("csv decode", e))?;
    concat_batches(&schema, &batches).map_err(|e| format_err("csv concat", e))
}

fn encode_arrow(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut writer = arrow_ipc::writer::FileWriter::try_new(&mut buf, batch.schema_ref())
            .map_err(|e| format_err("arrow encode", e))?;
        writer.write(batch).map_err(|e| format_err("arrow encode", e))?;
        writer.finish().map_err(|e| format_err("arrow encode", e))?;
    }
    Ok(buf)
}

fn decode_arrow(data: &[u8]) -> Result<RecordBatch> {
    let reader = arrow_ipc::reader::FileReader::try_new(Cursor::new(data), None)
        .map_err(|e| format_err("arrow decode", e))?;
    let schema = reader.schema();
    let batches: Vec<RecordBatch> = reader
        .collect::<Result<_, _>>()
        .map_err(|e| format_err("arrow decode", e))?;
    concat_batches(&schema, &batches).map_err(|e| format_err("arrow concat", e))
}

fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut writer = parquet::arrow::arrow_writer::ArrowWriter::try_new(
        &mut buf,
        batch.schema(),
        None,
    )
    .map_err(|e| format_err("parquet encode", e))?;
    writer.write(batch).map_err(|e| format_err("parquet encode", e))?;
    writer.close().map_err(|e| format_err("parquet encode", e))?;
    Ok(buf)
}

fn decode_parquet(data: &[u8]) -> Result<RecordBatch> {
    let builder =
        parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder::try_new(Bytes::copy_from_slice(data))
            .map_err(|e| format_err("parquet decode", e))?;
    let schema = builder.schema().clone();
    let reader = builder.build().map_err(|e| format_err("parquet decode", e))?;
    let batches: Vec<RecordBatch> = reader
        .collect::<Result<_, _>>()
        .map_err(|e| format_err("parquet decode", e))?;
    concat_batches(&schema, &batches).map_err(|e| format_err("parquet concat", e))
}

/// Rewrite every list-typed column as a Utf8 column of JSON-encoded cells.
///
/// Null slots stay null. Element types are limited to what the metadata type
/// vocabulary can express in list columns; anything else is a format error.
fn json_encode_list_columns(batch: &RecordBatch) -> Result<RecordBatch> {
    if !batch
        .schema_ref()
        .fields()
        .iter()
        .any(|f| matches!(f.data_type(), DataType::List(_)))
    {
        return Ok(batch.clone());
    }

    let mut fields = Vec::with_capacity(batch.num_columns());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(batch.num_columns());

    for (field, column) in batch.schema_ref().fields().iter().zip(batch.columns()) {
        if let DataType::List(_) = field.data_type() {
            let encoded = json_encode_list_array(field.name(), column)?;
            fields.push(Field::new(field.name(), DataType::Utf8, true));
            columns.push(Arc::new(encoded));
        } else {
            fields.push(field.as_ref().clone());
            columns.push(column.clone());
        }
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .map_err(|e| format_err("csv list encode", e))
}

fn json_encode_list_array(name: &str, column: &ArrayRef) -> Result<StringArray> {
    use arrow::array::ListArray;

    let list = column
        .as_any()
        .downcast_ref::<ListArray>()
        .ok_or_else(|| format_err("csv list encode", format!("column {name} is not a list")))?;

    let mut cells: Vec<Option<String>> = Vec::with_capacity(list.len());
    for i in 0..list.len() {
        if list.is_null(i) {
            cells.push(None);
            continue;
        }
        let values = list.value(i);
        let json = json_values(name, &values)?;
        cells.push(Some(
            serde_json::to_string(&json)
                .map_err(|e| format_err("csv list encode", e))?,
        ));
    }
    Ok(StringArray::from(cells))
}

fn json_values(name: &str, values: &ArrayRef) -> Result<Vec<serde_json::Value>> {
    let mut out = Vec::with_capacity(values.len());
    match values.data_type() {
        DataType::Int64 => {
            let arr = values
                .as_any()
                .downcast_ref::<Int64Array>()
                .expect("data type checked");
            for i in 0..arr.len() {
                out.push(match arr.is_null(i) {
                    true => serde_json::Value::Null,
                    false => serde_json::Value::from(arr.value(i)),
                });
            }
        }
        DataType::Float64 => {
            let arr = values
                .as_any()
                .downcast_ref::<Float64Array>()
                .expect("data type checked");
            for i in 0..arr.len() {
                out.push(match arr.is_null(i) {
                    true => serde_json::Value::Null,
                    false => serde_json::Value::from(arr.value(i)),
                });
            }
        }
        DataType::Utf8 => {
            let arr = values
                .as_any()
                .downcast_ref::<StringArray>()
                .expect("data type checked");
            for i in 0..arr.len() {
                out.push(match arr.is_null(i) {
                    true => serde_json::Value::Null,
                    false => serde_json::Value::from(arr.value(i)),
                });
            }
        }
        DataType::Boolean => {
            let arr = values
                .as_any()
                .downcast_ref::<BooleanArray>()
                .expect("data type checked");
            for i in 0..arr.len() {
                out.push(match arr.is_null(i) {
                    true => serde_json::Value::Null,
                    false => serde_json::Value::from(arr.value(i)),
                });
            }
        }
        other => {
            return FormatSnafu {
                message: format!("unsupported list element type {other:?} in column {name}"),
            }
            .fail();
        }
    }
    Ok(out)
}
