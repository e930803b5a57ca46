//! Dataset descriptor model.
//!
//! Every dataset stores a JSON descriptor next to its data objects (under
//! [`METADATA_KEY`]) describing schema, partition index, codec, and timezone.
//! The wire layout is a stable contract:
//!
//! ```json
//! {
//!   "column_order": ["target_start", "node_name", "price"],
//!   "column_types": {"target_start": "ZonedDateTime", ...},
//!   "timezone": "America/New_York",
//!   "index": {"_type": "TimeSeriesIndex",
//!             "_attr": {"key": "target_start", "partition_size": "DAY"}},
//!   "file_format": "CSV",
//!   "compression": "GZ",
//!   "last_modified": 1577836800,
//!   "details": {"source": "ingestor-7"}
//! }
//! ```
//!
//! The absent-compression case is stored as the literal string `"nothing"`
//! and round-trips to `None`. Once created, everything except `last_modified`
//! and `details` is immutable; the insert engine enforces that.
//!
//! Submodules: [`type_tag`] models the column type vocabulary, [`store`]
//! reads and writes descriptors through the object store.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::prelude::*;

use crate::codec::{Compression, FileFormat};
use crate::error::{FormatSnafu, Result, SchemaSnafu};
use crate::metadata::type_tag::TypeTag;

pub mod store;
pub mod type_tag;

/// Key of the descriptor object, relative to the dataset root.
pub const METADATA_KEY: &str = "METADATA.json";

/// Detail key carrying a read-only archive's own column schema.
pub const TYPE_MAP_DETAIL: &str = "type_map";

/// Detail key naming the columns that identify a logical row in a read-only
/// archive, as a comma-separated list.
pub const SUPERKEY_DETAIL: &str = "superkey";

/// Join non-empty key segments with `/`. Object keys never carry a leading
/// slash, so an empty store prefix simply disappears.
pub(crate) fn join_key<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// The descriptor key for a dataset under a store prefix.
pub fn metadata_key(prefix: &str, collection: &str, dataset: &str) -> String {
    join_key([prefix, collection, dataset, METADATA_KEY])
}

/// Partition granularity of a time-series index.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum PartitionSize {
    /// One object per UTC hour.
    Hour,
    /// One object per UTC day.
    Day,
    /// One object per UTC calendar month.
    Month,
    /// One object per UTC calendar year.
    Year,
}

impl PartitionSize {
    /// Parse a lowercase URI token (`"hour"`, `"day"`, ...).
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "hour" => Some(PartitionSize::Hour),
            "day" => Some(PartitionSize::Day),
            "month" => Some(PartitionSize::Month),
            "year" => Some(PartitionSize::Year),
            _ => None,
        }
    }
}

impl fmt::Display for PartitionSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionSize::Hour => "HOUR",
            PartitionSize::Day => "DAY",
            PartitionSize::Month => "MONTH",
            PartitionSize::Year => "YEAR",
        };
        f.write_str(name)
    }
}

/// The partition index of a dataset.
///
/// Only the time-series variant exists today; the `_type`/`_attr` wire
/// encoding leaves the contract open for other index families without
/// breaking stored JSON.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatasetIndex {
    /// Partition by the UTC-floor of a zoned timestamp column.
    TimeSeries {
        /// Name of the index column.
        key: String,
        /// Partition granularity.
        partition_size: PartitionSize,
    },
}

impl DatasetIndex {
    /// The index column name.
    pub fn key(&self) -> &str {
        match self {
            DatasetIndex::TimeSeries { key, .. } => key,
        }
    }

    /// The partition granularity.
    pub fn partition_size(&self) -> PartitionSize {
        match self {
            DatasetIndex::TimeSeries { partition_size, .. } => *partition_size,
        }
    }
}

const TIME_SERIES_INDEX_TYPE: &str = "TimeSeriesIndex";

#[derive(Serialize, Deserialize)]
struct IndexRepr {
    #[serde(rename = "_type")]
    type_name: String,
    #[serde(rename = "_attr")]
    attr: TimeSeriesIndexAttr,
}

#[derive(Serialize, Deserialize)]
struct TimeSeriesIndexAttr {
    key: String,
    partition_size: PartitionSize,
}

impl Serialize for DatasetIndex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DatasetIndex::TimeSeries {
                key,
                partition_size,
            } => IndexRepr {
                type_name: TIME_SERIES_INDEX_TYPE.to_string(),
                attr: TimeSeriesIndexAttr {
                    key: key.clone(),
                    partition_size: *partition_size,
                },
            }
            .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for DatasetIndex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = IndexRepr::deserialize(deserializer)?;
        if repr.type_name != TIME_SERIES_INDEX_TYPE {
            return Err(de::Error::custom(format!(
                "unknown index type {:?}",
                repr.type_name
            )));
        }
        Ok(DatasetIndex::TimeSeries {
            key: repr.attr.key,
            partition_size: repr.attr.partition_size,
        })
    }
}

/// Serde representation for the `compression` field: `None` is stored as the
/// literal string `"nothing"`.
mod compression_repr {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<Compression>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(c) => c.serialize(serializer),
            None => serializer.serialize_str("nothing"),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Compression>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == "nothing" {
            return Ok(None);
        }
        serde_json::from_value::<Compression>(serde_json::Value::String(raw.clone()))
            .map(Some)
            .map_err(|_| de::Error::custom(format!("unknown compression tag {raw:?}")))
    }
}

/// Per-dataset metadata stored as JSON alongside the data objects.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DatasetDescriptor {
    /// Collection the dataset belongs to. Not stored; derived from the key.
    #[serde(skip)]
    pub collection: String,

    /// Dataset name. Not stored; derived from the key.
    #[serde(skip)]
    pub dataset: String,

    /// Canonical column order for on-disk files.
    pub column_order: Vec<String>,

    /// Declared column types, keyed by column name.
    pub column_types: BTreeMap<String, TypeTag>,

    /// IANA timezone name for the dataset's zoned timestamp columns.
    pub timezone: String,

    /// Partition index.
    pub index: DatasetIndex,

    /// On-disk file format.
    pub file_format: FileFormat,

    /// On-disk compression; stored as `"nothing"` when absent.
    #[serde(with = "compression_repr")]
    pub compression: Option<Compression>,

    /// Last time the descriptor was rewritten, as unix seconds.
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_modified: DateTime<Utc>,

    /// Free-form details. Read-only archives surface their own schema
    /// information here (see [`TYPE_MAP_DETAIL`], [`SUPERKEY_DETAIL`]).
    pub details: Option<BTreeMap<String, String>>,
}

impl DatasetDescriptor {
    /// The descriptor's timezone, parsed. A stored zone that no longer parses
    /// is corrupt metadata, so this is a format error.
    pub fn tz(&self) -> Result<Tz> {
        self.timezone.parse::<Tz>().map_err(|_| {
            FormatSnafu {
                message: format!(
                    "descriptor for {}/{} names unknown timezone {:?}",
                    self.collection, self.dataset, self.timezone
                ),
            }
            .build()
        })
    }

    /// The index column name.
    pub fn index_key(&self) -> &str {
        self.index.key()
    }

    /// The index partition granularity.
    pub fn partition_size(&self) -> PartitionSize {
        self.index.partition_size()
    }

    /// A free-form detail value.
    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.as_ref()?.get(key).map(String::as_str)
    }

    /// The archive's logical-row superkey, if declared.
    pub fn superkey(&self) -> Option<Vec<String>> {
        let raw = self.detail(SUPERKEY_DETAIL)?;
        Some(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// The archive-provided free-form column type map, if declared. Values
    /// are free-form strings such as `"list"` or `"bool"` that drive the
    /// read-only post-processing.
    pub fn type_map(&self) -> Result<Option<BTreeMap<String, String>>> {
        let Some(raw) = self.detail(TYPE_MAP_DETAIL) else {
            return Ok(None);
        };
        serde_json::from_str(raw).map(Some).map_err(|e| {
            FormatSnafu {
                message: format!(
                    "descriptor for {}/{} carries unparseable {TYPE_MAP_DETAIL}: {e}",
                    self.collection, self.dataset
                ),
            }
            .build()
        })
    }

    /// Check the structural invariants of a descriptor about to be persisted:
    /// the index column must appear in the column order and be declared a
    /// zoned timestamp.
    pub fn validate(&self) -> Result<()> {
        let key = self.index_key();
        ensure!(
            self.column_order.iter().any(|c| c == key),
            SchemaSnafu {
                message: format!("index column {key:?} is not in the column order"),
            }
        );
        let declared = self.column_types.get(key);
        ensure!(
            declared.is_some_and(TypeTag::is_zoned_timestamp),
            SchemaSnafu {
                message: format!(
                    "index column {key:?} must be a zoned timestamp, found {declared:?}"
                ),
            }
        );
        Ok(())
    }

    /// The descriptor object key under a store prefix.
    pub fn metadata_key(&self, prefix: &str) -> String {
        metadata_key(prefix, &self.collection, &self.dataset)
    }
}
