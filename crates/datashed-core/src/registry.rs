//! Backend registry: store URIs, the centralized list, and ordered lookup.
//!
//! A store URI is `<type>:<bucket_spec>` where the type tag picks the
//! [`Store`] variant and `<bucket_spec>` is `s3://<bucket>[/<prefix>]`:
//!
//! - `ffs:` — a writable archive. Codec and index live in each dataset's
//!   descriptor.
//! - `s3db:` — a read-only partitioned archive with the default pinning
//!   (CSV, gzip, day partitions).
//! - `s3db-<format>-<compression>-<partition>:` — a read-only archive with
//!   explicit pinning, e.g. `s3db-arrow-zst-day:`.
//!
//! The process-wide registry is the centralized list composed with the
//! configuration's `additional-stores`, ordered. It is built lazily, dropped
//! by [`invalidate`] (which configuration reloads trigger), and duplicate
//! store ids keep their first occurrence in merge order rather than being
//! silently replaced.

use std::sync::{Arc, Mutex, OnceLock};

use log::warn;
use snafu::prelude::*;

use crate::codec::{Compression, FileFormat};
use crate::config;
use crate::error::{ConfigSnafu, Result};
use crate::metadata::PartitionSize;

/// The built-in centralized stores, in rank order.
pub const CENTRALIZED_STORES: &[(&str, &str)] = &[
    ("datafeeds", "s3db:s3://datashed-prod-datafeeds/version5"),
    ("forecasts", "ffs:s3://datashed-prod-forecasts/version5"),
    ("backruns", "ffs:s3://datashed-prod-backruns/version5"),
];

/// A resolved store backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Store {
    /// A partitioned archive populated by external systems. Format,
    /// compression, and partition size are pinned by the URI.
    ReadOnlyArchive {
        /// S3 bucket name.
        bucket: String,
        /// Key prefix inside the bucket, without trailing slash.
        prefix: String,
        /// Pinned file format.
        file_format: FileFormat,
        /// Pinned compression.
        compression: Option<Compression>,
        /// Pinned partition granularity.
        partition_size: PartitionSize,
    },

    /// An archive populated by this library's insert path. Codec and index
    /// live in per-dataset descriptors.
    WritableArchive {
        /// S3 bucket name.
        bucket: String,
        /// Key prefix inside the bucket, without trailing slash.
        prefix: String,
    },
}

impl Store {
    /// The store's bucket.
    pub fn bucket(&self) -> &str {
        match self {
            Store::ReadOnlyArchive { bucket, .. } | Store::WritableArchive { bucket, .. } => bucket,
        }
    }

    /// The store's key prefix (possibly empty).
    pub fn prefix(&self) -> &str {
        match self {
            Store::ReadOnlyArchive { prefix, .. } | Store::WritableArchive { prefix, .. } => prefix,
        }
    }

    /// True for stores the insert path may write to.
    pub fn is_writable(&self) -> bool {
        matches!(self, Store::WritableArchive { .. })
    }

    /// Render the URI this store parses from.
    pub fn uri(&self) -> String {
        let spec = |bucket: &str, prefix: &str| {
            if prefix.is_empty() {
                format!("s3://{bucket}")
            } else {
                format!("s3://{bucket}/{prefix}")
            }
        };
        match self {
            Store::WritableArchive { bucket, prefix } => format!("ffs:{}", spec(bucket, prefix)),
            Store::ReadOnlyArchive {
                bucket,
                prefix,
                file_format,
                compression,
                partition_size,
            } => {
                let default = matches!(
                    (file_format, compression, partition_size),
                    (FileFormat::Csv, Some(Compression::Gz), PartitionSize::Day)
                );
                if default {
                    format!("s3db:{}", spec(bucket, prefix))
                } else {
                    let comp = compression.map_or("none", Compression::extension);
                    format!(
                        "s3db-{}-{}-{}:{}",
                        file_format.extension(),
                        comp,
                        partition_size.to_string().to_ascii_lowercase(),
                        spec(bucket, prefix)
                    )
                }
            }
        }
    }

    /// Parse a store URI.
    pub fn parse(uri: &str) -> Result<Store> {
        let (tag, spec) = uri.split_once(':').with_context(|| ConfigSnafu {
            message: format!("store URI {uri:?} is missing a type tag"),
        })?;

        let rest = spec.strip_prefix("s3://").with_context(|| ConfigSnafu {
            message: format!("store URI {uri:?} must use an s3:// bucket spec"),
        })?;
        let (bucket, prefix) = match rest.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix.trim_end_matches('/')),
            None => (rest, ""),
        };
        ensure!(
            !bucket.is_empty(),
            ConfigSnafu {
                message: format!("store URI {uri:?} is missing a bucket"),
            }
        );

        let mut tokens = tag.split('-');
        match tokens.next() {
            Some("ffs") => {
                ensure!(
                    tokens.next().is_none(),
                    ConfigSnafu {
                        message: format!("unknown store type tag {tag:?} in {uri:?}"),
                    }
                );
                Ok(Store::WritableArchive {
                    bucket: bucket.to_string(),
                    prefix: prefix.to_string(),
                })
            }
            Some("s3db") => {
                let remainder: Vec<&str> = tokens.collect();
                let (file_format, compression, partition_size) = match remainder.as_slice() {
                    [] => (FileFormat::Csv, Some(Compression::Gz), PartitionSize::Day),
                    [fmt, comp, part] => {
                        let file_format =
                            FileFormat::from_token(fmt).with_context(|| ConfigSnafu {
                                message: format!("unknown file format {fmt:?} in {uri:?}"),
                            })?;
                        let compression = match *comp {
                            "none" => None,
                            other => Some(Compression::from_token(other).with_context(|| {
                                ConfigSnafu {
                                    message: format!("unknown compression {other:?} in {uri:?}"),
                                }
                            })?),
                        };
                        let partition_size =
                            PartitionSize::from_token(part).with_context(|| ConfigSnafu {
                                message: format!("unknown partition size {part:?} in {uri:?}"),
                            })?;
                        (file_format, compression, partition_size)
                    }
                    _ => {
                        return ConfigSnafu {
                            message: format!("malformed store type tag {tag:?} in {uri:?}"),
                        }
                        .fail();
                    }
                };
                Ok(Store::ReadOnlyArchive {
                    bucket: bucket.to_string(),
                    prefix: prefix.to_string(),
                    file_format,
                    compression,
                    partition_size,
                })
            }
            _ => ConfigSnafu {
                message: format!("unknown store type tag {tag:?} in {uri:?}"),
            }
            .fail(),
        }
    }
}

/// The ordered store-id → [`Store`] mapping.
#[derive(Clone, Debug, Default)]
pub struct BackendRegistry {
    entries: Vec<(String, Store)>,
}

impl BackendRegistry {
    /// Look up a store by id.
    pub fn get(&self, store_id: &str) -> Option<&Store> {
        self.entries
            .iter()
            .find(|(id, _)| id == store_id)
            .map(|(_, store)| store)
    }

    /// Iterate `(id, store)` pairs in rank order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Store)> {
        self.entries.iter().map(|(id, store)| (id.as_str(), store))
    }

    /// Number of registered stores.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no stores are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, id: &str, store: Store) {
        if self.get(id).is_some() {
            warn!("store id {id:?} already registered; keeping the first occurrence");
            return;
        }
        self.entries.push((id.to_string(), store));
    }

    /// Compose the registry from the centralized list and a configuration
    /// snapshot.
    fn build(config: &config::Config) -> Result<Self> {
        ensure!(
            !config.disable_centralized || !config.additional_stores.is_empty(),
            ConfigSnafu {
                message: "disable-centralized requires additional-stores to be non-empty"
                    .to_string(),
            }
        );

        let mut centralized = BackendRegistry::default();
        if !config.disable_centralized {
            for (id, uri) in CENTRALIZED_STORES {
                centralized.push(id, Store::parse(uri)?);
            }
        }

        let mut additional = BackendRegistry::default();
        for (id, uri) in &config.additional_stores {
            additional.push(id, Store::parse(uri)?);
        }

        let (mut first, second) = if config.prioritize_additional_stores {
            (additional, centralized)
        } else {
            (centralized, additional)
        };
        for (id, store) in second.entries {
            first.push(&id, store);
        }
        Ok(first)
    }
}

static REGISTRY: OnceLock<Mutex<Option<Arc<BackendRegistry>>>> = OnceLock::new();

fn registry_slot() -> &'static Mutex<Option<Arc<BackendRegistry>>> {
    REGISTRY.get_or_init(|| Mutex::new(None))
}

/// The process-wide registry, building it on first use from the current
/// configuration snapshot.
pub fn registry() -> Result<Arc<BackendRegistry>> {
    let mut slot = registry_slot().lock().expect("registry poisoned");
    if let Some(reg) = slot.as_ref() {
        return Ok(reg.clone());
    }
    let cfg = config::snapshot()?;
    let reg = Arc::new(BackendRegistry::build(&cfg)?);
    *slot = Some(reg.clone());
    Ok(reg)
}

/// Drop the registry so the next [`registry`] call rebuilds it. Called by
/// configuration reloads.
pub fn invalidate() {
    *registry_slot().lock().expect("registry poisoned") = None;
}

/// Resolve a store id: a registered id wins; otherwise the id is parsed as
/// an ad-hoc URI. Ids that are neither registered nor parseable are a
/// configuration error.
pub fn lookup(store_id: &str) -> Result<Store> {
    if let Some(store) = registry()?.get(store_id) {
        return Ok(store.clone());
    }
    Store::parse(store_id).map_err(|_| {
        ConfigSnafu {
            message: format!(
                "store id {store_id:?} is not registered and is not a parseable store URI"
            ),
        }
        .build()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::Error;

    #[test]
    fn ffs_uris_parse_to_writable_archives() {
        let store = Store::parse("ffs:s3://research-bucket/team/v2").expect("parse");
        assert_eq!(
            store,
            Store::WritableArchive {
                bucket: "research-bucket".to_string(),
                prefix: "team/v2".to_string(),
            }
        );
        assert_eq!(store.uri(), "ffs:s3://research-bucket/team/v2");
    }

    #[test]
    fn s3db_defaults_to_csv_gz_day() {
        let store = Store::parse("s3db:s3://feeds").expect("parse");
        assert_eq!(
            store,
            Store::ReadOnlyArchive {
                bucket: "feeds".to_string(),
                prefix: String::new(),
                file_format: FileFormat::Csv,
                compression: Some(Compression::Gz),
                partition_size: PartitionSize::Day,
            }
        );
        assert_eq!(store.uri(), "s3db:s3://feeds");
    }

    #[test]
    fn s3db_variant_overrides_the_defaults() {
        let store = Store::parse("s3db-arrow-zst-hour:s3://feeds/sub").expect("parse");
        assert_eq!(
            store,
            Store::ReadOnlyArchive {
                bucket: "feeds".to_string(),
                prefix: "sub".to_string(),
                file_format: FileFormat::Arrow,
                compression: Some(Compression::Zst),
                partition_size: PartitionSize::Hour,
            }
        );
        assert_eq!(store.uri(), "s3db-arrow-zst-hour:s3://feeds/sub");

        let none = Store::parse("s3db-parquet-none-month:s3://feeds").expect("parse");
        assert!(matches!(
            none,
            Store::ReadOnlyArchive {
                compression: None,
                ..
            }
        ));
    }

    #[test]
    fn malformed_uris_are_config_errors() {
        for uri in [
            "gluster:s3://bucket",
            "ffs:file:///tmp/x",
            "s3db-arrow:s3://bucket",
            "s3db-arrow-zst-fortnight:s3://bucket",
            "ffs:s3://",
            "nocolon",
        ] {
            let err = Store::parse(uri).expect_err(uri);
            assert!(matches!(err, Error::Config { .. }), "{uri}");
        }
    }

    #[test]
    fn registry_merges_centralized_first_by_default() {
        let mut cfg = Config::default();
        cfg.additional_stores = vec![
            ("research".to_string(), "ffs:s3://research".to_string()),
        ];
        let reg = BackendRegistry::build(&cfg).expect("build");
        let ids: Vec<&str> = reg.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["datafeeds", "forecasts", "backruns", "research"]);
    }

    #[test]
    fn prioritize_additional_reorders_and_first_occurrence_wins() {
        let mut cfg = Config::default();
        cfg.prioritize_additional_stores = true;
        cfg.additional_stores = vec![
            ("research".to_string(), "ffs:s3://research".to_string()),
            // Shadows a centralized id; the additional entry ranks first and
            // the centralized one is dropped with a warning.
            ("datafeeds".to_string(), "ffs:s3://my-datafeeds".to_string()),
        ];
        let reg = BackendRegistry::build(&cfg).expect("build");
        let ids: Vec<&str> = reg.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["research", "datafeeds", "forecasts", "backruns"]);
        assert!(reg.get("datafeeds").expect("present").is_writable());
    }

    #[test]
    fn disable_centralized_requires_additional_stores() {
        let mut cfg = Config::default();
        cfg.disable_centralized = true;
        let err = BackendRegistry::build(&cfg).expect_err("invalid");
        assert!(matches!(err, Error::Config { .. }));

        cfg.additional_stores = vec![("only".to_string(), "ffs:s3://only".to_string())];
        let reg = BackendRegistry::build(&cfg).expect("build");
        let ids: Vec<&str> = reg.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["only"]);
    }
}
