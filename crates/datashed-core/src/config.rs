//! Configuration snapshot.
//!
//! Configuration comes from an optional YAML file (pointed at by the
//! `DATASHED_CONFIG` environment variable) with environment variables of the
//! same names overriding file values. The recognized keys:
//!
//! | key | effect |
//! |-----|--------|
//! | `additional-stores` | ordered list of `{id: uri}` maps appended to the registry |
//! | `disable-centralized` | omit the built-in centralized stores |
//! | `prioritize-additional-stores` | additional stores rank before centralized |
//! | `DATA_CACHE_DIR` | persistent cache directory; absent means ephemeral |
//! | `DATA_CACHE_SIZE_MB` | cache byte ceiling in MB (default 20000) |
//! | `DATA_CACHE_EXPIRE_AFTER_DAYS` | startup TTL for persistent directories (default 90) |
//! | `DATA_CACHE_DECOMPRESS` | decompress objects before caching (default true) |
//!
//! Unrecognized keys pass through untouched and stay accessible via
//! [`Config::extra`].
//!
//! The loaded snapshot is immutable and process-wide. [`reload`] swaps it
//! atomically and drops the backend registry so the next lookup rebuilds
//! against the new snapshot.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use serde::Deserialize;
use snafu::prelude::*;

use crate::error::{ConfigSnafu, Result};
use crate::registry;

/// Default cache ceiling, in MB.
pub const DEFAULT_CACHE_SIZE_MB: u64 = 20_000;

/// Default startup TTL for persistent cache directories, in days.
pub const DEFAULT_CACHE_EXPIRE_AFTER_DAYS: u64 = 90;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "DATASHED_CONFIG";

/// Immutable configuration snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Ordered `(id, uri)` pairs appended to the registry.
    pub additional_stores: Vec<(String, String)>,
    /// Omit the built-in centralized stores.
    pub disable_centralized: bool,
    /// Rank additional stores before centralized ones.
    pub prioritize_additional_stores: bool,
    /// Persistent cache directory; `None` means ephemeral.
    pub cache_dir: Option<PathBuf>,
    /// Cache byte ceiling, in MB.
    pub cache_size_mb: u64,
    /// Startup TTL for persistent cache directories, in days.
    pub cache_expire_after_days: u64,
    /// Decompress compressed objects before caching.
    pub cache_decompress: bool,
    /// Unrecognized keys, preserved as parsed.
    extras: BTreeMap<String, serde_yaml::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            additional_stores: Vec::new(),
            disable_centralized: false,
            prioritize_additional_stores: false,
            cache_dir: None,
            cache_size_mb: DEFAULT_CACHE_SIZE_MB,
            cache_expire_after_days: DEFAULT_CACHE_EXPIRE_AFTER_DAYS,
            cache_decompress: true,
            extras: BTreeMap::new(),
        }
    }
}

/// File-level representation. `additional-stores` is a sequence of
/// single-key mappings so the file preserves insertion order.
#[derive(Debug, Default, Deserialize)]
struct FileRepr {
    #[serde(rename = "additional-stores", default)]
    additional_stores: Vec<BTreeMap<String, String>>,
    #[serde(rename = "disable-centralized", default)]
    disable_centralized: Option<bool>,
    #[serde(rename = "prioritize-additional-stores", default)]
    prioritize_additional_stores: Option<bool>,
    #[serde(rename = "DATA_CACHE_DIR", default)]
    cache_dir: Option<String>,
    #[serde(rename = "DATA_CACHE_SIZE_MB", default)]
    cache_size_mb: Option<u64>,
    #[serde(rename = "DATA_CACHE_EXPIRE_AFTER_DAYS", default)]
    cache_expire_after_days: Option<u64>,
    #[serde(rename = "DATA_CACHE_DECOMPRESS", default)]
    cache_decompress: Option<bool>,
    #[serde(flatten)]
    extras: BTreeMap<String, serde_yaml::Value>,
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => ConfigSnafu {
            message: format!("{key} must be a boolean, found {raw:?}"),
        }
        .fail(),
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64> {
    raw.trim().parse().map_err(|_| {
        ConfigSnafu {
            message: format!("{key} must be a non-negative integer, found {raw:?}"),
        }
        .build()
    })
}

impl Config {
    /// Parse a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let repr: FileRepr = serde_yaml::from_str(text).map_err(|e| {
            ConfigSnafu {
                message: format!("invalid configuration file: {e}"),
            }
            .build()
        })?;
        Self::from_repr(repr)
    }

    fn from_repr(repr: FileRepr) -> Result<Self> {
        let mut additional_stores = Vec::with_capacity(repr.additional_stores.len());
        for entry in repr.additional_stores {
            ensure!(
                entry.len() == 1,
                ConfigSnafu {
                    message: format!(
                        "each additional-stores entry must be a single `id: uri` mapping, found {} keys",
                        entry.len()
                    ),
                }
            );
            let (id, uri) = entry.into_iter().next().expect("exactly one entry");
            additional_stores.push((id, uri));
        }

        let defaults = Config::default();
        Ok(Config {
            additional_stores,
            disable_centralized: repr.disable_centralized.unwrap_or(defaults.disable_centralized),
            prioritize_additional_stores: repr
                .prioritize_additional_stores
                .unwrap_or(defaults.prioritize_additional_stores),
            cache_dir: repr.cache_dir.map(PathBuf::from),
            cache_size_mb: repr.cache_size_mb.unwrap_or(defaults.cache_size_mb),
            cache_expire_after_days: repr
                .cache_expire_after_days
                .unwrap_or(defaults.cache_expire_after_days),
            cache_decompress: repr.cache_decompress.unwrap_or(defaults.cache_decompress),
            extras: repr.extras,
        })
    }

    /// Apply same-name environment variable overrides.
    fn apply_env(mut self) -> Result<Self> {
        if let Ok(raw) = std::env::var("additional-stores") {
            let entries: Vec<BTreeMap<String, String>> =
                serde_yaml::from_str(&raw).map_err(|e| {
                    ConfigSnafu {
                        message: format!("additional-stores env override is not a YAML list: {e}"),
                    }
                    .build()
                })?;
            let repr = FileRepr {
                additional_stores: entries,
                ..FileRepr::default()
            };
            self.additional_stores = Self::from_repr(repr)?.additional_stores;
        }
        if let Ok(raw) = std::env::var("disable-centralized") {
            self.disable_centralized = parse_bool("disable-centralized", &raw)?;
        }
        if let Ok(raw) = std::env::var("prioritize-additional-stores") {
            self.prioritize_additional_stores = parse_bool("prioritize-additional-stores", &raw)?;
        }
        if let Ok(raw) = std::env::var("DATA_CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(raw));
        }
        if let Ok(raw) = std::env::var("DATA_CACHE_SIZE_MB") {
            self.cache_size_mb = parse_u64("DATA_CACHE_SIZE_MB", &raw)?;
        }
        if let Ok(raw) = std::env::var("DATA_CACHE_EXPIRE_AFTER_DAYS") {
            self.cache_expire_after_days = parse_u64("DATA_CACHE_EXPIRE_AFTER_DAYS", &raw)?;
        }
        if let Ok(raw) = std::env::var("DATA_CACHE_DECOMPRESS") {
            self.cache_decompress = parse_bool("DATA_CACHE_DECOMPRESS", &raw)?;
        }
        Ok(self)
    }

    /// Load the configuration: the `DATASHED_CONFIG` file when present,
    /// defaults otherwise, then environment overrides.
    pub fn load() -> Result<Self> {
        let base = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => {
                let text = std::fs::read_to_string(&path).map_err(|e| {
                    ConfigSnafu {
                        message: format!("cannot read configuration file {path}: {e}"),
                    }
                    .build()
                })?;
                Self::from_yaml(&text)?
            }
            Err(_) => Config::default(),
        };
        base.apply_env()
    }

    /// An unrecognized key's value, as parsed from the file.
    pub fn extra(&self, key: &str) -> Option<&serde_yaml::Value> {
        self.extras.get(key)
    }

    /// The cache byte ceiling.
    pub fn cache_max_bytes(&self) -> u64 {
        self.cache_size_mb * 1_000_000
    }
}

static SNAPSHOT: OnceLock<Mutex<Option<std::sync::Arc<Config>>>> = OnceLock::new();

fn snapshot_slot() -> &'static Mutex<Option<std::sync::Arc<Config>>> {
    SNAPSHOT.get_or_init(|| Mutex::new(None))
}

/// The process-wide configuration snapshot, loading it on first use.
pub fn snapshot() -> Result<std::sync::Arc<Config>> {
    let mut slot = snapshot_slot().lock().expect("config snapshot poisoned");
    if let Some(cfg) = slot.as_ref() {
        return Ok(cfg.clone());
    }
    let cfg = std::sync::Arc::new(Config::load()?);
    *slot = Some(cfg.clone());
    Ok(cfg)
}

/// Replace the snapshot with a freshly loaded one and drop the backend
/// registry so it rebuilds against the new configuration.
pub fn reload() -> Result<std::sync::Arc<Config>> {
    let cfg = std::sync::Arc::new(Config::load()?);
    *snapshot_slot().lock().expect("config snapshot poisoned") = Some(cfg.clone());
    registry::invalidate();
    Ok(cfg)
}

/// Install a snapshot directly. Tests use this instead of environment
/// variables; the backend registry is dropped like [`reload`] does.
pub fn install(config: Config) {
    *snapshot_slot().lock().expect("config snapshot poisoned") =
        Some(std::sync::Arc::new(config));
    registry::invalidate();
}

/// Drop the snapshot so the next [`snapshot`] call reloads. Also drops the
/// backend registry.
pub fn reset() {
    *snapshot_slot().lock().expect("config snapshot poisoned") = None;
    registry::invalidate();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.cache_size_mb, 20_000);
        assert_eq!(cfg.cache_expire_after_days, 90);
        assert!(cfg.cache_decompress);
        assert!(!cfg.disable_centralized);
        assert!(!cfg.prioritize_additional_stores);
        assert!(cfg.additional_stores.is_empty());
        assert!(cfg.cache_dir.is_none());
    }

    #[test]
    fn yaml_preserves_additional_store_order_and_extras() {
        let cfg = Config::from_yaml(
            r#"
additional-stores:
  - research: "ffs:s3://research-bucket/v1"
  - scratch: "ffs:s3://scratch-bucket"
prioritize-additional-stores: true
DATA_CACHE_SIZE_MB: 100
team-name: forecasting
"#,
        )
        .expect("parse");

        assert_eq!(
            cfg.additional_stores,
            vec![
                ("research".to_string(), "ffs:s3://research-bucket/v1".to_string()),
                ("scratch".to_string(), "ffs:s3://scratch-bucket".to_string()),
            ]
        );
        assert!(cfg.prioritize_additional_stores);
        assert_eq!(cfg.cache_size_mb, 100);
        assert_eq!(
            cfg.extra("team-name"),
            Some(&serde_yaml::Value::String("forecasting".to_string()))
        );
    }

    #[test]
    fn multi_key_store_entries_are_rejected() {
        let err = Config::from_yaml(
            r#"
additional-stores:
  - a: "ffs:s3://one"
    b: "ffs:s3://two"
"#,
        )
        .expect_err("two keys in one entry");
        assert!(matches!(err, crate::error::Error::Config { .. }));
    }

    #[test]
    fn boolean_env_values_parse_strictly() {
        assert!(parse_bool("k", "true").expect("true"));
        assert!(!parse_bool("k", "0").expect("zero"));
        assert!(parse_bool("k", "maybe").is_err());
    }
}
