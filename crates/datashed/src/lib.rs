//! # datashed
//!
//! Client library for a partitioned tabular dataset warehouse on object
//! storage: list datasets, range-query them (gather), and append-merge-store
//! new rows (insert), with a bounded on-disk cache and a deterministic
//! time-partitioned key scheme underneath.
//!
//! This crate is the supported public entry point and provides a small,
//! stable surface over `datashed-core`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use datashed::prelude::*;
//! ```

/// Convenience prelude with the stable, supported surface.
pub mod prelude;

/// Codec vocabulary (wrapper-only).
pub mod codec {
    pub use datashed_core::codec::{Compression, FileFormat, detect_from_filename, extension};
}

pub use datashed_core::cache::FileCache;
pub use datashed_core::error::{Error, Result};
pub use datashed_core::gather::{GatherOptions, Gathered, RowPredicate};
pub use datashed_core::insert::InsertOptions;
pub use datashed_core::metadata::type_tag::{SimpleTag, TypeTag};
pub use datashed_core::metadata::{DatasetDescriptor, DatasetIndex, PartitionSize};
pub use datashed_core::object_store::{LocalDirStore, MemoryStore, ObjectStore};
pub use datashed_core::registry::Store;
pub use datashed_core::warehouse::Warehouse;
