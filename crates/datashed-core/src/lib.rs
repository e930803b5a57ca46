//! Core engine for the `datashed` dataset-warehouse client.
//!
//! Datashed is a client library for a tabular dataset warehouse whose
//! physical backing is an object store of immutable, time-partitioned,
//! content-addressed files under per-dataset key prefixes. This crate
//! provides the engine behind the three public operations — list, gather
//! (range query), and insert (append-merge-store) — and the machinery they
//! share.
//!
//! Responsibilities (high level):
//! - A codec registry mapping the closed (format, compression) vocabulary
//!   to byte-level encode/decode over Arrow record batches ([`codec`]).
//! - A deterministic partition index translating range predicates to object
//!   keys for reads and grouping rows into partitions for writes
//!   ([`index`]).
//! - Per-dataset JSON descriptors with a stable type-tag wire contract
//!   ([`metadata`]).
//! - A bounded, thread-safe on-disk file cache with single-flight
//!   downloads, optional decompression on ingest, and persistent
//!   reconstruction ([`cache`]).
//! - An ordered backend registry parsing store URIs and composing the
//!   centralized list with configured additions ([`registry`], [`config`]).
//! - The gather and insert pipelines fanning out over bounded worker pools
//!   ([`gather`], [`insert`]), and prefix-based dataset enumeration
//!   ([`list`]).
//!
//! The object-store transport is not implemented here: everything funnels
//! through the [`object_store::ObjectStore`] trait, with a local-directory
//! adapter for development and an in-memory one for tests. [`Warehouse`]
//! ties an adapter to the public operations.
//!
//! Process-wide state (the configuration snapshot, the backend registry,
//! the default cache handle, the descriptor JSON cache) is built lazily,
//! guarded independently, and resettable; tests inject cache handles
//! instead of sharing the defaults.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod gather;
pub mod index;
pub mod insert;
pub mod list;
pub mod metadata;
pub mod object_store;
pub mod registry;
pub mod warehouse;

pub use error::{Error, Result};
pub use warehouse::Warehouse;

pub use cache::FileCache;
pub use codec::{Compression, FileFormat};
pub use gather::{GatherOptions, Gathered, RowPredicate};
pub use insert::InsertOptions;
pub use metadata::type_tag::{SimpleTag, TypeTag};
pub use metadata::{DatasetDescriptor, DatasetIndex, PartitionSize};
pub use object_store::{LocalDirStore, MemoryStore, ObjectStore, ObjectStoreError};
pub use registry::{BackendRegistry, Store};
