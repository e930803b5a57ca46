//! Wrapper prelude.
//!
//! The `datashed` crate is the supported public entry point. Downstream
//! code should prefer importing from this prelude instead of depending on
//! internal core module paths.

pub use crate::codec;
pub use crate::{
    DatasetDescriptor, DatasetIndex, Error, FileCache, GatherOptions, Gathered, InsertOptions,
    LocalDirStore, ObjectStore, PartitionSize, Result, SimpleTag, Store, TypeTag, Warehouse,
};
