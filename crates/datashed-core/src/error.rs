//! Error types and SNAFU context selectors shared across the crate.
//!
//! This module centralizes the public `Error` enum and exposes context
//! selectors (via `#[snafu(visibility(pub(crate)))]`) so implementation
//! details in sibling modules can attach error context without re-exporting
//! everything at the crate root. Keep new variants here to ensure consistent
//! user-facing messages and to avoid scattering selectors.
//!
//! The taxonomy is intentionally small. Callers are expected to match on the
//! kind of failure, not on fine-grained causes:
//!
//! - [`Error::Config`]: malformed configuration, unknown URI schemes, store
//!   ids that resolve to nothing.
//! - [`Error::MissingData`]: no descriptor for a dataset, or no rows
//!   intersecting the requested range in any store.
//! - [`Error::Schema`]: an input table incompatible with a dataset's declared
//!   column types, or structurally unusable (empty, missing columns).
//! - [`Error::Format`]: corrupt stored bytes, unrecognized type tags, or
//!   impossible filename codec suffixes. These signal corruption in stored
//!   state, never a problem with the caller's input.
//! - [`Error::Transport`]: an object-store fetch that kept failing after the
//!   retry budget was spent.
//! - [`Error::Argument`]: a call that is well-formed but meaningless for the
//!   target store, such as a release cutoff against a writable archive.

use snafu::prelude::*;

/// Result alias used by the public API.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the public dataset operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Malformed configuration, unknown store URI scheme, or a store id that
    /// is neither registered nor parseable as a URI.
    #[snafu(display("configuration error: {message}"))]
    Config {
        /// Human-readable description of the configuration problem.
        message: String,
    },

    /// No descriptor exists for the requested dataset, or no rows intersect
    /// the requested range in any consulted store.
    #[snafu(display("no data found: {message}"))]
    MissingData {
        /// Which dataset/range lookup came up empty.
        message: String,
    },

    /// The input table is empty, missing declared columns, or carries column
    /// types incompatible with the dataset descriptor.
    #[snafu(display("schema error: {message}"))]
    Schema {
        /// Which column or structural check failed.
        message: String,
    },

    /// Stored bytes could not be decoded: corrupt framing, an unknown type
    /// tag, or a nonsensical stacked-compression filename.
    #[snafu(display("format error: {message}"))]
    Format {
        /// What failed to decode and why.
        message: String,
    },

    /// A transient object-store failure that persisted through the retry
    /// budget, or a non-retryable adapter failure.
    #[snafu(display("transport error: {message}"))]
    Transport {
        /// The underlying adapter failure, rendered.
        message: String,
    },

    /// A well-formed call that cannot apply to the target store, such as a
    /// release cutoff supplied for a writable archive.
    #[snafu(display("invalid argument: {message}"))]
    Argument {
        /// Why the argument cannot apply.
        message: String,
    },
}

impl Error {
    /// True when the error is the "nothing stored here" case, which the
    /// gather fallback iteration treats as "keep trying the next store".
    pub fn is_missing_data(&self) -> bool {
        matches!(self, Error::MissingData { .. })
    }
}
