//! The reconciler's error taxonomy, realized as one [`snafu::Snafu`] enum.
//!
//! Mirrors the style of `stackable_operator::kvp::label::selector::SelectorError`
//! and `stackable_operator::deep_merger::Error`: one variant per failure mode,
//! context attached with `.context(...Snafu)` at the call site rather than
//! `map_err` closures.

use snafu::Snafu;

use crate::model::ClusterName;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// A store operation that should be retried with backoff; no status change.
    #[snafu(display("transient store error while {action}"))]
    TransientStore {
        action: String,
        source: store::StoreError,
    },

    /// An optimistic-concurrency conflict on update or status write; requeue immediately.
    #[snafu(display("resource version conflict writing {key}"))]
    Conflict { key: String },

    /// The template could not be decoded into a structured view.
    #[snafu(display("malformed template for {key}: {reason}"))]
    MalformedTemplate { key: String, reason: String },

    /// An override's `path` or `value` could not be applied.
    #[snafu(display("malformed override {path:?} for cluster {cluster}: {reason}"))]
    MalformedOverride {
        cluster: ClusterName,
        path: String,
        reason: String,
    },

    /// An override path resolves through a JSON array; array-index access is unsupported.
    #[snafu(display(
        "override path {path:?} for cluster {cluster} traverses a JSON array, which is unsupported"
    ))]
    OverridePathUnsupported { cluster: ClusterName, path: String },

    /// A required object-meta field (namespace/name) was missing.
    #[snafu(display("missing object key {key}"))]
    MissingObjectKey { key: &'static str },
}

pub mod store {
    //! Errors surfaced by [`crate::store::ObjectStore`] implementations.
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(crate)))]
    pub enum StoreError {
        #[snafu(display("object {key} not found"))]
        NotFound { key: String },

        #[snafu(display("resource version conflict writing {key}"))]
        Conflict { key: String },

        #[snafu(display("store backend error: {message}"))]
        Backend { message: String },
    }
}
