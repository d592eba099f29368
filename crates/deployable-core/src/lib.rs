//! Core reconciler for the Deployable propagation and rolling-update controller.
//!
//! This crate implements the reconciler *core* only: placement resolution,
//! the override engine, child-set diffing, status aggregation and the
//! rolling-update planner (see the module docs on [`controller`] for how
//! they are wired together). It does not implement a Kubernetes client, a
//! CLI, or logging setup -- those are external collaborators, consumed
//! through the [`store::ObjectStore`] and [`store::EventSink`] traits, and
//! are provided by the `deployable-controller` binary crate.

pub mod controller;
pub mod diff;
pub mod error;
pub mod kvp;
pub mod model;
pub mod overrides;
pub mod placement;
pub mod rolling;
pub mod status;
pub mod store;

pub use error::{Error, Result};
