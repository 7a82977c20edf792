//! CacheFlow - DAG workflows with per-operation result caching
//!
//! Operations wrap async callables and remember their last output keyed by
//! the hash of the input value. Workflows wire operations into a graph,
//! evaluate them incrementally, persist their state as snapshots, and
//! [`sync`](workflow::Workflow::sync) with a revised definition while keeping
//! every cache the revision did not touch.

pub mod dag;
pub mod error;
pub mod function;
pub mod logging;
pub mod models;
pub mod operation;
pub mod shape;
pub mod workflow;

pub use error::{ErrorKind, FlowError, Result};
pub use function::{Callable, FnCallable, FunctionRef, FunctionRegistry};
pub use operation::{CacheEntry, Operation};
pub use workflow::{Step, Validation, Workflow, WorkflowInspection};
