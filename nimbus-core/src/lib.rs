#![cfg_attr(docsrs, feature(doc_cfg))]

//! Backend-agnostic construction and dispatch of serverless jobs.
//!
//! Nimbus turns "run this function over these inputs" into a batch of calls a
//! compute backend can start. It takes care of everything between the caller
//! and the backend:
//! - **Partitioning**: functions processing stored objects get one call per
//!   chunk of each object, see [`partitioner`].
//! - **Argument validation**: call arguments are checked against the
//!   parameters the function declares, see [`function`].
//! - **Computation units**: the function and the modules it needs are
//!   serialized once per job, see [`unit`].
//! - **Payload aggregation**: every call's arguments are packed into a single
//!   stored object, each call reading its own byte range, see [`payload`].
//! - **Dispatch**: backends register by name and are resolved from
//!   configuration, see [`compute`].
//! - **Cleanup**: job artifacts are removed out of band, see [`cleaner`].
//!
//! # Declaring functions
//!
//! A remote function is any serializable type implementing
//! [`RemoteFunction`], usually through the derive macro. The parameter names
//! drive argument validation; a parameter named `obj` marks the function as
//! object-processing.
//!
//! ```
//! use nimbus::RemoteFunction;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, RemoteFunction)]
//! #[nimbus(name = "word_count", params(obj), modules("text"))]
//! struct WordCount {
//!     lowercase: bool,
//! }
//!
//! assert_eq!(WordCount::NAME, "word_count");
//! assert!(WordCount::is_object_processing());
//! ```
//!
//! # Building and dispatching a job
//!
//! [`JobBuilder`](job::JobBuilder) produces a
//! [`JobDescriptor`](job::JobDescriptor), which the
//! [`Invoker`](compute::invoker::Invoker) hands to the configured backend.
//! The only backend shipped with the crate, [`localhost`], runs jobs on the
//! local machine, either as host processes or inside containers.
//!
//! # Configuration
//!
//! [`Config`](config::Config) is a [`clap::Args`] struct, so it can be
//! flattened into any binary's command line, and every field can also be set
//! through its `NIMBUS_*` environment variable.
pub mod cleaner;
pub mod common;
pub mod compute;
pub mod config;
pub mod environment;
pub mod error;
pub mod function;
pub mod job;
pub mod localhost;
pub mod partitioner;
pub mod payload;
pub mod serializer;
pub mod storage;
pub mod unit;

pub use async_trait::async_trait;
pub use error::{CleanupError, DispatchError, JobError, Result};
pub use function::RemoteFunction;
pub use nimbus_function_derive::RemoteFunction;
pub use tracing;

#[doc(hidden)]
pub mod __private {
    pub use linkme;

    pub use crate::compute::BACKENDS;
}

/// Route `tracing` output of a test through the test harness. Honors
/// `RUST_LOG`.
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
