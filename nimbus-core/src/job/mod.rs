//! Job construction.
//!
//! A job is one batch of calls of one function. Building a job turns the
//! caller's input data into everything a backend needs to start the calls:
//! 1. Object-processing functions get their inputs partitioned.
//! 2. Call arguments are validated against the declared parameters.
//! 3. The function, its modules and every call's arguments are serialized.
//! 4. The call payloads are aggregated into a single blob.
//! 5. The total size is checked against the configured limit.
//! 6. The data blob is uploaded, and the computation unit is delivered either
//!    as a stored object or baked into a runtime image.
//! 7. A [`JobDescriptor`] is assembled.
//!
//! Any failure aborts the whole job; nothing is uploaded before the size check
//! passes.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use nimbus::{
//!     common::{create_executor_id, JobId},
//!     compute::RuntimeMeta,
//!     config::Config,
//!     job::{JobBuilder, JobOptions},
//!     storage::{in_memory::InMemoryStorage, InternalStorage},
//!     unit::ModuleCatalog,
//!     RemoteFunction,
//! };
//! use serde::{Deserialize, Serialize};
//! use serde_json::json;
//!
//! #[derive(Serialize, Deserialize, RemoteFunction)]
//! #[nimbus(params(x))]
//! struct Double;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(Config::default());
//!     let storage = InternalStorage::new(Arc::new(InMemoryStorage::default()), "bucket");
//!     let builder = JobBuilder::new(config, storage, ModuleCatalog::default());
//!
//!     let job = builder
//!         .create_map_job(
//!             &create_executor_id(),
//!             &JobId::map(0),
//!             &Double,
//!             vec![json!(1), json!(2), json!(3)],
//!             &RuntimeMeta::default(),
//!             JobOptions::default(),
//!         )
//!         .await?
//!         .expect("non-empty input");
//!
//!     assert_eq!(job.total_calls, 3);
//!     Ok(())
//! }
//! ```
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    function::CallArgs, partitioner::ChunkSpec, payload::ByteRange, unit::ModuleSelection,
};

mod builder;
mod image;
mod reduce;

pub use builder::JobBuilder;
pub use reduce::{group_reduce_inputs, REDUCE_JOB_ENV};

/// Everything a backend needs to start the calls of one job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub executor_id: String,
    pub job_id: String,
    pub runtime_name: String,
    /// MB.
    pub runtime_memory: u32,
    /// Seconds.
    pub execution_timeout: u64,
    pub function_name: String,
    pub total_calls: usize,
    pub invoke_pool_threads: usize,
    pub extra_env: BTreeMap<String, String>,
    pub data_key: String,
    /// One range per call into the object at `data_key`.
    pub data_ranges: Vec<ByteRange>,
    /// Empty when the computation unit was baked into the runtime image.
    pub func_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts_per_object: Option<Vec<usize>>,
    pub metadata: JobMetadata,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub job_created: DateTime<Utc>,
    pub data_size_bytes: u64,
    pub func_module_size_bytes: u64,
    /// Seconds.
    pub data_upload_time: f64,
    /// Seconds.
    pub func_upload_time: f64,
    /// Content hash the runtime image was tagged with, under image delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,
}

/// Per-job overrides of the session configuration.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobOptions {
    pub runtime_memory: Option<u32>,
    pub invoke_pool_threads: Option<usize>,
    /// `None` keeps the session selection.
    pub include_modules: Option<ModuleSelection>,
    /// Added to the session excludes.
    pub exclude_modules: Vec<String>,
    /// Defaults to the runtime timeout minus five seconds.
    pub execution_timeout: Option<u64>,
    /// Values are stored as strings.
    pub extra_env: BTreeMap<String, Value>,
    /// Merged into every call.
    pub extra_args: Option<CallArgs>,
    /// Only used by object-processing map jobs.
    pub chunks: ChunkSpec,
}

/// Progress of a job through the construction pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Created,
    Partitioned,
    Serialized,
    SizeChecked,
    Uploaded,
    Dispatchable,
}

impl JobState {
    pub(crate) fn advance(&mut self, next: JobState, executor_id: &str, job_id: &str) {
        debug!(executor_id, job_id, from = ?self, to = ?next, "job state");
        *self = next;
    }
}

/// Environment values are shipped as strings; JSON strings are taken verbatim
/// and every other value uses its JSON text (`true`, `3`, ...).
pub(crate) fn stringify_env(env: &BTreeMap<String, Value>) -> BTreeMap<String, String> {
    env.iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}
